use dx_core::errors::{DxError, ErrorInfo};

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("experiment", "ycsb")
        .with_context("binding", "x=1")
}

#[test]
fn config_error_surface() {
    let err = DxError::Config(sample_info("grid.empty_values", "option has no values"));
    assert_eq!(err.info().code, "grid.empty_values");
    assert!(err.info().context.contains_key("experiment"));
    assert!(err.is_config());
}

#[test]
fn dispatch_error_surface() {
    let err = DxError::Dispatch(sample_info("dispatch.retries_exhausted", "gave up"));
    assert_eq!(err.info().code, "dispatch.retries_exhausted");
    assert!(!err.is_config());
}

#[test]
fn remote_error_surface() {
    let err = DxError::Remote(sample_info("remote.spawn", "no such host"));
    assert_eq!(err.info().code, "remote.spawn");
}

#[test]
fn serde_error_surface() {
    let err = DxError::Serde(sample_info("json.write", "broken pipe"));
    assert_eq!(err.info().code, "json.write");
}

#[test]
fn with_context_keeps_family() {
    let err = DxError::dispatch("dispatch.abort", "stop").with_context("attempt", "2");
    assert!(matches!(err, DxError::Dispatch(_)));
    assert_eq!(err.info().context.get("attempt").map(String::as_str), Some("2"));
}

#[test]
fn display_includes_context_and_hint() {
    let err = DxError::Config(
        ErrorInfo::new("registry.duplicate", "experiment already registered")
            .with_context("name", "compile")
            .with_hint("rename one of the experiments"),
    );
    let rendered = err.to_string();
    assert!(rendered.starts_with("config error: experiment already registered"));
    assert!(rendered.contains("name=compile"));
    assert!(rendered.contains("hint: rename one of the experiments"));
}

#[test]
fn errors_roundtrip_through_json() {
    let err = DxError::Remote(sample_info("remote.lost", "connection reset"));
    let json = serde_json::to_string(&err).expect("encode");
    assert!(json.contains("\"family\":\"Remote\""));
    let back: DxError = serde_json::from_str(&json).expect("decode");
    assert_eq!(back, err);
}
