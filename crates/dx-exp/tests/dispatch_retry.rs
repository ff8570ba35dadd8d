use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dx_core::DxError;
use dx_exp::testing::{MockBehavior, MockTransport};
use dx_exp::{
    CommandStatus, ControlSignal, Dispatcher, ExperimentOptions, ExperimentRegistry, InstanceState,
    ParameterSpec, RunOpts, ServerSpec,
};

fn nodes(count: usize) -> Vec<ServerSpec> {
    (1..=count)
        .map(|idx| ServerSpec::new(format!("n{idx}"), format!("10.0.0.{idx}")))
        .collect()
}

fn xy() -> ParameterSpec {
    ParameterSpec::new().option("x", [1, 2])
}

#[test]
fn restarts_rerun_same_binding_with_increasing_attempts() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "flaky",
            nodes(1),
            Some(xy()),
            move |ctx| {
                log.lock().expect("log").push((ctx.binding().int("x")?, ctx.attempt()));
                Ok(ControlSignal::restart_unless(ctx.attempt() >= 3))
            },
            ExperimentOptions::default(),
        )
        .expect("register");

    let transport = MockTransport::new();
    let report = Dispatcher::new(&transport, RunOpts::default())
        .run(registry.get("flaky").expect("flaky"))
        .expect("run");

    assert_eq!(
        *seen.lock().expect("log"),
        [(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]
    );
    assert_eq!(report.instances.len(), 2);
    assert!(report.instances.iter().all(|instance| instance.attempts == 3));
    assert!(report.is_complete());
    assert_eq!(report.total_attempts(), 6);
}

#[test]
fn retry_cap_of_three_gives_up_after_three_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "always_restart",
            nodes(1),
            Some(xy()),
            move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ControlSignal::Restart)
            },
            ExperimentOptions::default(),
        )
        .expect("register");

    let transport = MockTransport::new();
    let opts = RunOpts {
        max_attempts: Some(3),
        backoff: Duration::from_millis(1),
        ..RunOpts::default()
    };
    let report = Dispatcher::new(&transport, opts).run_all(&registry);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let err = report.error.clone().expect("fatal error");
    assert!(matches!(err, DxError::Dispatch(_)));
    assert_eq!(err.info().code, "dispatch.retries_exhausted");
    assert_eq!(err.info().context.get("attempt").map(String::as_str), Some("3"));
    assert_eq!(err.info().context.get("binding").map(String::as_str), Some("{x=1}"));

    let section = report.experiment("always_restart").expect("section");
    assert_eq!(section.instances.len(), 1, "second binding never starts");
    assert_eq!(section.instances[0].state, InstanceState::Failed);
    assert_eq!(section.instances[0].attempts, 3);
}

#[test]
fn experiment_cap_overrides_run_default() {
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "capped",
            nodes(1),
            None,
            |_ctx| Ok(ControlSignal::Restart),
            ExperimentOptions::default().with_max_attempts(2),
        )
        .expect("register");
    let transport = MockTransport::new();
    let opts = RunOpts {
        max_attempts: Some(10),
        ..RunOpts::default()
    };
    let report = Dispatcher::new(&transport, opts).run_all(&registry);
    assert_eq!(report.experiments[0].instances[0].attempts, 2);
    assert!(!report.is_success());
}

#[test]
fn raise_on_rc_launch_failure_aborts_without_later_bindings() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "ycsb",
            nodes(3),
            Some(xy()),
            move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let x = ctx.binding().int("x")?;
                // The body ignores the result; the run must still abort.
                let _ = ctx.run_on_all(|info| format!("ycsb -x {x} -n {}", info.index)).wait_all();
                Ok(ControlSignal::Done)
            },
            ExperimentOptions::default(),
        )
        .expect("register");
    registry
        .register("after", nodes(1), None, |_ctx| Ok(ControlSignal::Done), ExperimentOptions::default())
        .expect("register after");

    let transport = MockTransport::new().with_behavior("n2", MockBehavior::FailLaunch("ssh refused".into()));
    let report = Dispatcher::new(&transport, RunOpts::default()).run_all(&registry);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // n3 is not launched once n2 has failed.
    assert_eq!(transport.launch_count(), 2);
    let err = report.error.as_ref().expect("abort");
    assert_eq!(err.info().code, "dispatch.nonzero_exit");
    assert_eq!(err.info().context.get("target").map(String::as_str), Some("n2"));
    assert_eq!(err.info().context.get("binding").map(String::as_str), Some("{x=1}"));
    assert!(report.experiment("after").is_none());
}

#[test]
fn raise_on_rc_refuses_launches_after_first_failure() {
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "build",
            nodes(2),
            None,
            |ctx| {
                for step in ["cmake ..", "make -j", "make install"] {
                    let result = ctx.run_on_all(|_| step.to_string()).wait_all();
                    assert_eq!(result.results.len(), 2);
                }
                Ok(ControlSignal::Done)
            },
            ExperimentOptions::default(),
        )
        .expect("register");
    let transport = MockTransport::new().with_behavior("n1", MockBehavior::Exit(1));
    let report = Dispatcher::new(&transport, RunOpts::default()).run_all(&registry);

    let launched: Vec<_> = transport.launches().into_iter().map(|launch| launch.command).collect();
    assert_eq!(launched, ["cmake ..", "cmake .."]);
    let err = report.error.as_ref().expect("abort");
    assert_eq!(err.info().code, "dispatch.nonzero_exit");
    assert_eq!(err.info().context.get("command").map(String::as_str), Some("cmake .."));

    let commands = &report.experiments[0].instances[0].commands;
    assert_eq!(commands.len(), 6);
    assert!(commands[2..].iter().all(|result| matches!(
        &result.status,
        CommandStatus::LaunchFailed(reason) if reason.starts_with("not launched")
    )));
}

#[test]
fn run_and_wait_surfaces_failure_at_wait_site() {
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "strict",
            nodes(2),
            None,
            |ctx| {
                ctx.run_everywhere("make")?;
                Ok(ControlSignal::Restart)
            },
            ExperimentOptions::default(),
        )
        .expect("register");
    let transport = MockTransport::new().with_behavior("n1", MockBehavior::Exit(2));
    let err = Dispatcher::new(&transport, RunOpts::default())
        .run(registry.get("strict").expect("strict"))
        .expect_err("abort");
    assert_eq!(err.info().code, "dispatch.nonzero_exit");
    assert_eq!(err.info().context.get("status").map(String::as_str), Some("exit 2"));
}

#[test]
fn lenient_experiments_see_exit_codes_as_data() {
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "lenient",
            nodes(3),
            Some(xy()),
            |ctx| {
                let result = ctx.run_everywhere("bench")?;
                Ok(ControlSignal::restart_unless(result.all_succeeded()))
            },
            ExperimentOptions::lenient(),
        )
        .expect("register");
    // n3 fails on its first launch only.
    let transport = MockTransport::new().with_behavior("n3", MockBehavior::ExitSequence(vec![1, 0]));
    let report = Dispatcher::new(&transport, RunOpts::default())
        .run(registry.get("lenient").expect("lenient"))
        .expect("run");
    let attempts: Vec<_> = report.instances.iter().map(|instance| instance.attempts).collect();
    assert_eq!(attempts, [2, 1]);
    assert_eq!(transport.launch_count(), 9);
}

#[test]
fn unreachable_target_surfaces_as_launch_failure() {
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "uptime",
            nodes(2),
            None,
            |ctx| {
                let result = ctx.run_everywhere("uptime")?;
                let down: Vec<_> = result.failures().map(|failure| failure.target.clone()).collect();
                assert_eq!(down, ["n2"]);
                Ok(ControlSignal::Done)
            },
            ExperimentOptions::lenient(),
        )
        .expect("register");
    let transport = MockTransport::new().with_behavior("n2", MockBehavior::Unreachable("timeout".into()));
    let report = Dispatcher::new(&transport, RunOpts::default())
        .run(registry.get("uptime").expect("uptime"))
        .expect("run");
    assert!(report.is_complete());
    assert_eq!(transport.launch_count(), 1);
}

#[test]
fn abort_signal_and_body_errors_carry_binding() {
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "abort",
            nodes(1),
            Some(xy()),
            |ctx| {
                if ctx.binding().int("x")? == 2 {
                    return Ok(ControlSignal::Abort("disk full".into()));
                }
                Ok(ControlSignal::Done)
            },
            ExperimentOptions::default(),
        )
        .expect("register");
    registry
        .register(
            "broken",
            nodes(1),
            Some(ParameterSpec::new().option("mode", ["ro"])),
            |ctx| ctx.binding().int("mode").map(|_| ControlSignal::Done),
            ExperimentOptions::default(),
        )
        .expect("register");
    let transport = MockTransport::new();
    let dispatcher = Dispatcher::new(&transport, RunOpts::default());

    let err = dispatcher.run(registry.get("abort").expect("abort")).expect_err("abort");
    assert_eq!(err.info().code, "dispatch.abort");
    assert_eq!(err.info().hint.as_deref(), Some("disk full"));
    assert_eq!(err.info().context.get("binding").map(String::as_str), Some("{x=2}"));
    assert_eq!(err.info().context.get("experiment").map(String::as_str), Some("abort"));

    let err = dispatcher.run(registry.get("broken").expect("broken")).expect_err("type error");
    assert_eq!(err.info().code, "binding.type_mismatch");
    assert_eq!(err.info().context.get("attempt").map(String::as_str), Some("1"));
}

#[test]
fn command_timeout_aborts_under_raise_on_rc() {
    let mut registry = ExperimentRegistry::new();
    registry
        .register(
            "hang",
            nodes(2),
            None,
            |ctx| {
                let _ = ctx.run_on_all(|_| "bench".to_string()).wait_all();
                Ok(ControlSignal::Done)
            },
            ExperimentOptions::default().with_command_timeout(Duration::from_millis(40)),
        )
        .expect("register");
    let transport = MockTransport::new().with_behavior("n1", MockBehavior::Delay(Duration::from_secs(30), 0));
    let err = Dispatcher::new(&transport, RunOpts::default())
        .run(registry.get("hang").expect("hang"))
        .expect_err("timeout");
    assert_eq!(err.info().context.get("status").map(String::as_str), Some("timed out"));
}

#[test]
fn only_filter_runs_named_experiments_in_registration_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ExperimentRegistry::new();
    for name in ["compile", "ycsb", "tpcc"] {
        let log = Arc::clone(&order);
        registry
            .register(
                name,
                nodes(1),
                None,
                move |ctx| {
                    log.lock().expect("log").push(ctx.experiment().to_string());
                    Ok(ControlSignal::Done)
                },
                ExperimentOptions::default(),
            )
            .expect("register");
    }
    let transport = MockTransport::new();
    let opts = RunOpts {
        only: vec!["tpcc".into(), "compile".into()],
        ..RunOpts::default()
    };
    let report = Dispatcher::new(&transport, opts).run_all(&registry);
    assert!(report.is_success());
    assert_eq!(*order.lock().expect("log"), ["compile", "tpcc"]);

    let opts = RunOpts {
        only: vec!["missing".into()],
        ..RunOpts::default()
    };
    let report = Dispatcher::new(&transport, opts).run_all(&registry);
    assert!(report.error.as_ref().is_some_and(DxError::is_config));
    assert!(report.experiments.is_empty());
}
