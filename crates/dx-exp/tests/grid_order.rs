use std::collections::BTreeSet;

use dx_core::ParamValue;
use dx_exp::{GridParameter, ParameterBinding, ParameterGrid, ParameterSpec};
use proptest::prelude::*;

fn pairs(binding: &ParameterBinding) -> Vec<(String, i64)> {
    binding
        .iter()
        .map(|(name, value)| (name.to_string(), value.as_i64().expect("int value")))
        .collect()
}

#[test]
fn two_options_expand_row_major() {
    let grid = ParameterGrid::new(ParameterSpec::new().option("x", [1, 2]).option("y", [10, 20]))
        .expect("grid");
    let order: Vec<_> = grid.iter().map(|binding| pairs(&binding)).collect();
    let expected = [(1, 10), (1, 20), (2, 10), (2, 20)]
        .iter()
        .map(|&(x, y)| vec![("x".to_string(), x), ("y".to_string(), y)])
        .collect::<Vec<_>>();
    assert_eq!(order, expected);
    assert_eq!(grid.len(), 4);
    assert_eq!(grid.iter().len(), 4);
}

#[test]
fn empty_spec_yields_one_empty_binding() {
    let grid = ParameterGrid::new(ParameterSpec::new()).expect("grid");
    let bindings: Vec<_> = grid.iter().collect();
    assert_eq!(bindings.len(), 1);
    assert!(bindings[0].is_empty());
    assert_eq!(bindings[0].to_string(), "{}");
}

#[test]
fn mixed_value_kinds_render_in_bindings() {
    let grid = ParameterGrid::new(
        ParameterSpec::new()
            .option("dramGB", [150])
            .option("ratio", [0.5, 1.0])
            .option("workload", ["ycsb_a"])
            .option("ssd", [true]),
    )
    .expect("grid");
    let rendered: Vec<_> = grid.iter().map(|binding| binding.to_string()).collect();
    assert_eq!(
        rendered,
        [
            "{dramGB=150, ratio=0.5, workload=ycsb_a, ssd=true}",
            "{dramGB=150, ratio=1.0, workload=ycsb_a, ssd=true}",
        ]
    );
}

#[test]
fn invalid_specs_are_config_errors() {
    let err = ParameterGrid::new(ParameterSpec::new().option("x", Vec::<i64>::new()))
        .expect_err("empty list");
    assert!(err.is_config());
    assert_eq!(err.info().code, "grid.empty_values");

    let err = ParameterGrid::new(ParameterSpec::new().option("x", [1]).option("x", [2]))
        .expect_err("duplicate");
    assert_eq!(err.info().code, "grid.duplicate_option");
    assert_eq!(err.info().context.get("option").map(String::as_str), Some("x"));

    let err = ParameterGrid::new(ParameterSpec::new().option(" ", [1])).expect_err("blank");
    assert_eq!(err.info().code, "grid.blank_name");
}

#[test]
fn spec_deserializes_from_parameter_list() {
    let yaml = "- { name: threads, values: [1, 2] }\n- { name: mode, values: [ro] }\n";
    let spec: ParameterSpec = serde_yaml::from_str(yaml).expect("yaml");
    assert_eq!(
        spec.parameters()[1],
        GridParameter {
            name: "mode".into(),
            values: vec![ParamValue::Str("ro".into())],
        }
    );
    assert_eq!(ParameterGrid::new(spec).expect("grid").len(), 2);
}

#[test]
fn binding_serializes_in_declaration_order() {
    let grid = ParameterGrid::new(ParameterSpec::new().option("z", [1]).option("a", ["q"]))
        .expect("grid");
    let binding = grid.binding_at(0).expect("binding");
    let json = serde_json::to_string(&binding).expect("json");
    assert_eq!(json, r#"{"z":1,"a":"q"}"#);
    let back: ParameterBinding = serde_json::from_str(&json).expect("parse");
    assert_eq!(back, binding);
}

fn spec_from_lengths(lengths: &[usize]) -> ParameterSpec {
    lengths.iter().enumerate().fold(ParameterSpec::new(), |spec, (idx, &len)| {
        spec.option(format!("p{idx}"), (0..len as i64).collect::<Vec<_>>())
    })
}

proptest! {
    #[test]
    fn expansion_is_complete_unique_and_repeatable(lengths in prop::collection::vec(1usize..5, 0..5)) {
        let grid = ParameterGrid::new(spec_from_lengths(&lengths)).expect("grid");
        let expected: usize = lengths.iter().product();
        let first: Vec<_> = grid.iter().map(|binding| pairs(&binding)).collect();
        let second: Vec<_> = grid.iter().map(|binding| pairs(&binding)).collect();
        prop_assert_eq!(first.len(), expected);
        prop_assert_eq!(&first, &second);
        let unique: BTreeSet<_> = first.iter().cloned().collect();
        prop_assert_eq!(unique.len(), expected);
        for (idx, binding) in first.iter().enumerate() {
            prop_assert_eq!(binding.len(), lengths.len());
            prop_assert_eq!(&pairs(&grid.binding_at(idx).expect("in range")), binding);
        }
        // Last option varies fastest.
        if let Some(&last) = lengths.last() {
            if expected > 1 && last > 1 {
                let tail = |idx: usize| first[idx].last().map(|(_, value)| *value);
                prop_assert_eq!(tail(0), Some(0));
                prop_assert_eq!(tail(1), Some(1));
            }
        }
    }
}
