//! Decompose/compose and serialization round-trip scenarios.

mod fixtures;

use fixtures::three_layer_layout;
use glovebox::layout::{compose, decompose, LayoutData};
use tempfile::TempDir;

#[test]
fn decompose_compose_is_byte_identical() {
    let layout = three_layer_layout();
    let tmp = TempDir::new().unwrap();

    decompose(&layout, tmp.path()).unwrap();
    let rebuilt = compose(tmp.path()).unwrap();

    assert_eq!(
        rebuilt.to_canonical_json().unwrap(),
        layout.to_canonical_json().unwrap()
    );
}

#[test]
fn decompose_writes_one_file_per_layer() {
    let layout = three_layer_layout();
    let tmp = TempDir::new().unwrap();
    decompose(&layout, tmp.path()).unwrap();

    for name in ["base", "lower", "raise"] {
        assert!(
            tmp.path().join(format!("layers/{name}.json")).is_file(),
            "missing layer file for {name}"
        );
    }
    let metadata = std::fs::read_to_string(tmp.path().join("metadata.json")).unwrap();
    assert!(metadata.contains("__extracted__"));
    assert!(!metadata.contains("\"layers\""));
}

#[test]
fn dtsi_sections_round_trip_through_component_files() {
    let mut layout = three_layer_layout();
    layout.custom_devicetree = Some("/ { my_node { }; };\n".into());
    layout.custom_defined_behaviors = Some("// behaviors fragment\n".into());

    let tmp = TempDir::new().unwrap();
    decompose(&layout, tmp.path()).unwrap();

    assert!(tmp.path().join("device.dtsi").is_file());
    assert!(tmp.path().join("keymap.dtsi").is_file());

    let rebuilt = compose(tmp.path()).unwrap();
    assert_eq!(
        rebuilt.to_canonical_json().unwrap(),
        layout.to_canonical_json().unwrap()
    );
}

#[test]
fn json_round_trip_preserves_unknown_fields_and_order() {
    let json = r#"{
        "keyboard": "toy42",
        "title": "Ordered",
        "layer_names": ["Z", "A"],
        "layers": [
            [{"value": "&kp", "params": [{"value": "Z", "params": []}]}],
            [{"value": "&kp", "params": [{"value": "A", "params": []}]}]
        ],
        "config_parameters": [
            {"paramName": "CONFIG_B", "value": 1},
            {"paramName": "CONFIG_A", "value": 2}
        ],
        "someFutureField": {"keep": "me"}
    }"#;

    let layout = LayoutData::from_json(json).unwrap();
    // Document order is preserved for layer names and sequences.
    assert_eq!(layout.layer_names, vec!["Z", "A"]);
    assert_eq!(layout.config_parameters[0].param_name, "CONFIG_B");

    let out = layout.to_canonical_json().unwrap();
    assert!(out.contains("someFutureField"));
    let reparsed = LayoutData::from_json(&out).unwrap();
    assert_eq!(reparsed, layout);
    assert_eq!(reparsed.to_canonical_json().unwrap(), out);
}

#[test]
fn compose_rejects_tampered_indices() {
    let layout = three_layer_layout();
    let tmp = TempDir::new().unwrap();
    decompose(&layout, tmp.path()).unwrap();

    // Skew an index so the set is no longer dense.
    let path = tmp.path().join("layers/raise.json");
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("\"index\": 2", "\"index\": 5")).unwrap();

    assert!(compose(tmp.path()).is_err());
}
