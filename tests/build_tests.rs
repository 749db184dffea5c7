//! Workspace synthesis and build matrix scenarios.

mod fixtures;

use fixtures::{load_profile, GLOVE80_YAML};
use glovebox::build::driver::{resolve_user_mapping, BuildDriver};
use glovebox::build::WorkspaceBuilder;
use glovebox::profile::UserMappingConfig;
use tempfile::TempDir;

#[test]
fn split_keyboard_build_yaml_has_exactly_two_includes() {
    let tmp = TempDir::new().unwrap();
    let profile = load_profile(tmp.path(), "glove80", GLOVE80_YAML, Some("v25.05"));
    let builder = WorkspaceBuilder::new(&profile);

    let workspace_dir = TempDir::new().unwrap();
    let workspace = builder
        .prepare(workspace_dir.path(), "// keymap\n", "")
        .unwrap();

    let build_yaml: serde_yml::Value = serde_yml::from_str(
        &std::fs::read_to_string(workspace_dir.path().join("build.yaml")).unwrap(),
    )
    .unwrap();
    let include = build_yaml
        .get("include")
        .and_then(serde_yml::Value::as_sequence)
        .unwrap();
    assert_eq!(include.len(), 2);
    assert_eq!(
        include[0].get("board").and_then(serde_yml::Value::as_str),
        Some("glove80_lh")
    );
    assert_eq!(
        include[1].get("board").and_then(serde_yml::Value::as_str),
        Some("glove80_rh")
    );

    // The expected artifacts follow the ZMK naming convention per half.
    let names: Vec<String> = workspace
        .matrix
        .iter()
        .map(glovebox::profile::BuildMatrixEntry::artifact_base_name)
        .collect();
    assert_eq!(names, vec!["glove80_lh-zmk", "glove80_rh-zmk"]);
}

#[test]
fn synthesized_workspace_contains_required_files() {
    let tmp = TempDir::new().unwrap();
    let profile = load_profile(tmp.path(), "glove80", GLOVE80_YAML, Some("v25.05"));
    let builder = WorkspaceBuilder::new(&profile);

    let workspace_dir = TempDir::new().unwrap();
    builder
        .prepare(workspace_dir.path(), "// keymap\n", "CONFIG_ZMK_SLEEP=y\n")
        .unwrap();

    assert!(workspace_dir.path().join("config/west.yml").is_file());
    assert!(workspace_dir.path().join("config/glove80.keymap").is_file());
    assert!(workspace_dir.path().join("config/glove80.conf").is_file());
    assert!(workspace_dir.path().join("build.yaml").is_file());

    let west = std::fs::read_to_string(workspace_dir.path().join("config/west.yml")).unwrap();
    assert!(west.contains("url-base: https://github.com/moergo-sc"));
    assert!(west.contains("revision: v25.05"));
    assert!(west.contains("import: app/west.yml"));
    assert!(west.contains("path: config"));
}

#[test]
fn build_commands_target_each_half() {
    let tmp = TempDir::new().unwrap();
    let profile = load_profile(tmp.path(), "glove80", GLOVE80_YAML, Some("v25.05"));
    let driver = BuildDriver::new(&profile, None, None);
    let matrix = WorkspaceBuilder::new(&profile).effective_matrix();

    let commands = driver.strategy_commands(&matrix, true);
    assert!(commands.iter().any(|c| c.contains("-b glove80_lh")));
    assert!(commands.iter().any(|c| c.contains("-b glove80_rh")));
    assert!(commands
        .iter()
        .any(|c| c.contains("-DZMK_CONFIG=/workspace/config")));
}

#[test]
fn artifact_name_override_wins() {
    let yaml = GLOVE80_YAML.replace(
        "    - board: glove80_lh\n",
        "    - board: glove80_lh\n      artifact_name: left-half\n",
    );
    let tmp = TempDir::new().unwrap();
    let profile = load_profile(tmp.path(), "glove80", &yaml, None);
    let names: Vec<String> = WorkspaceBuilder::new(&profile)
        .effective_matrix()
        .iter()
        .map(glovebox::profile::BuildMatrixEntry::artifact_base_name)
        .collect();
    assert_eq!(names, vec!["left-half", "glove80_rh-zmk"]);
}

#[test]
fn user_mapping_layers_resolve_in_order() {
    let profile_layer = UserMappingConfig {
        uid: Some(1000),
        gid: Some(1000),
        ..UserMappingConfig::default()
    };
    let user_layer = UserMappingConfig {
        home: Some("/home/builder".into()),
        ..UserMappingConfig::default()
    };
    let resolved = resolve_user_mapping(None, Some(&profile_layer), Some(&user_layer));
    assert_eq!(resolved.uid, Some(1000));
    assert_eq!(resolved.gid, Some(1000));
    assert_eq!(resolved.home.as_deref(), Some("/home/builder"));
}
