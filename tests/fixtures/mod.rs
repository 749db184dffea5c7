//! Shared fixtures for integration tests.
#![allow(dead_code)] // Not every suite uses every fixture.

use glovebox::layout::{Binding, LayoutData};
use glovebox::profile::{KeyboardProfile, ProfileResolver};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A two-key test keyboard with one base include, matching the minimal
/// profile the generator scenarios use.
pub const TOY42_YAML: &str = r#"
keyboard: toy42
description: Two-key test board
vendor: Acme
key_count: 2
flash:
  usb_vid: "0x1209"
  usb_pid: "0x0042"
  device_query: "vendor=Acme and removable=true"
build:
  strategy: zmk_config
  image: zmkfirmware/zmk-build-arm:stable
  repository: https://github.com/zmkfirmware/zmk
  revision: main
  matrix:
    - board: nice_nano_v2
      shield: toy42
keymap:
  includes:
    - "<dt-bindings/zmk/keys.h>"
firmwares:
  v1:
    branch: main
"#;

/// A split 80-key keyboard with per-half boards, as scenario C expects.
pub const GLOVE80_YAML: &str = r#"
keyboard: glove80
description: MoErgo Glove80
vendor: MoErgo
key_count: 80
flash:
  usb_vid: "0x16c0"
  usb_pid: "0x27db"
  device_query: "vendor=Adafruit and removable=true"
build:
  strategy: zmk_config
  image: glove80-zmk-config-docker
  repository: https://github.com/moergo-sc/zmk
  revision: v25.05
  is_split: true
  matrix:
    - board: glove80_lh
    - board: glove80_rh
keymap:
  includes:
    - "<behaviors.dtsi>"
    - "<dt-bindings/zmk/keys.h>"
firmwares:
  v25.05:
    branch: v25.05
"#;

/// Writes a profile YAML into `dir` and resolves it.
pub fn load_profile(dir: &Path, name: &str, yaml: &str, firmware: Option<&str>) -> Arc<KeyboardProfile> {
    std::fs::write(dir.join(format!("{name}.yaml")), yaml).unwrap();
    let resolver = ProfileResolver::new(vec![dir.to_path_buf()]);
    resolver.load(name, firmware).unwrap()
}

/// A resolver rooted at a fresh temp dir seeded with the toy42 profile.
pub fn toy42_resolver() -> (TempDir, ProfileResolver) {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("toy42.yaml"), TOY42_YAML).unwrap();
    let resolver = ProfileResolver::new(vec![tmp.path().to_path_buf()]);
    (tmp, resolver)
}

/// The minimal two-key layout from the generator scenarios.
pub fn minimal_layout() -> LayoutData {
    LayoutData {
        keyboard: "toy42".into(),
        title: "T".into(),
        layer_names: vec!["L0".into()],
        layers: vec![vec![kp("Q"), Binding::leaf("&trans")]],
        ..LayoutData::default()
    }
}

/// A three-layer layout for round-trip scenarios.
pub fn three_layer_layout() -> LayoutData {
    LayoutData {
        keyboard: "toy42".into(),
        title: "Round Trip".into(),
        uuid: "0d9f1f26-5f54-4a0e-9f0a-2f9e3b7c4d5e".into(),
        version: "7".into(),
        layer_names: vec!["BASE".into(), "LOWER".into(), "RAISE".into()],
        layers: vec![
            vec![kp("Q"), Binding::new("&mo", vec![Binding::leaf("1")])],
            vec![kp("N1"), Binding::leaf("&trans")],
            vec![Binding::leaf("&trans"), Binding::leaf("&none")],
        ],
        ..LayoutData::default()
    }
}

/// `&kp <key>`.
pub fn kp(key: &str) -> Binding {
    Binding::new("&kp", vec![Binding::leaf(key)])
}
