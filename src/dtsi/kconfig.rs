//! `.conf` generation: merged Kconfig options, one per line.

use crate::layout::LayoutData;
use crate::profile::{KconfigValue, KeyboardProfile};
use std::collections::BTreeMap;

/// Merges Kconfig options with layout > firmware > profile precedence and
/// renders the `.conf` text. Sorted by option name; empty input renders an
/// empty string.
#[must_use]
pub fn generate_conf(profile: &KeyboardProfile, layout: &LayoutData) -> String {
    let mut merged: BTreeMap<String, KconfigValue> = BTreeMap::new();

    if let Some(keymap) = &profile.keymap_section {
        for (name, value) in &keymap.kconfig {
            merged.insert(name.clone(), value.clone());
        }
    }
    if let Some(firmware) = &profile.firmware_config {
        for (name, value) in &firmware.kconfig {
            merged.insert(name.clone(), value.clone());
        }
    }
    for param in &layout.config_parameters {
        merged.insert(param.param_name.clone(), KconfigValue::from_json(&param.value));
    }

    if merged.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    for (name, value) in &merged {
        out.push_str(name);
        out.push('=');
        out.push_str(&value.render());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ConfigParam;
    use crate::profile::{
        BuildMethodConfig, FirmwareConfig, FlashMethodConfig, KeymapConfig, ZmkConfig,
    };

    fn profile() -> KeyboardProfile {
        let mut keymap = KeymapConfig::default();
        keymap
            .kconfig
            .insert("CONFIG_ZMK_SLEEP".into(), KconfigValue::Bool(true));
        keymap.kconfig.insert(
            "CONFIG_ZMK_IDLE_TIMEOUT".into(),
            KconfigValue::Int(30000),
        );

        let mut firmware = FirmwareConfig {
            version: "v1".into(),
            branch: "main".into(),
            ..FirmwareConfig::default()
        };
        firmware
            .kconfig
            .insert("CONFIG_ZMK_IDLE_TIMEOUT".into(), KconfigValue::Int(60000));

        KeyboardProfile {
            keyboard_name: "toy42".into(),
            description: "Toy".into(),
            vendor: "Acme".into(),
            key_count: 2,
            flash_method: FlashMethodConfig::default(),
            build_method: BuildMethodConfig::default(),
            firmware_version: Some("v1".into()),
            firmware_config: Some(firmware),
            keymap_section: Some(keymap),
            zmk_config: ZmkConfig::default(),
        }
    }

    #[test]
    fn test_precedence_layout_over_firmware_over_profile() {
        let mut layout = LayoutData::default();
        layout.config_parameters.push(ConfigParam {
            param_name: "CONFIG_ZMK_SLEEP".into(),
            value: serde_json::json!(false),
            description: None,
        });

        let conf = generate_conf(&profile(), &layout);
        // Layout wins over profile base; firmware wins over profile base.
        assert!(conf.contains("CONFIG_ZMK_SLEEP=n"));
        assert!(conf.contains("CONFIG_ZMK_IDLE_TIMEOUT=60000"));
    }

    #[test]
    fn test_sorted_and_newline_terminated() {
        let conf = generate_conf(&profile(), &LayoutData::default());
        let lines: Vec<&str> = conf.lines().collect();
        assert_eq!(
            lines,
            vec!["CONFIG_ZMK_IDLE_TIMEOUT=60000", "CONFIG_ZMK_SLEEP=y"]
        );
        assert!(conf.ends_with('\n'));
    }

    #[test]
    fn test_empty_inputs_render_empty() {
        let profile = KeyboardProfile {
            firmware_config: None,
            keymap_section: None,
            ..profile()
        };
        assert_eq!(generate_conf(&profile, &LayoutData::default()), "");
    }

    #[test]
    fn test_string_values_quoted() {
        let mut layout = LayoutData::default();
        layout.config_parameters.push(ConfigParam {
            param_name: "CONFIG_ZMK_KEYBOARD_NAME".into(),
            value: serde_json::json!("Toy 42"),
            description: None,
        });
        let conf = generate_conf(&profile(), &layout);
        assert!(conf.contains("CONFIG_ZMK_KEYBOARD_NAME=\"Toy 42\""));
    }
}
