//! Post-merge schema validation for keyboard profiles.

use crate::error::{Error, Result};
use crate::profile::{FirmwareConfig, KeyboardProfile};
use regex::Regex;
use serde_yml::Value;

const REQUIRED_FIELDS: &[&str] = &["keyboard", "description", "vendor", "key_count", "flash", "build"];

/// Checks required top-level fields on the merged document.
pub fn check_required_fields(doc: &Value) -> Result<()> {
    let map = doc.as_mapping().ok_or_else(|| Error::SchemaError {
        field: "<root>".into(),
        reason: "profile document must be a mapping".into(),
    })?;

    for field in REQUIRED_FIELDS {
        let present = map
            .get(&Value::String((*field).to_string()))
            .is_some_and(|v| !v.is_null());
        if !present {
            return Err(Error::SchemaError {
                field: (*field).to_string(),
                reason: "required field is missing".into(),
            });
        }
    }
    Ok(())
}

/// Validates a fully deserialized profile.
pub fn check_profile(profile: &KeyboardProfile) -> Result<()> {
    if profile.key_count == 0 {
        return Err(Error::SchemaError {
            field: "key_count".into(),
            reason: "must be greater than zero".into(),
        });
    }

    let usb_id = Regex::new(r"^0x[0-9a-fA-F]{4}$").expect("static regex");
    for (field, value) in [
        ("flash.usb_vid", &profile.flash_method.usb_vid),
        ("flash.usb_pid", &profile.flash_method.usb_pid),
    ] {
        if !value.is_empty() && !usb_id.is_match(value) {
            return Err(Error::SchemaError {
                field: field.into(),
                reason: format!("'{value}' is not a 4-digit hex id like 0x1A2B"),
            });
        }
    }

    if let Some(firmware) = &profile.firmware_config {
        check_firmware(firmware)?;
    }

    let kconfig_name = Regex::new(r"^CONFIG_[A-Z0-9_]+$").expect("static regex");
    if let Some(keymap) = &profile.keymap_section {
        for name in keymap.kconfig.keys() {
            if !kconfig_name.is_match(name) {
                return Err(Error::SchemaError {
                    field: format!("keymap.kconfig.{name}"),
                    reason: "kconfig option names must match CONFIG_[A-Z0-9_]+".into(),
                });
            }
        }
        for behavior in &keymap.system_behaviors {
            if !behavior.code.starts_with('&') {
                return Err(Error::SchemaError {
                    field: format!("keymap.system_behaviors.{}", behavior.code),
                    reason: "behavior codes must begin with '&'".into(),
                });
            }
        }
    }

    Ok(())
}

/// Validates a firmware variant on its own (also used when listing them).
pub fn check_firmware(firmware: &FirmwareConfig) -> Result<()> {
    if firmware.branch.trim().is_empty() {
        return Err(Error::SchemaError {
            field: "firmwares.<version>.branch".into(),
            reason: "branch must be a non-empty string".into(),
        });
    }
    let kconfig_name = Regex::new(r"^CONFIG_[A-Z0-9_]+$").expect("static regex");
    for name in firmware.kconfig.keys() {
        if !kconfig_name.is_match(name) {
            return Err(Error::SchemaError {
                field: format!("firmwares.<version>.kconfig.{name}"),
                reason: "kconfig option names must match CONFIG_[A-Z0-9_]+".into(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{
        BuildMethodConfig, FlashMethodConfig, KeymapConfig, SystemBehavior, ZmkConfig,
    };

    fn minimal_profile() -> KeyboardProfile {
        KeyboardProfile {
            keyboard_name: "toy42".into(),
            description: "Toy".into(),
            vendor: "Acme".into(),
            key_count: 2,
            flash_method: FlashMethodConfig {
                usb_vid: "0x16c0".into(),
                usb_pid: "0x27db".into(),
                ..FlashMethodConfig::default()
            },
            build_method: BuildMethodConfig::default(),
            firmware_version: None,
            firmware_config: None,
            keymap_section: None,
            zmk_config: ZmkConfig::default(),
        }
    }

    #[test]
    fn test_required_fields() {
        let doc: Value = serde_yml::from_str(
            "keyboard: x\ndescription: d\nvendor: v\nkey_count: 2\nflash: {}\nbuild: {}",
        )
        .unwrap();
        assert!(check_required_fields(&doc).is_ok());

        let missing: Value = serde_yml::from_str("keyboard: x").unwrap();
        let err = check_required_fields(&missing).unwrap_err();
        assert!(err.to_string().contains("description"));
    }

    #[test]
    fn test_zero_key_count_rejected() {
        let mut profile = minimal_profile();
        profile.key_count = 0;
        assert!(check_profile(&profile).is_err());
    }

    #[test]
    fn test_usb_id_pattern() {
        let mut profile = minimal_profile();
        profile.flash_method.usb_vid = "16c0".into();
        let err = check_profile(&profile).unwrap_err();
        assert!(err.to_string().contains("usb_vid"));
    }

    #[test]
    fn test_empty_branch_rejected() {
        let mut profile = minimal_profile();
        profile.firmware_config = Some(FirmwareConfig {
            version: "v1".into(),
            branch: "  ".into(),
            ..FirmwareConfig::default()
        });
        assert!(check_profile(&profile).is_err());
    }

    #[test]
    fn test_kconfig_name_pattern() {
        let mut profile = minimal_profile();
        let mut keymap = KeymapConfig::default();
        keymap
            .kconfig
            .insert("NOT_CONFIG".into(), crate::profile::KconfigValue::Bool(true));
        profile.keymap_section = Some(keymap);
        assert!(check_profile(&profile).is_err());
    }

    #[test]
    fn test_behavior_sigil() {
        let mut profile = minimal_profile();
        let mut keymap = KeymapConfig::default();
        keymap.system_behaviors.push(SystemBehavior {
            code: "magic".into(),
            name: "Magic".into(),
            description: None,
            expected_params: 0,
            includes: vec![],
        });
        profile.keymap_section = Some(keymap);
        let err = check_profile(&profile).unwrap_err();
        assert!(err.to_string().contains("begin with '&'"));
    }
}
