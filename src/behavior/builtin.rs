//! The builtin ZMK behavior table.

use crate::behavior::{BehaviorEntry, Origin, ParamKind, ParamSpec};

const KEYS_H: &str = "<dt-bindings/zmk/keys.h>";
const BT_H: &str = "<dt-bindings/zmk/bt.h>";
const OUTPUTS_H: &str = "<dt-bindings/zmk/outputs.h>";
const RGB_H: &str = "<dt-bindings/zmk/rgb.h>";
const BACKLIGHT_H: &str = "<dt-bindings/zmk/backlight.h>";
const EXT_POWER_H: &str = "<dt-bindings/zmk/ext_power.h>";
const POINTING_H: &str = "<dt-bindings/zmk/pointing.h>";

struct Row {
    code: &'static str,
    name: &'static str,
    params: &'static [(&'static str, ParamKind)],
    includes: &'static [&'static str],
}

const TABLE: &[Row] = &[
    Row { code: "&kp", name: "Key Press", params: &[("key", ParamKind::Keycode)], includes: &[KEYS_H] },
    Row { code: "&kt", name: "Key Toggle", params: &[("key", ParamKind::Keycode)], includes: &[KEYS_H] },
    Row { code: "&sk", name: "Sticky Key", params: &[("key", ParamKind::Keycode)], includes: &[KEYS_H] },
    Row { code: "&mt", name: "Mod Tap", params: &[("modifier", ParamKind::Keycode), ("key", ParamKind::Keycode)], includes: &[KEYS_H] },
    Row { code: "&lt", name: "Layer Tap", params: &[("layer", ParamKind::Layer), ("key", ParamKind::Keycode)], includes: &[KEYS_H] },
    Row { code: "&mo", name: "Momentary Layer", params: &[("layer", ParamKind::Layer)], includes: &[] },
    Row { code: "&to", name: "To Layer", params: &[("layer", ParamKind::Layer)], includes: &[] },
    Row { code: "&tog", name: "Toggle Layer", params: &[("layer", ParamKind::Layer)], includes: &[] },
    Row { code: "&sl", name: "Sticky Layer", params: &[("layer", ParamKind::Layer)], includes: &[] },
    Row { code: "&trans", name: "Transparent", params: &[], includes: &[] },
    Row { code: "&none", name: "None", params: &[], includes: &[] },
    Row { code: "&gresc", name: "Grave Escape", params: &[], includes: &[KEYS_H] },
    Row { code: "&key_repeat", name: "Key Repeat", params: &[], includes: &[] },
    Row { code: "&caps_word", name: "Caps Word", params: &[], includes: &[] },
    Row { code: "&sys_reset", name: "System Reset", params: &[], includes: &[] },
    Row { code: "&bootloader", name: "Bootloader", params: &[], includes: &[] },
    Row { code: "&soft_off", name: "Soft Off", params: &[], includes: &[] },
    Row { code: "&studio_unlock", name: "Studio Unlock", params: &[], includes: &[] },
    Row { code: "&bt", name: "Bluetooth", params: &[("command", ParamKind::Command)], includes: &[BT_H] },
    Row { code: "&out", name: "Output Select", params: &[("command", ParamKind::Command)], includes: &[OUTPUTS_H] },
    Row { code: "&rgb_ug", name: "RGB Underglow", params: &[("command", ParamKind::Command)], includes: &[RGB_H] },
    Row { code: "&bl", name: "Backlight", params: &[("command", ParamKind::Command)], includes: &[BACKLIGHT_H] },
    Row { code: "&ext_power", name: "External Power", params: &[("command", ParamKind::Command)], includes: &[EXT_POWER_H] },
    Row { code: "&mkp", name: "Mouse Button", params: &[("button", ParamKind::Command)], includes: &[POINTING_H] },
    Row { code: "&msc", name: "Mouse Scroll", params: &[("movement", ParamKind::Command)], includes: &[POINTING_H] },
    Row { code: "&mmv", name: "Mouse Move", params: &[("movement", ParamKind::Command)], includes: &[POINTING_H] },
    // Macro operator behaviors, legal only inside macro sequences but
    // registered so collection and arity checks see them.
    Row { code: "&macro_press", name: "Macro Press Mode", params: &[], includes: &[] },
    Row { code: "&macro_release", name: "Macro Release Mode", params: &[], includes: &[] },
    Row { code: "&macro_tap", name: "Macro Tap Mode", params: &[], includes: &[] },
    Row { code: "&macro_pause_for_release", name: "Macro Pause For Release", params: &[], includes: &[] },
    Row { code: "&macro_wait_time", name: "Macro Wait Time", params: &[("ms", ParamKind::Integer)], includes: &[] },
    Row { code: "&macro_tap_time", name: "Macro Tap Time", params: &[("ms", ParamKind::Integer)], includes: &[] },
    Row { code: "&macro_param_1to1", name: "Macro Param 1 to 1", params: &[], includes: &[] },
    Row { code: "&macro_param_1to2", name: "Macro Param 1 to 2", params: &[], includes: &[] },
    Row { code: "&macro_param_2to1", name: "Macro Param 2 to 1", params: &[], includes: &[] },
    Row { code: "&macro_param_2to2", name: "Macro Param 2 to 2", params: &[], includes: &[] },
];

/// Builds the builtin ZMK entries.
pub(crate) fn builtin_entries() -> Vec<BehaviorEntry> {
    TABLE
        .iter()
        .map(|row| BehaviorEntry {
            code: row.code.to_string(),
            display_name: row.name.to_string(),
            description: None,
            expected_params: row.params.len(),
            origin: Origin::Zmk,
            includes: row.includes.iter().map(ToString::to_string).collect(),
            params: row
                .params
                .iter()
                .map(|(name, kind)| ParamSpec::new(name, *kind))
                .collect(),
        })
        .collect()
}
