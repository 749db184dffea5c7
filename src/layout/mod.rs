//! The typed layout document and its transforms.
//!
//! A layout is the JSON document users edit: metadata, named layers of
//! bindings, and behavior definitions. It round-trips losslessly (unknown
//! top-level fields are preserved) and is only mutated through the explicit
//! operations in [`edit`], [`decompose`]/[`compose`], and [`diff`].

pub mod binding;
pub mod decompose;
pub mod diff;
pub mod edit;
mod path;

pub use binding::Binding;
pub use decompose::{compose, decompose};
pub use diff::{diff, patch, upgrade, ConflictPolicy, LayoutPatch};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// One kconfig setting carried by the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigParam {
    /// Kconfig option name, e.g. `CONFIG_ZMK_SLEEP`.
    #[serde(rename = "paramName")]
    pub param_name: String,
    /// Value in layout form; booleans serialize as `y`/`n` downstream.
    pub value: serde_json::Value,
    /// Optional human note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Record of the last firmware produced from this layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareBuildRecord {
    /// ISO 8601 build timestamp.
    pub date: String,
    /// Profile spec used, e.g. `glove80/v25.05`.
    pub profile: String,
    /// Where the image was written.
    pub firmware_path: String,
    /// SHA-256 of the image.
    pub firmware_hash: String,
    /// Build identifier.
    pub build_id: String,
}

/// A user-defined macro behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroDef {
    /// Devicetree node name (sanitized identifier).
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default wait between bindings, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u32>,
    /// Default tap duration, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_ms: Option<u32>,
    /// The macro's binding sequence, including operator behaviors.
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

impl MacroDef {
    /// Parameter arity: the count of distinct `${0}`/`${1}` placeholders
    /// referenced anywhere in the sequence (0, 1, or 2).
    #[must_use]
    pub fn arity(&self) -> usize {
        let mut seen = BTreeSet::new();
        for binding in &self.bindings {
            binding.walk(&mut |node| {
                if node.value.contains("${0}") {
                    seen.insert(0);
                }
                if node.value.contains("${1}") {
                    seen.insert(1);
                }
            });
        }
        seen.len()
    }

    /// The behavior code this macro is invoked by.
    #[must_use]
    pub fn code(&self) -> String {
        format!("&{}", self.name)
    }
}

/// A user-defined hold-tap behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldTapDef {
    /// Devicetree node name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Decision flavor; must be in the profile's allowed set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
    /// Tapping term, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tapping_term_ms: Option<u32>,
    /// Quick-tap window, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_tap_ms: Option<u32>,
    /// Require-prior-idle window, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_prior_idle_ms: Option<u32>,
    /// Key positions that trigger the hold action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hold_trigger_key_positions: Vec<u32>,
    /// Whether the trigger list also applies on release.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hold_trigger_on_release: bool,
    /// Exactly two behavior references: tap action, hold action.
    #[serde(default)]
    pub bindings: Vec<String>,
}

impl HoldTapDef {
    /// The behavior code this hold-tap is invoked by.
    #[must_use]
    pub fn code(&self) -> String {
        format!("&{}", self.name)
    }
}

/// A user-defined combo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboDef {
    /// Devicetree node name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Press window, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u32>,
    /// Key positions that must be pressed together.
    #[serde(default)]
    pub key_positions: Vec<u32>,
    /// The behavior triggered by the combo.
    pub binding: Binding,
    /// Layer indices the combo is active on; empty means all layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<u32>,
}

/// A raw input-listener node (pointing devices and the like).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputListener {
    /// Listener node label, e.g. `trackball_listener`.
    pub code: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Raw DTSI body emitted inside the listener node.
    #[serde(default)]
    pub content: String,
}

/// The layout document.
///
/// Field order here defines the canonical JSON key order; unknown top-level
/// fields collect into `extra` and survive round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LayoutData {
    /// Logical keyboard identifier; must match a known profile.
    #[serde(default)]
    pub keyboard: String,
    /// Layout title.
    #[serde(default)]
    pub title: String,
    /// Author.
    #[serde(default)]
    pub creator: String,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
    /// Searchable tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Unique identity of this document.
    #[serde(default)]
    pub uuid: String,
    /// The master layout this derives from, empty for originals.
    #[serde(default)]
    pub parent_uuid: String,
    /// Document date, ISO 8601.
    #[serde(default)]
    pub date: String,
    /// Locale hint for key labels.
    #[serde(default)]
    pub locale: String,
    /// Layout-format API version.
    #[serde(default)]
    pub firmware_api_version: String,
    /// Semver-like document version.
    #[serde(default)]
    pub version: String,
    /// Version of the master this was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<String>,
    /// Identity of the master this was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_layout: Option<String>,
    /// User-defined scalars referenced by `${name}` in bindings.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Kconfig settings carried by the layout (highest precedence).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_parameters: Vec<ConfigParam>,
    /// Ordered, unique layer names; parallel to `layers`.
    #[serde(default)]
    pub layer_names: Vec<String>,
    /// Bindings per layer, outer index = layer, inner = key position.
    #[serde(default)]
    pub layers: Vec<Vec<Binding>>,
    /// User-defined macros.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub macros: Vec<MacroDef>,
    /// User-defined hold-taps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hold_taps: Vec<HoldTapDef>,
    /// User-defined combos.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combos: Vec<ComboDef>,
    /// Raw input-listener nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_listeners: Vec<InputListener>,
    /// Free-form DTSI emitted before the keymap node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_defined_behaviors: Option<String>,
    /// Free-form DTSI appended after the keymap node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_devicetree: Option<String>,
    /// Record of the last firmware produced from this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_firmware_build: Option<FirmwareBuildRecord>,
    /// Unknown top-level fields, preserved on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LayoutData {
    /// Parses a layout from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Json {
            context: "parsing layout document".into(),
            source: e,
        })
    }

    /// Loads a layout from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading layout {}", path.display()), e))?;
        Self::from_json(&text)
    }

    /// Canonical serialization: pretty JSON, fixed key order, `\n` endings,
    /// final newline. Two layouts are equal iff their canonical forms are
    /// byte-identical.
    pub fn to_canonical_json(&self) -> Result<String> {
        let mut text = serde_json::to_string_pretty(self).map_err(|e| Error::Json {
            context: "serializing layout document".into(),
            source: e,
        })?;
        text.push('\n');
        Ok(text)
    }

    /// Writes the canonical form atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = self.to_canonical_json()?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &text)
            .map_err(|e| Error::io(format!("writing {}", tmp.display()), e))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::io(format!("renaming to {}", path.display()), e))?;
        Ok(())
    }

    /// Every behavior code used anywhere: layer bindings, macro sequences,
    /// hold-tap actions, combos, plus the definitions' own codes.
    #[must_use]
    pub fn behavior_codes_used(&self) -> BTreeSet<String> {
        let mut codes = BTreeSet::new();
        for layer in &self.layers {
            for binding in layer {
                binding.collect_codes(&mut codes);
            }
        }
        for mac in &self.macros {
            codes.insert(mac.code());
            for binding in &mac.bindings {
                binding.collect_codes(&mut codes);
            }
        }
        for ht in &self.hold_taps {
            codes.insert(ht.code());
            for action in &ht.bindings {
                if action.starts_with('&') {
                    codes.insert(action.clone());
                }
            }
        }
        for combo in &self.combos {
            combo.binding.collect_codes(&mut codes);
        }
        codes
    }

    /// Structural invariants that hold regardless of any profile:
    /// parallel layer arrays, unique names, uniform layer width, resolvable
    /// layer references and variables.
    pub fn check_invariants(&self) -> Result<()> {
        if self.layers.len() != self.layer_names.len() {
            return Err(Error::Validation(format!(
                "layer_names has {} entries but layers has {}",
                self.layer_names.len(),
                self.layers.len()
            )));
        }
        if self.layers.is_empty() {
            return Err(Error::Validation("layout must have at least one layer".into()));
        }

        let mut seen = BTreeSet::new();
        for name in &self.layer_names {
            if !seen.insert(name.as_str()) {
                return Err(Error::Validation(format!("duplicate layer name '{name}'")));
            }
        }

        let width = self.layers[0].len();
        for (idx, layer) in self.layers.iter().enumerate() {
            if layer.len() != width {
                return Err(Error::Validation(format!(
                    "layer '{}' has {} bindings, expected {} (all layers must match)",
                    self.layer_names[idx],
                    layer.len(),
                    width
                )));
            }
        }

        self.check_layer_references()?;
        self.check_variable_references()?;
        Ok(())
    }

    /// Verifies every `&mo`/`&lt`/`&to`/`&tog`/`&sl` target names a layer.
    fn check_layer_references(&self) -> Result<()> {
        const LAYER_BEHAVIORS: &[&str] = &["&mo", "&lt", "&to", "&tog", "&sl"];
        for layer in &self.layers {
            for binding in layer {
                let mut result = Ok(());
                binding.walk(&mut |node| {
                    if result.is_err() || !LAYER_BEHAVIORS.contains(&node.value.as_str()) {
                        return;
                    }
                    if let Some(target) = node.params.first() {
                        if !self.layer_ref_resolves(&target.value) {
                            result = Err(Error::UnknownLayer(target.value.clone()));
                        }
                    }
                });
                result?;
            }
        }
        Ok(())
    }

    /// A layer reference is a numeric index in range or a known layer name.
    fn layer_ref_resolves(&self, reference: &str) -> bool {
        if let Ok(index) = reference.parse::<usize>() {
            return index < self.layer_names.len();
        }
        // Variables resolve before layer lookup happens downstream.
        if reference.starts_with("${") {
            return true;
        }
        self.layer_names.iter().any(|n| n == reference)
    }

    /// Verifies every `${var}` reference resolves to a variable.
    fn check_variable_references(&self) -> Result<()> {
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            for (pos, binding) in layer.iter().enumerate() {
                let mut result = Ok(());
                binding.walk(&mut |node| {
                    if result.is_ok() {
                        if let Some(name) = unresolved_variable(&node.value, &self.variables) {
                            result = Err(Error::UndefinedVariable {
                                name,
                                location: format!("layers[{layer_idx}][{pos}]"),
                            });
                        }
                    }
                });
                result?;
            }
        }
        Ok(())
    }

    /// Index of a layer by name.
    pub fn layer_index(&self, name: &str) -> Result<usize> {
        self.layer_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::UnknownLayer(name.to_string()))
    }
}

/// Returns the first `${name}` in `text` that is not a macro-parameter
/// placeholder and has no entry in `variables`.
pub(crate) fn unresolved_variable(
    text: &str,
    variables: &serde_json::Map<String, serde_json::Value>,
) -> Option<String> {
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let tail = &rest[start + 2..];
        let end = tail.find('}')?;
        let name = &tail[..end];
        // ${0}/${1} are macro parameter placeholders, not variables.
        if name != "0" && name != "1" && !variables.contains_key(name) {
            return Some(name.to_string());
        }
        rest = &tail[end + 1..];
    }
    None
}

/// Lower-cases and replaces anything outside `[A-Za-z0-9_-]` with `_`.
#[must_use]
pub fn slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_key_layout() -> LayoutData {
        LayoutData {
            keyboard: "toy42".into(),
            title: "T".into(),
            layer_names: vec!["L0".into()],
            layers: vec![vec![
                Binding::new("&kp", vec![Binding::leaf("Q")]),
                Binding::leaf("&trans"),
            ]],
            ..LayoutData::default()
        }
    }

    #[test]
    fn test_canonical_round_trip() {
        let layout = two_key_layout();
        let text = layout.to_canonical_json().unwrap();
        let back = LayoutData::from_json(&text).unwrap();
        assert_eq!(back, layout);
        assert_eq!(back.to_canonical_json().unwrap(), text);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let json = r#"{
            "keyboard": "toy42",
            "layer_names": ["L0"],
            "layers": [[{"value": "&none", "params": []}]],
            "futureField": {"nested": true}
        }"#;
        let layout = LayoutData::from_json(json).unwrap();
        assert!(layout.extra.contains_key("futureField"));
        let out = layout.to_canonical_json().unwrap();
        assert!(out.contains("futureField"));
    }

    #[test]
    fn test_invariants_layer_count_mismatch() {
        let mut layout = two_key_layout();
        layout.layer_names.push("GHOST".into());
        assert!(layout.check_invariants().is_err());
    }

    #[test]
    fn test_invariants_empty_layers_rejected() {
        let layout = LayoutData {
            keyboard: "toy42".into(),
            ..LayoutData::default()
        };
        assert!(layout.check_invariants().is_err());
    }

    #[test]
    fn test_invariants_width_mismatch() {
        let mut layout = two_key_layout();
        layout.layer_names.push("L1".into());
        layout.layers.push(vec![Binding::leaf("&none")]);
        let err = layout.check_invariants().unwrap_err();
        assert!(err.to_string().contains("bindings"));
    }

    #[test]
    fn test_layer_reference_checking() {
        let mut layout = two_key_layout();
        layout.layers[0][1] = Binding::new("&mo", vec![Binding::leaf("NAV")]);
        assert!(matches!(
            layout.check_invariants().unwrap_err(),
            Error::UnknownLayer(_)
        ));

        layout.layer_names.push("NAV".into());
        layout
            .layers
            .push(vec![Binding::leaf("&trans"), Binding::leaf("&trans")]);
        assert!(layout.check_invariants().is_ok());

        // Numeric references resolve by range.
        layout.layers[0][1] = Binding::new("&mo", vec![Binding::leaf("1")]);
        assert!(layout.check_invariants().is_ok());
        layout.layers[0][1] = Binding::new("&mo", vec![Binding::leaf("7")]);
        assert!(layout.check_invariants().is_err());
    }

    #[test]
    fn test_variable_reference_checking() {
        let mut layout = two_key_layout();
        layout.layers[0][0] = Binding::new("&kp", vec![Binding::leaf("${MOD}")]);
        assert!(matches!(
            layout.check_invariants().unwrap_err(),
            Error::UndefinedVariable { .. }
        ));

        layout
            .variables
            .insert("MOD".into(), serde_json::json!("LCTRL"));
        assert!(layout.check_invariants().is_ok());
    }

    #[test]
    fn test_macro_arity() {
        let mut mac = MacroDef {
            name: "email".into(),
            description: None,
            wait_ms: None,
            tap_ms: None,
            bindings: vec![
                Binding::new("&kp", vec![Binding::leaf("U")]),
                Binding::new("&kp", vec![Binding::leaf("S")]),
            ],
        };
        assert_eq!(mac.arity(), 0);

        mac.bindings.push(Binding::leaf("&macro_param_1to1"));
        mac.bindings
            .push(Binding::new("&kp", vec![Binding::leaf("${0}")]));
        assert_eq!(mac.arity(), 1);

        mac.bindings
            .push(Binding::new("&kp", vec![Binding::leaf("${1}")]));
        assert_eq!(mac.arity(), 2);
    }

    #[test]
    fn test_behavior_codes_used() {
        let mut layout = two_key_layout();
        layout.macros.push(MacroDef {
            name: "email".into(),
            description: None,
            wait_ms: None,
            tap_ms: None,
            bindings: vec![Binding::new("&kp", vec![Binding::leaf("A")])],
        });
        layout.hold_taps.push(HoldTapDef {
            name: "hm".into(),
            description: None,
            flavor: Some("balanced".into()),
            tapping_term_ms: None,
            quick_tap_ms: None,
            require_prior_idle_ms: None,
            hold_trigger_key_positions: vec![],
            hold_trigger_on_release: false,
            bindings: vec!["&kp".into(), "&mo".into()],
        });
        let codes = layout.behavior_codes_used();
        assert!(codes.contains("&email"));
        assert!(codes.contains("&hm"));
        assert!(codes.contains("&kp"));
        assert!(codes.contains("&mo"));
        assert!(codes.contains("&trans"));
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Base Layer"), "base_layer");
        assert_eq!(slug("NAV-2"), "nav-2");
        assert_eq!(slug("Fn/Media"), "fn_media");
    }
}
