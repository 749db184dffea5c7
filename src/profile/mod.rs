//! Keyboard profile model and resolution.
//!
//! A profile is the merged keyboard + optional firmware configuration that
//! every other subsystem consumes. Profiles are loaded from YAML files by the
//! [`resolver::ProfileResolver`], deep-merged across includes, validated, and
//! immutable afterwards.

pub mod merge;
pub mod resolver;
mod schema;

pub use resolver::ProfileResolver;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How firmware reaches the keyboard over USB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlashMethodConfig {
    /// USB vendor id as a hex string, e.g. `"0x16c0"`.
    #[serde(default)]
    pub usb_vid: String,
    /// USB product id as a hex string.
    #[serde(default)]
    pub usb_pid: String,
    /// Device query in the detector's query language (see `flash::query`).
    #[serde(default)]
    pub device_query: String,
    /// Mount backend: `udisks` (default) or `manual`.
    #[serde(default = "default_mount_method")]
    pub mount_method: String,
}

fn default_mount_method() -> String {
    "udisks".to_string()
}

/// One row of the build matrix: a (board, shield) combination to compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMatrixEntry {
    /// Zephyr board identifier (e.g. `nice_nano_v2`, `glove80_lh`).
    pub board: String,
    /// ZMK shield, absent for boards with integrated electronics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shield: Option<String>,
    /// Override for the output `.uf2` base name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<String>,
    /// Extra `-D` arguments forwarded to CMake.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmake_args: Vec<String>,
    /// Zephyr snippet to apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl BuildMatrixEntry {
    /// Default artifact name per the ZMK convention `${shield-}${board}-zmk`.
    #[must_use]
    pub fn artifact_base_name(&self) -> String {
        if let Some(name) = &self.artifact_name {
            return name.clone();
        }
        match &self.shield {
            Some(shield) => format!("{shield}-{}-zmk", self.board),
            None => format!("{}-zmk", self.board),
        }
    }
}

/// Build strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStrategy {
    /// Standard ZMK user-config build: `west init -l config && west update`.
    #[default]
    ZmkConfig,
    /// Manifest-defined multi-repo west workspace.
    West,
    /// Direct out-of-tree CMake build.
    Cmake,
    /// Plain Makefile project.
    Make,
    /// Ninja project.
    Ninja,
    /// Profile-supplied shell command sequence.
    Custom,
}

/// Container-side user identity for builds. Fields left unset fall through
/// to the next precedence level (CLI > profile > user config > auto-detect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserMappingConfig {
    /// Disable mapping entirely (container runs as its default user).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Container-side UID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    /// Container-side GID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// Container-side HOME.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
}

/// Where the build workspace comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceSource {
    /// Materialize a minimal workspace from the profile.
    #[default]
    Synthesized,
    /// Clone the profile's existing ZMK-config repository.
    ConfigRepo,
}

/// How to compile firmware for this keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuildMethodConfig {
    /// Which build strategy to run.
    #[serde(default)]
    pub strategy: BuildStrategy,
    /// Whether the workspace is cloned or synthesized.
    #[serde(default)]
    pub source: WorkspaceSource,
    /// Container image the build runs in.
    #[serde(default)]
    pub image: String,
    /// ZMK (or zmk-config) repository URL.
    #[serde(default)]
    pub repository: String,
    /// Default revision (branch, tag, or SHA).
    #[serde(default)]
    pub revision: String,
    /// The (board, shield) combinations to produce firmware for.
    #[serde(default)]
    pub matrix: Vec<BuildMatrixEntry>,
    /// Whether the halves of a split keyboard build separately.
    #[serde(default)]
    pub is_split: bool,
    /// Regenerate a config-repo `build.yaml` from the matrix.
    /// Default preserves the remote file.
    #[serde(default)]
    pub regenerate_build_yaml: bool,
    /// Shell command sequence for the `custom` strategy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Container user mapping overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_mapping: Option<UserMappingConfig>,
}

/// A Kconfig value as profiles and layouts carry it.
///
/// Renders per the `.conf` contract: `y`/`n` for booleans, decimal for
/// integers, double-quoted for strings (already-quoted strings pass
/// through).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KconfigValue {
    /// Boolean option.
    Bool(bool),
    /// Integer option.
    Int(i64),
    /// String option.
    Str(String),
}

impl KconfigValue {
    /// The `.conf` form of this value.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Bool(true) => "y".to_string(),
            Self::Bool(false) => "n".to_string(),
            Self::Int(n) => n.to_string(),
            Self::Str(s) => {
                if s == "y" || s == "n" || s.parse::<i64>().is_ok() {
                    s.clone()
                } else if s.starts_with('"') && s.ends_with('"') && s.len() >= 2 {
                    s.clone()
                } else {
                    format!("\"{s}\"")
                }
            }
        }
    }

    /// Conversion from a layout's JSON parameter value.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Str(n.to_string()), Self::Int),
            serde_json::Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }
}

/// A firmware variant declared under the profile's `firmwares:` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FirmwareConfig {
    /// Human-facing version label.
    #[serde(default)]
    pub version: String,
    /// Upstream branch this firmware tracks. Must be non-empty.
    #[serde(default)]
    pub branch: String,
    /// Short description of the variant.
    #[serde(default)]
    pub description: String,
    /// Kconfig overrides applied on top of the keymap section's options.
    #[serde(default)]
    pub kconfig: BTreeMap<String, KconfigValue>,
}

/// A system behavior declared by the profile (vendor origin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemBehavior {
    /// Behavior code including the `&` sigil.
    pub code: String,
    /// Display name for listings.
    #[serde(default)]
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Number of parameters the behavior takes.
    #[serde(default)]
    pub expected_params: usize,
    /// DTSI includes this behavior requires.
    #[serde(default)]
    pub includes: Vec<String>,
}

/// A spacer marker inside a formatting row.
pub const ROW_GAP: i64 = -1;

/// Visual formatting of generated keymap layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattingConfig {
    /// Key positions in visual order, row by row. `-1` marks a gap.
    #[serde(default)]
    pub rows: Vec<Vec<i64>>,
    /// Column width bindings are padded to.
    #[serde(default = "default_key_width")]
    pub default_key_width: usize,
}

fn default_key_width() -> usize {
    8
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            default_key_width: default_key_width(),
        }
    }
}

/// The keymap-generation section of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeymapConfig {
    /// Unconditional DTSI includes, emitted before behavior-driven ones.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Base kconfig options (lowest precedence).
    #[serde(default)]
    pub kconfig: BTreeMap<String, KconfigValue>,
    /// Vendor-declared behaviors beyond the builtin ZMK set.
    #[serde(default)]
    pub system_behaviors: Vec<SystemBehavior>,
    /// Layer formatting rules.
    #[serde(default)]
    pub formatting: FormattingConfig,
}

/// Validation limits enforced by the DTSI generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationLimits {
    /// Maximum number of layers a layout may define.
    #[serde(default = "default_max_layers")]
    pub max_layers: usize,
    /// Maximum parameters a macro may take.
    #[serde(default = "default_max_macro_params")]
    pub max_macro_params: usize,
    /// Exact number of bindings a hold-tap must declare.
    #[serde(default = "default_required_holdtap_bindings")]
    pub required_holdtap_bindings: usize,
    /// Non-fatal warning threshold for layer count.
    #[serde(default = "default_warn_many_layers")]
    pub warn_many_layers_threshold: usize,
}

fn default_max_layers() -> usize {
    32
}
fn default_max_macro_params() -> usize {
    2
}
fn default_required_holdtap_bindings() -> usize {
    2
}
fn default_warn_many_layers() -> usize {
    16
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_layers: default_max_layers(),
            max_macro_params: default_max_macro_params(),
            required_holdtap_bindings: default_required_holdtap_bindings(),
            warn_many_layers_threshold: default_warn_many_layers(),
        }
    }
}

/// ZMK devicetree conventions the generator targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZmkConfig {
    /// `compatible` string for macro behavior nodes.
    #[serde(default = "default_macro_compatible")]
    pub compatible_macro: String,
    /// `compatible` string for hold-tap behavior nodes.
    #[serde(default = "default_holdtap_compatible")]
    pub compatible_hold_tap: String,
    /// `compatible` string for the combos block.
    #[serde(default = "default_combos_compatible")]
    pub compatible_combos: String,
    /// Hold-tap flavors the firmware accepts.
    #[serde(default = "default_flavors")]
    pub hold_tap_flavors: Vec<String>,
    /// Regex a sanitized devicetree identifier must match.
    #[serde(default = "default_identifier_pattern")]
    pub identifier_pattern: String,
    /// Limits enforced during generation.
    #[serde(default)]
    pub validation_limits: ValidationLimits,
}

fn default_macro_compatible() -> String {
    "zmk,behavior-macro".to_string()
}
fn default_holdtap_compatible() -> String {
    "zmk,behavior-hold-tap".to_string()
}
fn default_combos_compatible() -> String {
    "zmk,combos".to_string()
}
fn default_flavors() -> Vec<String> {
    ["tap-preferred", "hold-preferred", "balanced", "tap-unless-interrupted"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_identifier_pattern() -> String {
    "^[a-z_][a-z0-9_]*$".to_string()
}

impl Default for ZmkConfig {
    fn default() -> Self {
        Self {
            compatible_macro: default_macro_compatible(),
            compatible_hold_tap: default_holdtap_compatible(),
            compatible_combos: default_combos_compatible(),
            hold_tap_flavors: default_flavors(),
            identifier_pattern: default_identifier_pattern(),
            validation_limits: ValidationLimits::default(),
        }
    }
}

/// The validated, immutable profile every subsystem consumes.
///
/// A profile without a firmware section is *keyboard-only*: it can drive the
/// flash engine but any compile-category operation fails with
/// `ProfileIncomplete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardProfile {
    /// Logical keyboard identifier (matches the layout's `keyboard` field).
    pub keyboard_name: String,
    /// Human-facing description.
    pub description: String,
    /// Keyboard vendor.
    pub vendor: String,
    /// Physical key count; every layer must resolve to this length.
    pub key_count: usize,
    /// USB flash parameters.
    pub flash_method: FlashMethodConfig,
    /// Build parameters.
    pub build_method: BuildMethodConfig,
    /// Selected firmware version label, if any.
    pub firmware_version: Option<String>,
    /// Selected firmware variant, if any.
    pub firmware_config: Option<FirmwareConfig>,
    /// Keymap-generation section, absent for flash-only profiles.
    pub keymap_section: Option<KeymapConfig>,
    /// ZMK devicetree conventions.
    pub zmk_config: ZmkConfig,
}

impl KeyboardProfile {
    /// True when the profile can compile firmware.
    #[must_use]
    pub const fn can_compile(&self) -> bool {
        self.firmware_config.is_some()
    }

    /// Errors with `ProfileIncomplete` unless the profile can compile.
    pub fn require_compile(&self) -> crate::error::Result<()> {
        if self.can_compile() {
            Ok(())
        } else {
            Err(crate::error::Error::ProfileIncomplete(
                self.keyboard_name.clone(),
            ))
        }
    }

    /// The keymap section, or empty defaults for keyboard-only profiles.
    #[must_use]
    pub fn keymap(&self) -> KeymapConfig {
        self.keymap_section.clone().unwrap_or_default()
    }

    /// The effective build matrix. Split keyboards with an empty explicit
    /// matrix synthesize `<board>_left` / `<board>_right` rows elsewhere; the
    /// profile itself never invents entries.
    #[must_use]
    pub fn build_matrix(&self) -> &[BuildMatrixEntry] {
        &self.build_method.matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_base_name() {
        let entry = BuildMatrixEntry {
            board: "nice_nano_v2".into(),
            shield: Some("corne_left".into()),
            artifact_name: None,
            cmake_args: vec![],
            snippet: None,
        };
        assert_eq!(entry.artifact_base_name(), "corne_left-nice_nano_v2-zmk");

        let board_only = BuildMatrixEntry {
            board: "glove80_lh".into(),
            shield: None,
            artifact_name: None,
            cmake_args: vec![],
            snippet: None,
        };
        assert_eq!(board_only.artifact_base_name(), "glove80_lh-zmk");

        let overridden = BuildMatrixEntry {
            artifact_name: Some("left-half".into()),
            ..board_only
        };
        assert_eq!(overridden.artifact_base_name(), "left-half");
    }

    #[test]
    fn test_keyboard_only_profile() {
        let profile = KeyboardProfile {
            keyboard_name: "toy42".into(),
            description: "Test".into(),
            vendor: "Acme".into(),
            key_count: 2,
            flash_method: FlashMethodConfig::default(),
            build_method: BuildMethodConfig::default(),
            firmware_version: None,
            firmware_config: None,
            keymap_section: None,
            zmk_config: ZmkConfig::default(),
        };
        assert!(!profile.can_compile());
        assert!(profile.require_compile().is_err());
        assert!(profile.keymap().includes.is_empty());
    }

    #[test]
    fn test_build_strategy_serde_names() {
        let yaml = "zmk_config";
        let strategy: BuildStrategy = serde_yml::from_str(yaml).unwrap();
        assert_eq!(strategy, BuildStrategy::ZmkConfig);
        assert_eq!(
            serde_yml::to_string(&BuildStrategy::Cmake).unwrap().trim(),
            "cmake"
        );
    }
}
