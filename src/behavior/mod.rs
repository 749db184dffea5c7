//! Behavior registry: which codes are legal, their arity, and the DTSI
//! includes they pull in.
//!
//! The registry is assembled per profile from three origins with strict
//! precedence (user > vendor > zmk): the builtin ZMK table, the profile's
//! `system_behaviors`, and the behaviors a specific layout defines.

mod builtin;
mod registry;

pub use registry::BehaviorRegistry;

use serde::{Deserialize, Serialize};

/// Where a registry entry came from; decides precedence on conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Builtin ZMK behavior (lowest precedence).
    Zmk,
    /// Declared by the keyboard profile.
    Vendor,
    /// Defined inside the layout document (highest precedence).
    User,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zmk => write!(f, "zmk"),
            Self::Vendor => write!(f, "vendor"),
            Self::User => write!(f, "user"),
        }
    }
}

/// What a parameter slot accepts. Used for diagnostics, not type-checking:
/// ZMK headers define the symbols, which the generator cannot see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// A key code symbol (`Q`, `LC(LS(A))`).
    Keycode,
    /// A layer index or name.
    Layer,
    /// An integer literal.
    Integer,
    /// A command symbol from a ZMK header (`BT_CLR`, `EP_TOG`).
    Command,
    /// Anything.
    Any,
}

/// One parameter slot of a behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Slot name for diagnostics.
    pub name: String,
    /// What the slot accepts.
    pub kind: ParamKind,
}

impl ParamSpec {
    pub(crate) fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// A registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorEntry {
    /// Behavior code including the `&` sigil.
    pub code: String,
    /// Display name for listings.
    pub display_name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Number of parameters an invocation takes.
    pub expected_params: usize,
    /// Precedence origin.
    pub origin: Origin,
    /// DTSI includes an invocation requires.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
    /// Parameter slots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamSpec>,
}
