//! Binding trees: a behavior invocation plus its (possibly nested) params.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One binding: a behavior code and its parameters.
///
/// Leaves have an empty `params` and a `value` that is a plain symbol
/// (`Q`, `LCTRL`, `BT_CLR`, a number, or a nested modifier expression like
/// `LC(LS(A))`). Non-leaf values are behavior codes beginning with `&`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Behavior code or leaf symbol.
    pub value: String,
    /// Nested parameters, empty for leaves.
    #[serde(default)]
    pub params: Vec<Binding>,
}

impl Binding {
    /// A behavior invocation with parameters.
    pub fn new(value: impl Into<String>, params: Vec<Binding>) -> Self {
        Self {
            value: value.into(),
            params,
        }
    }

    /// A parameterless binding or a leaf symbol.
    pub fn leaf(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            params: Vec::new(),
        }
    }

    /// True when the value is a behavior code (starts with `&`).
    #[must_use]
    pub fn is_behavior(&self) -> bool {
        self.value.starts_with('&')
    }

    /// Serializes the binding in keymap source form.
    ///
    /// `{&kp, [Q]}` becomes `&kp Q`; nested expressions are emitted verbatim
    /// with no added spaces inside parentheses: `{LC, [{LS, [A]}]}` becomes
    /// `LC(LS(A))`.
    #[must_use]
    pub fn to_dtsi(&self) -> String {
        if self.params.is_empty() {
            return self.value.clone();
        }
        if self.is_behavior() {
            let params: Vec<String> = self.params.iter().map(Binding::to_dtsi).collect();
            format!("{} {}", self.value, params.join(" "))
        } else {
            // Modifier-function form: LC(LS(A)).
            let params: Vec<String> = self.params.iter().map(Binding::to_dtsi).collect();
            format!("{}({})", self.value, params.join(","))
        }
    }

    /// Collects every behavior code reachable from this binding into `out`.
    pub fn collect_codes(&self, out: &mut BTreeSet<String>) {
        if self.is_behavior() {
            out.insert(self.value.clone());
        }
        for param in &self.params {
            param.collect_codes(out);
        }
    }

    /// Visits every node of the tree, leaves included.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Binding)) {
        visit(self);
        for param in &self.params {
            param.walk(visit);
        }
    }

    /// Rewrites every node value with `f`, returning the transformed tree.
    #[must_use]
    pub fn map_values(&self, f: &impl Fn(&str) -> String) -> Self {
        Self {
            value: f(&self.value),
            params: self.params.iter().map(|p| p.map_values(f)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_serialization() {
        assert_eq!(Binding::leaf("&trans").to_dtsi(), "&trans");
        assert_eq!(Binding::leaf("Q").to_dtsi(), "Q");
    }

    #[test]
    fn test_simple_binding() {
        let b = Binding::new("&kp", vec![Binding::leaf("Q")]);
        assert_eq!(b.to_dtsi(), "&kp Q");
    }

    #[test]
    fn test_two_param_binding() {
        let b = Binding::new("&lt", vec![Binding::leaf("1"), Binding::leaf("SPACE")]);
        assert_eq!(b.to_dtsi(), "&lt 1 SPACE");
    }

    #[test]
    fn test_nested_modifier_expression() {
        let inner = Binding::new("LS", vec![Binding::leaf("A")]);
        let outer = Binding::new("LC", vec![inner]);
        let b = Binding::new("&kp", vec![outer]);
        assert_eq!(b.to_dtsi(), "&kp LC(LS(A))");
    }

    #[test]
    fn test_collect_codes() {
        let b = Binding::new(
            "&ht_mod",
            vec![
                Binding::new("&kp", vec![Binding::leaf("A")]),
                Binding::leaf("LCTRL"),
            ],
        );
        let mut codes = BTreeSet::new();
        b.collect_codes(&mut codes);
        assert!(codes.contains("&ht_mod"));
        assert!(codes.contains("&kp"));
        assert!(!codes.contains("LCTRL"));
    }

    #[test]
    fn test_json_round_trip() {
        let b = Binding::new("&kp", vec![Binding::leaf("Q")]);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, r#"{"value":"&kp","params":[{"value":"Q","params":[]}]}"#);
        let back: Binding = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn test_params_default_on_deserialize() {
        let b: Binding = serde_json::from_str(r#"{"value":"&none"}"#).unwrap();
        assert!(b.params.is_empty());
    }
}
