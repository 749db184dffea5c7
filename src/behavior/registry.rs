//! Registry assembly, lookup, and binding validation.

use crate::behavior::{builtin, BehaviorEntry, Origin, ParamKind, ParamSpec};
use crate::error::{Error, Result};
use crate::layout::{Binding, LayoutData};
use crate::profile::KeyboardProfile;
use std::collections::{BTreeSet, HashMap};

/// Legal behavior codes for one profile (and optionally one layout).
#[derive(Debug, Clone)]
pub struct BehaviorRegistry {
    entries: HashMap<String, BehaviorEntry>,
    /// Profile base includes, emitted before behavior-driven ones.
    base_includes: Vec<String>,
}

impl BehaviorRegistry {
    /// Builds the registry for a profile: builtin ZMK table plus the
    /// profile's `system_behaviors` (vendor origin).
    pub fn for_profile(profile: &KeyboardProfile) -> Result<Self> {
        let mut registry = Self {
            entries: HashMap::new(),
            base_includes: profile.keymap().includes.clone(),
        };

        for entry in builtin::builtin_entries() {
            registry.insert(entry)?;
        }
        for behavior in &profile.keymap().system_behaviors {
            registry.insert(BehaviorEntry {
                code: behavior.code.clone(),
                display_name: if behavior.name.is_empty() {
                    behavior.code.trim_start_matches('&').to_string()
                } else {
                    behavior.name.clone()
                },
                description: behavior.description.clone(),
                expected_params: behavior.expected_params,
                origin: Origin::Vendor,
                includes: behavior.includes.clone(),
                params: (0..behavior.expected_params)
                    .map(|i| ParamSpec::new(&format!("param{i}"), ParamKind::Any))
                    .collect(),
            })?;
        }
        Ok(registry)
    }

    /// Adds the behaviors a layout defines (user origin): macros with their
    /// placeholder-derived arity and hold-taps with two parameter slots.
    pub fn with_layout(mut self, layout: &LayoutData) -> Result<Self> {
        for mac in &layout.macros {
            let arity = mac.arity();
            self.insert(BehaviorEntry {
                code: mac.code(),
                display_name: mac.name.clone(),
                description: mac.description.clone(),
                expected_params: arity,
                origin: Origin::User,
                includes: Vec::new(),
                params: (0..arity)
                    .map(|i| ParamSpec::new(&format!("param{i}"), ParamKind::Any))
                    .collect(),
            })?;
        }
        for ht in &layout.hold_taps {
            self.insert(BehaviorEntry {
                code: ht.code(),
                display_name: ht.name.clone(),
                description: ht.description.clone(),
                expected_params: 2,
                origin: Origin::User,
                includes: Vec::new(),
                params: vec![
                    ParamSpec::new("hold", ParamKind::Any),
                    ParamSpec::new("tap", ParamKind::Any),
                ],
            })?;
        }
        Ok(self)
    }

    /// Inserts honoring precedence: higher origin replaces lower; equal
    /// origin with the same code is an error.
    fn insert(&mut self, entry: BehaviorEntry) -> Result<()> {
        match self.entries.get(&entry.code) {
            Some(existing) if existing.origin == entry.origin => Err(Error::Config(format!(
                "behavior '{}' defined twice at {} origin",
                entry.code, entry.origin
            ))),
            Some(existing) if existing.origin > entry.origin => Ok(()),
            _ => {
                self.entries.insert(entry.code.clone(), entry);
                Ok(())
            }
        }
    }

    /// Looks up a behavior code.
    #[must_use]
    pub fn lookup(&self, code: &str) -> Option<&BehaviorEntry> {
        self.entries.get(code)
    }

    /// All entries, sorted by code.
    #[must_use]
    pub fn entries(&self) -> Vec<&BehaviorEntry> {
        let mut all: Vec<_> = self.entries.values().collect();
        all.sort_by(|a, b| a.code.cmp(&b.code));
        all
    }

    /// The include set for a set of used behavior codes: profile base
    /// includes first (profile order), then each used behavior's includes
    /// sorted by string, deduplicated preserving first occurrence.
    #[must_use]
    pub fn required_includes(&self, used: &BTreeSet<String>) -> Vec<String> {
        let mut ordered = Vec::new();
        let mut seen = BTreeSet::new();
        for include in &self.base_includes {
            if seen.insert(include.clone()) {
                ordered.push(include.clone());
            }
        }

        let mut behavior_includes = BTreeSet::new();
        for code in used {
            if let Some(entry) = self.entries.get(code) {
                for include in &entry.includes {
                    behavior_includes.insert(include.clone());
                }
            }
        }
        for include in behavior_includes {
            if seen.insert(include.clone()) {
                ordered.push(include);
            }
        }
        ordered
    }

    /// Validates one binding tree: the code must exist and the parameter
    /// count must match; nested behavior invocations validate recursively.
    pub fn validate_binding(&self, binding: &Binding, location: &str) -> Result<()> {
        if !binding.is_behavior() {
            // Leaf symbol; nothing to check without the ZMK headers.
            return Ok(());
        }
        let entry = self
            .lookup(&binding.value)
            .ok_or_else(|| Error::UnknownBehavior {
                code: binding.value.clone(),
                location: location.to_string(),
            })?;
        if binding.params.len() != entry.expected_params {
            return Err(Error::ArityMismatch {
                code: binding.value.clone(),
                expected: entry.expected_params,
                got: binding.params.len(),
                location: location.to_string(),
            });
        }
        for (index, param) in binding.params.iter().enumerate() {
            if param.is_behavior() {
                self.validate_binding(param, &format!("{location}.params[{index}]"))?;
            }
        }
        Ok(())
    }
}
