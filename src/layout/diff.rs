//! Structural diff, patch, and master-upgrade for layouts.
//!
//! A patch is an ordered set of mutations recorded against a source
//! document: whole-field metadata changes, layer adds/removes/renames,
//! per-position binding changes, behavior definition changes, and the
//! free-form DTSI sections. Applying a patch is transactional: it works on a
//! copy and either returns the new layout or fails.

use crate::error::{Error, Result};
use crate::layout::{Binding, ComboDef, HoldTapDef, InputListener, LayoutData, MacroDef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// How to resolve a mismatch between the patch's recorded `old` value and
/// the document the patch is being applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the document's value; record the conflict.
    PreferSource,
    /// Apply the patch value anyway; record the conflict.
    #[default]
    PreferPatch,
    /// Fail the whole application on the first conflict.
    ConflictFail,
}

/// A whole-field change on the document's top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Top-level field name.
    pub path: String,
    /// Value in the source (JSON `null` when absent).
    pub old: Value,
    /// Value in the target (JSON `null` when absent).
    pub new: Value,
}

/// A single key-position change inside a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellChange {
    /// Layer name (the target-side name for renamed layers).
    pub layer: String,
    /// Key position within the layer.
    pub position: usize,
    /// Binding in the source.
    pub old: Binding,
    /// Binding in the target.
    pub new: Binding,
}

/// A layer present only in the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerAdd {
    /// Layer name.
    pub name: String,
    /// Position in the target's layer order.
    pub index: usize,
    /// Full bindings.
    pub bindings: Vec<Binding>,
}

/// A layer rename (same bindings, same position, new name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRename {
    /// Name in the source.
    pub from: String,
    /// Name in the target.
    pub to: String,
}

/// An old/new pair for a behavior definition or DTSI section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replace<T> {
    /// Source-side value.
    pub old: T,
    /// Target-side value.
    pub new: T,
}

/// The structural patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LayoutPatch {
    /// UUID of the source document the patch was computed from.
    #[serde(default)]
    pub source_uuid: String,
    /// Version of the source document.
    #[serde(default)]
    pub source_version: String,
    /// Whole-field metadata changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldChange>,
    /// Layers only in the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers_added: Vec<LayerAdd>,
    /// Layers only in the source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers_removed: Vec<String>,
    /// Renamed layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers_renamed: Vec<LayerRename>,
    /// Layers whose width changed; replaced wholesale.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers_replaced: Vec<LayerAdd>,
    /// Per-position binding changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<CellChange>,
    /// Target-side order of the layers the patch knows about.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layer_order: Vec<String>,
    /// Behavior changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub macros_added: Vec<MacroDef>,
    /// Names of macros removed in the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub macros_removed: Vec<String>,
    /// Macros changed in place.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub macros_changed: Vec<Replace<MacroDef>>,
    /// Hold-taps only in the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hold_taps_added: Vec<HoldTapDef>,
    /// Names of hold-taps removed in the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hold_taps_removed: Vec<String>,
    /// Hold-taps changed in place.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hold_taps_changed: Vec<Replace<HoldTapDef>>,
    /// Combos only in the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combos_added: Vec<ComboDef>,
    /// Names of combos removed in the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combos_removed: Vec<String>,
    /// Combos changed in place.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combos_changed: Vec<Replace<ComboDef>>,
    /// Input listeners only in the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_listeners_added: Vec<InputListener>,
    /// Codes of input listeners removed in the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_listeners_removed: Vec<String>,
    /// Input listeners changed in place.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_listeners_changed: Vec<Replace<InputListener>>,
    /// Change to `custom_defined_behaviors`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_defined_behaviors: Option<Replace<Option<String>>>,
    /// Change to `custom_devicetree`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_devicetree: Option<Replace<Option<String>>>,
}

impl LayoutPatch {
    /// True when the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.layers_added.is_empty()
            && self.layers_removed.is_empty()
            && self.layers_renamed.is_empty()
            && self.layers_replaced.is_empty()
            && self.cells.is_empty()
            && self.macros_added.is_empty()
            && self.macros_removed.is_empty()
            && self.macros_changed.is_empty()
            && self.hold_taps_added.is_empty()
            && self.hold_taps_removed.is_empty()
            && self.hold_taps_changed.is_empty()
            && self.combos_added.is_empty()
            && self.combos_removed.is_empty()
            && self.combos_changed.is_empty()
            && self.input_listeners_added.is_empty()
            && self.input_listeners_removed.is_empty()
            && self.input_listeners_changed.is_empty()
            && self.custom_defined_behaviors.is_none()
            && self.custom_devicetree.is_none()
    }

    /// Removes no-op entries (equal old/new pairs).
    #[must_use]
    pub fn normalize(mut self) -> Self {
        self.fields.retain(|f| f.old != f.new);
        self.cells.retain(|c| c.old != c.new);
        self.macros_changed.retain(|r| r.old != r.new);
        self.hold_taps_changed.retain(|r| r.old != r.new);
        self.combos_changed.retain(|r| r.old != r.new);
        self.input_listeners_changed.retain(|r| r.old != r.new);
        if self
            .custom_defined_behaviors
            .as_ref()
            .is_some_and(|r| r.old == r.new)
        {
            self.custom_defined_behaviors = None;
        }
        if self
            .custom_devicetree
            .as_ref()
            .is_some_and(|r| r.old == r.new)
        {
            self.custom_devicetree = None;
        }
        self
    }
}

/// Result of a patch application.
#[derive(Debug)]
pub struct PatchOutcome {
    /// The patched layout.
    pub layout: LayoutData,
    /// Human-readable descriptions of conflicts encountered.
    pub conflicts: Vec<String>,
}

/// Top-level fields handled structurally, not as whole-field changes.
const STRUCTURAL_FIELDS: &[&str] = &[
    "layers",
    "layer_names",
    "macros",
    "hold_taps",
    "combos",
    "input_listeners",
    "custom_defined_behaviors",
    "custom_devicetree",
];

/// Computes the structural patch turning `a` into `b`.
pub fn diff(a: &LayoutData, b: &LayoutData) -> Result<LayoutPatch> {
    let doc_a = to_object(a)?;
    let doc_b = to_object(b)?;

    let mut patch = LayoutPatch {
        source_uuid: a.uuid.clone(),
        source_version: a.version.clone(),
        layer_order: b.layer_names.clone(),
        ..LayoutPatch::default()
    };

    // Metadata: union of field names, skipping the structurally handled ones.
    let mut keys: BTreeSet<&String> = doc_a.keys().collect();
    keys.extend(doc_b.keys());
    for key in keys {
        if STRUCTURAL_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let old = doc_a.get(key).cloned().unwrap_or(Value::Null);
        let new = doc_b.get(key).cloned().unwrap_or(Value::Null);
        if old != new {
            patch.fields.push(FieldChange {
                path: key.clone(),
                old,
                new,
            });
        }
    }

    diff_layers(a, b, &mut patch);

    diff_named(
        &a.macros,
        &b.macros,
        |m| m.name.clone(),
        &mut patch.macros_added,
        &mut patch.macros_removed,
        &mut patch.macros_changed,
    );
    diff_named(
        &a.hold_taps,
        &b.hold_taps,
        |h| h.name.clone(),
        &mut patch.hold_taps_added,
        &mut patch.hold_taps_removed,
        &mut patch.hold_taps_changed,
    );
    diff_named(
        &a.combos,
        &b.combos,
        |c| c.name.clone(),
        &mut patch.combos_added,
        &mut patch.combos_removed,
        &mut patch.combos_changed,
    );
    diff_named(
        &a.input_listeners,
        &b.input_listeners,
        |l| l.code.clone(),
        &mut patch.input_listeners_added,
        &mut patch.input_listeners_removed,
        &mut patch.input_listeners_changed,
    );

    if a.custom_defined_behaviors != b.custom_defined_behaviors {
        patch.custom_defined_behaviors = Some(Replace {
            old: a.custom_defined_behaviors.clone(),
            new: b.custom_defined_behaviors.clone(),
        });
    }
    if a.custom_devicetree != b.custom_devicetree {
        patch.custom_devicetree = Some(Replace {
            old: a.custom_devicetree.clone(),
            new: b.custom_devicetree.clone(),
        });
    }

    Ok(patch.normalize())
}

fn diff_layers(a: &LayoutData, b: &LayoutData, patch: &mut LayoutPatch) {
    let names_a: BTreeSet<&String> = a.layer_names.iter().collect();
    let names_b: BTreeSet<&String> = b.layer_names.iter().collect();

    let mut removed: Vec<String> = a
        .layer_names
        .iter()
        .filter(|n| !names_b.contains(n))
        .cloned()
        .collect();
    let mut added: Vec<String> = b
        .layer_names
        .iter()
        .filter(|n| !names_a.contains(n))
        .cloned()
        .collect();

    // Rename detection: a removed and an added layer with identical bindings
    // at the same index is a rename, not a remove+add.
    let mut renames = Vec::new();
    removed.retain(|old_name| {
        let old_idx = a.layer_names.iter().position(|n| n == old_name).unwrap_or(0);
        let matching = added.iter().position(|new_name| {
            let new_idx = b.layer_names.iter().position(|n| n == new_name);
            new_idx == Some(old_idx)
                && a.layers.get(old_idx).map(Vec::as_slice)
                    == new_idx.and_then(|i| b.layers.get(i)).map(Vec::as_slice)
        });
        if let Some(pos) = matching {
            renames.push(LayerRename {
                from: old_name.clone(),
                to: added.remove(pos),
            });
            false
        } else {
            true
        }
    });

    patch.layers_removed = removed;
    patch.layers_renamed = renames;
    for name in added {
        let idx = b.layer_names.iter().position(|n| n == &name).unwrap_or(0);
        patch.layers_added.push(LayerAdd {
            name,
            index: idx,
            bindings: b.layers[idx].clone(),
        });
    }

    // Per-position diffs for layers present (possibly renamed) on both sides.
    for (idx_a, name_a) in a.layer_names.iter().enumerate() {
        let name_b = patch
            .layers_renamed
            .iter()
            .find(|r| &r.from == name_a)
            .map_or(name_a.clone(), |r| r.to.clone());
        let Some(idx_b) = b.layer_names.iter().position(|n| n == &name_b) else {
            continue;
        };
        let layer_a = &a.layers[idx_a];
        let layer_b = &b.layers[idx_b];

        if layer_a.len() != layer_b.len() {
            patch.layers_replaced.push(LayerAdd {
                name: name_b,
                index: idx_b,
                bindings: layer_b.clone(),
            });
            continue;
        }
        for (position, (old, new)) in layer_a.iter().zip(layer_b.iter()).enumerate() {
            if old != new {
                patch.cells.push(CellChange {
                    layer: name_b.clone(),
                    position,
                    old: old.clone(),
                    new: new.clone(),
                });
            }
        }
    }
}

fn diff_named<T: Clone + PartialEq>(
    a: &[T],
    b: &[T],
    key: impl Fn(&T) -> String,
    added: &mut Vec<T>,
    removed: &mut Vec<String>,
    changed: &mut Vec<Replace<T>>,
) {
    for item in b {
        match a.iter().find(|x| key(x) == key(item)) {
            None => added.push(item.clone()),
            Some(old) if old != item => changed.push(Replace {
                old: old.clone(),
                new: item.clone(),
            }),
            Some(_) => {}
        }
    }
    for item in a {
        if !b.iter().any(|x| key(x) == key(item)) {
            removed.push(key(item));
        }
    }
}

/// Applies a patch to `layout` under the given conflict policy.
pub fn patch(
    layout: &LayoutData,
    patch: &LayoutPatch,
    policy: ConflictPolicy,
) -> Result<PatchOutcome> {
    let mut result = layout.clone();
    let mut conflicts = Vec::new();

    apply_fields(&mut result, patch, policy, &mut conflicts)?;
    apply_layers(&mut result, patch, policy, &mut conflicts)?;

    apply_named(
        &mut result.macros,
        &patch.macros_added,
        &patch.macros_removed,
        &patch.macros_changed,
        |m| m.name.clone(),
        policy,
        &mut conflicts,
        "macro",
    )?;
    apply_named(
        &mut result.hold_taps,
        &patch.hold_taps_added,
        &patch.hold_taps_removed,
        &patch.hold_taps_changed,
        |h| h.name.clone(),
        policy,
        &mut conflicts,
        "hold-tap",
    )?;
    apply_named(
        &mut result.combos,
        &patch.combos_added,
        &patch.combos_removed,
        &patch.combos_changed,
        |c| c.name.clone(),
        policy,
        &mut conflicts,
        "combo",
    )?;
    apply_named(
        &mut result.input_listeners,
        &patch.input_listeners_added,
        &patch.input_listeners_removed,
        &patch.input_listeners_changed,
        |l| l.code.clone(),
        policy,
        &mut conflicts,
        "input listener",
    )?;

    apply_dtsi_section(
        &mut result.custom_defined_behaviors,
        patch.custom_defined_behaviors.as_ref(),
        "custom_defined_behaviors",
        policy,
        &mut conflicts,
    )?;
    apply_dtsi_section(
        &mut result.custom_devicetree,
        patch.custom_devicetree.as_ref(),
        "custom_devicetree",
        policy,
        &mut conflicts,
    )?;

    result.check_invariants()?;
    Ok(PatchOutcome {
        layout: result,
        conflicts,
    })
}

fn conflict(
    policy: ConflictPolicy,
    conflicts: &mut Vec<String>,
    description: String,
) -> Result<bool> {
    match policy {
        ConflictPolicy::ConflictFail => Err(Error::Validation(format!(
            "patch conflict: {description}"
        ))),
        ConflictPolicy::PreferSource => {
            conflicts.push(description);
            Ok(false)
        }
        ConflictPolicy::PreferPatch => {
            conflicts.push(description);
            Ok(true)
        }
    }
}

fn apply_fields(
    result: &mut LayoutData,
    patch: &LayoutPatch,
    policy: ConflictPolicy,
    conflicts: &mut Vec<String>,
) -> Result<()> {
    if patch.fields.is_empty() {
        return Ok(());
    }
    let mut doc = to_object(result)?;
    for change in &patch.fields {
        let current = doc.get(&change.path).cloned().unwrap_or(Value::Null);
        let apply = if current == change.old || current == change.new {
            current != change.new
        } else {
            conflict(
                policy,
                conflicts,
                format!("field '{}' was modified on both sides", change.path),
            )?
        };
        if apply {
            if change.new.is_null() {
                doc.remove(&change.path);
            } else {
                doc.insert(change.path.clone(), change.new.clone());
            }
        }
    }
    *result = serde_json::from_value(Value::Object(doc)).map_err(|e| Error::Json {
        context: "rebuilding layout after field changes".into(),
        source: e,
    })?;
    Ok(())
}

fn apply_layers(
    result: &mut LayoutData,
    patch: &LayoutPatch,
    policy: ConflictPolicy,
    conflicts: &mut Vec<String>,
) -> Result<()> {
    // Renames first so later stages address layers by target-side names.
    for rename in &patch.layers_renamed {
        if let Some(slot) = result.layer_names.iter_mut().find(|n| **n == rename.from) {
            *slot = rename.to.clone();
        }
    }

    for name in &patch.layers_removed {
        if let Ok(index) = result.layer_index(name) {
            result.layer_names.remove(index);
            result.layers.remove(index);
        }
    }

    for replace in &patch.layers_replaced {
        if let Ok(index) = result.layer_index(&replace.name) {
            result.layers[index] = replace.bindings.clone();
        }
    }

    for change in &patch.cells {
        let Ok(index) = result.layer_index(&change.layer) else {
            conflicts.push(format!("cell change targets unknown layer '{}'", change.layer));
            continue;
        };
        let Some(cell) = result.layers[index].get_mut(change.position) else {
            conflicts.push(format!(
                "cell change targets position {} beyond layer '{}'",
                change.position, change.layer
            ));
            continue;
        };
        let apply = if *cell == change.old || *cell == change.new {
            *cell != change.new
        } else {
            conflict(
                policy,
                conflicts,
                format!(
                    "binding at '{}'[{}] was modified on both sides",
                    change.layer, change.position
                ),
            )?
        };
        if apply {
            *cell = change.new.clone();
        }
    }

    for add in &patch.layers_added {
        if result.layer_index(&add.name).is_ok() {
            conflicts.push(format!("layer '{}' already exists", add.name));
            continue;
        }
        let index = add.index.min(result.layer_names.len());
        result.layer_names.insert(index, add.name.clone());
        result.layers.insert(index, add.bindings.clone());
    }

    // Final ordering: patch-known layers in patch order, then layers the
    // patch does not know about (custom-only), in their current order.
    if !patch.layer_order.is_empty() {
        let mut ordered: Vec<(String, Vec<Binding>)> = Vec::new();
        for name in &patch.layer_order {
            if let Ok(index) = result.layer_index(name) {
                ordered.push((result.layer_names[index].clone(), result.layers[index].clone()));
            }
        }
        for (index, name) in result.layer_names.iter().enumerate() {
            if !patch.layer_order.contains(name) {
                ordered.push((name.clone(), result.layers[index].clone()));
            }
        }
        result.layer_names = ordered.iter().map(|(n, _)| n.clone()).collect();
        result.layers = ordered.into_iter().map(|(_, l)| l).collect();
    }

    Ok(())
}

fn apply_named<T: Clone + PartialEq>(
    items: &mut Vec<T>,
    added: &[T],
    removed: &[String],
    changed: &[Replace<T>],
    key: impl Fn(&T) -> String,
    policy: ConflictPolicy,
    conflicts: &mut Vec<String>,
    what: &str,
) -> Result<()> {
    for name in removed {
        items.retain(|item| key(item) != *name);
    }
    for change in changed {
        let name = key(&change.new);
        let Some(slot) = items.iter_mut().find(|item| key(item) == name) else {
            conflicts.push(format!("{what} '{name}' to change is absent"));
            continue;
        };
        let apply = if *slot == change.old || *slot == change.new {
            *slot != change.new
        } else {
            conflict(
                policy,
                conflicts,
                format!("{what} '{name}' was modified on both sides"),
            )?
        };
        if apply {
            *slot = change.new.clone();
        }
    }
    for item in added {
        if items.iter().any(|existing| key(existing) == key(item)) {
            conflicts.push(format!("{what} '{}' already exists", key(item)));
        } else {
            items.push(item.clone());
        }
    }
    Ok(())
}

fn apply_dtsi_section(
    slot: &mut Option<String>,
    change: Option<&Replace<Option<String>>>,
    what: &str,
    policy: ConflictPolicy,
    conflicts: &mut Vec<String>,
) -> Result<()> {
    let Some(change) = change else {
        return Ok(());
    };
    let apply = if *slot == change.old || *slot == change.new {
        *slot != change.new
    } else {
        conflict(
            policy,
            conflicts,
            format!("{what} was modified on both sides"),
        )?
    };
    if apply {
        slot.clone_from(&change.new);
    }
    Ok(())
}

/// Upgrades a derived layout to a new master.
///
/// Computes `diff(old_master, new_master)` and applies it to `custom` with
/// `PreferSource`, so customized values survive and untouched base content
/// updates. Identity fields (`uuid`, `parent_uuid`, `date`) are never
/// patched; `base_version`/`base_layout` always track the new master.
pub fn upgrade(
    custom: &LayoutData,
    old_master: &LayoutData,
    new_master: &LayoutData,
) -> Result<PatchOutcome> {
    let mut master_patch = diff(old_master, new_master)?;
    master_patch
        .fields
        .retain(|f| !matches!(f.path.as_str(), "uuid" | "parent_uuid" | "date"));

    let mut outcome = patch(custom, &master_patch, ConflictPolicy::PreferSource)?;
    if !new_master.version.is_empty() {
        outcome.layout.base_version = Some(new_master.version.clone());
    }
    if new_master.base_layout.is_some() {
        outcome.layout.base_layout.clone_from(&new_master.base_layout);
    }
    Ok(outcome)
}

fn to_object(layout: &LayoutData) -> Result<serde_json::Map<String, Value>> {
    match serde_json::to_value(layout).map_err(|e| Error::Json {
        context: "serializing layout for diff".into(),
        source: e,
    })? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Internal("layout did not serialize to an object".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(names: &[&str], width: usize) -> LayoutData {
        LayoutData {
            keyboard: "toy42".into(),
            title: "Master".into(),
            uuid: "master-uuid".into(),
            version: "41".into(),
            layer_names: names.iter().map(ToString::to_string).collect(),
            layers: names
                .iter()
                .map(|_| (0..width).map(|_| Binding::leaf("&trans")).collect())
                .collect(),
            ..LayoutData::default()
        }
    }

    #[test]
    fn test_diff_empty_for_identical() {
        let a = layout(&["BASE"], 2);
        let p = diff(&a, &a).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn test_patch_cancels_diff() {
        let a = layout(&["BASE", "LOWER"], 2);
        let mut b = layout(&["BASE", "LOWER"], 2);
        b.title = "Changed".into();
        b.layers[1][0] = Binding::new("&kp", vec![Binding::leaf("ESC")]);
        b.layer_names.push("NAV".into());
        b.layers.push(vec![Binding::leaf("&none"), Binding::leaf("&none")]);
        b.macros.push(MacroDef {
            name: "email".into(),
            description: None,
            wait_ms: None,
            tap_ms: None,
            bindings: vec![],
        });

        let p = diff(&a, &b).unwrap();
        let outcome = patch(&a, &p, ConflictPolicy::ConflictFail).unwrap();
        assert!(outcome.conflicts.is_empty());
        assert_eq!(
            outcome.layout.to_canonical_json().unwrap(),
            b.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn test_diff_detects_rename() {
        let a = layout(&["BASE", "FN"], 2);
        let mut b = layout(&["BASE", "MEDIA"], 2);
        b.layers = a.layers.clone();

        let p = diff(&a, &b).unwrap();
        assert_eq!(
            p.layers_renamed,
            vec![LayerRename {
                from: "FN".into(),
                to: "MEDIA".into()
            }]
        );
        assert!(p.layers_added.is_empty());
        assert!(p.layers_removed.is_empty());

        let outcome = patch(&a, &p, ConflictPolicy::ConflictFail).unwrap();
        assert_eq!(outcome.layout.layer_names, vec!["BASE", "MEDIA"]);
    }

    #[test]
    fn test_conflict_policies() {
        let a = layout(&["BASE"], 1);
        let mut b = a.clone();
        b.layers[0][0] = Binding::new("&kp", vec![Binding::leaf("A")]);
        let p = diff(&a, &b).unwrap();

        // The document moved away from the patch's source value.
        let mut moved = a.clone();
        moved.layers[0][0] = Binding::new("&kp", vec![Binding::leaf("Z")]);

        assert!(patch(&moved, &p, ConflictPolicy::ConflictFail).is_err());

        let kept = patch(&moved, &p, ConflictPolicy::PreferSource).unwrap();
        assert_eq!(kept.layout.layers[0][0].to_dtsi(), "&kp Z");
        assert_eq!(kept.conflicts.len(), 1);

        let replaced = patch(&moved, &p, ConflictPolicy::PreferPatch).unwrap();
        assert_eq!(replaced.layout.layers[0][0].to_dtsi(), "&kp A");
        assert_eq!(replaced.conflicts.len(), 1);
    }

    #[test]
    fn test_patch_is_idempotent_on_target() {
        let a = layout(&["BASE"], 1);
        let mut b = a.clone();
        b.title = "New".into();
        let p = diff(&a, &b).unwrap();

        // Applying to a document already at the target is a clean no-op.
        let outcome = patch(&b, &p, ConflictPolicy::ConflictFail).unwrap();
        assert_eq!(
            outcome.layout.to_canonical_json().unwrap(),
            b.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn test_upgrade_preserves_customizations() {
        // Old master with BASE + LOWER.
        let old_master = layout(&["BASE", "LOWER"], 2);

        // User derivative: adds GAMING layer and an EMAIL macro.
        let mut custom = old_master.clone();
        custom.uuid = "custom-uuid".into();
        custom.parent_uuid = "master-uuid".into();
        custom.title = "My Layout".into();
        custom.layer_names.push("GAMING".into());
        custom
            .layers
            .push(vec![Binding::leaf("&none"), Binding::leaf("&none")]);
        custom.macros.push(MacroDef {
            name: "email".into(),
            description: None,
            wait_ms: None,
            tap_ms: None,
            bindings: vec![Binding::new("&kp", vec![Binding::leaf("A")])],
        });

        // New master: updates a LOWER binding, adds a combo.
        let mut new_master = old_master.clone();
        new_master.version = "42".into();
        new_master.layers[1][1] = Binding::new("&kp", vec![Binding::leaf("ESC")]);
        new_master.combos.push(ComboDef {
            name: "esc_combo".into(),
            description: None,
            timeout_ms: Some(50),
            key_positions: vec![0, 1],
            binding: Binding::new("&kp", vec![Binding::leaf("ESC")]),
            layers: vec![],
        });

        let outcome = upgrade(&custom, &old_master, &new_master).unwrap();
        let upgraded = outcome.layout;

        assert_eq!(upgraded.layer_names, vec!["BASE", "LOWER", "GAMING"]);
        assert_eq!(upgraded.layers[1][1].to_dtsi(), "&kp ESC");
        assert_eq!(upgraded.macros.len(), 1);
        assert_eq!(upgraded.macros[0].name, "email");
        assert_eq!(upgraded.combos.len(), 1);
        assert_eq!(upgraded.combos[0].name, "esc_combo");
        // Identity is preserved; base version tracks the new master.
        assert_eq!(upgraded.uuid, "custom-uuid");
        assert_eq!(upgraded.title, "My Layout");
        assert_eq!(upgraded.base_version.as_deref(), Some("42"));
    }

    #[test]
    fn test_normalize_drops_noops() {
        let p = LayoutPatch {
            fields: vec![FieldChange {
                path: "title".into(),
                old: serde_json::json!("same"),
                new: serde_json::json!("same"),
            }],
            ..LayoutPatch::default()
        };
        assert!(p.normalize().is_empty());
    }
}
