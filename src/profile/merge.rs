//! Deep-merge visitor over parsed YAML trees.
//!
//! Merge rules (applied recursively):
//! - scalars: the overlay replaces the base;
//! - mappings: keys merge pairwise, overlay-only keys are inserted;
//! - sequences: the overlay replaces the base wholesale, unless the overlay
//!   mapping that contains the sequence carries the marker `<append>: true`,
//!   in which case base and overlay concatenate (base first).
//!
//! The marker key is consumed by the merge and never appears in the result.

use serde_yml::Value;

/// Marker key that switches sequence merging from replace to append.
pub const APPEND_MARKER: &str = "<append>";

/// Merges `overlay` on top of `base`, consuming both.
#[must_use]
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let append = marker_set(&overlay_map);
            let mut result = base_map;
            for (key, overlay_value) in overlay_map {
                if key.as_str() == Some(APPEND_MARKER) {
                    continue;
                }
                match result.remove(&key) {
                    Some(base_value) => {
                        let merged = match (base_value, overlay_value) {
                            (Value::Sequence(mut base_seq), Value::Sequence(overlay_seq))
                                if append =>
                            {
                                base_seq.extend(overlay_seq);
                                Value::Sequence(base_seq)
                            }
                            (b, o) => deep_merge(b, o),
                        };
                        result.insert(key, merged);
                    }
                    None => {
                        result.insert(key, strip_markers(overlay_value));
                    }
                }
            }
            Value::Mapping(result)
        }
        // Anything that is not a mapping-on-mapping merge replaces.
        (_, overlay) => strip_markers(overlay),
    }
}

/// Merges a chain of fragments in order: later fragments take precedence.
#[must_use]
pub fn merge_all<I: IntoIterator<Item = Value>>(fragments: I) -> Value {
    fragments
        .into_iter()
        .fold(Value::Null, |acc, next| match acc {
            Value::Null => strip_markers(next),
            acc => deep_merge(acc, next),
        })
}

fn marker_set(map: &serde_yml::Mapping) -> bool {
    map.get(&Value::String(APPEND_MARKER.to_string()))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Removes any `<append>` markers from a standalone value (one that is not
/// being merged against a base).
fn strip_markers(value: Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .filter(|(k, _)| k.as_str() != Some(APPEND_MARKER))
                .map(|(k, v)| (k, strip_markers(v)))
                .collect(),
        ),
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(strip_markers).collect()),
        other => other,
    }
}
