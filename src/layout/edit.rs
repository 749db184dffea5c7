//! Transactional edit operations over a layout.
//!
//! An [`EditSession`] works on the JSON form of a copied document; nothing is
//! visible to the caller until [`EditSession::commit`] deserializes and
//! re-validates the result. A failing operation aborts with an error naming
//! the offending path and leaves the original layout untouched.

use crate::error::{Error, Result};
use crate::layout::{path, Binding, LayoutData};
use serde_json::Value;

/// Selects a layer by name or by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSelector {
    /// By layer name.
    Name(String),
    /// By position in `layer_names`.
    Index(usize),
}

impl std::str::FromStr for LayerSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(s.parse::<usize>()
            .map_or_else(|_| Self::Name(s.to_string()), Self::Index))
    }
}

/// A batch of edits against one layout.
pub struct EditSession {
    doc: Value,
}

impl EditSession {
    /// Starts a session over a copy of `layout`.
    pub fn new(layout: &LayoutData) -> Result<Self> {
        let doc = serde_json::to_value(layout).map_err(|e| Error::Json {
            context: "preparing layout for editing".into(),
            source: e,
        })?;
        Ok(Self { doc })
    }

    /// Sets the value at a dotted/bracketed path.
    pub fn set_field(&mut self, field_path: &str, value: Value) -> Result<()> {
        let segments = path::parse_path(field_path)?;
        path::set(&mut self.doc, field_path, &segments, value)
    }

    /// Removes the value at a path.
    pub fn unset(&mut self, field_path: &str) -> Result<()> {
        let segments = path::parse_path(field_path)?;
        path::unset(&mut self.doc, field_path, &segments)
    }

    /// Deep-merges a JSON object into the object at a path.
    pub fn merge(&mut self, field_path: &str, incoming: Value) -> Result<()> {
        let segments = path::parse_path(field_path)?;
        let current = path::get(&self.doc, &segments)
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        let merged = merge_json(current, incoming);
        path::set(&mut self.doc, field_path, &segments, merged)
    }

    /// Appends a value to the array at a path.
    pub fn append(&mut self, field_path: &str, value: Value) -> Result<()> {
        let segments = path::parse_path(field_path)?;
        let current = path::get(&self.doc, &segments).ok_or_else(|| Error::InvalidPath {
            path: field_path.to_string(),
            reason: "not found".into(),
        })?;
        let Value::Array(mut items) = current.clone() else {
            return Err(Error::InvalidPath {
                path: field_path.to_string(),
                reason: "append target is not an array".into(),
            });
        };
        items.push(value);
        path::set(&mut self.doc, field_path, &segments, Value::Array(items))
    }

    /// Adds a layer of `&trans` bindings, at `position` or at the end.
    pub fn add_layer(&mut self, name: &str, position: Option<usize>) -> Result<()> {
        let (mut names, mut layers) = self.layer_arrays()?;

        if names.iter().any(|n| n == name) {
            return Err(Error::Validation(format!("layer '{name}' already exists")));
        }
        let width = layers.first().map_or(0, Vec::len);
        let filler: Vec<Binding> = (0..width).map(|_| Binding::leaf("&trans")).collect();

        let index = position.unwrap_or(names.len()).min(names.len());
        names.insert(index, name.to_string());
        layers.insert(index, filler);
        self.store_layer_arrays(names, layers)
    }

    /// Removes a layer by name or index.
    pub fn remove_layer(&mut self, selector: &LayerSelector) -> Result<()> {
        let (mut names, mut layers) = self.layer_arrays()?;
        let index = self.resolve_selector(selector, &names)?;
        names.remove(index);
        layers.remove(index);
        self.store_layer_arrays(names, layers)
    }

    /// Moves a layer to a new position.
    pub fn move_layer(&mut self, selector: &LayerSelector, position: usize) -> Result<()> {
        let (mut names, mut layers) = self.layer_arrays()?;
        let from = self.resolve_selector(selector, &names)?;
        if position >= names.len() {
            return Err(Error::Validation(format!(
                "position {position} out of range (have {} layers)",
                names.len()
            )));
        }
        let name = names.remove(from);
        let layer = layers.remove(from);
        names.insert(position, name);
        layers.insert(position, layer);
        self.store_layer_arrays(names, layers)
    }

    /// Copies the bindings of `src` into a new layer named `dst`, appended.
    pub fn copy_layer(&mut self, src: &LayerSelector, dst: &str) -> Result<()> {
        let (mut names, mut layers) = self.layer_arrays()?;
        if names.iter().any(|n| n == dst) {
            return Err(Error::Validation(format!("layer '{dst}' already exists")));
        }
        let from = self.resolve_selector(src, &names)?;
        let copied = layers[from].clone();
        names.push(dst.to_string());
        layers.push(copied);
        self.store_layer_arrays(names, layers)
    }

    /// Finalizes the session: deserializes and re-checks invariants.
    pub fn commit(self) -> Result<LayoutData> {
        let layout: LayoutData = serde_json::from_value(self.doc).map_err(|e| Error::Json {
            context: "rebuilding layout after edits".into(),
            source: e,
        })?;
        layout.check_invariants()?;
        Ok(layout)
    }

    fn resolve_selector(&self, selector: &LayerSelector, names: &[String]) -> Result<usize> {
        match selector {
            LayerSelector::Name(name) => names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| Error::UnknownLayer(name.clone())),
            LayerSelector::Index(index) => {
                if *index < names.len() {
                    Ok(*index)
                } else {
                    Err(Error::UnknownLayer(index.to_string()))
                }
            }
        }
    }

    fn layer_arrays(&self) -> Result<(Vec<String>, Vec<Vec<Binding>>)> {
        let names: Vec<String> = self
            .doc
            .get("layer_names")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Json {
                context: "reading layer_names".into(),
                source: e,
            })?
            .unwrap_or_default();
        let layers: Vec<Vec<Binding>> = self
            .doc
            .get("layers")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Json {
                context: "reading layers".into(),
                source: e,
            })?
            .unwrap_or_default();
        Ok((names, layers))
    }

    fn store_layer_arrays(&mut self, names: Vec<String>, layers: Vec<Vec<Binding>>) -> Result<()> {
        let doc = self.doc.as_object_mut().ok_or_else(|| {
            Error::Internal("layout document lost its object form during editing".into())
        })?;
        doc.insert(
            "layer_names".into(),
            serde_json::to_value(names).map_err(|e| Error::Json {
                context: "storing layer_names".into(),
                source: e,
            })?,
        );
        doc.insert(
            "layers".into(),
            serde_json::to_value(layers).map_err(|e| Error::Json {
                context: "storing layers".into(),
                source: e,
            })?,
        );
        Ok(())
    }
}

/// JSON merge: objects merge key-wise, everything else replaces.
fn merge_json(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}
