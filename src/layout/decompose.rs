//! Splitting a layout into per-layer component files and reassembling it.
//!
//! `compose(decompose(layout)) == layout` byte-for-byte under canonical
//! serialization. The on-disk shape:
//!
//! ```text
//! <dir>/metadata.json          every top-level field except layers
//! <dir>/layers/<slug>.json     {name, index, bindings} per layer
//! <dir>/device.dtsi            custom_devicetree, if present
//! <dir>/keymap.dtsi            custom_defined_behaviors, if present
//! ```

use crate::error::{Error, Result};
use crate::layout::{slug, Binding, LayoutData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Sentinel key marking a metadata file whose layers live in sibling files.
const EXTRACTED_MARKER: &str = "__extracted__";

#[derive(Debug, Serialize, Deserialize)]
struct LayerFile {
    name: String,
    index: usize,
    bindings: Vec<Binding>,
}

/// Writes the layout's components under `dir`.
pub fn decompose(layout: &LayoutData, dir: &Path) -> Result<()> {
    layout.check_invariants()?;

    let layers_dir = dir.join("layers");
    std::fs::create_dir_all(&layers_dir)
        .map_err(|e| Error::io(format!("creating {}", layers_dir.display()), e))?;

    // Metadata: the full document minus layers, with the sentinel in their
    // place. DTSI sections move to their own files.
    let mut doc = serde_json::to_value(layout).map_err(|e| Error::Json {
        context: "serializing layout metadata".into(),
        source: e,
    })?;
    let map = doc
        .as_object_mut()
        .ok_or_else(|| Error::Internal("layout did not serialize to an object".into()))?;
    map.remove("layers");
    map.insert(EXTRACTED_MARKER.into(), serde_json::Value::Bool(true));

    if let Some(devicetree) = &layout.custom_devicetree {
        map.remove("custom_devicetree");
        write_text(&dir.join("device.dtsi"), devicetree)?;
    }
    if let Some(behaviors) = &layout.custom_defined_behaviors {
        map.remove("custom_defined_behaviors");
        write_text(&dir.join("keymap.dtsi"), behaviors)?;
    }

    let mut metadata = serde_json::to_string_pretty(&doc).map_err(|e| Error::Json {
        context: "serializing layout metadata".into(),
        source: e,
    })?;
    metadata.push('\n');
    write_text(&dir.join("metadata.json"), &metadata)?;

    // One file per layer; slug collisions get a positional suffix.
    let mut used_slugs = BTreeMap::new();
    for (index, name) in layout.layer_names.iter().enumerate() {
        let base = slug(name);
        let file_name = match used_slugs.get(&base) {
            None => {
                used_slugs.insert(base.clone(), index);
                format!("{base}.json")
            }
            Some(_) => format!("{base}-{index}.json"),
        };

        let layer = LayerFile {
            name: name.clone(),
            index,
            bindings: layout.layers[index].clone(),
        };
        let mut text = serde_json::to_string_pretty(&layer).map_err(|e| Error::Json {
            context: format!("serializing layer '{name}'"),
            source: e,
        })?;
        text.push('\n');
        write_text(&layers_dir.join(file_name), &text)?;
    }

    Ok(())
}

/// Rebuilds a layout from a decomposed directory.
pub fn compose(dir: &Path) -> Result<LayoutData> {
    let metadata_path = dir.join("metadata.json");
    let metadata_text = std::fs::read_to_string(&metadata_path)
        .map_err(|e| Error::io(format!("reading {}", metadata_path.display()), e))?;
    let mut doc: serde_json::Value =
        serde_json::from_str(&metadata_text).map_err(|e| Error::Json {
            context: format!("parsing {}", metadata_path.display()),
            source: e,
        })?;

    let map = doc.as_object_mut().ok_or_else(|| {
        Error::Validation(format!("{} is not a JSON object", metadata_path.display()))
    })?;
    if map.remove(EXTRACTED_MARKER).is_none() {
        return Err(Error::Validation(format!(
            "{} is not a decomposed layout (missing {EXTRACTED_MARKER})",
            metadata_path.display()
        )));
    }

    let layer_names: Vec<String> = map
        .get("layer_names")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::Json {
            context: "reading layer_names from metadata".into(),
            source: e,
        })?
        .unwrap_or_default();

    // Collect layer files and order them by their recorded index.
    let layers_dir = dir.join("layers");
    let mut files: Vec<LayerFile> = Vec::new();
    let entries = std::fs::read_dir(&layers_dir)
        .map_err(|e| Error::io(format!("reading {}", layers_dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("listing layer files", e))?;
        let file_path = entry.path();
        if file_path.extension().is_none_or(|e| e != "json") {
            continue;
        }
        let text = std::fs::read_to_string(&file_path)
            .map_err(|e| Error::io(format!("reading {}", file_path.display()), e))?;
        let layer: LayerFile = serde_json::from_str(&text).map_err(|e| Error::Json {
            context: format!("parsing {}", file_path.display()),
            source: e,
        })?;
        files.push(layer);
    }
    files.sort_by_key(|f| f.index);

    // Indices must be dense [0..n) and names must agree with the metadata.
    if files.len() != layer_names.len() {
        return Err(Error::Validation(format!(
            "metadata names {} layers but {} layer files were found",
            layer_names.len(),
            files.len()
        )));
    }
    for (expected_index, layer) in files.iter().enumerate() {
        if layer.index != expected_index {
            return Err(Error::Validation(format!(
                "layer indices are not dense: expected {expected_index}, found {}",
                layer.index
            )));
        }
        if layer.name != layer_names[expected_index] {
            return Err(Error::Validation(format!(
                "layer file '{}' does not match metadata name '{}' at index {expected_index}",
                layer.name, layer_names[expected_index]
            )));
        }
    }

    let layers: Vec<Vec<Binding>> = files.into_iter().map(|f| f.bindings).collect();
    map.insert(
        "layers".into(),
        serde_json::to_value(layers).map_err(|e| Error::Json {
            context: "rebuilding layers".into(),
            source: e,
        })?,
    );

    let mut layout: LayoutData = serde_json::from_value(doc).map_err(|e| Error::Json {
        context: "rebuilding layout from components".into(),
        source: e,
    })?;

    let device = dir.join("device.dtsi");
    if device.is_file() {
        layout.custom_devicetree = Some(
            std::fs::read_to_string(&device)
                .map_err(|e| Error::io(format!("reading {}", device.display()), e))?,
        );
    }
    let keymap = dir.join("keymap.dtsi");
    if keymap.is_file() {
        layout.custom_defined_behaviors = Some(
            std::fs::read_to_string(&keymap)
                .map_err(|e| Error::io(format!("reading {}", keymap.display()), e))?,
        );
    }

    layout.check_invariants()?;
    Ok(layout)
}

fn write_text(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_layout() -> LayoutData {
        LayoutData {
            keyboard: "toy42".into(),
            title: "Round Trip".into(),
            uuid: "11111111-2222-3333-4444-555555555555".into(),
            layer_names: vec!["BASE".into(), "LOWER".into(), "RAISE".into()],
            layers: vec![
                vec![
                    Binding::new("&kp", vec![Binding::leaf("Q")]),
                    Binding::new("&mo", vec![Binding::leaf("1")]),
                ],
                vec![
                    Binding::new("&kp", vec![Binding::leaf("N1")]),
                    Binding::leaf("&trans"),
                ],
                vec![Binding::leaf("&trans"), Binding::leaf("&none")],
            ],
            custom_devicetree: Some("/ { test_node { }; };\n".into()),
            ..LayoutData::default()
        }
    }

    #[test]
    fn test_round_trip_byte_identical() {
        let layout = sample_layout();
        let tmp = TempDir::new().unwrap();

        decompose(&layout, tmp.path()).unwrap();
        let rebuilt = compose(tmp.path()).unwrap();

        assert_eq!(
            rebuilt.to_canonical_json().unwrap(),
            layout.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn test_layer_files_named_by_slug() {
        let layout = sample_layout();
        let tmp = TempDir::new().unwrap();
        decompose(&layout, tmp.path()).unwrap();

        assert!(tmp.path().join("layers/base.json").is_file());
        assert!(tmp.path().join("layers/lower.json").is_file());
        assert!(tmp.path().join("layers/raise.json").is_file());
        assert!(tmp.path().join("device.dtsi").is_file());
        assert!(!tmp.path().join("keymap.dtsi").exists());
    }

    #[test]
    fn test_slug_collision_gets_suffix() {
        let mut layout = sample_layout();
        layout.layer_names = vec!["Nav!".into(), "Nav?".into()];
        layout.layers.truncate(2);
        let tmp = TempDir::new().unwrap();
        decompose(&layout, tmp.path()).unwrap();

        assert!(tmp.path().join("layers/nav_.json").is_file());
        assert!(tmp.path().join("layers/nav_-1.json").is_file());

        let rebuilt = compose(tmp.path()).unwrap();
        assert_eq!(rebuilt.layer_names, layout.layer_names);
    }

    #[test]
    fn test_compose_rejects_missing_layer() {
        let layout = sample_layout();
        let tmp = TempDir::new().unwrap();
        decompose(&layout, tmp.path()).unwrap();
        std::fs::remove_file(tmp.path().join("layers/lower.json")).unwrap();

        let err = compose(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("layer files"));
    }

    #[test]
    fn test_compose_rejects_renamed_layer() {
        let layout = sample_layout();
        let tmp = TempDir::new().unwrap();
        decompose(&layout, tmp.path()).unwrap();

        let path = tmp.path().join("layers/lower.json");
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("LOWER", "SNEAKY")).unwrap();

        let err = compose(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("does not match metadata name"));
    }

    #[test]
    fn test_compose_rejects_plain_metadata() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("layers")).unwrap();
        std::fs::write(tmp.path().join("metadata.json"), "{}").unwrap();
        let err = compose(tmp.path()).unwrap_err();
        assert!(err.to_string().contains(EXTRACTED_MARKER));
    }
}
