//! Dotted/bracketed paths into the layout's JSON form.
//!
//! `layers[0]`, `config_parameters[0].paramName`, and `variables.MOD` all
//! resolve through the same segment list.

use crate::error::{Error, Result};
use serde_json::Value;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    /// Object key.
    Key(String),
    /// Array index.
    Index(usize),
}

/// Parses `a.b[2].c` into segments.
pub fn parse_path(path: &str) -> Result<Vec<PathSeg>> {
    let invalid = |reason: &str| Error::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(invalid("path is empty"));
    }

    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut current = String::new();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() && segments.is_empty() {
                    return Err(invalid("leading '.'"));
                }
                if !current.is_empty() {
                    segments.push(PathSeg::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSeg::Key(std::mem::take(&mut current)));
                }
                let mut digits = String::new();
                for d in chars.by_ref() {
                    if d == ']' {
                        break;
                    }
                    digits.push(d);
                }
                let index: usize = digits
                    .parse()
                    .map_err(|_| invalid("index must be a non-negative integer"))?;
                segments.push(PathSeg::Index(index));
            }
            ']' => return Err(invalid("unmatched ']'")),
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        segments.push(PathSeg::Key(current));
    }
    if segments.is_empty() {
        return Err(invalid("no segments"));
    }
    Ok(segments)
}

/// Immutable lookup.
#[must_use]
pub fn get<'a>(root: &'a Value, segments: &[PathSeg]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segments {
        node = match seg {
            PathSeg::Key(key) => node.as_object()?.get(key)?,
            PathSeg::Index(idx) => node.as_array()?.get(*idx)?,
        };
    }
    Some(node)
}

/// Sets the value at `segments`, creating the final key if absent.
/// Intermediate containers must already exist.
pub fn set(root: &mut Value, path: &str, segments: &[PathSeg], new: Value) -> Result<()> {
    let (last, parents) = segments.split_last().ok_or_else(|| Error::InvalidPath {
        path: path.to_string(),
        reason: "no segments".into(),
    })?;
    let parent = descend_mut(root, path, parents)?;
    match last {
        PathSeg::Key(key) => {
            let map = parent.as_object_mut().ok_or_else(|| Error::InvalidPath {
                path: path.to_string(),
                reason: format!("'{key}' parent is not an object"),
            })?;
            map.insert(key.clone(), new);
        }
        PathSeg::Index(idx) => {
            let arr = parent.as_array_mut().ok_or_else(|| Error::InvalidPath {
                path: path.to_string(),
                reason: format!("[{idx}] parent is not an array"),
            })?;
            if *idx > arr.len() {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                    reason: format!("index {idx} out of bounds (len {})", arr.len()),
                });
            }
            if *idx == arr.len() {
                arr.push(new);
            } else {
                arr[*idx] = new;
            }
        }
    }
    Ok(())
}

/// Removes the value at `segments`.
pub fn unset(root: &mut Value, path: &str, segments: &[PathSeg]) -> Result<()> {
    let (last, parents) = segments.split_last().ok_or_else(|| Error::InvalidPath {
        path: path.to_string(),
        reason: "no segments".into(),
    })?;
    let parent = descend_mut(root, path, parents)?;
    let removed = match last {
        PathSeg::Key(key) => parent
            .as_object_mut()
            .and_then(|map| map.remove(key))
            .is_some(),
        PathSeg::Index(idx) => match parent.as_array_mut() {
            Some(arr) if *idx < arr.len() => {
                arr.remove(*idx);
                true
            }
            _ => false,
        },
    };
    if removed {
        Ok(())
    } else {
        Err(Error::InvalidPath {
            path: path.to_string(),
            reason: "nothing to remove at this path".into(),
        })
    }
}

fn descend_mut<'a>(root: &'a mut Value, path: &str, segments: &[PathSeg]) -> Result<&'a mut Value> {
    let mut node = root;
    for seg in segments {
        node = match seg {
            PathSeg::Key(key) => {
                node.as_object_mut()
                    .and_then(|map| map.get_mut(key))
                    .ok_or_else(|| Error::InvalidPath {
                        path: path.to_string(),
                        reason: format!("'{key}' not found"),
                    })?
            }
            PathSeg::Index(idx) => {
                node.as_array_mut()
                    .and_then(|arr| arr.get_mut(*idx))
                    .ok_or_else(|| Error::InvalidPath {
                        path: path.to_string(),
                        reason: format!("index {idx} out of bounds"),
                    })?
            }
        };
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("variables.MOD").unwrap(),
            vec![PathSeg::Key("variables".into()), PathSeg::Key("MOD".into())]
        );
        assert_eq!(
            parse_path("layers[0]").unwrap(),
            vec![PathSeg::Key("layers".into()), PathSeg::Index(0)]
        );
        assert_eq!(
            parse_path("config_parameters[2].paramName").unwrap(),
            vec![
                PathSeg::Key("config_parameters".into()),
                PathSeg::Index(2),
                PathSeg::Key("paramName".into())
            ]
        );
        assert!(parse_path("").is_err());
        assert!(parse_path("a[x]").is_err());
    }

    #[test]
    fn test_get_set_unset() {
        let mut doc = json!({"variables": {"MOD": "LCTRL"}, "list": [1, 2, 3]});

        let segs = parse_path("variables.MOD").unwrap();
        assert_eq!(get(&doc, &segs).unwrap(), &json!("LCTRL"));

        set(&mut doc, "variables.MOD", &segs, json!("LALT")).unwrap();
        assert_eq!(get(&doc, &segs).unwrap(), &json!("LALT"));

        // New key under an existing object.
        let new_segs = parse_path("variables.EXTRA").unwrap();
        set(&mut doc, "variables.EXTRA", &new_segs, json!(5)).unwrap();
        assert_eq!(get(&doc, &new_segs).unwrap(), &json!(5));

        let list_segs = parse_path("list[1]").unwrap();
        unset(&mut doc, "list[1]", &list_segs).unwrap();
        assert_eq!(doc["list"], json!([1, 3]));

        unset(&mut doc, "variables.MOD", &segs).unwrap();
        assert!(get(&doc, &segs).is_none());
    }

    #[test]
    fn test_set_append_at_end() {
        let mut doc = json!({"list": [1]});
        let segs = parse_path("list[1]").unwrap();
        set(&mut doc, "list[1]", &segs, json!(2)).unwrap();
        assert_eq!(doc["list"], json!([1, 2]));

        let far = parse_path("list[9]").unwrap();
        assert!(set(&mut doc, "list[9]", &far, json!(0)).is_err());
    }

    #[test]
    fn test_missing_intermediate_errors() {
        let mut doc = json!({});
        let segs = parse_path("missing.key").unwrap();
        let err = set(&mut doc, "missing.key", &segs, json!(1)).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
