//! Multi-path, include-aware profile loading.
//!
//! A keyboard definition lives either in a single `<name>.yaml` file or in a
//! `<name>/` directory whose main file is `keyboard.yaml`. Fragments named by
//! `includes:` (top level, or inside the `behaviors`, `display`, `zmk`, and
//! `keymap` sections) are loaded depth-first and deep-merged underneath the
//! including document. The selected firmware variant merges last.

use crate::error::{Error, Result};
use crate::profile::merge::{deep_merge, merge_all};
use crate::profile::{schema, FirmwareConfig, KeyboardProfile, KeymapConfig, ZmkConfig};
use serde::Deserialize;
use serde_yml::Value;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Section keys whose mapping values may carry their own `includes:`.
const SECTION_KEYS: &[&str] = &["behaviors", "display", "zmk", "keymap"];

/// Main file name for directory-form keyboard definitions.
const MAIN_FILE: &str = "keyboard.yaml";

#[derive(Clone)]
struct CachedYaml {
    mtime: SystemTime,
    value: Value,
}

struct CachedProfile {
    profile: Arc<KeyboardProfile>,
    /// Files the profile was built from, with the mtimes observed then.
    deps: Vec<(PathBuf, SystemTime)>,
}

/// Turns `(keyboard_name, firmware_version?)` into a validated profile.
///
/// The resolver owns all memoization; there is no process-wide state. Search
/// paths are supplied by the caller in precedence order (earlier wins on
/// duplicate names).
pub struct ProfileResolver {
    search_paths: Vec<PathBuf>,
    yaml_cache: RefCell<HashMap<PathBuf, CachedYaml>>,
    profile_cache: RefCell<HashMap<(String, Option<String>), CachedProfile>>,
}

impl ProfileResolver {
    /// Creates a resolver over the given search paths.
    #[must_use]
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            yaml_cache: RefCell::new(HashMap::new()),
            profile_cache: RefCell::new(HashMap::new()),
        }
    }

    /// The search paths this resolver scans, in precedence order.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// All keyboard names discoverable across the search paths.
    #[must_use]
    pub fn list_keyboards(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for path in &self.search_paths {
            let Ok(entries) = std::fs::read_dir(path) else {
                continue;
            };
            for entry in entries.flatten() {
                let entry_path = entry.path();
                if entry_path.is_dir() {
                    if entry_path.join(MAIN_FILE).is_file() {
                        if let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) {
                            names.insert(name.to_string());
                        }
                    }
                } else if entry_path.extension().is_some_and(|e| e == "yaml") {
                    if let Some(stem) = entry_path.file_stem().and_then(|s| s.to_str()) {
                        names.insert(stem.to_string());
                    }
                }
            }
        }
        names
    }

    /// Firmware versions a keyboard declares, in document order.
    pub fn list_firmwares(&self, keyboard: &str) -> Result<Vec<String>> {
        let (doc, _) = self.merged_document(keyboard)?;
        let Some(firmwares) = doc
            .as_mapping()
            .and_then(|m| m.get(&Value::String("firmwares".into())))
            .and_then(Value::as_mapping)
        else {
            return Ok(Vec::new());
        };
        Ok(firmwares
            .keys()
            .filter_map(|k| k.as_str().map(ToString::to_string))
            .collect())
    }

    /// Loads and validates a profile.
    ///
    /// With `firmware` given, the matching variant is merged last and its
    /// fields win; requesting an absent variant is `FirmwareMissing`. Without
    /// it the result is keyboard-only unless the keyboard declares exactly
    /// its defaults inline.
    pub fn load(&self, keyboard: &str, firmware: Option<&str>) -> Result<Arc<KeyboardProfile>> {
        let cache_key = (keyboard.to_string(), firmware.map(ToString::to_string));
        if let Some(cached) = self.profile_cache.borrow().get(&cache_key) {
            if deps_fresh(&cached.deps) {
                debug!(keyboard, "profile cache hit");
                return Ok(Arc::clone(&cached.profile));
            }
        }

        let (doc, deps) = self.merged_document(keyboard)?;
        schema::check_required_fields(&doc)?;

        let (doc, firmware_config) = match firmware {
            Some(version) => {
                let variant = extract_firmware(&doc, keyboard, version)?;
                let mut config: FirmwareConfig = serde_yml::from_value(variant.clone())
                    .map_err(|e| Error::Yaml {
                        context: format!("firmware '{version}' of keyboard '{keyboard}'"),
                        source: e,
                    })?;
                if config.version.is_empty() {
                    config.version = version.to_string();
                }
                schema::check_firmware(&config)?;
                (deep_merge(doc, variant), Some(config))
            }
            None => (doc, None),
        };

        let raw: RawProfile = serde_yml::from_value(doc).map_err(|e| Error::Yaml {
            context: format!("keyboard profile '{keyboard}'"),
            source: e,
        })?;

        let profile = KeyboardProfile {
            keyboard_name: raw.keyboard,
            description: raw.description,
            vendor: raw.vendor,
            key_count: raw.key_count,
            flash_method: raw.flash,
            build_method: raw.build,
            firmware_version: firmware.map(ToString::to_string),
            firmware_config,
            keymap_section: raw.keymap,
            zmk_config: raw.zmk,
        };
        schema::check_profile(&profile)?;

        let profile = Arc::new(profile);
        self.profile_cache.borrow_mut().insert(
            cache_key,
            CachedProfile {
                profile: Arc::clone(&profile),
                deps,
            },
        );
        Ok(profile)
    }

    /// Like [`load`](Self::load), but downgrades `FirmwareMissing` to a
    /// keyboard-only profile instead of failing.
    pub fn load_or_keyboard_only(
        &self,
        keyboard: &str,
        firmware: Option<&str>,
    ) -> Result<Arc<KeyboardProfile>> {
        match self.load(keyboard, firmware) {
            Err(Error::FirmwareMissing { .. }) => self.load(keyboard, None),
            other => other,
        }
    }

    /// Loads the main document for a keyboard and resolves every include.
    /// Returns the merged document plus the (path, mtime) set it depends on.
    fn merged_document(&self, keyboard: &str) -> Result<(Value, Vec<(PathBuf, SystemTime)>)> {
        let (main_path, dir) = self
            .find_definition(keyboard)
            .ok_or_else(|| Error::ConfigNotFound(keyboard.to_string()))?;

        let mut stack = Vec::new();
        let mut deps = Vec::new();
        let doc = self.load_resolved(&main_path, &dir, &mut stack, &mut deps)?;
        Ok((doc, deps))
    }

    /// Locates the definition file for a keyboard: `<path>/<name>.yaml` or
    /// `<path>/<name>/keyboard.yaml`, first search path wins.
    fn find_definition(&self, keyboard: &str) -> Option<(PathBuf, PathBuf)> {
        for path in &self.search_paths {
            let file_form = path.join(format!("{keyboard}.yaml"));
            if file_form.is_file() {
                return Some((file_form, path.clone()));
            }
            let dir_form = path.join(keyboard);
            let main = dir_form.join(MAIN_FILE);
            if main.is_file() {
                return Some((main, dir_form));
            }
        }
        None
    }

    /// Loads one file, resolves its includes depth-first, and returns the
    /// merged value. `stack` carries the canonical include chain for cycle
    /// detection; `deps` accumulates every file touched.
    fn load_resolved(
        &self,
        file: &Path,
        dir: &Path,
        stack: &mut Vec<PathBuf>,
        deps: &mut Vec<(PathBuf, SystemTime)>,
    ) -> Result<Value> {
        let canonical = file
            .canonicalize()
            .map_err(|e| Error::io(format!("resolving include {}", file.display()), e))?;
        if stack.contains(&canonical) {
            let mut cycle = stack.clone();
            cycle.push(canonical);
            return Err(Error::IncludeCycle(cycle));
        }
        stack.push(canonical.clone());

        let (value, mtime) = self.read_yaml(&canonical)?;
        deps.push((canonical, mtime));

        let resolved = self.resolve_node(value, dir, stack, deps)?;
        stack.pop();
        Ok(resolved)
    }

    /// Resolves `includes:` in one mapping node and in its section children.
    fn resolve_node(
        &self,
        value: Value,
        dir: &Path,
        stack: &mut Vec<PathBuf>,
        deps: &mut Vec<(PathBuf, SystemTime)>,
    ) -> Result<Value> {
        let Value::Mapping(mut map) = value else {
            return Ok(value);
        };

        // Section children first, so their fragments merge below the
        // section's own fields.
        for section in SECTION_KEYS {
            let key = Value::String((*section).to_string());
            if let Some(child) = map.remove(&key) {
                let resolved = self.resolve_node(child, dir, stack, deps)?;
                map.insert(key, resolved);
            }
        }

        let includes_key = Value::String("includes".to_string());
        let Some(includes) = map.remove(&includes_key) else {
            return Ok(Value::Mapping(map));
        };

        let names = include_names(&includes)?;
        let mut fragments = Vec::with_capacity(names.len() + 1);
        for name in names {
            let include_path = dir.join(&name);
            fragments.push(self.load_resolved(&include_path, dir, stack, deps)?);
        }
        fragments.push(Value::Mapping(map));
        Ok(merge_all(fragments))
    }

    /// Reads and parses a YAML file, memoized by path + mtime.
    fn read_yaml(&self, path: &Path) -> Result<(Value, SystemTime)> {
        let mtime = file_mtime(path)?;
        if let Some(cached) = self.yaml_cache.borrow().get(path) {
            if cached.mtime == mtime {
                return Ok((cached.value.clone(), mtime));
            }
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        let value: Value = serde_yml::from_str(&text).map_err(|e| Error::Yaml {
            context: format!("parsing {}", path.display()),
            source: e,
        })?;

        self.yaml_cache.borrow_mut().insert(
            path.to_path_buf(),
            CachedYaml {
                mtime,
                value: value.clone(),
            },
        );
        Ok((value, mtime))
    }
}

/// Raw deserialization target for a merged profile document.
#[derive(Deserialize)]
struct RawProfile {
    keyboard: String,
    description: String,
    vendor: String,
    key_count: usize,
    flash: super::FlashMethodConfig,
    build: super::BuildMethodConfig,
    #[serde(default)]
    keymap: Option<KeymapConfig>,
    #[serde(default)]
    zmk: ZmkConfig,
}

fn extract_firmware(doc: &Value, keyboard: &str, version: &str) -> Result<Value> {
    doc.as_mapping()
        .and_then(|m| m.get(&Value::String("firmwares".into())))
        .and_then(Value::as_mapping)
        .and_then(|m| m.get(&Value::String(version.to_string())))
        .cloned()
        .ok_or_else(|| Error::FirmwareMissing {
            keyboard: keyboard.to_string(),
            version: version.to_string(),
        })
}

fn include_names(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Sequence(seq) => seq
            .iter()
            .map(|v| {
                v.as_str().map(ToString::to_string).ok_or_else(|| {
                    Error::SchemaError {
                        field: "includes".into(),
                        reason: "entries must be file names".into(),
                    }
                })
            })
            .collect(),
        _ => Err(Error::SchemaError {
            field: "includes".into(),
            reason: "must be a file name or a list of file names".into(),
        }),
    }
}

fn file_mtime(path: &Path) -> Result<SystemTime> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| Error::io(format!("stat {}", path.display()), e))
}

fn deps_fresh(deps: &[(PathBuf, SystemTime)]) -> bool {
    deps.iter()
        .all(|(path, recorded)| file_mtime(path).is_ok_and(|now| now == *recorded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    const TOY: &str = r#"
keyboard: toy42
description: Toy board
vendor: Acme
key_count: 2
flash:
  usb_vid: "0x1209"
  usb_pid: "0x0042"
build:
  strategy: zmk_config
  image: zmkfirmware/zmk-build-arm:stable
  repository: https://github.com/acme/zmk-config-toy42
  revision: main
  matrix:
    - board: nice_nano_v2
      shield: toy42
keymap:
  includes: []
firmwares:
  v1:
    branch: v1-branch
  v2:
    branch: v2-branch
    kconfig:
      CONFIG_ZMK_SLEEP: "y"
"#;

    #[test]
    fn test_load_file_form() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "toy42.yaml", TOY);

        let resolver = ProfileResolver::new(vec![tmp.path().to_path_buf()]);
        let profile = resolver.load("toy42", None).unwrap();
        assert_eq!(profile.keyboard_name, "toy42");
        assert_eq!(profile.key_count, 2);
        assert!(!profile.can_compile());
    }

    #[test]
    fn test_load_firmware_variant() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "toy42.yaml", TOY);

        let resolver = ProfileResolver::new(vec![tmp.path().to_path_buf()]);
        let profile = resolver.load("toy42", Some("v2")).unwrap();
        assert!(profile.can_compile());
        let firmware = profile.firmware_config.as_ref().unwrap();
        assert_eq!(firmware.branch, "v2-branch");
        assert_eq!(firmware.version, "v2");
        assert_eq!(
            firmware.kconfig.get("CONFIG_ZMK_SLEEP").unwrap(),
            &crate::profile::KconfigValue::Str("y".into())
        );
    }

    #[test]
    fn test_firmware_missing() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "toy42.yaml", TOY);

        let resolver = ProfileResolver::new(vec![tmp.path().to_path_buf()]);
        let err = resolver.load("toy42", Some("v9")).unwrap_err();
        assert!(matches!(err, Error::FirmwareMissing { .. }));

        // Downgrade path keeps the keyboard usable for flashing.
        let profile = resolver.load_or_keyboard_only("toy42", Some("v9")).unwrap();
        assert!(!profile.can_compile());
    }

    #[test]
    fn test_list_keyboards_and_firmwares() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "toy42.yaml", TOY);
        fs::create_dir(tmp.path().join("other")).unwrap();
        write(
            &tmp.path().join("other"),
            "keyboard.yaml",
            "keyboard: other\ndescription: o\nvendor: v\nkey_count: 1\nflash: {}\nbuild: {}",
        );

        let resolver = ProfileResolver::new(vec![tmp.path().to_path_buf()]);
        let names = resolver.list_keyboards();
        assert!(names.contains("toy42"));
        assert!(names.contains("other"));

        let firmwares = resolver.list_firmwares("toy42").unwrap();
        assert_eq!(firmwares, vec!["v1", "v2"]);
        assert!(resolver.list_firmwares("other").unwrap().is_empty());
    }

    #[test]
    fn test_include_resolution() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("inc");
        fs::create_dir(&dir).unwrap();
        write(
            &dir,
            "keyboard.yaml",
            r#"
includes: [base.yaml]
keyboard: inc
description: with include
vendor: Acme
key_count: 4
flash: {}
keymap:
  includes_fragment: true
"#,
        );
        write(
            &dir,
            "base.yaml",
            r#"
build:
  strategy: west
  image: zmkfirmware/zmk-build-arm:stable
key_count: 2
"#,
        );

        let resolver = ProfileResolver::new(vec![tmp.path().to_path_buf()]);
        let profile = resolver.load("inc", None).unwrap();
        // Including file wins on conflicts.
        assert_eq!(profile.key_count, 4);
        assert_eq!(
            profile.build_method.strategy,
            crate::profile::BuildStrategy::West
        );
    }

    #[test]
    fn test_include_cycle_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cyc");
        fs::create_dir(&dir).unwrap();
        write(&dir, "keyboard.yaml", "includes: [a.yaml]\nkeyboard: cyc");
        write(&dir, "a.yaml", "includes: [b.yaml]");
        write(&dir, "b.yaml", "includes: [a.yaml]");

        let resolver = ProfileResolver::new(vec![tmp.path().to_path_buf()]);
        let err = resolver.load("cyc", None).unwrap_err();
        assert!(matches!(err, Error::IncludeCycle(_)));
    }

    #[test]
    fn test_self_include_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("selfy");
        fs::create_dir(&dir).unwrap();
        write(&dir, "keyboard.yaml", "includes: [keyboard.yaml]");

        let resolver = ProfileResolver::new(vec![tmp.path().to_path_buf()]);
        let err = resolver.load("selfy", None).unwrap_err();
        assert!(matches!(err, Error::IncludeCycle(_)));
    }

    #[test]
    fn test_first_search_path_wins() {
        let tmp_a = TempDir::new().unwrap();
        let tmp_b = TempDir::new().unwrap();
        write(tmp_a.path(), "toy42.yaml", TOY);
        write(
            tmp_b.path(),
            "toy42.yaml",
            TOY.replace("vendor: Acme", "vendor: Clone").as_str(),
        );

        let resolver = ProfileResolver::new(vec![
            tmp_a.path().to_path_buf(),
            tmp_b.path().to_path_buf(),
        ]);
        let profile = resolver.load("toy42", None).unwrap();
        assert_eq!(profile.vendor, "Acme");
    }
}
