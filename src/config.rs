//! User preferences store.
//!
//! Loaded from `<config_dir>/glovebox/config.yaml` (or `config.json`), with
//! environment overrides applied at read time. Every other subsystem gets
//! its settings handed to it from here; nothing else reads the environment.

use crate::error::{Error, Result};
use crate::profile::UserMappingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment override names.
pub mod env_vars {
    /// Default profile spec (`keyboard` or `keyboard/firmware`).
    pub const PROFILE: &str = "GLOVEBOX_PROFILE";
    /// Default layout file.
    pub const LAYOUT_FILE: &str = "GLOVEBOX_LAYOUT_FILE";
    /// Cache root directory.
    pub const CACHE_ROOT: &str = "GLOVEBOX_CACHE_ROOT";
    /// Extra keyboard search paths, colon separated.
    pub const KEYBOARD_PATH: &str = "GLOVEBOX_KEYBOARD_PATH";
    /// Container runtime binary.
    pub const CONTAINER_RUNTIME: &str = "GLOVEBOX_CONTAINER_RUNTIME";
    /// Built-in keyboard bundle location (set by packaging).
    pub const BUILTIN_KEYBOARDS: &str = "GLOVEBOX_BUILTIN_KEYBOARDS";
}

/// The persisted preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserConfig {
    /// Default profile spec, e.g. `glove80/v25.05`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
    /// Default layout file for layout commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_layout: Option<PathBuf>,
    /// Cache root; platform cache dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<PathBuf>,
    /// Additional keyboard search paths (lowest precedence).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyboard_paths: Vec<PathBuf>,
    /// Container runtime binary (`docker`/`podman`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<String>,
    /// Container user mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_mapping: Option<UserMappingConfig>,
    /// Log filter applied when `-v` flags are absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl UserConfig {
    /// The configuration directory (`~/.config/glovebox` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join("glovebox"))
            .ok_or_else(|| Error::Config("could not determine user config directory".into()))
    }

    /// Loads preferences from the default location; missing files yield
    /// defaults.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        Self::load_from_dir(&dir)
    }

    /// Loads from `config.yaml` or `config.json` under `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let yaml_path = dir.join("config.yaml");
        if yaml_path.is_file() {
            let text = std::fs::read_to_string(&yaml_path)
                .map_err(|e| Error::io(format!("reading {}", yaml_path.display()), e))?;
            return serde_yml::from_str(&text).map_err(|e| Error::Yaml {
                context: format!("parsing {}", yaml_path.display()),
                source: e,
            });
        }
        let json_path = dir.join("config.json");
        if json_path.is_file() {
            let text = std::fs::read_to_string(&json_path)
                .map_err(|e| Error::io(format!("reading {}", json_path.display()), e))?;
            return serde_json::from_str(&text).map_err(|e| Error::Json {
                context: format!("parsing {}", json_path.display()),
                source: e,
            });
        }
        Ok(Self::default())
    }

    /// Persists to `config.yaml` atomically.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&Self::config_dir()?)
    }

    /// Persists to `dir/config.yaml` atomically.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
        let text = serde_yml::to_string(self).map_err(|e| Error::Yaml {
            context: "serializing preferences".into(),
            source: e,
        })?;
        let path = dir.join("config.yaml");
        let tmp = dir.join("config.yaml.tmp");
        std::fs::write(&tmp, text)
            .map_err(|e| Error::io(format!("writing {}", tmp.display()), e))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::io(format!("renaming to {}", path.display()), e))?;
        Ok(())
    }

    /// The effective default profile: environment first, then the store.
    #[must_use]
    pub fn effective_profile(&self) -> Option<String> {
        std::env::var(env_vars::PROFILE)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.default_profile.clone())
    }

    /// The effective default layout file.
    #[must_use]
    pub fn effective_layout(&self) -> Option<PathBuf> {
        std::env::var(env_vars::LAYOUT_FILE)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.default_layout.clone())
    }

    /// The effective cache root.
    #[must_use]
    pub fn effective_cache_root(&self) -> PathBuf {
        if let Ok(root) = std::env::var(env_vars::CACHE_ROOT) {
            if !root.is_empty() {
                return PathBuf::from(root);
            }
        }
        self.cache_root.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("glovebox")
        })
    }

    /// The effective container runtime choice.
    #[must_use]
    pub fn effective_runtime(&self) -> Option<String> {
        std::env::var(env_vars::CONTAINER_RUNTIME)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.container_runtime.clone())
    }

    /// Keyboard search paths in precedence order: built-in bundle, user
    /// keyboards, environment paths, store paths.
    #[must_use]
    pub fn keyboard_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(builtin) = std::env::var(env_vars::BUILTIN_KEYBOARDS) {
            if !builtin.is_empty() {
                paths.push(PathBuf::from(builtin));
            }
        } else if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let bundled = dir.join("keyboards");
                if bundled.is_dir() {
                    paths.push(bundled);
                }
            }
        }

        if let Ok(dir) = Self::config_dir() {
            paths.push(dir.join("keyboards"));
        }

        if let Ok(env_paths) = std::env::var(env_vars::KEYBOARD_PATH) {
            for p in env_paths.split(':').filter(|p| !p.is_empty()) {
                paths.push(PathBuf::from(p));
            }
        }

        paths.extend(self.keyboard_paths.iter().cloned());
        paths
    }

    /// Where master layouts are stored for `layout upgrade`.
    pub fn masters_dir(keyboard: &str) -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("masters").join(keyboard))
    }

    /// Reads one preference by name, for `config show <key>`.
    pub fn get_field(&self, key: &str) -> Result<serde_yml::Value> {
        let doc = serde_yml::to_value(self).map_err(|e| Error::Yaml {
            context: "serializing preferences".into(),
            source: e,
        })?;
        doc.as_mapping()
            .and_then(|m| m.get(&serde_yml::Value::String(key.to_string())))
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown or unset preference '{key}'")))
    }

    /// Sets one preference by name from a YAML-parsed value, for
    /// `config edit`.
    pub fn set_field(&mut self, key: &str, raw: &str) -> Result<()> {
        const KNOWN_KEYS: &[&str] = &[
            "default_profile",
            "default_layout",
            "cache_root",
            "keyboard_paths",
            "container_runtime",
            "user_mapping",
            "log_level",
        ];
        if !KNOWN_KEYS.contains(&key) {
            return Err(Error::Config(format!(
                "unknown preference '{key}' (known: {})",
                KNOWN_KEYS.join(", ")
            )));
        }
        let mut doc = serde_yml::to_value(&*self).map_err(|e| Error::Yaml {
            context: "serializing preferences".into(),
            source: e,
        })?;
        let value: serde_yml::Value = serde_yml::from_str(raw).map_err(|e| Error::Yaml {
            context: format!("parsing value for '{key}'"),
            source: e,
        })?;
        let map = doc
            .as_mapping_mut()
            .ok_or_else(|| Error::Internal("preferences did not serialize to a mapping".into()))?;
        map.insert(serde_yml::Value::String(key.to_string()), value);
        *self = serde_yml::from_value(doc).map_err(|e| Error::Yaml {
            context: format!("'{key}' is not a valid preference value"),
            source: e,
        })?;
        Ok(())
    }
}

/// Splits a `keyboard[/firmware]` profile spec.
#[must_use]
pub fn parse_profile_spec(spec: &str) -> (String, Option<String>) {
    match spec.split_once('/') {
        Some((keyboard, firmware)) if !firmware.is_empty() => {
            (keyboard.to_string(), Some(firmware.to_string()))
        }
        _ => (spec.trim_end_matches('/').to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = UserConfig::load_from_dir(tmp.path()).unwrap();
        assert_eq!(config, UserConfig::default());
    }

    #[test]
    fn test_yaml_round_trip() {
        let tmp = TempDir::new().unwrap();
        let config = UserConfig {
            default_profile: Some("glove80/v25.05".into()),
            keyboard_paths: vec![PathBuf::from("/opt/keyboards")],
            container_runtime: Some("podman".into()),
            ..UserConfig::default()
        };
        config.save_to_dir(tmp.path()).unwrap();
        let loaded = UserConfig::load_from_dir(tmp.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_json_fallback() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            r#"{"default_profile": "corne/main"}"#,
        )
        .unwrap();
        let loaded = UserConfig::load_from_dir(tmp.path()).unwrap();
        assert_eq!(loaded.default_profile.as_deref(), Some("corne/main"));
    }

    #[test]
    fn test_get_set_field() {
        let mut config = UserConfig::default();
        config.set_field("default_profile", "glove80/v25.05").unwrap();
        assert_eq!(config.default_profile.as_deref(), Some("glove80/v25.05"));

        let value = config.get_field("default_profile").unwrap();
        assert_eq!(value.as_str(), Some("glove80/v25.05"));

        assert!(config.set_field("keyboard_paths", "[/a, /b]").is_ok());
        assert_eq!(config.keyboard_paths.len(), 2);

        assert!(config.set_field("not_a_key", "1").is_err());
    }

    #[test]
    fn test_parse_profile_spec() {
        assert_eq!(
            parse_profile_spec("glove80/v25.05"),
            ("glove80".into(), Some("v25.05".into()))
        );
        assert_eq!(parse_profile_spec("corne"), ("corne".into(), None));
        assert_eq!(parse_profile_spec("corne/"), ("corne".into(), None));
    }
}
