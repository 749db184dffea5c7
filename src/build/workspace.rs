//! Build workspace materialization.
//!
//! Two shapes: clone an existing ZMK-config repository and drop the generated
//! sources into its `config/`, or synthesize a minimal west workspace from
//! the profile alone. Either way the result is the directory layout the ZMK
//! build system expects:
//!
//! ```text
//! <root>/config/west.yml
//! <root>/config/<shield>.keymap
//! <root>/config/<shield>.conf
//! <root>/build.yaml
//! ```

use crate::error::{Error, Result};
use crate::profile::{BuildMatrixEntry, KeyboardProfile, WorkspaceSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

/// A materialized workspace, ready for the build driver.
#[derive(Debug)]
pub struct Workspace {
    /// Workspace root (the single volume mounted into the container).
    pub root: PathBuf,
    /// The effective build matrix, split halves expanded.
    pub matrix: Vec<BuildMatrixEntry>,
}

/// One `include:` row of `build.yaml`, hyphenated per the ZMK convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildYamlEntry {
    /// Zephyr board.
    pub board: String,
    /// ZMK shield.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shield: Option<String>,
    /// Extra CMake arguments.
    #[serde(
        rename = "cmake-args",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cmake_args: Vec<String>,
    /// Zephyr snippet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Artifact name override.
    #[serde(
        rename = "artifact-name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub artifact_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BuildYaml {
    include: Vec<BuildYamlEntry>,
}

/// Materializes workspaces for one profile.
pub struct WorkspaceBuilder<'a> {
    profile: &'a KeyboardProfile,
}

impl<'a> WorkspaceBuilder<'a> {
    /// A builder over `profile`.
    #[must_use]
    pub fn new(profile: &'a KeyboardProfile) -> Self {
        Self { profile }
    }

    /// The effective build matrix: the profile's rows, with split keyboards
    /// expanding each shield row into `_left` and `_right` halves. Rows are
    /// never invented beyond that expansion.
    #[must_use]
    pub fn effective_matrix(&self) -> Vec<BuildMatrixEntry> {
        let build = &self.profile.build_method;
        let mut matrix = Vec::new();
        for entry in &build.matrix {
            let splittable = build.is_split
                && entry.shield.as_ref().is_some_and(|s| {
                    !s.ends_with("_left") && !s.ends_with("_right")
                });
            if splittable {
                let shield = entry.shield.clone().unwrap_or_default();
                for half in ["left", "right"] {
                    let mut half_entry = entry.clone();
                    half_entry.shield = Some(format!("{shield}_{half}"));
                    matrix.push(half_entry);
                }
            } else {
                matrix.push(entry.clone());
            }
        }
        matrix
    }

    /// The canonical shield file name for generated sources: the first
    /// shield with any `_left`/`_right` suffix stripped, else the keyboard
    /// name.
    #[must_use]
    pub fn shield_file_name(&self) -> String {
        self.profile
            .build_method
            .matrix
            .iter()
            .find_map(|e| e.shield.clone())
            .map_or_else(
                || self.profile.keyboard_name.clone(),
                |s| {
                    s.trim_end_matches("_left")
                        .trim_end_matches("_right")
                        .to_string()
                },
            )
    }

    /// Materializes a workspace at `root` with the generated sources.
    pub fn prepare(&self, root: &Path, keymap_source: &str, conf_source: &str) -> Result<Workspace> {
        match self.profile.build_method.source {
            WorkspaceSource::ConfigRepo => self.prepare_config_repo(root, keymap_source, conf_source),
            WorkspaceSource::Synthesized => self.prepare_synthesized(root, keymap_source, conf_source),
        }
    }

    /// Writes the generated keymap/conf into an existing workspace shell
    /// (the cache warm path).
    pub fn overlay_sources(&self, root: &Path, keymap_source: &str, conf_source: &str) -> Result<()> {
        let config_dir = root.join("config");
        std::fs::create_dir_all(&config_dir)
            .map_err(|e| Error::io(format!("creating {}", config_dir.display()), e))?;
        let shield = self.shield_file_name();
        write(&config_dir.join(format!("{shield}.keymap")), keymap_source)?;
        write(&config_dir.join(format!("{shield}.conf")), conf_source)?;
        Ok(())
    }

    fn prepare_config_repo(
        &self,
        root: &Path,
        keymap_source: &str,
        conf_source: &str,
    ) -> Result<Workspace> {
        let build = &self.profile.build_method;
        clone_with_retry(&build.repository, &build.revision, root)?;

        self.overlay_sources(root, keymap_source, conf_source)?;

        let build_yaml = root.join("build.yaml");
        if build.regenerate_build_yaml || !build_yaml.exists() {
            self.write_build_yaml(&build_yaml)?;
        } else {
            info!("preserving build.yaml from config repository");
        }

        Ok(Workspace {
            root: root.to_path_buf(),
            matrix: self.effective_matrix(),
        })
    }

    fn prepare_synthesized(
        &self,
        root: &Path,
        keymap_source: &str,
        conf_source: &str,
    ) -> Result<Workspace> {
        let config_dir = root.join("config");
        std::fs::create_dir_all(&config_dir)
            .map_err(|e| Error::io(format!("creating {}", config_dir.display()), e))?;

        write(&config_dir.join("west.yml"), &self.west_manifest())?;
        self.overlay_sources(root, keymap_source, conf_source)?;
        self.write_build_yaml(&root.join("build.yaml"))?;

        Ok(Workspace {
            root: root.to_path_buf(),
            matrix: self.effective_matrix(),
        })
    }

    /// The minimal west manifest: one remote, one project importing the ZMK
    /// application manifest at the configured revision, `self.path: config`.
    fn west_manifest(&self) -> String {
        let build = &self.profile.build_method;
        let (url_base, project) = split_repository_url(&build.repository);
        let revision = if build.revision.is_empty() {
            "main"
        } else {
            &build.revision
        };
        format!(
            "manifest:\n  remotes:\n    - name: upstream\n      url-base: {url_base}\n  projects:\n    - name: {project}\n      remote: upstream\n      revision: {revision}\n      import: app/west.yml\n  self:\n    path: config\n"
        )
    }

    /// Serializes `build.yaml` from the effective matrix.
    pub fn write_build_yaml(&self, path: &Path) -> Result<()> {
        let doc = BuildYaml {
            include: self
                .effective_matrix()
                .into_iter()
                .map(|entry| BuildYamlEntry {
                    board: entry.board,
                    shield: entry.shield,
                    cmake_args: entry.cmake_args,
                    snippet: entry.snippet,
                    artifact_name: entry.artifact_name,
                })
                .collect(),
        };
        let text = serde_yml::to_string(&doc).map_err(|e| Error::Yaml {
            context: "serializing build.yaml".into(),
            source: e,
        })?;
        write(path, &text)
    }
}

/// `https://github.com/zmkfirmware/zmk` → (`https://github.com/zmkfirmware`, `zmk`).
fn split_repository_url(url: &str) -> (String, String) {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    match trimmed.rsplit_once('/') {
        Some((base, name)) if !name.is_empty() => (base.to_string(), name.to_string()),
        _ => (trimmed.to_string(), "zmk".to_string()),
    }
}

/// Shallow clone with 3 retries and exponential backoff (1 s, 2 s, 4 s).
fn clone_with_retry(repository: &str, revision: &str, dest: &Path) -> Result<()> {
    if repository.is_empty() {
        return Err(Error::Config(
            "profile names no repository for config-repo workspaces".into(),
        ));
    }
    let mut delay = Duration::from_secs(1);
    let mut last_error = String::new();
    for attempt in 1..=3 {
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1");
        if !revision.is_empty() {
            cmd.arg("--branch").arg(revision);
        }
        cmd.arg(repository).arg(dest);

        match cmd.output() {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                last_error = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(attempt, error = %last_error, "git clone failed");
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(attempt, error = %last_error, "git not runnable");
            }
        }
        if attempt < 3 {
            // A partial clone must not poison the next attempt.
            let _ = std::fs::remove_dir_all(dest);
            std::thread::sleep(delay);
            delay *= 2;
        }
    }
    Err(Error::Config(format!(
        "cloning {repository} failed after 3 attempts: {last_error}"
    )))
}

fn write(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{
        BuildMethodConfig, BuildStrategy, FlashMethodConfig, ZmkConfig,
    };
    use tempfile::TempDir;

    fn profile(matrix: Vec<BuildMatrixEntry>, is_split: bool) -> KeyboardProfile {
        KeyboardProfile {
            keyboard_name: "glove80".into(),
            description: "MoErgo Glove80".into(),
            vendor: "MoErgo".into(),
            key_count: 80,
            flash_method: FlashMethodConfig::default(),
            build_method: BuildMethodConfig {
                strategy: BuildStrategy::ZmkConfig,
                repository: "https://github.com/zmkfirmware/zmk".into(),
                revision: "v3.5".into(),
                image: "zmkfirmware/zmk-build-arm:stable".into(),
                matrix,
                is_split,
                ..BuildMethodConfig::default()
            },
            firmware_version: None,
            firmware_config: None,
            keymap_section: None,
            zmk_config: ZmkConfig::default(),
        }
    }

    fn board(name: &str) -> BuildMatrixEntry {
        BuildMatrixEntry {
            board: name.into(),
            shield: None,
            artifact_name: None,
            cmake_args: vec![],
            snippet: None,
        }
    }

    #[test]
    fn test_split_board_matrix_not_expanded() {
        // Split keyboards with per-half boards list both halves explicitly.
        let profile = profile(vec![board("glove80_lh"), board("glove80_rh")], true);
        let builder = WorkspaceBuilder::new(&profile);
        let matrix = builder.effective_matrix();
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix[0].artifact_base_name(), "glove80_lh-zmk");
        assert_eq!(matrix[1].artifact_base_name(), "glove80_rh-zmk");
    }

    #[test]
    fn test_split_shield_expands_into_halves() {
        let entry = BuildMatrixEntry {
            board: "nice_nano_v2".into(),
            shield: Some("corne".into()),
            artifact_name: None,
            cmake_args: vec![],
            snippet: None,
        };
        let profile = profile(vec![entry], true);
        let builder = WorkspaceBuilder::new(&profile);
        let matrix = builder.effective_matrix();
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix[0].shield.as_deref(), Some("corne_left"));
        assert_eq!(matrix[1].shield.as_deref(), Some("corne_right"));
    }

    #[test]
    fn test_synthesized_workspace_layout() {
        let profile = profile(vec![board("glove80_lh"), board("glove80_rh")], true);
        let builder = WorkspaceBuilder::new(&profile);
        let tmp = TempDir::new().unwrap();

        let workspace = builder
            .prepare(tmp.path(), "// keymap\n", "CONFIG_ZMK_SLEEP=y\n")
            .unwrap();
        assert_eq!(workspace.matrix.len(), 2);

        let west = std::fs::read_to_string(tmp.path().join("config/west.yml")).unwrap();
        assert!(west.contains("url-base: https://github.com/zmkfirmware"));
        assert!(west.contains("revision: v3.5"));
        assert!(west.contains("import: app/west.yml"));
        assert!(west.contains("path: config"));

        assert!(tmp.path().join("config/glove80.keymap").is_file());
        assert!(tmp.path().join("config/glove80.conf").is_file());

        let build_yaml = std::fs::read_to_string(tmp.path().join("build.yaml")).unwrap();
        let parsed: BuildYaml = serde_yml::from_str(&build_yaml).unwrap();
        assert_eq!(parsed.include.len(), 2);
        assert_eq!(parsed.include[0].board, "glove80_lh");
        assert_eq!(parsed.include[1].board, "glove80_rh");
    }

    #[test]
    fn test_build_yaml_hyphenated_fields() {
        let entry = BuildMatrixEntry {
            board: "nice_nano_v2".into(),
            shield: Some("corne_left".into()),
            artifact_name: Some("left".into()),
            cmake_args: vec!["-DCONFIG_ZMK_STUDIO=y".into()],
            snippet: Some("studio-rpc-usb-uart".into()),
        };
        let profile = profile(vec![entry], false);
        let builder = WorkspaceBuilder::new(&profile);
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.yaml");
        builder.write_build_yaml(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("cmake-args:"));
        assert!(text.contains("artifact-name: left"));
        assert!(text.contains("snippet: studio-rpc-usb-uart"));
        assert!(!text.contains("cmake_args"));
    }

    #[test]
    fn test_shield_file_name_strips_half_suffix() {
        let entry = BuildMatrixEntry {
            board: "nice_nano_v2".into(),
            shield: Some("corne_left".into()),
            artifact_name: None,
            cmake_args: vec![],
            snippet: None,
        };
        let profile = profile(vec![entry], true);
        assert_eq!(WorkspaceBuilder::new(&profile).shield_file_name(), "corne");
    }

    #[test]
    fn test_split_repository_url() {
        assert_eq!(
            split_repository_url("https://github.com/zmkfirmware/zmk"),
            ("https://github.com/zmkfirmware".into(), "zmk".into())
        );
        assert_eq!(
            split_repository_url("https://github.com/moergo-sc/zmk.git"),
            ("https://github.com/moergo-sc".into(), "zmk".into())
        );
    }
}
