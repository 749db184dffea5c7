//! Container build driver.
//!
//! Runs the profile's build strategy inside a container with exactly one
//! mounted volume (the workspace), multiplexes the container's output into a
//! persistent build log from a background thread, and collects the expected
//! artifacts per build-matrix entry.

use crate::build::cache::{CacheTier, TwoTierCache, BASE_TTL, CONFIG_TTL};
use crate::build::workspace::WorkspaceBuilder;
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::profile::{BuildMatrixEntry, BuildStrategy, KeyboardProfile, UserMappingConfig};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many log lines a `BuildFailed` error carries.
const LOG_TAIL_LINES: usize = 20;

/// Grace period between terminate and kill on cancellation.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Options for one compile invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Where artifacts and the build log land.
    pub output_dir: PathBuf,
    /// Bypass both cache tiers.
    pub no_cache: bool,
    /// Keep the workspace around when the build fails.
    pub preserve_on_failure: bool,
    /// Container runtime binary; auto-detected when unset.
    pub runtime: Option<String>,
    /// CLI-level user mapping override (highest precedence).
    pub user_mapping: Option<UserMappingConfig>,
    /// Cooperative cancellation.
    pub cancel: CancellationToken,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            no_cache: false,
            preserve_on_failure: false,
            runtime: None,
            user_mapping: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// What a compile produced.
#[derive(Debug)]
pub struct BuildResult {
    /// Artifacts copied into the output directory.
    pub artifacts: Vec<PathBuf>,
    /// Artifact names that were expected but not found.
    pub missing: Vec<String>,
    /// The persisted build log.
    pub log_path: PathBuf,
}

/// The fully resolved container-side user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUserMapping {
    /// Whether any mapping flags are passed at all.
    pub enabled: bool,
    /// UID for `--user`.
    pub uid: Option<u32>,
    /// GID for `--user`.
    pub gid: Option<u32>,
    /// HOME inside the container.
    pub home: Option<String>,
}

/// Resolves user mapping with CLI > profile > user config > auto-detect
/// precedence, field by field.
#[must_use]
pub fn resolve_user_mapping(
    cli: Option<&UserMappingConfig>,
    profile: Option<&UserMappingConfig>,
    user_config: Option<&UserMappingConfig>,
) -> ResolvedUserMapping {
    let layers = [cli, profile, user_config];
    let pick_u32 = |get: fn(&UserMappingConfig) -> Option<u32>| {
        layers.iter().flatten().find_map(|layer| get(layer))
    };
    let enabled = layers
        .iter()
        .flatten()
        .find_map(|layer| layer.enabled)
        .unwrap_or(true);
    let home = layers
        .iter()
        .flatten()
        .find_map(|layer| layer.home.clone());

    let uid = pick_u32(|l| l.uid).or_else(|| if enabled { detect_id("-u") } else { None });
    let gid = pick_u32(|l| l.gid).or_else(|| if enabled { detect_id("-g") } else { None });

    ResolvedUserMapping {
        enabled,
        uid,
        gid,
        home,
    }
}

/// Current-process uid/gid via `id`, the portable unix probe.
fn detect_id(flag: &str) -> Option<u32> {
    let output = Command::new("id").arg(flag).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

/// Picks the container runtime: explicit choice, else the first of
/// `docker`/`podman` on PATH.
pub fn detect_runtime(preferred: Option<&str>) -> Result<String> {
    let candidates: Vec<String> = match preferred {
        Some(name) => vec![name.to_string()],
        None => vec!["docker".to_string(), "podman".to_string()],
    };
    for candidate in &candidates {
        let found = Command::new(candidate)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success());
        if found {
            return Ok(candidate.clone());
        }
    }
    Err(Error::RuntimeMissing(candidates.join("/")))
}

/// Drives compiles for one profile. The cache is optional: `None` means
/// every build is cold.
pub struct BuildDriver<'a> {
    profile: &'a KeyboardProfile,
    cache: Option<&'a TwoTierCache>,
    user_config_mapping: Option<UserMappingConfig>,
}

impl<'a> BuildDriver<'a> {
    /// A driver over `profile`.
    #[must_use]
    pub fn new(
        profile: &'a KeyboardProfile,
        cache: Option<&'a TwoTierCache>,
        user_config_mapping: Option<UserMappingConfig>,
    ) -> Self {
        Self {
            profile,
            cache,
            user_config_mapping,
        }
    }

    /// Compiles the generated sources into firmware images.
    pub fn compile(
        &self,
        keymap_source: &str,
        conf_source: &str,
        opts: &BuildOptions,
    ) -> Result<BuildResult> {
        self.profile.require_compile()?;
        opts.cancel.check()?;

        std::fs::create_dir_all(&opts.output_dir)
            .map_err(|e| Error::io(format!("creating {}", opts.output_dir.display()), e))?;
        let log_path = opts.output_dir.join("build.log");

        let workspace_root = tempfile_dir(&self.profile.keyboard_name)?;
        let builder = WorkspaceBuilder::new(self.profile);

        let cached = if opts.no_cache {
            false
        } else {
            self.restore_from_cache(&builder, &workspace_root, keymap_source, conf_source)?
        };
        let workspace = if cached {
            crate::build::workspace::Workspace {
                root: workspace_root.clone(),
                matrix: builder.effective_matrix(),
            }
        } else {
            builder.prepare(&workspace_root, keymap_source, conf_source)?
        };

        let commands = self.strategy_commands(&workspace.matrix, !cached);
        let runtime = detect_runtime(opts.runtime.as_deref())?;
        let mapping = resolve_user_mapping(
            opts.user_mapping.as_ref(),
            self.profile.build_method.user_mapping.as_ref(),
            self.user_config_mapping.as_ref(),
        );

        info!(
            keyboard = %self.profile.keyboard_name,
            runtime,
            cached,
            "starting containerized build"
        );
        let run = self.run_container(&runtime, &workspace.root, &commands, &mapping, &log_path, &opts.cancel);

        match run {
            Ok(()) => {
                if !opts.no_cache && !cached {
                    self.populate_cache(&workspace.root);
                }
                let (artifacts, missing) =
                    collect_artifacts(&workspace.root, &workspace.matrix, &opts.output_dir)?;
                let _ = std::fs::remove_dir_all(&workspace.root);
                Ok(BuildResult {
                    artifacts,
                    missing,
                    log_path,
                })
            }
            Err(err) => {
                if opts.preserve_on_failure {
                    warn!(workspace = %workspace.root.display(), "preserving failed workspace for inspection");
                } else {
                    let _ = std::fs::remove_dir_all(&workspace.root);
                }
                Err(err)
            }
        }
    }

    /// Restores a cached workspace shell into `root` and overlays the
    /// generated sources. True on a warm start.
    fn restore_from_cache(
        &self,
        builder: &WorkspaceBuilder<'_>,
        root: &Path,
        keymap_source: &str,
        conf_source: &str,
    ) -> Result<bool> {
        let Some(cache) = self.cache else {
            return Ok(false);
        };
        let build = &self.profile.build_method;
        let base_key = TwoTierCache::base_key(&build.repository, &build.revision);
        let config_key = TwoTierCache::config_key(
            &base_key,
            &self.profile.keyboard_name,
            &builder.effective_matrix(),
            &build.image,
        );
        let Some(entry) = cache.lookup(CacheTier::KeyboardConfig, &config_key) else {
            return Ok(false);
        };
        cache.materialize(&entry, root)?;
        builder.overlay_sources(root, keymap_source, conf_source)?;
        debug!(key = config_key, "workspace restored from cache");
        Ok(true)
    }

    /// Stores the built workspace into both tiers. Failures are logged and
    /// swallowed; caching never fails a successful build.
    fn populate_cache(&self, workspace_root: &Path) {
        let Some(cache) = self.cache else { return };
        let build = &self.profile.build_method;
        let builder = WorkspaceBuilder::new(self.profile);

        let base_key = TwoTierCache::base_key(&build.repository, &build.revision);
        let mut base_inputs = BTreeMap::new();
        base_inputs.insert("repository".to_string(), build.repository.clone());
        base_inputs.insert("revision".to_string(), build.revision.clone());
        if let Err(e) = cache.store(CacheTier::BaseDeps, &base_key, workspace_root, base_inputs, BASE_TTL)
        {
            warn!(error = %e, "failed to populate base-deps cache");
        }

        let config_key = TwoTierCache::config_key(
            &base_key,
            &self.profile.keyboard_name,
            &builder.effective_matrix(),
            &build.image,
        );
        let mut config_inputs = BTreeMap::new();
        config_inputs.insert("base".to_string(), base_key);
        config_inputs.insert("keyboard".to_string(), self.profile.keyboard_name.clone());
        config_inputs.insert("image".to_string(), build.image.clone());
        if let Err(e) = cache.store(
            CacheTier::KeyboardConfig,
            &config_key,
            workspace_root,
            config_inputs,
            CONFIG_TTL,
        ) {
            warn!(error = %e, "failed to populate keyboard-config cache");
        }
    }

    /// The shell command sequence for the profile's strategy. `cold` adds
    /// the workspace initialization steps a cache hit skips.
    pub fn strategy_commands(&self, matrix: &[BuildMatrixEntry], cold: bool) -> Vec<String> {
        let build = &self.profile.build_method;
        let mut commands = Vec::new();

        match build.strategy {
            BuildStrategy::ZmkConfig | BuildStrategy::West => {
                if cold {
                    if build.strategy == BuildStrategy::ZmkConfig {
                        commands.push("west init -l config".to_string());
                    }
                    commands.push("west update".to_string());
                    commands.push("west zephyr-export".to_string());
                }
                for entry in matrix {
                    commands.push(west_build_command(entry, matrix.len() > 1));
                }
            }
            BuildStrategy::Cmake => {
                for entry in matrix {
                    let dir = build_dir_name(entry, matrix.len() > 1);
                    commands.push(format!(
                        "cmake -S . -B {dir} {} && cmake --build {dir}",
                        cmake_defines(entry)
                    ));
                }
            }
            BuildStrategy::Make => {
                for entry in matrix {
                    commands.push(format!("make {}", make_defines(entry)));
                }
            }
            BuildStrategy::Ninja => {
                for entry in matrix {
                    let dir = build_dir_name(entry, matrix.len() > 1);
                    commands.push(format!(
                        "cmake -GNinja -S . -B {dir} {} && ninja -C {dir}",
                        cmake_defines(entry)
                    ));
                }
            }
            BuildStrategy::Custom => {
                commands.extend(build.commands.iter().cloned());
            }
        }
        commands
    }

    /// One container invocation running the command sequence; stdout and
    /// stderr stream into the build log from reader threads.
    fn run_container(
        &self,
        runtime: &str,
        workspace: &Path,
        commands: &[String],
        mapping: &ResolvedUserMapping,
        log_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let script = commands.join(" && ");
        let volume = format!("{}:/workspace", workspace.display());

        let mut cmd = Command::new(runtime);
        cmd.arg("run")
            .arg("--rm")
            .arg("-v")
            .arg(&volume)
            .arg("-w")
            .arg("/workspace");
        if mapping.enabled {
            if let (Some(uid), Some(gid)) = (mapping.uid, mapping.gid) {
                cmd.arg("--user").arg(format!("{uid}:{gid}"));
            }
            if let Some(home) = &mapping.home {
                cmd.arg("-e").arg(format!("HOME={home}"));
            }
        }
        cmd.arg(&self.profile.build_method.image)
            .arg("sh")
            .arg("-c")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(script, "container command assembled");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io(format!("spawning {runtime}"), e))?;

        let (tx, rx) = mpsc::channel::<String>();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let tx_err = tx.clone();
        let out_thread = stdout.map(|pipe| {
            thread::spawn(move || {
                for line in BufReader::new(pipe).lines().map_while(std::result::Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
        });
        let err_thread = stderr.map(|pipe| {
            thread::spawn(move || {
                for line in BufReader::new(pipe).lines().map_while(std::result::Result::ok) {
                    if tx_err.send(line).is_err() {
                        break;
                    }
                }
            })
        });

        let mut log_file = std::fs::File::create(log_path)
            .map_err(|e| Error::io(format!("creating {}", log_path.display()), e))?;
        let mut tail: Vec<String> = Vec::new();
        let mut cancelled = false;

        let status = loop {
            while let Ok(line) = rx.try_recv() {
                let _ = writeln!(log_file, "{line}");
                push_tail(&mut tail, line);
            }
            if cancel.is_cancelled() && !cancelled {
                cancelled = true;
                terminate_child(&mut child);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(Duration::from_millis(100)),
                Err(e) => return Err(Error::io("waiting for container", e)),
            }
        };

        // The pipes close when the child exits; join the readers, then
        // drain whatever they still sent.
        if let Some(t) = out_thread {
            let _ = t.join();
        }
        if let Some(t) = err_thread {
            let _ = t.join();
        }
        for line in rx.try_iter() {
            let _ = writeln!(log_file, "{line}");
            push_tail(&mut tail, line);
        }

        if cancelled {
            return Err(Error::Cancelled);
        }
        if status.success() {
            Ok(())
        } else {
            Err(Error::BuildFailed {
                exit_code: status.code().unwrap_or(-1),
                log_tail: tail,
            })
        }
    }
}

fn push_tail(tail: &mut Vec<String>, line: String) {
    tail.push(line);
    if tail.len() > LOG_TAIL_LINES {
        tail.remove(0);
    }
}

/// Terminate politely, then kill after the grace period.
fn terminate_child(child: &mut std::process::Child) {
    let pid = child.id();
    let sent = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .is_ok_and(|s| s.success());
    if sent {
        let deadline = std::time::Instant::now() + TERMINATE_GRACE;
        while std::time::Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
    let _ = child.kill();
}

fn west_build_command(entry: &BuildMatrixEntry, multi: bool) -> String {
    let dir = build_dir_name(entry, multi);
    let mut cmd = format!("west build -s zmk/app -d {dir} -b {}", entry.board);
    if let Some(snippet) = &entry.snippet {
        cmd.push_str(&format!(" -S {snippet}"));
    }
    cmd.push_str(" -- -DZMK_CONFIG=/workspace/config");
    if let Some(shield) = &entry.shield {
        cmd.push_str(&format!(" -DSHIELD={shield}"));
    }
    for arg in &entry.cmake_args {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    cmd
}

fn cmake_defines(entry: &BuildMatrixEntry) -> String {
    let mut defines = format!("-DBOARD={}", entry.board);
    if let Some(shield) = &entry.shield {
        defines.push_str(&format!(" -DSHIELD={shield}"));
    }
    for arg in &entry.cmake_args {
        defines.push(' ');
        defines.push_str(arg);
    }
    defines
}

fn make_defines(entry: &BuildMatrixEntry) -> String {
    let mut defines = format!("BOARD={}", entry.board);
    if let Some(shield) = &entry.shield {
        defines.push_str(&format!(" SHIELD={shield}"));
    }
    defines
}

/// `build_<shield-or-board>` for multi-entry matrices, `build` otherwise.
fn build_dir_name(entry: &BuildMatrixEntry, multi: bool) -> String {
    if multi {
        format!(
            "build_{}",
            entry.shield.as_deref().unwrap_or(&entry.board)
        )
    } else {
        "build".to_string()
    }
}

/// Finds each matrix entry's `zephyr/zmk.uf2` and copies it out under its
/// artifact name. Missing artifacts are warned about, not fatal.
fn collect_artifacts(
    workspace: &Path,
    matrix: &[BuildMatrixEntry],
    output_dir: &Path,
) -> Result<(Vec<PathBuf>, Vec<String>)> {
    let multi = matrix.len() > 1;
    let mut artifacts = Vec::new();
    let mut missing = Vec::new();

    for entry in matrix {
        let name = entry.artifact_base_name();
        let image = workspace
            .join(build_dir_name(entry, multi))
            .join("zephyr")
            .join("zmk.uf2");
        if image.is_file() {
            let dest = output_dir.join(format!("{name}.uf2"));
            std::fs::copy(&image, &dest)
                .map_err(|e| Error::io(format!("copying artifact to {}", dest.display()), e))?;
            artifacts.push(dest);
        } else {
            warn!(artifact = name, "expected artifact not found");
            missing.push(name);
        }
    }
    Ok((artifacts, missing))
}

fn tempfile_dir(keyboard: &str) -> Result<PathBuf> {
    let base = std::env::temp_dir().join(format!(
        "glovebox-build-{keyboard}-{}",
        std::process::id()
    ));
    if base.exists() {
        std::fs::remove_dir_all(&base)
            .map_err(|e| Error::io(format!("clearing {}", base.display()), e))?;
    }
    std::fs::create_dir_all(&base)
        .map_err(|e| Error::io(format!("creating {}", base.display()), e))?;
    Ok(base)
}
