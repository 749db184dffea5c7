//! `glovebox status`: end-to-end environment probe.

use crate::build::driver::detect_runtime;
use crate::build::CacheTier;
use crate::cli::common::CliContext;
use crate::config::UserConfig;
use crate::error::Result;
use crate::flash::platform_probe;
use clap::Args;

/// Probe the environment every pipeline stage depends on.
#[derive(Debug, Args)]
pub struct StatusArgs {}

impl StatusArgs {
    /// Runs every probe, reporting pass/fail per line. Always exits zero;
    /// the output is the diagnosis.
    pub fn execute(&self) -> Result<()> {
        let ctx = CliContext::new()?;

        match UserConfig::config_dir() {
            Ok(dir) => {
                let exists = dir.is_dir();
                line(exists, &format!("config dir: {}", dir.display()));
            }
            Err(e) => line(false, &format!("config dir: {e}")),
        }

        let profile = ctx.config.effective_profile();
        line(
            profile.is_some(),
            &profile.map_or_else(
                || "default profile: unset".to_string(),
                |p| format!("default profile: {p}"),
            ),
        );

        let keyboards = ctx.resolver.list_keyboards();
        line(
            !keyboards.is_empty(),
            &format!("keyboards discovered: {}", keyboards.len()),
        );

        match detect_runtime(ctx.config.effective_runtime().as_deref()) {
            Ok(runtime) => line(true, &format!("container runtime: {runtime}")),
            Err(e) => line(false, &format!("container runtime: {e}")),
        }

        match ctx.cache() {
            Ok(cache) => {
                let base = cache.entries(CacheTier::BaseDeps).map(|e| e.len()).unwrap_or(0);
                let config = cache
                    .entries(CacheTier::KeyboardConfig)
                    .map(|e| e.len())
                    .unwrap_or(0);
                line(
                    true,
                    &format!(
                        "cache at {} ({base} base, {config} keyboard entries)",
                        cache.root().display()
                    ),
                );
            }
            Err(e) => line(false, &format!("cache: {e}")),
        }

        match platform_probe() {
            Ok(probe) => match probe.enumerate() {
                Ok(devices) => line(
                    true,
                    &format!("device detection: {} block device(s) visible", devices.len()),
                ),
                Err(e) => line(false, &format!("device detection: {e}")),
            },
            Err(e) => line(false, &format!("device detection: {e}")),
        }

        Ok(())
    }
}

fn line(ok: bool, message: &str) {
    let marker = if ok { "ok " } else { "!! " };
    println!("{marker}{message}");
}
