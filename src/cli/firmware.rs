//! `glovebox firmware` commands.

use crate::build::{BuildDriver, BuildOptions};
use crate::cancel::CancellationToken;
use crate::cli::common::CliContext;
use crate::error::{Error, FlashStage, Result};
use crate::flash::{
    flash, mounter_for, platform_probe, spawn_monitor, FlashOptions, Query,
    DEFAULT_POLL_INTERVAL,
};
use crate::layout::FirmwareBuildRecord;
use clap::{Args, Subcommand};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

/// Firmware build and flash commands.
#[derive(Debug, Subcommand)]
pub enum FirmwareCommand {
    /// Compile firmware images from a layout or pre-generated sources
    Compile(FirmwareCompileArgs),
    /// Flash a firmware image to matching devices
    Flash(FlashArgs),
    /// List block devices matching a query
    Devices(DevicesArgs),
}

impl FirmwareCommand {
    /// Dispatches to the selected subcommand.
    pub fn execute(&self) -> Result<()> {
        let ctx = CliContext::new()?;
        match self {
            Self::Compile(args) => args.execute(&ctx),
            Self::Flash(args) => args.execute(&ctx),
            Self::Devices(args) => args.execute(&ctx),
        }
    }
}

/// Compile a layout (or generated sources) into firmware images.
#[derive(Debug, Args)]
pub struct FirmwareCompileArgs {
    /// Layout JSON file; generates sources before building
    #[arg(long, value_name = "FILE", conflicts_with_all = ["keymap", "conf"])]
    pub layout: Option<PathBuf>,

    /// Pre-generated keymap source
    #[arg(long, value_name = "FILE", requires = "conf")]
    pub keymap: Option<PathBuf>,

    /// Pre-generated conf source
    #[arg(long, value_name = "FILE", requires = "keymap")]
    pub conf: Option<PathBuf>,

    /// Profile spec
    #[arg(short, long, value_name = "SPEC")]
    pub profile: Option<String>,

    /// Output directory for artifacts and the build log
    #[arg(short, long, value_name = "DIR", default_value = "firmware")]
    pub out_dir: PathBuf,

    /// Bypass the build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Keep the workspace when the build fails
    #[arg(long)]
    pub preserve_on_failure: bool,

    /// Container runtime override
    #[arg(long, value_name = "BINARY")]
    pub runtime: Option<String>,
}

impl FirmwareCompileArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let (keymap_source, conf_source, layout_input) = self.sources(ctx)?;
        let profile = match &layout_input {
            Some((layout, _)) => ctx.profile_for_layout(self.profile.as_deref(), layout)?,
            None => ctx.profile(self.profile.as_deref())?,
        };

        let cache = ctx.cache()?;
        let driver = BuildDriver::new(
            &profile,
            Some(&cache),
            ctx.config.user_mapping.clone(),
        );
        let opts = BuildOptions {
            output_dir: self.out_dir.clone(),
            no_cache: self.no_cache,
            preserve_on_failure: self.preserve_on_failure,
            runtime: self
                .runtime
                .clone()
                .or_else(|| ctx.config.effective_runtime()),
            user_mapping: None,
            cancel: CancellationToken::new(),
        };

        let result = driver.compile(&keymap_source, &conf_source, &opts)?;
        for artifact in &result.artifacts {
            println!("Built {}", artifact.display());
        }
        for missing in &result.missing {
            eprintln!("warning: expected artifact '{missing}' was not produced");
        }
        println!("Build log: {}", result.log_path.display());

        // Stamp the build record back into the layout document.
        if let (Some((mut layout, path)), Some(first)) =
            (layout_input, result.artifacts.first())
        {
            layout.last_firmware_build = Some(FirmwareBuildRecord {
                date: chrono::Utc::now().to_rfc3339(),
                profile: profile
                    .firmware_version
                    .as_ref()
                    .map_or_else(
                        || profile.keyboard_name.clone(),
                        |v| format!("{}/{v}", profile.keyboard_name),
                    ),
                firmware_path: first.display().to_string(),
                firmware_hash: file_sha256(first)?,
                build_id: uuid::Uuid::new_v4().to_string(),
            });
            layout.save(&path)?;
        }
        Ok(())
    }

    fn sources(
        &self,
        ctx: &CliContext,
    ) -> Result<(String, String, Option<(crate::layout::LayoutData, PathBuf)>)> {
        if let (Some(keymap), Some(conf)) = (&self.keymap, &self.conf) {
            let keymap_source = std::fs::read_to_string(keymap)
                .map_err(|e| Error::io(format!("reading {}", keymap.display()), e))?;
            let conf_source = std::fs::read_to_string(conf)
                .map_err(|e| Error::io(format!("reading {}", conf.display()), e))?;
            return Ok((keymap_source, conf_source, None));
        }

        let (layout, path) = ctx.load_layout(self.layout.as_deref())?;
        let profile = ctx.profile_for_layout(self.profile.as_deref(), &layout)?;
        let sources = crate::dtsi::generate(&profile, &layout)?;
        for warning in &sources.warnings {
            eprintln!("warning: {warning}");
        }
        Ok((sources.keymap, sources.conf, Some((layout, path))))
    }
}

fn file_sha256(path: &std::path::Path) -> Result<String> {
    let bytes =
        std::fs::read(path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Flash an image to one or more matching devices.
#[derive(Debug, Args)]
pub struct FlashArgs {
    /// Firmware image (.uf2)
    #[arg(value_name = "FIRMWARE")]
    pub firmware: PathBuf,

    /// Device query (defaults to the profile's flash query)
    #[arg(short, long, value_name = "QUERY")]
    pub query: Option<String>,

    /// Profile spec
    #[arg(short, long, value_name = "SPEC")]
    pub profile: Option<String>,

    /// How many devices to flash
    #[arg(short, long, default_value_t = 1)]
    pub count: usize,

    /// Overall timeout in seconds
    #[arg(short, long, default_value_t = 60)]
    pub timeout: u64,

    /// Allow flashing the same device more than once
    #[arg(long)]
    pub no_track: bool,

    /// Per-device retry budget
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
}

impl FlashArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let profile = ctx.profile(self.profile.as_deref())?;
        let query_text = self
            .query
            .clone()
            .unwrap_or_else(|| profile.flash_method.device_query.clone());
        let query = Query::parse(&query_text)?;

        if self.timeout == 0 {
            return Err(Error::Usage("timeout must be greater than zero".into()));
        }

        let cancel = CancellationToken::new();
        let probe = platform_probe()?;
        let (events, monitor) = spawn_monitor(probe, DEFAULT_POLL_INTERVAL, cancel.clone());
        let mounter = mounter_for(&profile);

        let opts = FlashOptions {
            count: self.count,
            timeout: Duration::from_secs(self.timeout),
            track: !self.no_track,
            retries: self.retries,
        };
        let results = flash(mounter, &events, &query, &self.firmware, &opts, &cancel);
        cancel.cancel();
        let _ = monitor.join();
        let results = results?;

        let mut successes = 0;
        for result in &results {
            if result.success {
                successes += 1;
                println!(
                    "Flashed {} ({:.1}s) via {}",
                    result.device.path,
                    result.elapsed.as_secs_f32(),
                    result.mount_points_used.join(", ")
                );
            } else {
                eprintln!(
                    "Failed {}: {}",
                    result.device.path,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        if successes < self.count {
            return Err(Error::Flash {
                stage: FlashStage::Wait,
                device: query_text,
                reason: format!("flashed {successes} of {} device(s)", self.count),
            });
        }
        Ok(())
    }
}

/// List matching block devices.
#[derive(Debug, Args)]
pub struct DevicesArgs {
    /// Device query (empty lists everything)
    #[arg(value_name = "QUERY", default_value = "")]
    pub query: String,
}

impl DevicesArgs {
    fn execute(&self, _ctx: &CliContext) -> Result<()> {
        let query = Query::parse(&self.query)?;
        let probe = platform_probe()?;
        let devices = probe.enumerate()?;

        let mut shown = 0;
        for device in devices.iter().filter(|d| query.matches(d)) {
            shown += 1;
            println!(
                "{:<14} {:<12} {:<20} removable={} mounted={} {}",
                device.path,
                device.vendor.as_deref().unwrap_or("-"),
                device.serial.as_deref().unwrap_or("-"),
                device.removable,
                device.mounted,
                device.mount_points.join(",")
            );
        }
        if shown == 0 {
            println!("No matching devices.");
        }
        Ok(())
    }
}
