//! `glovebox cache` commands.

use crate::build::CacheTier;
use crate::cli::common::CliContext;
use crate::error::Result;
use clap::{Args, Subcommand};
use std::path::Path;

/// Cache administration commands.
#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Show per-tier entry counts, sizes, and counters
    Stats(StatsArgs),
    /// Remove cache entries
    Clear(ClearArgs),
}

impl CacheCommand {
    /// Dispatches to the selected subcommand.
    pub fn execute(&self) -> Result<()> {
        let ctx = CliContext::new()?;
        match self {
            Self::Stats(args) => args.execute(&ctx),
            Self::Clear(args) => args.execute(&ctx),
        }
    }
}

/// Print cache statistics.
#[derive(Debug, Args)]
pub struct StatsArgs {}

impl StatsArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let cache = ctx.cache()?;
        println!("Cache root: {}", cache.root().display());

        for (label, tier) in [
            ("base deps", CacheTier::BaseDeps),
            ("keyboard config", CacheTier::KeyboardConfig),
        ] {
            let entries = cache.entries(tier)?;
            println!("\n{label}: {} entr{}", entries.len(), plural_y(entries.len()));
            for meta in entries {
                println!(
                    "  {}  created {}  last used {}",
                    meta.key,
                    meta.created_at.format("%Y-%m-%d %H:%M"),
                    meta.last_used_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        let stats = cache.stats();
        println!(
            "\nhits: {}  misses: {}  evictions: {}  errors: {}",
            stats.hits, stats.misses, stats.evictions, stats.errors
        );
        let size = dir_size(cache.root());
        println!("total size: {:.1} MiB", size as f64 / (1024.0 * 1024.0));
        Ok(())
    }
}

/// Remove entries from one or both tiers.
#[derive(Debug, Args)]
pub struct ClearArgs {
    /// Only clear the base dependency tier
    #[arg(long, conflicts_with = "config")]
    pub base: bool,

    /// Only clear the keyboard config tier
    #[arg(long)]
    pub config: bool,
}

impl ClearArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let cache = ctx.cache()?;
        let tier = if self.base {
            Some(CacheTier::BaseDeps)
        } else if self.config {
            Some(CacheTier::KeyboardConfig)
        } else {
            None
        };
        let removed = cache.clear(tier)?;
        println!("Removed {removed} cache entr{}.", plural_y(removed));
        Ok(())
    }
}

fn plural_y(count: usize) -> &'static str {
    if count == 1 {
        "y"
    } else {
        "ies"
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            total += dir_size(&entry_path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}
