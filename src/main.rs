//! Glovebox CLI entry point.

use clap::{Parser, Subcommand};
use glovebox::cli::{cache_cmd, common, config_cmd, firmware, keyboard, layout, status};
use tracing_subscriber::EnvFilter;

/// Manage ZMK keyboard firmware: layouts, builds, and flashing.
#[derive(Debug, Parser)]
#[command(name = "glovebox", version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Work with layout documents
    #[command(subcommand)]
    Layout(layout::LayoutCommand),
    /// Build and flash firmware
    #[command(subcommand)]
    Firmware(firmware::FirmwareCommand),
    /// Inspect or modify preferences
    #[command(subcommand)]
    Config(config_cmd::ConfigCommand),
    /// Discover keyboard profiles
    #[command(subcommand)]
    Keyboard(keyboard::KeyboardCommand),
    /// Administer the build cache
    #[command(subcommand)]
    Cache(cache_cmd::CacheCommand),
    /// Probe the environment end to end
    Status(status::StatusArgs),
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match &cli.command {
        Commands::Layout(cmd) => cmd.execute(),
        Commands::Firmware(cmd) => cmd.execute(),
        Commands::Config(cmd) => cmd.execute(),
        Commands::Keyboard(cmd) => cmd.execute(),
        Commands::Cache(cmd) => cmd.execute(),
        Commands::Status(cmd) => cmd.execute(),
    };

    if let Err(error) = result {
        common::report_error(&error);
        std::process::exit(error.exit_code());
    }
}

fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("glovebox=warn")),
        1 => EnvFilter::new("glovebox=info"),
        _ => EnvFilter::new("glovebox=debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
