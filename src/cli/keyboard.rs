//! `glovebox keyboard` commands: profile discovery.

use crate::cli::common::CliContext;
use crate::error::Result;
use clap::{Args, Subcommand};

/// Keyboard profile discovery commands.
#[derive(Debug, Subcommand)]
pub enum KeyboardCommand {
    /// List discoverable keyboards
    List(ListArgs),
    /// Show a keyboard's resolved profile
    Show(ShowArgs),
    /// List a keyboard's firmware versions
    Firmwares(FirmwaresArgs),
}

impl KeyboardCommand {
    /// Dispatches to the selected subcommand.
    pub fn execute(&self) -> Result<()> {
        let ctx = CliContext::new()?;
        match self {
            Self::List(args) => args.execute(&ctx),
            Self::Show(args) => args.execute(&ctx),
            Self::Firmwares(args) => args.execute(&ctx),
        }
    }
}

/// List keyboards across all search paths.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Print search paths too
    #[arg(long)]
    pub verbose: bool,
}

impl ListArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        if self.verbose {
            for path in ctx.resolver.search_paths() {
                println!("# search path: {}", path.display());
            }
        }
        let names = ctx.resolver.list_keyboards();
        if names.is_empty() {
            println!("No keyboards found.");
        }
        for name in names {
            println!("{name}");
        }
        Ok(())
    }
}

/// Show a resolved profile.
#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Keyboard name, optionally with firmware: name[/firmware]
    #[arg(value_name = "KEYBOARD")]
    pub keyboard: String,

    /// Output as JSON instead of YAML
    #[arg(long)]
    pub json: bool,
}

impl ShowArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let (keyboard, firmware) = crate::config::parse_profile_spec(&self.keyboard);
        let profile = ctx.resolver.load(&keyboard, firmware.as_deref())?;
        let text = if self.json {
            serde_json::to_string_pretty(&*profile).map_err(|e| crate::error::Error::Json {
                context: "serializing profile".into(),
                source: e,
            })?
        } else {
            serde_yml::to_string(&*profile).map_err(|e| crate::error::Error::Yaml {
                context: "serializing profile".into(),
                source: e,
            })?
        };
        println!("{text}");
        Ok(())
    }
}

/// List firmware versions of a keyboard.
#[derive(Debug, Args)]
pub struct FirmwaresArgs {
    /// Keyboard name
    #[arg(value_name = "KEYBOARD")]
    pub keyboard: String,
}

impl FirmwaresArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let firmwares = ctx.resolver.list_firmwares(&self.keyboard)?;
        if firmwares.is_empty() {
            println!("{} has no firmware variants (keyboard-only).", self.keyboard);
        }
        for version in firmwares {
            println!("{version}");
        }
        Ok(())
    }
}
