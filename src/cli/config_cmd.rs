//! `glovebox config` commands: inspect and modify the preferences store.

use crate::cli::common::CliContext;
use crate::config::UserConfig;
use crate::error::{Error, Result};
use clap::{Args, Subcommand};

/// Preferences store commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// List all preferences
    List(ListArgs),
    /// Show one preference
    Show(ShowArgs),
    /// Set preferences
    Edit(EditArgs),
}

impl ConfigCommand {
    /// Dispatches to the selected subcommand.
    pub fn execute(&self) -> Result<()> {
        let ctx = CliContext::new()?;
        match self {
            Self::List(args) => args.execute(&ctx),
            Self::Show(args) => args.execute(&ctx),
            Self::Edit(args) => args.execute(&ctx),
        }
    }
}

/// Print the whole store.
#[derive(Debug, Args)]
pub struct ListArgs {}

impl ListArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let text = serde_yml::to_string(&ctx.config).map_err(|e| Error::Yaml {
            context: "serializing preferences".into(),
            source: e,
        })?;
        if text.trim() == "{}" {
            println!("No preferences set.");
        } else {
            print!("{text}");
        }
        println!("# store: {}", UserConfig::config_dir()?.join("config.yaml").display());
        Ok(())
    }
}

/// Print one preference.
#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Preference name, e.g. default_profile
    #[arg(value_name = "KEY")]
    pub key: String,
}

impl ShowArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let value = ctx.config.get_field(&self.key)?;
        let text = serde_yml::to_string(&value).map_err(|e| Error::Yaml {
            context: "serializing preference".into(),
            source: e,
        })?;
        print!("{text}");
        Ok(())
    }
}

/// Set one or more preferences.
#[derive(Debug, Args)]
pub struct EditArgs {
    /// key=value pairs; values parse as YAML
    #[arg(value_name = "KEY=VALUE", required = true)]
    pub assignments: Vec<String>,
}

impl EditArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let mut config = ctx.config.clone();
        for assignment in &self.assignments {
            let (key, value) = assignment.split_once('=').ok_or_else(|| {
                Error::Usage(format!("expected key=value, got '{assignment}'"))
            })?;
            config.set_field(key, value)?;
        }
        config.save()?;
        println!("Saved preferences.");
        Ok(())
    }
}
