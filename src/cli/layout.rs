//! `glovebox layout` commands.

use crate::cli::common::CliContext;
use crate::config::UserConfig;
use crate::error::{Error, Result};
use crate::layout::edit::{EditSession, LayerSelector};
use crate::layout::{compose, decompose, diff, patch, upgrade, ConflictPolicy, LayoutData, LayoutPatch};
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Layout manipulation commands.
#[derive(Debug, Subcommand)]
pub enum LayoutCommand {
    /// Generate .keymap and .conf sources from a layout
    Compile(CompileArgs),
    /// Run all invariants and behavior checks
    Validate(ValidateArgs),
    /// Render layers textually
    Show(ShowArgs),
    /// Split a layout into per-layer component files
    Decompose(DecomposeArgs),
    /// Reassemble a decomposed layout
    Compose(ComposeArgs),
    /// Apply batched field and layer mutations
    Edit(EditArgs),
    /// Compute a structural patch between two layouts
    Diff(DiffArgs),
    /// Apply a structural patch
    Patch(PatchArgs),
    /// Re-derive a customized layout from a new master
    Upgrade(UpgradeArgs),
}

impl LayoutCommand {
    /// Dispatches to the selected subcommand.
    pub fn execute(&self) -> Result<()> {
        let ctx = CliContext::new()?;
        match self {
            Self::Compile(args) => args.execute(&ctx),
            Self::Validate(args) => args.execute(&ctx),
            Self::Show(args) => args.execute(&ctx),
            Self::Decompose(args) => args.execute(&ctx),
            Self::Compose(args) => args.execute(&ctx),
            Self::Edit(args) => args.execute(&ctx),
            Self::Diff(args) => args.execute(),
            Self::Patch(args) => args.execute(),
            Self::Upgrade(args) => args.execute(&ctx),
        }
    }
}

/// Generate keymap/conf sources from a layout.
#[derive(Debug, Args)]
pub struct CompileArgs {
    /// Layout JSON file (defaults to the configured layout)
    #[arg(value_name = "LAYOUT")]
    pub layout: Option<PathBuf>,

    /// Profile spec, e.g. glove80/v25.05
    #[arg(short, long, value_name = "SPEC")]
    pub profile: Option<String>,

    /// Output directory for the generated sources
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub out_dir: PathBuf,
}

impl CompileArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let (layout, _) = ctx.load_layout(self.layout.as_deref())?;
        let profile = ctx.profile_for_layout(self.profile.as_deref(), &layout)?;
        let sources = crate::dtsi::generate(&profile, &layout)?;

        std::fs::create_dir_all(&self.out_dir)
            .map_err(|e| Error::io(format!("creating {}", self.out_dir.display()), e))?;
        let base = profile.keyboard_name.clone();
        let keymap_path = self.out_dir.join(format!("{base}.keymap"));
        let conf_path = self.out_dir.join(format!("{base}.conf"));
        std::fs::write(&keymap_path, &sources.keymap)
            .map_err(|e| Error::io(format!("writing {}", keymap_path.display()), e))?;
        std::fs::write(&conf_path, &sources.conf)
            .map_err(|e| Error::io(format!("writing {}", conf_path.display()), e))?;

        for warning in &sources.warnings {
            eprintln!("warning: {warning}");
        }
        println!("Generated {}", keymap_path.display());
        println!("Generated {}", conf_path.display());
        Ok(())
    }
}

/// Validate a layout against its profile.
#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Layout JSON file
    #[arg(value_name = "LAYOUT")]
    pub layout: Option<PathBuf>,

    /// Profile spec
    #[arg(short, long, value_name = "SPEC")]
    pub profile: Option<String>,

    /// Treat warnings as errors
    #[arg(long)]
    pub strict: bool,
}

impl ValidateArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let (layout, path) = ctx.load_layout(self.layout.as_deref())?;
        let profile = ctx.profile_for_layout(self.profile.as_deref(), &layout)?;
        let sources = crate::dtsi::generate(&profile, &layout)?;

        for warning in &sources.warnings {
            println!("warning: {warning}");
        }
        if self.strict && !sources.warnings.is_empty() {
            return Err(Error::Validation(format!(
                "{} warning(s) with --strict",
                sources.warnings.len()
            )));
        }
        println!("{} is valid for {}", path.display(), profile.keyboard_name);
        Ok(())
    }
}

/// Print layers as aligned grids.
#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Layout JSON file
    #[arg(value_name = "LAYOUT")]
    pub layout: Option<PathBuf>,

    /// Profile spec
    #[arg(short, long, value_name = "SPEC")]
    pub profile: Option<String>,

    /// Show only this layer (name or index)
    #[arg(long, value_name = "LAYER")]
    pub layer: Option<String>,
}

impl ShowArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let (mut layout, _) = ctx.load_layout(self.layout.as_deref())?;
        let profile = ctx.profile_for_layout(self.profile.as_deref(), &layout)?;

        if let Some(selector) = &self.layer {
            let index = match selector.parse::<usize>() {
                Ok(index) if index < layout.layer_names.len() => index,
                Ok(index) => return Err(Error::UnknownLayer(index.to_string())),
                Err(_) => layout.layer_index(selector)?,
            };
            layout.layer_names = vec![layout.layer_names[index].clone()];
            layout.layers = vec![layout.layers[index].clone()];
        }

        print!("{}", crate::dtsi::render_layers(&profile, &layout)?);
        Ok(())
    }
}

/// Split a layout into metadata + per-layer files.
#[derive(Debug, Args)]
pub struct DecomposeArgs {
    /// Layout JSON file
    #[arg(value_name = "LAYOUT")]
    pub layout: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    pub out_dir: PathBuf,
}

impl DecomposeArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let (layout, _) = ctx.load_layout(self.layout.as_deref())?;
        decompose(&layout, &self.out_dir)?;
        println!(
            "Decomposed {} layer(s) into {}",
            layout.layer_names.len(),
            self.out_dir.display()
        );
        Ok(())
    }
}

/// Reassemble a decomposed layout directory.
#[derive(Debug, Args)]
pub struct ComposeArgs {
    /// Decomposed layout directory
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    /// Output layout file
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,
}

impl ComposeArgs {
    fn execute(&self, _ctx: &CliContext) -> Result<()> {
        let layout = compose(&self.dir)?;
        layout.save(&self.output)?;
        println!("Composed {}", self.output.display());
        Ok(())
    }
}

/// Batched, transactional mutations.
#[derive(Debug, Args)]
pub struct EditArgs {
    /// Layout JSON file
    #[arg(value_name = "LAYOUT")]
    pub layout: Option<PathBuf>,

    /// Set a field: path=json (repeatable)
    #[arg(long = "set", value_name = "PATH=VALUE")]
    pub sets: Vec<String>,

    /// Remove a field by path (repeatable)
    #[arg(long = "unset", value_name = "PATH")]
    pub unsets: Vec<String>,

    /// Deep-merge JSON into a path: path=json (repeatable)
    #[arg(long = "merge", value_name = "PATH=VALUE")]
    pub merges: Vec<String>,

    /// Append JSON to an array: path=json (repeatable)
    #[arg(long = "append", value_name = "PATH=VALUE")]
    pub appends: Vec<String>,

    /// Add a layer, optionally at a position: name or name@pos
    #[arg(long = "add-layer", value_name = "NAME[@POS]")]
    pub add_layers: Vec<String>,

    /// Remove a layer by name or index
    #[arg(long = "remove-layer", value_name = "LAYER")]
    pub remove_layers: Vec<String>,

    /// Move a layer: name@pos
    #[arg(long = "move-layer", value_name = "NAME@POS")]
    pub move_layers: Vec<String>,

    /// Copy a layer: src:dst
    #[arg(long = "copy-layer", value_name = "SRC:DST")]
    pub copy_layers: Vec<String>,

    /// Write the result here instead of in place
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl EditArgs {
    fn execute(&self, ctx: &CliContext) -> Result<()> {
        let (layout, path) = ctx.load_layout(self.layout.as_deref())?;
        let mut session = EditSession::new(&layout)?;

        for spec in &self.sets {
            let (field, value) = split_assignment(spec)?;
            session.set_field(field, parse_json_value(value))?;
        }
        for field in &self.unsets {
            session.unset(field)?;
        }
        for spec in &self.merges {
            let (field, value) = split_assignment(spec)?;
            session.merge(field, parse_json_value(value))?;
        }
        for spec in &self.appends {
            let (field, value) = split_assignment(spec)?;
            session.append(field, parse_json_value(value))?;
        }
        for spec in &self.add_layers {
            let (name, position) = split_position(spec)?;
            session.add_layer(name, position)?;
        }
        for selector in &self.remove_layers {
            session.remove_layer(&parse_selector(selector))?;
        }
        for spec in &self.move_layers {
            let (name, position) = split_position(spec)?;
            let position = position.ok_or_else(|| {
                Error::Usage(format!("--move-layer needs name@pos, got '{spec}'"))
            })?;
            session.move_layer(&parse_selector(name), position)?;
        }
        for spec in &self.copy_layers {
            let (src, dst) = spec.split_once(':').ok_or_else(|| {
                Error::Usage(format!("--copy-layer needs src:dst, got '{spec}'"))
            })?;
            session.copy_layer(&parse_selector(src), dst)?;
        }

        let edited = session.commit()?;
        let target = self.output.clone().unwrap_or(path);
        edited.save(&target)?;
        println!("Wrote {}", target.display());
        Ok(())
    }
}

/// Compute a structural patch.
#[derive(Debug, Args)]
pub struct DiffArgs {
    /// Source layout
    #[arg(value_name = "FROM")]
    pub from: PathBuf,

    /// Target layout
    #[arg(value_name = "TO")]
    pub to: PathBuf,

    /// Write the patch here (stdout otherwise)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl DiffArgs {
    fn execute(&self) -> Result<()> {
        let from = LayoutData::load(&self.from)?;
        let to = LayoutData::load(&self.to)?;
        let result = diff(&from, &to)?;

        let mut text = serde_json::to_string_pretty(&result).map_err(|e| Error::Json {
            context: "serializing patch".into(),
            source: e,
        })?;
        text.push('\n');
        match &self.output {
            Some(path) => {
                std::fs::write(path, text)
                    .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
                println!("Wrote {}", path.display());
            }
            None => print!("{text}"),
        }
        Ok(())
    }
}

/// Apply a structural patch.
#[derive(Debug, Args)]
pub struct PatchArgs {
    /// Layout to patch
    #[arg(value_name = "LAYOUT")]
    pub layout: PathBuf,

    /// Patch file produced by `layout diff`
    #[arg(value_name = "PATCH")]
    pub patch: PathBuf,

    /// Conflict policy
    #[arg(long, value_enum, default_value = "conflict-fail")]
    pub policy: PolicyArg,

    /// Write the result here instead of in place
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// CLI face of [`ConflictPolicy`].
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum PolicyArg {
    /// Keep the document's value on conflict.
    PreferSource,
    /// Apply the patch value on conflict.
    PreferPatch,
    /// Fail on the first conflict.
    ConflictFail,
}

impl From<PolicyArg> for ConflictPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::PreferSource => Self::PreferSource,
            PolicyArg::PreferPatch => Self::PreferPatch,
            PolicyArg::ConflictFail => Self::ConflictFail,
        }
    }
}

impl PatchArgs {
    fn execute(&self) -> Result<()> {
        let layout = LayoutData::load(&self.layout)?;
        let text = std::fs::read_to_string(&self.patch)
            .map_err(|e| Error::io(format!("reading {}", self.patch.display()), e))?;
        let parsed: LayoutPatch = serde_json::from_str(&text).map_err(|e| Error::Json {
            context: format!("parsing {}", self.patch.display()),
            source: e,
        })?;

        let outcome = patch(&layout, &parsed, self.policy.into())?;
        for conflict in &outcome.conflicts {
            eprintln!("conflict: {conflict}");
        }
        let target = self.output.clone().unwrap_or_else(|| self.layout.clone());
        outcome.layout.save(&target)?;
        println!("Wrote {}", target.display());
        Ok(())
    }
}

/// Upgrade a derived layout to a new master.
#[derive(Debug, Args)]
pub struct UpgradeArgs {
    /// The customized layout
    #[arg(value_name = "LAYOUT")]
    pub layout: PathBuf,

    /// The new master layout
    #[arg(long, value_name = "FILE")]
    pub to: PathBuf,

    /// The old master (defaults to the stored master for the layout's
    /// base_version)
    #[arg(long, value_name = "FILE")]
    pub from: Option<PathBuf>,

    /// Write the result here instead of in place
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl UpgradeArgs {
    fn execute(&self, _ctx: &CliContext) -> Result<()> {
        let custom = LayoutData::load(&self.layout)?;
        let new_master = LayoutData::load(&self.to)?;

        let old_master_path = match &self.from {
            Some(path) => path.clone(),
            None => {
                let base_version = custom.base_version.clone().ok_or_else(|| {
                    Error::Config(
                        "layout has no base_version; pass --from <old master>".into(),
                    )
                })?;
                UserConfig::masters_dir(&custom.keyboard)?.join(format!("{base_version}.json"))
            }
        };
        let old_master = LayoutData::load(&old_master_path)?;

        let outcome = upgrade(&custom, &old_master, &new_master)?;
        for conflict in &outcome.conflicts {
            eprintln!("kept local change: {conflict}");
        }
        let target = self.output.clone().unwrap_or_else(|| self.layout.clone());
        outcome.layout.save(&target)?;
        println!("Upgraded {}", target.display());
        Ok(())
    }
}

fn split_assignment(spec: &str) -> Result<(&str, &str)> {
    spec.split_once('=')
        .ok_or_else(|| Error::Usage(format!("expected path=value, got '{spec}'")))
}

/// Values parse as JSON when they look like it, else as plain strings, so
/// `--set title=Hello` works without quoting gymnastics.
fn parse_json_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn split_position(spec: &str) -> Result<(&str, Option<usize>)> {
    match spec.rsplit_once('@') {
        Some((name, position)) => {
            let position = position.parse().map_err(|_| {
                Error::Usage(format!("position in '{spec}' must be a number"))
            })?;
            Ok((name, Some(position)))
        }
        None => Ok((spec, None)),
    }
}

fn parse_selector(raw: &str) -> LayerSelector {
    raw.parse::<usize>()
        .map_or_else(|_| LayerSelector::Name(raw.to_string()), LayerSelector::Index)
}
