//! Shared plumbing for CLI commands.

use crate::build::TwoTierCache;
use crate::config::{parse_profile_spec, UserConfig};
use crate::error::{Error, Result};
use crate::layout::LayoutData;
use crate::profile::{KeyboardProfile, ProfileResolver};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a command needs to run: preferences and a profile resolver
/// over the effective search paths.
pub struct CliContext {
    /// The loaded preferences store.
    pub config: UserConfig,
    /// Keyboard profile resolver.
    pub resolver: ProfileResolver,
}

impl CliContext {
    /// Loads preferences and builds the resolver.
    pub fn new() -> Result<Self> {
        let config = UserConfig::load()?;
        let resolver = ProfileResolver::new(config.keyboard_search_paths());
        Ok(Self { config, resolver })
    }

    /// Resolves a profile from an explicit spec, falling back to the
    /// configured default.
    pub fn profile(&self, spec: Option<&str>) -> Result<Arc<KeyboardProfile>> {
        let spec = spec
            .map(ToString::to_string)
            .or_else(|| self.config.effective_profile())
            .ok_or_else(|| {
                Error::Config(
                    "no profile given; pass --profile or set default_profile".into(),
                )
            })?;
        let (keyboard, firmware) = parse_profile_spec(&spec);
        self.resolver.load(&keyboard, firmware.as_deref())
    }

    /// Loads a layout from an explicit path or the configured default.
    pub fn load_layout(&self, path: Option<&Path>) -> Result<(LayoutData, PathBuf)> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| self.config.effective_layout())
            .ok_or_else(|| {
                Error::Config(
                    "no layout file given; pass one or set default_layout".into(),
                )
            })?;
        let layout = LayoutData::load(&path)?;
        Ok((layout, path))
    }

    /// The profile a layout implies (its `keyboard` field), unless an
    /// explicit spec overrides it.
    pub fn profile_for_layout(
        &self,
        spec: Option<&str>,
        layout: &LayoutData,
    ) -> Result<Arc<KeyboardProfile>> {
        if spec.is_some() || layout.keyboard.is_empty() {
            return self.profile(spec);
        }
        match self.config.effective_profile() {
            // An explicitly configured default still wins over the
            // layout's own keyboard when it names the same keyboard.
            Some(configured) => {
                let (keyboard, firmware) = parse_profile_spec(&configured);
                if keyboard == layout.keyboard {
                    self.resolver.load(&keyboard, firmware.as_deref())
                } else {
                    self.resolver.load(&layout.keyboard, None)
                }
            }
            None => self.resolver.load(&layout.keyboard, None),
        }
    }

    /// Opens the two-tier cache at the effective root.
    pub fn cache(&self) -> Result<TwoTierCache> {
        TwoTierCache::new(self.config.effective_cache_root())
    }
}

/// Prints an error with its cause chain: what was being done, then the
/// contextual detail each layer carries.
pub fn report_error(error: &Error) {
    eprintln!("error: {error}");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = std::error::Error::source(cause);
    }
}
