//! Glovebox: a toolchain for managing ZMK keyboard firmware.
//!
//! The pipeline runs layout JSON through devicetree generation, a
//! containerized ZMK build, and USB flashing:
//!
//! ```text
//! layout.json -> .keymap/.conf -> workspace -> firmware.uf2 -> keyboard
//! ```
//!
//! Subsystems, leaves first: [`profile`] resolves keyboard definitions,
//! [`behavior`] knows the legal behavior codes, [`layout`] is the typed
//! document model with decompose/compose and diff/patch, [`dtsi`] generates
//! the firmware sources, [`build`] owns workspaces, the two-tier cache, and
//! the container driver, and [`flash`] detects devices and writes images.

pub mod behavior;
pub mod build;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod dtsi;
pub mod error;
pub mod flash;
pub mod layout;
pub mod profile;

pub use error::{Error, Result};
