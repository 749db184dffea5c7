//! CLI command handlers.
//!
//! Each command is a clap `Args` struct with an `execute` method; `main`
//! dispatches and maps errors to exit codes. Commands stay thin: they wire
//! preferences, profiles, and subsystem objects together and format output.

pub mod cache_cmd;
pub mod common;
pub mod config_cmd;
pub mod firmware;
pub mod keyboard;
pub mod layout;
pub mod status;

pub use common::CliContext;
