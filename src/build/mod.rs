//! Firmware build pipeline: workspace materialization, the two-tier cache,
//! and the container build driver.

pub mod cache;
pub mod driver;
pub mod workspace;

pub use cache::{CacheStats, CacheTier, TwoTierCache};
pub use driver::{BuildDriver, BuildOptions, BuildResult};
pub use workspace::{Workspace, WorkspaceBuilder};
