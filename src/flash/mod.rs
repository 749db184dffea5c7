//! USB device detection and firmware flashing.

pub mod device;
pub mod flasher;
pub mod monitor;
pub mod query;

pub use device::{platform_probe, BlockDevice, DeviceProbe};
pub use flasher::{flash, mounter_for, FlashOptions, FlashResult, Mounter};
pub use monitor::{spawn_monitor, DeviceEvent, DEFAULT_POLL_INTERVAL};
pub use query::Query;
