//! Polling device monitor: turns repeated enumerations into an add/remove
//! event stream over a bounded channel.

use crate::cancel::CancellationToken;
use crate::flash::device::{BlockDevice, DeviceProbe};
use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Channel depth; a stalled consumer drops the oldest news, not the thread.
const CHANNEL_DEPTH: usize = 64;

/// A device appeared or disappeared between polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Newly observed device (the first poll reports every present device).
    Added(BlockDevice),
    /// A previously observed device is gone.
    Removed(BlockDevice),
}

/// Spawns the polling thread. Events arrive on the returned receiver; the
/// thread exits on the next tick after cancellation, emitting one final
/// flush of changes first.
pub fn spawn_monitor(
    probe: Box<dyn DeviceProbe>,
    interval: Duration,
    cancel: CancellationToken,
) -> (Receiver<DeviceEvent>, JoinHandle<()>) {
    let (tx, rx) = sync_channel(CHANNEL_DEPTH);
    let handle = std::thread::spawn(move || poll_loop(probe.as_ref(), interval, &cancel, &tx));
    (rx, handle)
}

fn poll_loop(
    probe: &dyn DeviceProbe,
    interval: Duration,
    cancel: &CancellationToken,
    tx: &SyncSender<DeviceEvent>,
) {
    let mut known: HashMap<String, BlockDevice> = HashMap::new();
    loop {
        let finishing = cancel.is_cancelled();
        match probe.enumerate() {
            Ok(devices) => emit_changes(&mut known, devices, tx),
            Err(e) => warn!(error = %e, "device enumeration failed"),
        }
        if finishing {
            debug!("device monitor exiting after final flush");
            return;
        }
        std::thread::sleep(interval);
    }
}

fn emit_changes(
    known: &mut HashMap<String, BlockDevice>,
    devices: Vec<BlockDevice>,
    tx: &SyncSender<DeviceEvent>,
) {
    let mut current: HashMap<String, BlockDevice> = HashMap::new();
    for device in devices {
        current.insert(device.path.clone(), device);
    }

    for (path, device) in &current {
        if !known.contains_key(path) {
            send(tx, DeviceEvent::Added(device.clone()));
        }
    }
    for (path, device) in known.iter() {
        if !current.contains_key(path) {
            send(tx, DeviceEvent::Removed(device.clone()));
        }
    }
    *known = current;
}

fn send(tx: &SyncSender<DeviceEvent>, event: DeviceEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(?event, "device event channel full; dropping event");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}
