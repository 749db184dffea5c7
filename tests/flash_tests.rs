//! Flash engine scenarios: multi-device flows, tracking, query filtering,
//! and boundary inputs.

use glovebox::cancel::CancellationToken;
use glovebox::error::{Error, FlashStage, Result};
use glovebox::flash::{
    flash, spawn_monitor, BlockDevice, DeviceProbe, FlashOptions, Mounter, Query,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn device(path: &str, vendor: &str, serial: &str) -> BlockDevice {
    BlockDevice {
        name: path.trim_start_matches("/dev/").to_string(),
        path: path.to_string(),
        vendor: Some(vendor.to_string()),
        serial: Some(serial.to_string()),
        removable: true,
        ..BlockDevice::default()
    }
}

fn firmware(dir: &Path) -> PathBuf {
    let path = dir.join("zmk.uf2");
    std::fs::write(&path, b"UF2 payload").unwrap();
    path
}

/// A probe whose listing grows one device per poll: A alone, then A and B.
struct StagedProbe {
    polls: AtomicUsize,
}

impl DeviceProbe for StagedProbe {
    fn enumerate(&self) -> Result<Vec<BlockDevice>> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        let mut devices = vec![device("/dev/sda", "Adafruit", "A1")];
        if poll >= 1 {
            devices.push(device("/dev/sdb", "Adafruit", "B2"));
        }
        Ok(devices)
    }
}

/// Copies into a per-device directory; records every mount.
struct RecordingMounter {
    root: PathBuf,
    mounts: Mutex<Vec<String>>,
}

impl RecordingMounter {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            mounts: Mutex::new(Vec::new()),
        }
    }
}

impl Mounter for RecordingMounter {
    fn mount(&self, device: &BlockDevice) -> Result<Vec<String>> {
        self.mounts.lock().unwrap().push(device.path.clone());
        let dir = self.root.join(device.name.clone());
        std::fs::create_dir_all(&dir)
            .map_err(|e| glovebox::error::Error::io("creating fake mount", e))?;
        Ok(vec![dir.display().to_string()])
    }

    fn unmount(&self, _device: &BlockDevice) -> Result<()> {
        Ok(())
    }

    fn sync(&self, _device: &BlockDevice) -> Result<()> {
        Ok(())
    }

    fn present(&self, _device: &BlockDevice) -> bool {
        true
    }
}

#[test]
fn two_devices_flash_within_deadline() {
    let mount_root = TempDir::new().unwrap();
    let firmware_dir = TempDir::new().unwrap();
    let firmware = firmware(firmware_dir.path());

    let cancel = CancellationToken::new();
    let (events, monitor) = spawn_monitor(
        Box::new(StagedProbe {
            polls: AtomicUsize::new(0),
        }),
        Duration::from_millis(20),
        cancel.clone(),
    );
    let mounter: Arc<dyn Mounter> = Arc::new(RecordingMounter::new(mount_root.path()));

    let query = Query::parse("vendor=Adafruit").unwrap();
    let results = flash(
        Arc::clone(&mounter),
        &events,
        &query,
        &firmware,
        &FlashOptions {
            count: 2,
            timeout: Duration::from_secs(10),
            track: true,
            retries: 3,
        },
        &cancel,
    )
    .unwrap();
    cancel.cancel();
    let _ = monitor.join();

    let successes: HashSet<String> = results
        .iter()
        .filter(|r| r.success)
        .map(|r| r.device.path.clone())
        .collect();
    assert_eq!(successes.len(), 2);
    assert!(successes.contains("/dev/sda"));
    assert!(successes.contains("/dev/sdb"));

    // Both fake volumes received the image.
    assert!(mount_root.path().join("sda/zmk.uf2").is_file());
    assert!(mount_root.path().join("sdb/zmk.uf2").is_file());
}

#[test]
fn tracking_skips_already_flashed_devices() {
    // Only one device ever appears; with track on and count 2 the
    // operation must not flash it twice, so the deadline fires with
    // exactly one success.
    struct ConstantProbe;
    impl DeviceProbe for ConstantProbe {
        fn enumerate(&self) -> Result<Vec<BlockDevice>> {
            Ok(vec![device("/dev/sda", "Adafruit", "A1")])
        }
    }

    let mount_root = TempDir::new().unwrap();
    let firmware_dir = TempDir::new().unwrap();
    let firmware = firmware(firmware_dir.path());

    let cancel = CancellationToken::new();
    let (events, monitor) = spawn_monitor(
        Box::new(ConstantProbe),
        Duration::from_millis(10),
        cancel.clone(),
    );
    let mounter: Arc<dyn Mounter> = Arc::new(RecordingMounter::new(mount_root.path()));

    let query = Query::parse("vendor=Adafruit").unwrap();
    let results = flash(
        Arc::clone(&mounter),
        &events,
        &query,
        &firmware,
        &FlashOptions {
            count: 2,
            timeout: Duration::from_millis(500),
            track: true,
            retries: 0,
        },
        &cancel,
    )
    .unwrap();
    cancel.cancel();
    let _ = monitor.join();

    assert_eq!(results.iter().filter(|r| r.success).count(), 1);
}

#[test]
fn query_filters_devices_consistently() {
    // Property: a device is flashed iff the textual query matches it.
    let devices = vec![
        device("/dev/sda", "Adafruit", "A1"),
        device("/dev/sdb", "SanDisk", "S1"),
        {
            let mut d = device("/dev/sdc", "Adafruit", "C1");
            d.removable = false;
            d
        },
    ];
    let query = Query::parse("vendor=Adafruit and removable=true").unwrap();
    let matching: Vec<&BlockDevice> = devices.iter().filter(|d| query.matches(d)).collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].path, "/dev/sda");
}

#[test]
fn boundary_inputs_are_rejected() {
    let firmware_dir = TempDir::new().unwrap();
    let mounter: Arc<dyn Mounter> = Arc::new(RecordingMounter::new(firmware_dir.path()));
    let (_tx, events) = std::sync::mpsc::sync_channel(1);
    let query = Query::parse("").unwrap();
    let cancel = CancellationToken::new();

    // Zero-size firmware.
    let empty = firmware_dir.path().join("empty.uf2");
    std::fs::write(&empty, b"").unwrap();
    assert!(matches!(
        flash(
            Arc::clone(&mounter),
            &events,
            &query,
            &empty,
            &FlashOptions::default(),
            &cancel
        )
        .unwrap_err(),
        Error::InvalidFirmware { .. }
    ));

    // Missing firmware file.
    assert!(matches!(
        flash(
            Arc::clone(&mounter),
            &events,
            &query,
            &firmware_dir.path().join("nope.uf2"),
            &FlashOptions::default(),
            &cancel
        )
        .unwrap_err(),
        Error::InvalidFirmware { .. }
    ));

    // count = 0 and timeout = 0 are usage errors.
    let good = firmware(firmware_dir.path());
    for opts in [
        FlashOptions {
            count: 0,
            ..FlashOptions::default()
        },
        FlashOptions {
            timeout: Duration::ZERO,
            ..FlashOptions::default()
        },
    ] {
        assert!(matches!(
            flash(Arc::clone(&mounter), &events, &query, &good, &opts, &cancel).unwrap_err(),
            Error::Usage(_)
        ));
    }
}

#[test]
fn flash_error_carries_device_and_stage() {
    let err = Error::Flash {
        stage: FlashStage::Mount,
        device: "/dev/sda".into(),
        reason: "no filesystem".into(),
    };
    let message = err.to_string();
    assert!(message.contains("mount"));
    assert!(message.contains("/dev/sda"));
    assert_eq!(err.exit_code(), 5);
}
