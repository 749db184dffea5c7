//! The flash engine: wait, match, mount, copy, sync, unmount.
//!
//! Each matched device runs its own state machine on its own thread:
//!
//! ```text
//! Mounting -> Copying -> Syncing -> Unmounting -> done(ok)
//! ```
//!
//! Mount, copy, and sync failures re-mount from scratch up to the retry
//! budget; an unmount failure on the success path is final. A device that
//! disappears after a successful copy counts as success: ZMK bootloaders
//! reboot out of the mass-storage device the moment a valid image lands.

use crate::cancel::CancellationToken;
use crate::error::{Error, FlashStage, Result};
use crate::flash::device::BlockDevice;
use crate::flash::monitor::DeviceEvent;
use crate::flash::query::Query;
use crate::profile::KeyboardProfile;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);
const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for a multi-device flash operation.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// How many devices to flash before the operation completes.
    pub count: usize,
    /// Overall deadline.
    pub timeout: Duration,
    /// Never flash the same device twice in one invocation.
    pub track: bool,
    /// Per-device retry budget for mount/copy/sync failures.
    pub retries: u32,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            count: 1,
            timeout: Duration::from_secs(60),
            track: true,
            retries: 3,
        }
    }
}

/// Outcome of one device's state machine.
#[derive(Debug, Clone)]
pub struct FlashResult {
    /// Whether the device ended in `done(ok)`.
    pub success: bool,
    /// The device flashed.
    pub device: BlockDevice,
    /// The firmware image used.
    pub firmware_file: PathBuf,
    /// Wall time from mount start to completion.
    pub elapsed: Duration,
    /// Failure detail, when unsuccessful.
    pub error: Option<String>,
    /// Mount points the engine used.
    pub mount_points_used: Vec<String>,
    /// True when the machine ended in `done(cancelled)`.
    pub cancelled: bool,
}

/// Mount/unmount/sync backend. Production backends shell out to the
/// platform's tools; tests provide in-memory fakes.
pub trait Mounter: Send + Sync {
    /// Mounts the device's filesystem, returning the mount points.
    fn mount(&self, device: &BlockDevice) -> Result<Vec<String>>;
    /// Releases the device's mount points.
    fn unmount(&self, device: &BlockDevice) -> Result<()>;
    /// Flushes pending writes for the device.
    fn sync(&self, device: &BlockDevice) -> Result<()>;
    /// Whether the device is still attached (disconnect detection).
    fn present(&self, device: &BlockDevice) -> bool;
}

/// Picks the mount backend the profile asks for.
#[must_use]
pub fn mounter_for(profile: &KeyboardProfile) -> Arc<dyn Mounter> {
    match profile.flash_method.mount_method.as_str() {
        "manual" => Arc::new(ManualMounter),
        _ => Arc::new(SystemMounter),
    }
}

/// Platform mounter: `udisksctl` on Linux, `diskutil` on macOS.
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, device: &BlockDevice) -> Result<Vec<String>> {
        if device.mounted && !device.mount_points.is_empty() {
            return Ok(device.mount_points.clone());
        }
        let output = if cfg!(target_os = "macos") {
            run_with_timeout(
                Command::new("diskutil").args(["mount", &device.path]),
                MOUNT_TIMEOUT,
            )?
        } else {
            run_with_timeout(
                Command::new("udisksctl").args(["mount", "-b", &mount_target(device)]),
                MOUNT_TIMEOUT,
            )?
        };
        parse_mount_points(&output, device)
    }

    fn unmount(&self, device: &BlockDevice) -> Result<()> {
        let status = if cfg!(target_os = "macos") {
            run_with_timeout(
                Command::new("diskutil").args(["unmount", &device.path]),
                UNMOUNT_TIMEOUT,
            )
        } else {
            run_with_timeout(
                Command::new("udisksctl").args(["unmount", "-b", &mount_target(device)]),
                UNMOUNT_TIMEOUT,
            )
        };
        status.map(|_| ())
    }

    fn sync(&self, _device: &BlockDevice) -> Result<()> {
        run_with_timeout(&mut Command::new("sync"), SYNC_TIMEOUT).map(|_| ())
    }

    fn present(&self, device: &BlockDevice) -> bool {
        Path::new(&device.path).exists()
    }
}

/// For profiles whose devices auto-mount: use the mount points the detector
/// observed and leave mounting/unmounting to the OS.
pub struct ManualMounter;

impl Mounter for ManualMounter {
    fn mount(&self, device: &BlockDevice) -> Result<Vec<String>> {
        if device.mount_points.is_empty() {
            return Err(Error::Flash {
                stage: FlashStage::Mount,
                device: device.path.clone(),
                reason: "device is not mounted and mount_method is manual".into(),
            });
        }
        Ok(device.mount_points.clone())
    }

    fn unmount(&self, _device: &BlockDevice) -> Result<()> {
        Ok(())
    }

    fn sync(&self, _device: &BlockDevice) -> Result<()> {
        run_with_timeout(&mut Command::new("sync"), SYNC_TIMEOUT).map(|_| ())
    }

    fn present(&self, device: &BlockDevice) -> bool {
        Path::new(&device.path).exists()
    }
}

/// The bootloader volume is FAT on the whole disk for most ZMK boards, but
/// some expose a partition; mount the first partition when one is listed.
fn mount_target(device: &BlockDevice) -> String {
    device
        .attributes
        .get("partition")
        .cloned()
        .unwrap_or_else(|| device.path.clone())
}

/// `udisksctl` prints `Mounted /dev/sda at /media/user/GLV80LHBOOT`.
fn parse_mount_points(output: &str, device: &BlockDevice) -> Result<Vec<String>> {
    let mut points = Vec::new();
    for line in output.lines() {
        if let Some(at) = line.find(" at ") {
            let point = line[at + 4..].trim().trim_end_matches('.').to_string();
            if !point.is_empty() {
                points.push(point);
            }
        }
    }
    if points.is_empty() {
        return Err(Error::Flash {
            stage: FlashStage::Mount,
            device: device.path.clone(),
            reason: "mount reported no mount point".into(),
        });
    }
    Ok(points)
}

/// Runs a command, killing it at the deadline.
fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<String> {
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::io("spawning mount helper", e))?;
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut output = String::new();
                if let Some(mut stdout) = child.stdout.take() {
                    use std::io::Read;
                    let _ = stdout.read_to_string(&mut output);
                }
                if status.success() {
                    return Ok(output);
                }
                let mut stderr_text = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    use std::io::Read;
                    let _ = stderr.read_to_string(&mut stderr_text);
                }
                return Err(Error::io(
                    "mount helper failed",
                    std::io::Error::other(stderr_text.trim().to_string()),
                ));
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    return Err(Error::io(
                        "mount helper timed out",
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded"),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(Error::io("waiting for mount helper", e)),
        }
    }
}

/// Runs the state machine for one device.
pub fn flash_one(
    mounter: &dyn Mounter,
    device: &BlockDevice,
    firmware: &Path,
    retries: u32,
    cancel: &CancellationToken,
) -> FlashResult {
    let started = Instant::now();
    let mut last_error = String::new();

    let done = |success: bool, error: Option<String>, points: Vec<String>, cancelled: bool| {
        FlashResult {
            success,
            device: device.clone(),
            firmware_file: firmware.to_path_buf(),
            elapsed: started.elapsed(),
            error,
            mount_points_used: points,
            cancelled,
        }
    };

    for attempt in 0..=retries {
        if cancel.is_cancelled() {
            return done(false, Some("cancelled".into()), vec![], true);
        }
        if attempt > 0 {
            debug!(device = %device.path, attempt, "retrying flash from mount");
        }

        // Mounting.
        let mount_points = match mounter.mount(device) {
            Ok(points) => points,
            Err(e) => {
                last_error = format!("mount: {e}");
                continue;
            }
        };

        // Copying.
        let file_name = firmware
            .file_name()
            .map_or_else(|| "zmk.uf2".into(), |n| n.to_string_lossy().into_owned());
        let dest = Path::new(&mount_points[0]).join(file_name);
        if let Err(e) = std::fs::copy(firmware, &dest) {
            last_error = format!("copy to {}: {e}", dest.display());
            let _ = mounter.unmount(device);
            continue;
        }

        // Syncing. A vanished device means the bootloader took the image
        // and rebooted.
        if let Err(e) = mounter.sync(device) {
            if !mounter.present(device) {
                info!(device = %device.path, "device detached after copy; flash complete");
                return done(true, None, mount_points, false);
            }
            last_error = format!("sync: {e}");
            let _ = mounter.unmount(device);
            continue;
        }

        // Unmounting: no retry on the success path.
        if let Err(e) = mounter.unmount(device) {
            if !mounter.present(device) {
                info!(device = %device.path, "device detached during unmount; flash complete");
                return done(true, None, mount_points, false);
            }
            return done(
                false,
                Some(format!("unmount: {e}")),
                mount_points,
                false,
            );
        }

        return done(true, None, mount_points, false);
    }

    done(false, Some(last_error), vec![], false)
}

/// Drives up to `count` concurrent state machines from the event stream.
///
/// Completes when `count` devices flashed successfully, the deadline fires,
/// or the token cancels. With `track` set, a device identity is flashed at
/// most once per invocation.
pub fn flash(
    mounter: Arc<dyn Mounter>,
    events: &Receiver<DeviceEvent>,
    query: &Query,
    firmware: &Path,
    opts: &FlashOptions,
    cancel: &CancellationToken,
) -> Result<Vec<FlashResult>> {
    if opts.count == 0 {
        return Err(Error::Usage("device count must be at least 1".into()));
    }
    if opts.timeout.is_zero() {
        return Err(Error::Usage("timeout must be greater than zero".into()));
    }
    let metadata = std::fs::metadata(firmware).map_err(|_| Error::InvalidFirmware {
        path: firmware.to_path_buf(),
        reason: "file not found".into(),
    })?;
    if metadata.len() == 0 {
        return Err(Error::InvalidFirmware {
            path: firmware.to_path_buf(),
            reason: "file is empty".into(),
        });
    }

    let deadline = Instant::now() + opts.timeout;
    let (result_tx, result_rx) = channel::<FlashResult>();
    let mut results = Vec::new();
    let mut workers = Vec::new();
    let mut flashed: HashSet<String> = HashSet::new();
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut pending: std::collections::VecDeque<BlockDevice> = std::collections::VecDeque::new();
    let mut successes = 0usize;
    let mut events_open = true;

    while successes < opts.count && !cancel.is_cancelled() && Instant::now() < deadline {
        // Drain finished workers so capacity frees up.
        while let Ok(result) = result_rx.try_recv() {
            in_flight.remove(&result.device.identity());
            if result.success {
                successes += 1;
            }
            results.push(result);
        }
        if successes >= opts.count {
            break;
        }

        // Start machines for queued devices while capacity allows. A device
        // whose identity is already in flight stays queued.
        let mut deferred = std::collections::VecDeque::new();
        while let Some(device) = pending.pop_front() {
            if successes + in_flight.len() >= opts.count {
                deferred.push_back(device);
                break;
            }
            let identity = device.identity();
            if in_flight.contains(&identity) {
                deferred.push_back(device);
                continue;
            }
            info!(device = %device.path, "matched device; starting flash");
            flashed.insert(identity.clone());
            in_flight.insert(identity);
            let mounter = Arc::clone(&mounter);
            let firmware = firmware.to_path_buf();
            let retries = opts.retries;
            let worker_cancel = cancel.clone();
            let tx = result_tx.clone();
            workers.push(std::thread::spawn(move || {
                let result =
                    flash_one(mounter.as_ref(), &device, &firmware, retries, &worker_cancel);
                let _ = tx.send(result);
            }));
        }
        deferred.append(&mut pending);
        pending = deferred;

        if !events_open && pending.is_empty() && in_flight.is_empty() {
            break;
        }

        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(Duration::from_millis(100));
        match events.recv_timeout(wait) {
            Ok(DeviceEvent::Added(device)) => {
                if !query.matches(&device) {
                    continue;
                }
                let identity = device.identity();
                if opts.track && flashed.contains(&identity) {
                    debug!(device = %device.path, "already flashed; ignoring duplicate");
                    continue;
                }
                pending.push_back(device);
            }
            Ok(DeviceEvent::Removed(device)) => {
                debug!(device = %device.path, "device removed");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                events_open = false;
            }
        }
    }

    // Let in-flight machines finish their current transition.
    drop(result_tx);
    for worker in workers {
        let _ = worker.join();
    }
    while let Ok(result) = result_rx.try_recv() {
        if result.success {
            successes += 1;
        }
        results.push(result);
    }

    if results.iter().filter(|r| r.success).count() < opts.count {
        warn!(
            wanted = opts.count,
            flashed = successes,
            "flash operation ended short of target"
        );
    }
    Ok(results)
}
