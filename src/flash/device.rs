//! Block device model and platform probes.
//!
//! Probes shell out to the platform's own tooling (`lsblk` on Linux,
//! `diskutil` on macOS) and normalize the result into [`BlockDevice`].
//! Windows is unsupported.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Command;

/// A removable-storage candidate as the detector sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockDevice {
    /// Kernel name (`sda`, `disk4`).
    pub name: String,
    /// Device node path (`/dev/sda`).
    pub path: String,
    /// USB vendor string, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// Product/model string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Serial number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Capacity in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Whether the platform flags the device removable.
    #[serde(default)]
    pub removable: bool,
    /// Whether any filesystem on it is mounted.
    #[serde(default)]
    pub mounted: bool,
    /// Current mount points.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_points: Vec<String>,
    /// Any further platform attributes, queryable by key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl BlockDevice {
    /// Stable identity for dedupe: `(vendor, serial)` when both are known,
    /// else the device path.
    #[must_use]
    pub fn identity(&self) -> String {
        match (&self.vendor, &self.serial) {
            (Some(vendor), Some(serial)) => format!("{vendor}:{serial}"),
            _ => self.path.clone(),
        }
    }

    /// Attribute lookup for the query language. Well-known keys first,
    /// then the free-form attribute map. `None` means absent.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<String> {
        match key {
            "name" => Some(self.name.clone()),
            "path" => Some(self.path.clone()),
            "vendor" => self.vendor.clone(),
            "product" | "model" => self.model.clone(),
            "serial" => self.serial.clone(),
            "size" => self.size_bytes.map(|s| s.to_string()),
            "removable" => Some(self.removable.to_string()),
            "mounted" => Some(self.mounted.to_string()),
            other => self.attributes.get(other).cloned(),
        }
    }
}

/// A source of device listings.
pub trait DeviceProbe: Send {
    /// Enumerates the current block devices.
    fn enumerate(&self) -> Result<Vec<BlockDevice>>;
}

/// The platform's probe, or an error on unsupported platforms.
pub fn platform_probe() -> Result<Box<dyn DeviceProbe>> {
    if cfg!(target_os = "linux") {
        Ok(Box::new(LsblkProbe))
    } else if cfg!(target_os = "macos") {
        Ok(Box::new(DiskutilProbe))
    } else {
        Err(Error::Config(
            "device detection is not supported on this platform".into(),
        ))
    }
}

/// Linux probe: `lsblk` JSON output.
pub struct LsblkProbe;

#[derive(Debug, Deserialize)]
struct LsblkDoc {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    rm: bool,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl DeviceProbe for LsblkProbe {
    fn enumerate(&self) -> Result<Vec<BlockDevice>> {
        let output = Command::new("lsblk")
            .args([
                "-J",
                "-b",
                "-o",
                "NAME,PATH,VENDOR,MODEL,SERIAL,SIZE,RM,MOUNTPOINTS",
            ])
            .output()
            .map_err(|e| Error::io("running lsblk", e))?;
        if !output.status.success() {
            return Err(Error::Config(format!(
                "lsblk failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let doc: LsblkDoc =
            serde_json::from_slice(&output.stdout).map_err(|e| Error::Json {
                context: "parsing lsblk output".into(),
                source: e,
            })?;
        Ok(doc.blockdevices.iter().map(convert_lsblk).collect())
    }
}

/// Converts one lsblk row; partition mount points roll up to the disk.
fn convert_lsblk(raw: &LsblkDevice) -> BlockDevice {
    let mut mount_points: Vec<String> =
        raw.mountpoints.iter().flatten().cloned().collect();
    for child in &raw.children {
        mount_points.extend(child.mountpoints.iter().flatten().cloned());
    }
    mount_points.retain(|m| !m.is_empty());

    BlockDevice {
        name: raw.name.clone(),
        path: raw
            .path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", raw.name)),
        vendor: raw.vendor.as_ref().map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
        model: raw.model.as_ref().map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
        serial: raw.serial.as_ref().map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
        size_bytes: raw.size,
        removable: raw.rm,
        mounted: !mount_points.is_empty(),
        mount_points,
        attributes: BTreeMap::new(),
    }
}

/// macOS probe: `diskutil list -plist` is heavyweight to parse without a
/// plist reader, so this walks `diskutil list` for external disks and
/// `diskutil info` for their attributes.
pub struct DiskutilProbe;

impl DeviceProbe for DiskutilProbe {
    fn enumerate(&self) -> Result<Vec<BlockDevice>> {
        let output = Command::new("diskutil")
            .arg("list")
            .output()
            .map_err(|e| Error::io("running diskutil", e))?;
        if !output.status.success() {
            return Err(Error::Config("diskutil list failed".into()));
        }
        let listing = String::from_utf8_lossy(&output.stdout);

        let mut devices = Vec::new();
        for line in listing.lines() {
            // Disk header lines look like "/dev/disk4 (external, physical):".
            if line.starts_with("/dev/disk") && line.contains("external") {
                let path = line.split_whitespace().next().unwrap_or_default();
                if let Some(device) = diskutil_info(path) {
                    devices.push(device);
                }
            }
        }
        Ok(devices)
    }
}

fn diskutil_info(path: &str) -> Option<BlockDevice> {
    let output = Command::new("diskutil").args(["info", path]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let info = String::from_utf8_lossy(&output.stdout);
    let mut fields = BTreeMap::new();
    for line in info.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    let mount_point = fields
        .get("Mount Point")
        .filter(|m| !m.is_empty() && *m != "Not applicable (no file system)")
        .cloned();
    Some(BlockDevice {
        name: fields
            .get("Device Identifier")
            .cloned()
            .unwrap_or_else(|| path.trim_start_matches("/dev/").to_string()),
        path: path.to_string(),
        vendor: fields.get("Device / Media Name").cloned(),
        model: fields.get("Device / Media Name").cloned(),
        serial: fields.get("Disk / Partition UUID").cloned(),
        size_bytes: fields
            .get("Disk Size")
            .and_then(|s| s.split('(').nth(1))
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse().ok()),
        removable: fields
            .get("Removable Media")
            .is_some_and(|v| v == "Removable"),
        mounted: mount_point.is_some(),
        mount_points: mount_point.into_iter().collect(),
        attributes: fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_prefers_vendor_serial() {
        let device = BlockDevice {
            name: "sda".into(),
            path: "/dev/sda".into(),
            vendor: Some("Adafruit".into()),
            serial: Some("GLV80-1".into()),
            ..BlockDevice::default()
        };
        assert_eq!(device.identity(), "Adafruit:GLV80-1");

        let anonymous = BlockDevice {
            name: "sdb".into(),
            path: "/dev/sdb".into(),
            ..BlockDevice::default()
        };
        assert_eq!(anonymous.identity(), "/dev/sdb");
    }

    #[test]
    fn test_attribute_lookup() {
        let mut device = BlockDevice {
            name: "sda".into(),
            path: "/dev/sda".into(),
            vendor: Some("Adafruit".into()),
            size_bytes: Some(33554432),
            removable: true,
            ..BlockDevice::default()
        };
        device
            .attributes
            .insert("label".into(), "GLV80LHBOOT".into());

        assert_eq!(device.attribute("vendor").as_deref(), Some("Adafruit"));
        assert_eq!(device.attribute("size").as_deref(), Some("33554432"));
        assert_eq!(device.attribute("removable").as_deref(), Some("true"));
        assert_eq!(device.attribute("label").as_deref(), Some("GLV80LHBOOT"));
        assert_eq!(device.attribute("serial"), None);
        assert_eq!(device.attribute("made-up"), None);
    }

    #[test]
    fn test_lsblk_parsing() {
        let json = r#"{
            "blockdevices": [
                {
                    "name": "sda",
                    "path": "/dev/sda",
                    "vendor": "Adafruit ",
                    "model": "Glove80 Bootloader",
                    "serial": "GLV80-1",
                    "size": 33554432,
                    "rm": true,
                    "mountpoints": [null],
                    "children": [
                        {"name": "sda1", "mountpoints": ["/media/GLV80LHBOOT"]}
                    ]
                }
            ]
        }"#;
        let doc: LsblkDoc = serde_json::from_str(json).unwrap();
        let devices: Vec<BlockDevice> = doc.blockdevices.iter().map(convert_lsblk).collect();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.vendor.as_deref(), Some("Adafruit"));
        assert!(device.removable);
        assert!(device.mounted);
        assert_eq!(device.mount_points, vec!["/media/GLV80LHBOOT"]);
    }
}
