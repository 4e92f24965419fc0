//! Mount/overlay dependency tracker: reference-counts read-only
//! layers and scratch devices beneath overlay mounts so a device can't be
//! unmounted while still in use. The tracker only manages the in-memory
//! bookkeeping; callers hold the lock across the real mount/unmount syscall
//! themselves (`wormhole::newmount`'s raw syscall wrappers are the
//! synchronous style this mirrors).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Ro,
    Rw,
    Overlay,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub mount_path: PathBuf,
    pub device_type: DeviceType,
    pub source: PathBuf,
    pub usage: u32,
    pub encrypted: bool,
    pub referenced_devices: Vec<PathBuf>,
}

/// A revert token returned by [`MountTracker::remove_overlay`]. Dropping it
/// without calling [`Undo::undo`] is fine; it carries no destructor logic
/// of its own, so a caller that forgets to call it simply accepts the
/// removal; callers invoke it only to roll back a partially-applied mount
/// on syscall failure.
pub struct Undo {
    device: Device,
}

pub struct MountTracker {
    devices: Mutex<HashMap<PathBuf, Device>>,
}

impl Default for MountTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTracker {
    pub fn new() -> Self {
        MountTracker {
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_ro(&self, path: &Path, source: &Path) -> Result<(), ErrorKind> {
        self.insert_leaf(path, source, DeviceType::Ro, false)
    }

    pub fn add_rw(&self, path: &Path, source: &Path, encrypted: bool) -> Result<(), ErrorKind> {
        self.insert_leaf(path, source, DeviceType::Rw, encrypted)
    }

    fn insert_leaf(
        &self,
        path: &Path,
        source: &Path,
        device_type: DeviceType,
        encrypted: bool,
    ) -> Result<(), ErrorKind> {
        let mut devices = self.devices.lock().unwrap();
        let clean = clean_path(path);
        if devices.contains_key(&clean) {
            return Err(ErrorKind::already_exists(anyhow::anyhow!(
                "mount path {} already mapped",
                clean.display()
            )));
        }
        devices.insert(
            clean.clone(),
            Device {
                mount_path: clean,
                device_type,
                source: source.to_path_buf(),
                usage: 0,
                encrypted,
                referenced_devices: Vec::new(),
            },
        );
        Ok(())
    }

    /// Inserts an overlay record and bumps the usage of every layer and the
    /// scratch device. On any failure to resolve a reference, all
    /// increments performed so far are reverted and the overlay record is
    /// removed.
    pub fn add_overlay(
        &self,
        path: &Path,
        layers: &[PathBuf],
        scratch: &Path,
    ) -> Result<(), ErrorKind> {
        let mut devices = self.devices.lock().unwrap();
        let clean = clean_path(path);
        if devices.contains_key(&clean) {
            return Err(ErrorKind::already_exists(anyhow::anyhow!(
                "mount path {} already mapped",
                clean.display()
            )));
        }

        let mut referenced = Vec::new();
        let mut used = Vec::new();
        let mut failure = None;
        for candidate in layers.iter().chain(std::iter::once(&scratch.to_path_buf())) {
            match use_device(&mut devices, candidate) {
                Ok(owner) => {
                    referenced.push(owner.clone());
                    used.push(owner);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            for owner in &used {
                if let Some(d) = devices.get_mut(owner) {
                    d.usage = d.usage.saturating_sub(1);
                }
            }
            return Err(e);
        }

        devices.insert(
            clean.clone(),
            Device {
                mount_path: clean,
                device_type: DeviceType::Overlay,
                source: PathBuf::new(),
                usage: 0,
                encrypted: false,
                referenced_devices: referenced,
            },
        );
        Ok(())
    }

    pub fn remove_ro(&self, path: &Path, source: &Path) -> Result<(), ErrorKind> {
        self.remove_leaf(path, source, DeviceType::Ro, None)
    }

    pub fn remove_rw(&self, path: &Path, source: &Path, encrypted: bool) -> Result<(), ErrorKind> {
        self.remove_leaf(path, source, DeviceType::Rw, Some(encrypted))
    }

    fn remove_leaf(
        &self,
        path: &Path,
        source: &Path,
        device_type: DeviceType,
        encrypted: Option<bool>,
    ) -> Result<(), ErrorKind> {
        let mut devices = self.devices.lock().unwrap();
        let clean = clean_path(path);
        let device = devices
            .get(&clean)
            .ok_or_else(|| ErrorKind::not_found(anyhow::anyhow!("no device at {}", clean.display())))?;

        if device.device_type != device_type || device.source != source {
            return Err(ErrorKind::invalid_arg(anyhow::anyhow!(
                "device at {} does not match type/source",
                clean.display()
            )));
        }
        if let Some(want_encrypted) = encrypted {
            if device.encrypted != want_encrypted {
                return Err(ErrorKind::invalid_arg(anyhow::anyhow!(
                    "device at {} encrypted flag mismatch",
                    clean.display()
                )));
            }
        }
        if device.usage > 0 {
            return Err(ErrorKind::invalid_state(anyhow::anyhow!(
                "device at {} still in use (usage={})",
                clean.display(),
                device.usage
            )));
        }

        devices.remove(&clean);
        Ok(())
    }

    /// Decrements usage on every referenced device, removes the overlay
    /// record, and returns an [`Undo`] the caller invokes if the unmount
    /// syscall that follows fails.
    pub fn remove_overlay(&self, path: &Path) -> Result<Undo, ErrorKind> {
        let mut devices = self.devices.lock().unwrap();
        let clean = clean_path(path);
        let device = devices
            .get(&clean)
            .ok_or_else(|| ErrorKind::not_found(anyhow::anyhow!("no overlay at {}", clean.display())))?;
        if device.device_type != DeviceType::Overlay {
            return Err(ErrorKind::invalid_arg(anyhow::anyhow!(
                "{} is not an overlay",
                clean.display()
            )));
        }

        let device = devices.remove(&clean).unwrap();
        for owner in &device.referenced_devices {
            if let Some(d) = devices.get_mut(owner) {
                d.usage = d.usage.saturating_sub(1);
            }
        }
        Ok(Undo { device })
    }

    /// Reinstates an overlay record and all the usage counts it held,
    /// undoing a prior [`remove_overlay`] call.
    pub fn undo(&self, undo: Undo) {
        let mut devices = self.devices.lock().unwrap();
        for owner in &undo.device.referenced_devices {
            if let Some(d) = devices.get_mut(owner) {
                d.usage = d.usage.saturating_add(1);
            }
        }
        devices.insert(undo.device.mount_path.clone(), undo.device);
    }

    /// True iff the innermost containing device is an encrypted RW device.
    pub fn is_encrypted(&self, path: &Path) -> bool {
        let devices = self.devices.lock().unwrap();
        match innermost(&devices, path) {
            Some(d) => d.device_type == DeviceType::Rw && d.encrypted,
            None => false,
        }
    }

    pub fn has_overlay_mounted_at(&self, path: &Path) -> bool {
        let devices = self.devices.lock().unwrap();
        let clean = clean_path(path);
        matches!(devices.get(&clean), Some(d) if d.device_type == DeviceType::Overlay)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }
}

/// Finds the innermost device containing `target` and increments its
/// usage, returning its mount path. "Innermost" is the device whose mount
/// path is the longest prefix of `target` such that the relative suffix
/// does not escape via `..`.
fn use_device(
    devices: &mut HashMap<PathBuf, Device>,
    target: &Path,
) -> Result<PathBuf, ErrorKind> {
    let owner = innermost(devices, target)
        .map(|d| d.mount_path.clone())
        .ok_or_else(|| {
            ErrorKind::not_found(anyhow::anyhow!(
                "no device contains {}",
                clean_path(target).display()
            ))
        })?;
    devices.get_mut(&owner).unwrap().usage += 1;
    Ok(owner)
}

fn innermost<'a>(devices: &'a HashMap<PathBuf, Device>, target: &Path) -> Option<&'a Device> {
    let clean_target = clean_path(target);
    let mut best: Option<&Device> = None;
    for device in devices.values() {
        if let Ok(rel) = clean_target.strip_prefix(&device.mount_path) {
            if rel.components().next().map(|c| c.as_os_str() == "..").unwrap_or(false) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => device.mount_path.as_os_str().len() > b.mount_path.as_os_str().len(),
            };
            if better {
                best = Some(device);
            }
        } else if clean_target == device.mount_path {
            best = Some(device);
        }
    }
    best
}

/// Lexically normalizes `path` (collapses `.`/`..` without touching the
/// filesystem); used so mount-path comparisons are stable regardless of
/// how the caller spelled the path.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_is_set_difference() {
        let t = MountTracker::new();
        t.add_ro(Path::new("/a"), Path::new("/dev/sda")).unwrap();
        t.add_rw(Path::new("/b"), Path::new("/dev/sdb"), false).unwrap();
        assert_eq!(t.len(), 2);
        t.remove_ro(Path::new("/a"), Path::new("/dev/sda")).unwrap();
        assert_eq!(t.len(), 1);
        t.remove_rw(Path::new("/b"), Path::new("/dev/sdb"), false).unwrap();
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn duplicate_add_fails() {
        let t = MountTracker::new();
        t.add_ro(Path::new("/a"), Path::new("/dev/sda")).unwrap();
        assert!(t.add_ro(Path::new("/a"), Path::new("/dev/sdc")).is_err());
    }

    #[test]
    fn scenario_c_mount_tracker_overlap() {
        let t = MountTracker::new();
        t.add_ro(Path::new("/layers/a"), Path::new("/dev/sda")).unwrap();
        t.add_rw(Path::new("/scratch"), Path::new("/dev/sdb"), true).unwrap();
        t.add_overlay(
            Path::new("/root"),
            &[PathBuf::from("/layers/a")],
            Path::new("/scratch"),
        )
        .unwrap();

        assert!(t.remove_ro(Path::new("/layers/a"), Path::new("/dev/sda")).is_err());

        let undo = t.remove_overlay(Path::new("/root")).unwrap();
        t.remove_ro(Path::new("/layers/a"), Path::new("/dev/sda")).unwrap();
        // undo is otherwise unused here; drop it to simulate a successful unmount
        drop(undo);
    }

    #[test]
    fn scenario_d_encrypted_scratch_detection() {
        let t = MountTracker::new();
        t.add_rw(Path::new("/enc"), Path::new("/dev/sdc"), true).unwrap();
        t.add_rw(Path::new("/enc/sub"), Path::new("/dev/sdd"), false).unwrap();

        assert!(!t.is_encrypted(Path::new("/enc/sub/x")));
        assert!(t.is_encrypted(Path::new("/enc/other")));
    }

    #[test]
    fn overlay_removal_undo_is_idempotent() {
        let t = MountTracker::new();
        t.add_ro(Path::new("/layers/a"), Path::new("/dev/sda")).unwrap();
        t.add_rw(Path::new("/scratch"), Path::new("/dev/sdb"), false).unwrap();
        t.add_overlay(
            Path::new("/root"),
            &[PathBuf::from("/layers/a")],
            Path::new("/scratch"),
        )
        .unwrap();

        let undo = t.remove_overlay(Path::new("/root")).unwrap();
        assert!(!t.has_overlay_mounted_at(Path::new("/root")));
        t.undo(undo);
        assert!(t.has_overlay_mounted_at(Path::new("/root")));

        let undo2 = t.remove_overlay(Path::new("/root")).unwrap();
        assert!(!t.has_overlay_mounted_at(Path::new("/root")));
        drop(undo2);
    }

    #[test]
    fn device_in_use_cannot_be_removed() {
        let t = MountTracker::new();
        t.add_ro(Path::new("/layers/a"), Path::new("/dev/sda")).unwrap();
        t.add_rw(Path::new("/scratch"), Path::new("/dev/sdb"), false).unwrap();
        t.add_overlay(
            Path::new("/root"),
            &[PathBuf::from("/layers/a")],
            Path::new("/scratch"),
        )
        .unwrap();

        let err = t.remove_ro(Path::new("/layers/a"), Path::new("/dev/sda")).unwrap_err();
        assert_eq!(err.hresult(), crate::error::hresult::INVALID_STATE);
    }

    #[test]
    fn longest_prefix_wins_and_dotdot_is_excluded() {
        let t = MountTracker::new();
        t.add_rw(Path::new("/a"), Path::new("/dev/sda"), false).unwrap();
        t.add_rw(Path::new("/a/b"), Path::new("/dev/sdb"), true).unwrap();

        assert!(t.is_encrypted(Path::new("/a/b/c")));
        assert!(!t.is_encrypted(Path::new("/a/other")));
    }
}
