// Volume lock manager
//
// Finds the OS volume backed by a given disk and partition start, takes it
// offline and holds it until unlocked. Volumes are matched by the device
// number and starting sector the OS reports for them, never by mount point or
// drive letter.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::UdisksVolumes as PlatformVolumes;
#[cfg(windows)]
pub use windows::WindowsVolumes as PlatformVolumes;

use crate::error::{DiskError, Result};
use std::fmt;
use tracing::{debug, info, warn};

/// Kind of device behind a volume, as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Disk,
    DiskFileSystem,
    FileSystem,
    Other(u32),
}

impl DeviceClass {
    pub fn is_disk_like(&self) -> bool {
        !matches!(self, DeviceClass::Other(_))
    }
}

/// Where a volume lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDeviceInfo {
    pub device_class: DeviceClass,
    pub device_number: u32,
    /// First sector of the backing partition, in 512-byte sectors
    pub start_lba: u64,
}

/// An opened OS volume
pub trait OpenVolume {
    fn path(&self) -> &str;

    /// Backing device and partition start
    fn query(&mut self) -> Result<VolumeDeviceInfo>;

    /// Take the volume offline, dropping cached state and open references.
    /// The handle stays open afterwards and keeps the OS from remounting.
    fn dismount(&mut self) -> Result<()>;
}

/// Enumerates and opens the volumes the OS knows about
pub trait VolumeSource {
    type Volume: OpenVolume + 'static;

    fn volume_paths(&mut self) -> Result<Vec<String>>;

    fn open(&mut self, path: &str) -> Result<Self::Volume>;
}

/// A volume taken offline for exclusive use; released on `unlock` or drop
pub struct LockedVolume {
    volume: Option<Box<dyn OpenVolume>>,
    path: String,
    device_number: u32,
    start_lba: u64,
}

impl LockedVolume {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn device_number(&self) -> u32 {
        self.device_number
    }

    pub fn start_lba(&self) -> u64 {
        self.start_lba
    }

    pub fn is_locked(&self) -> bool {
        self.volume.is_some()
    }

    /// Close the retained handle; calling it again does nothing
    pub fn unlock(&mut self) {
        if self.volume.take().is_some() {
            info!("Released volume {}", self.path);
        }
    }
}

impl Drop for LockedVolume {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl fmt::Debug for LockedVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedVolume")
            .field("path", &self.path)
            .field("device_number", &self.device_number)
            .field("start_lba", &self.start_lba)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Lock the volume on partition `start_lba` of disk `device_number`.
///
/// Volumes that cannot be opened or queried are skipped. The first match is
/// dismounted and retained; every other opened volume is closed right away.
/// A failed dismount is `LockFailed` and leaves nothing held. No match is
/// `NotFound`, which means nothing is mounted there.
pub fn lock_with<S: VolumeSource>(
    source: &mut S,
    device_number: u32,
    start_lba: u64,
) -> Result<LockedVolume> {
    let paths = source.volume_paths()?;
    debug!(
        "Looking for disk {} partition at sector {} among {} volumes",
        device_number,
        start_lba,
        paths.len()
    );

    for path in paths {
        let mut volume = match source.open(&path) {
            Ok(volume) => volume,
            Err(e) => {
                debug!("Skipping volume {}: {}", path, e);
                continue;
            }
        };
        let info = match volume.query() {
            Ok(info) => info,
            Err(e) => {
                debug!("Skipping volume {}: {}", path, e);
                continue;
            }
        };

        if !info.device_class.is_disk_like()
            || info.device_number != device_number
            || info.start_lba != start_lba
        {
            continue;
        }

        info!(
            "Volume {} is disk {} partition at sector {}, dismounting",
            path, device_number, start_lba
        );
        if let Err(e) = volume.dismount() {
            warn!("Dismount of {} failed: {}", path, e);
            return Err(DiskError::LockFailed(format!("dismount {}: {}", path, e)));
        }

        return Ok(LockedVolume {
            volume: Some(Box::new(volume)),
            path,
            device_number,
            start_lba,
        });
    }

    Err(DiskError::NotFound(format!(
        "volume for disk {} partition at sector {}",
        device_number, start_lba
    )))
}

/// Lock through the platform's volume enumeration
pub fn lock(device_number: u32, start_lba: u64) -> Result<LockedVolume> {
    lock_with(&mut PlatformVolumes::connect()?, device_number, start_lba)
}

/// Scripted volume sources for unit tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    pub struct Events(Rc<RefCell<Vec<String>>>);

    impl Events {
        pub fn push(&self, event: String) {
            self.0.borrow_mut().push(event);
        }

        pub fn all(&self) -> Vec<String> {
            self.0.borrow().clone()
        }
    }

    pub struct FakeVolume {
        path: String,
        info: Option<VolumeDeviceInfo>,
        dismount_ok: bool,
        events: Rc<RefCell<Vec<String>>>,
    }

    impl OpenVolume for FakeVolume {
        fn path(&self) -> &str {
            &self.path
        }

        fn query(&mut self) -> Result<VolumeDeviceInfo> {
            self.info
                .ok_or_else(|| DiskError::Unsupported(format!("query {}", self.path)))
        }

        fn dismount(&mut self) -> Result<()> {
            self.events.borrow_mut().push(format!("dismount {}", self.path));
            if self.dismount_ok {
                Ok(())
            } else {
                Err(DiskError::AccessDenied(self.path.clone()))
            }
        }
    }

    impl Drop for FakeVolume {
        fn drop(&mut self) {
            self.events.borrow_mut().push(format!("close {}", self.path));
        }
    }

    pub struct FakeSource {
        pub volumes: Vec<(String, Option<VolumeDeviceInfo>, bool)>,
        pub events: Events,
    }

    impl VolumeSource for FakeSource {
        type Volume = FakeVolume;

        fn volume_paths(&mut self) -> Result<Vec<String>> {
            Ok(self.volumes.iter().map(|(p, _, _)| p.clone()).collect())
        }

        fn open(&mut self, path: &str) -> Result<FakeVolume> {
            if path == "unopenable" {
                return Err(DiskError::AccessDenied(path.to_string()));
            }
            let (_, info, dismount_ok) = self
                .volumes
                .iter()
                .find(|(p, _, _)| p == path)
                .cloned()
                .ok_or_else(|| DiskError::NotFound(path.to_string()))?;
            self.events.push(format!("open {}", path));
            Ok(FakeVolume {
                path: path.to_string(),
                info,
                dismount_ok,
                events: self.events.0.clone(),
            })
        }
    }

    pub fn disk(number: u32, start: u64) -> Option<VolumeDeviceInfo> {
        Some(VolumeDeviceInfo {
            device_class: DeviceClass::Disk,
            device_number: number,
            start_lba: start,
        })
    }

    pub fn source(volumes: Vec<(&str, Option<VolumeDeviceInfo>, bool)>) -> FakeSource {
        FakeSource {
            volumes: volumes
                .into_iter()
                .map(|(p, i, d)| (p.to_string(), i, d))
                .collect(),
            events: Events::default(),
        }
    }
}
