// Linux volumes: block objects published by UDisks2, unmounted and then
// reopened exclusively through the daemon

use super::{DeviceClass, OpenVolume, VolumeDeviceInfo, VolumeSource};
use crate::disk::{PlatformDiskAccess, SECTOR_SIZE};
use crate::error::{DiskError, Result};
use libc::{O_CLOEXEC, O_EXCL, O_SYNC};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt::Display;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};
use udisks2::zbus::zvariant::OwnedObjectPath;
use udisks2::{Client, zbus};

fn udisks_error<E: Display>(context: impl Into<String>) -> impl FnOnce(E) -> DiskError {
    let context = context.into();
    move |e| DiskError::LockFailed(format!("{}: {}", context, e))
}

/// Block device node from the NUL-terminated byte string UDisks2 reports
fn device_node(raw: &[u8]) -> PathBuf {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    PathBuf::from(OsStr::from_bytes(&raw[..end]))
}

// The D-Bus calls are driven to completion one at a time on a
// current-thread runtime owned by the source
struct Session {
    runtime: Runtime,
    client: Client,
}

impl Session {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

pub struct UdisksVolumes {
    session: Rc<Session>,
}

impl UdisksVolumes {
    /// Connect to the UDisks2 daemon on the system bus
    pub fn connect() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DiskError::io("start D-Bus executor", e))?;
        let client = runtime
            .block_on(Client::new())
            .map_err(udisks_error("connect to UDisks2"))?;
        debug!("Connected to UDisks2");
        Ok(UdisksVolumes {
            session: Rc::new(Session { runtime, client }),
        })
    }
}

impl VolumeSource for UdisksVolumes {
    type Volume = UdisksVolume;

    /// Object paths of every block device the daemon manages
    fn volume_paths(&mut self) -> Result<Vec<String>> {
        let session = &self.session;
        let objects = session
            .block_on(session.client.manager().get_block_devices(HashMap::default()))
            .map_err(udisks_error("list block devices"))?;
        Ok(objects.iter().map(|o| o.as_str().to_string()).collect())
    }

    fn open(&mut self, path: &str) -> Result<UdisksVolume> {
        let object = OwnedObjectPath::try_from(path.to_string())
            .map_err(|e| DiskError::InvalidArgument(format!("object path {}: {}", path, e)))?;
        Ok(UdisksVolume {
            session: Rc::clone(&self.session),
            object,
            path: path.to_string(),
            exclusive: None,
        })
    }
}

/// A block object; holds a descriptor opened with `O_EXCL` once dismounted
pub struct UdisksVolume {
    session: Rc<Session>,
    object: OwnedObjectPath,
    path: String,
    exclusive: Option<File>,
}

impl UdisksVolume {
    /// Node of the whole disk and the partition's byte offset on it.
    /// A filesystem written straight onto a disk sits at offset zero.
    async fn placement(&self) -> Result<(PathBuf, u64)> {
        let client = &self.session.client;
        let object = client
            .object(self.object.clone())
            .map_err(udisks_error(format!("object {}", self.path)))?;

        let Ok(partition) = object.partition().await else {
            let block = object
                .block()
                .await
                .map_err(udisks_error(format!("block {}", self.path)))?;
            let device = block
                .device()
                .await
                .map_err(udisks_error(format!("device of {}", self.path)))?;
            return Ok((device_node(&device), 0));
        };

        let offset = partition
            .offset()
            .await
            .map_err(udisks_error(format!("offset of {}", self.path)))?;
        let table = partition
            .table()
            .await
            .map_err(udisks_error(format!("table of {}", self.path)))?;
        let disk = client
            .object(table)
            .map_err(udisks_error(format!("disk of {}", self.path)))?
            .block()
            .await
            .map_err(udisks_error(format!("disk of {}", self.path)))?;
        let device = disk
            .device()
            .await
            .map_err(udisks_error(format!("disk device of {}", self.path)))?;
        Ok((device_node(&device), offset))
    }

    async fn unmount_and_open(&self) -> Result<File> {
        let client = &self.session.client;
        let object = client
            .object(self.object.clone())
            .map_err(udisks_error(format!("object {}", self.path)))?;

        if let Ok(filesystem) = object.filesystem().await {
            let mount_points = filesystem
                .mount_points()
                .await
                .map_err(udisks_error(format!("mount points of {}", self.path)))?;
            if !mount_points.is_empty() {
                info!("Unmounting {} ({} mount points)", self.path, mount_points.len());
                filesystem
                    .unmount(HashMap::new())
                    .await
                    .map_err(udisks_error(format!("unmount {}", self.path)))?;
            }
        }

        // The kernel refuses O_EXCL on a block device while it is mounted
        let block = object
            .block()
            .await
            .map_err(udisks_error(format!("block {}", self.path)))?;
        let owned_fd = block
            .open_device(
                "rw",
                [("flags", zbus::zvariant::Value::from(O_EXCL | O_SYNC | O_CLOEXEC))]
                    .into_iter()
                    .collect(),
            )
            .await
            .map_err(udisks_error(format!("open {} exclusively", self.path)))?;
        match owned_fd.into() {
            zbus::zvariant::Fd::Owned(fd) => Ok(File::from(fd)),
            _ => Err(DiskError::LockFailed(format!(
                "{} returned a borrowed descriptor",
                self.path
            ))),
        }
    }
}

impl OpenVolume for UdisksVolume {
    fn path(&self) -> &str {
        &self.path
    }

    fn query(&mut self) -> Result<VolumeDeviceInfo> {
        let session = Rc::clone(&self.session);
        let (disk, offset) = session.block_on(self.placement())?;
        let device_number = PlatformDiskAccess::disk_number(&disk)
            .ok_or_else(|| DiskError::NotFound(format!("disk {} of {}", disk.display(), self.path)))?;

        Ok(VolumeDeviceInfo {
            device_class: DeviceClass::Disk,
            device_number,
            start_lba: offset / SECTOR_SIZE as u64,
        })
    }

    fn dismount(&mut self) -> Result<()> {
        let session = Rc::clone(&self.session);
        let file = session.block_on(self.unmount_and_open())?;
        debug!("Holding {} exclusively", self.path);
        self.exclusive = Some(file);
        Ok(())
    }
}
