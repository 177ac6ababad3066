// Disk context: one opened disk, one selected partition, and the volume lock
// held while the partition is being modified

use crate::disk::{BlockDevice, PartitionDevice, RawDisk};
use crate::error::{DiskError, Result};
use crate::table::{self, PartitionRecord};
use crate::volume::{self, LockedVolume, PlatformVolumes, VolumeSource};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Take the partition's OS volume offline while the context is open
    pub lock_volume: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions { lock_volume: true }
    }
}

/// Caller-owned state for operations on one partition.
///
/// Dropping the context closes the disk first and then releases the lock.
#[derive(Debug)]
pub struct DiskContext<D: BlockDevice = RawDisk> {
    device: PartitionDevice<D>,
    record: PartitionRecord,
    lock: Option<LockedVolume>,
}

impl DiskContext<RawDisk> {
    /// Open partition `partition_number` (one-based) of disk `disk_number`
    pub fn open(disk_number: u32, partition_number: u32, options: OpenOptions) -> Result<Self> {
        let disk = RawDisk::open(disk_number)?;
        Self::open_disk(disk, partition_number, options)
    }
}

impl<D: BlockDevice> DiskContext<D> {
    /// Select a partition of an already opened disk.
    ///
    /// Only physical disks have OS volumes to lock. When no volume matches
    /// the partition it is not mounted, and the context goes on unlocked.
    pub fn open_disk(disk: D, partition_number: u32, options: OpenOptions) -> Result<Self> {
        Self::open_disk_with(disk, partition_number, options, PlatformVolumes::connect)
    }

    /// Like `open_disk`, with the volume source created by `volumes` and only
    /// when a lock is actually taken
    pub fn open_disk_with<S, F>(
        mut disk: D,
        partition_number: u32,
        options: OpenOptions,
        volumes: F,
    ) -> Result<Self>
    where
        S: VolumeSource,
        F: FnOnce() -> Result<S>,
    {
        let record = table::find_partition(&mut disk, partition_number)?;

        let lock = match (options.lock_volume, disk.identity().device_number()) {
            (true, Some(number)) => {
                match volume::lock_with(&mut volumes()?, number, record.start_lba) {
                    Ok(lock) => Some(lock),
                    Err(DiskError::NotFound(what)) => {
                        info!("No mounted volume ({}), continuing without a lock", what);
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
            (true, None) => {
                debug!("{} is not a physical disk, nothing to lock", disk.identity());
                None
            }
            (false, _) => {
                debug!("Volume locking disabled");
                None
            }
        };

        let device = PartitionDevice::new(disk, &record)?;
        info!(
            "{} partition {}: sectors {}..{} ({})",
            device.inner().identity(),
            record.display_number(),
            record.start_lba,
            record.end_lba(),
            record.format
        );
        Ok(DiskContext {
            device,
            record,
            lock,
        })
    }

    /// Partition-scoped device: sector 0 is the partition's first sector
    pub fn device(&mut self) -> &mut PartitionDevice<D> {
        &mut self.device
    }

    /// The whole disk the partition lives on
    pub fn disk(&mut self) -> &mut D {
        self.device.inner_mut()
    }

    pub fn record(&self) -> &PartitionRecord {
        &self.record
    }

    pub fn is_locked(&self) -> bool {
        self.lock.as_ref().is_some_and(|l| l.is_locked())
    }

    /// Flush, close the disk and release the lock
    pub fn close(mut self) -> Result<()> {
        let flushed = self.device.flush();
        let DiskContext { device, lock, .. } = self;
        drop(device);
        if let Some(mut lock) = lock {
            lock.unlock();
        }
        flushed
    }
}
