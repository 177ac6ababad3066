// Partition-scoped view over a whole-disk block device

use super::{BlockDevice, DiskIdentity, check_transfer};
use crate::error::{DiskError, Result};
use crate::table::PartitionRecord;

/// Restricts a disk to one partition: sector 0 of the view is the partition's
/// first sector and transfers may not leave the partition.
#[derive(Debug)]
pub struct PartitionDevice<D> {
    inner: D,
    start: u64,
    len: u64,
}

impl<D: BlockDevice> PartitionDevice<D> {
    /// Bind a view to `record`, which must lie within the disk
    pub fn new(inner: D, record: &PartitionRecord) -> Result<Self> {
        Self::with_range(inner, record.start_lba, record.len_sectors)
    }

    pub fn with_range(inner: D, start: u64, len: u64) -> Result<Self> {
        let end = start.checked_add(len);
        if end.is_none_or(|end| end > inner.total_sectors()) {
            return Err(DiskError::BadTable(format!(
                "partition at {} (+{}) extends past the end of {} ({} sectors)",
                start,
                len,
                inner.identity(),
                inner.total_sectors()
            )));
        }
        Ok(PartitionDevice { inner, start, len })
    }

    pub fn start_lba(&self) -> u64 {
        self.start
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: BlockDevice> BlockDevice for PartitionDevice<D> {
    fn identity(&self) -> &DiskIdentity {
        self.inner.identity()
    }

    fn total_sectors(&self) -> u64 {
        self.len
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        check_transfer(self.inner.identity(), self.len, sector, buf.len(), "partition read")?;
        self.inner.read_sectors(self.start + sector, buf)
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        check_transfer(self.inner.identity(), self.len, sector, buf.len(), "partition write")?;
        self.inner.write_sectors(self.start + sector, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn invalidate_cache(&mut self) -> Result<()> {
        self.inner.invalidate_cache()
    }
}
