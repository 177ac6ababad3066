// Disk access module with platform abstraction
//
// Every backend (physical drive, raw path, read-only image, partition view)
// implements `BlockDevice`, which addresses storage in 512-byte logical
// sectors. Byte-granular helpers are provided on top of the sector calls.

use crate::error::{DiskError, Result};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

// Platform-specific modules
#[cfg(target_os = "linux")]
mod linux;

#[cfg(windows)]
mod windows;

mod image;
mod partition;
mod physical;
mod stream;

/// Platform-specific disk operations
#[cfg(target_os = "linux")]
pub(crate) use linux::LinuxDiskAccess as PlatformDiskAccess;

#[cfg(windows)]
pub(crate) use windows::WindowsDiskAccess as PlatformDiskAccess;

pub use image::ImageFile;
pub use partition::PartitionDevice;
pub use physical::{DiskInfo, RawDisk, list_disks};
pub use stream::{ControlQuery, ControlReply, DriveStatus, SectorDriver, SectorStream};

/// Logical sector size used for every offset in this crate
pub const SECTOR_SIZE: usize = 512;

/// log2 of `SECTOR_SIZE`
pub const SECTOR_BITS: u32 = 9;

/// Where a block device's data comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DiskIdentity {
    /// An OS disk addressed by its device number
    Physical { number: u32, path: PathBuf },
    /// A disk or image file opened read/write by explicit path
    Raw { path: PathBuf },
    /// A read-only loopback image
    Image { path: PathBuf },
}

impl DiskIdentity {
    /// OS device number, only known for physical disks
    pub fn device_number(&self) -> Option<u32> {
        match self {
            DiskIdentity::Physical { number, .. } => Some(*number),
            _ => None,
        }
    }
}

impl fmt::Display for DiskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskIdentity::Physical { number, path } => {
                write!(f, "disk {} ({})", number, path.display())
            }
            DiskIdentity::Raw { path } => write!(f, "{}", path.display()),
            DiskIdentity::Image { path } => write!(f, "image {}", path.display()),
        }
    }
}

/// Sector-addressable storage.
///
/// Buffers passed to `read_sectors` and `write_sectors` must be a whole number
/// of sectors long; the sector count is implied by the buffer length.
/// Implementations reject any access that reaches past `total_sectors()`.
pub trait BlockDevice {
    fn identity(&self) -> &DiskIdentity;

    fn total_sectors(&self) -> u64;

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()>;

    /// Push buffered writes down to the device
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop any cached view the OS holds of this device's layout
    fn invalidate_cache(&mut self) -> Result<()> {
        Ok(())
    }

    /// Read a single sector
    fn read_sector(&mut self, sector: u64) -> Result<[u8; SECTOR_SIZE]> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_sectors(sector, &mut buf)?;
        Ok(buf)
    }

    /// Read `buf.len()` bytes starting `offset` bytes into `sector`.
    ///
    /// `offset` may be larger than a sector; it is folded into the sector
    /// number first.
    fn read_bytes(&mut self, sector: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let (first, skip) = normalize(sector, offset);
        let count = sectors_spanned(skip, buf.len());
        let mut scratch = vec![0u8; count as usize * SECTOR_SIZE];
        self.read_sectors(first, &mut scratch)?;
        buf.copy_from_slice(&scratch[skip..skip + buf.len()]);
        Ok(())
    }

    /// Write `data` starting `offset` bytes into `sector`.
    ///
    /// Partial head and tail sectors are read back first so the bytes around
    /// the written range are kept.
    fn write_bytes(&mut self, sector: u64, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (first, skip) = normalize(sector, offset);
        let count = sectors_spanned(skip, data.len());
        let mut scratch = vec![0u8; count as usize * SECTOR_SIZE];

        let tail = (skip + data.len()) % SECTOR_SIZE;
        if skip != 0 {
            self.read_sectors(first, &mut scratch[..SECTOR_SIZE])?;
        }
        if tail != 0 && (count > 1 || skip == 0) {
            let last = first + count - 1;
            let at = (count as usize - 1) * SECTOR_SIZE;
            self.read_sectors(last, &mut scratch[at..])?;
        }

        scratch[skip..skip + data.len()].copy_from_slice(data);
        self.write_sectors(first, &scratch)
    }
}

fn normalize(sector: u64, offset: u64) -> (u64, usize) {
    let first = sector + (offset >> SECTOR_BITS);
    let skip = (offset & (SECTOR_SIZE as u64 - 1)) as usize;
    (first, skip)
}

fn sectors_spanned(skip: usize, len: usize) -> u64 {
    (skip + len).div_ceil(SECTOR_SIZE) as u64
}

/// Validate a sector transfer against a device size and return the number of
/// sectors it covers.
pub(crate) fn check_transfer(
    identity: &DiskIdentity,
    total_sectors: u64,
    sector: u64,
    len: usize,
    op: &str,
) -> Result<u64> {
    if len % SECTOR_SIZE != 0 {
        return Err(DiskError::InvalidArgument(format!(
            "{} of {} bytes on {} is not a whole number of sectors",
            op, len, identity
        )));
    }
    let count = (len / SECTOR_SIZE) as u64;
    match sector.checked_add(count) {
        Some(end) if end <= total_sectors => Ok(count),
        _ => Err(DiskError::io(
            format!("{} sector {} (+{}) of {}", op, sector, count, identity),
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("device has {} sectors", total_sectors),
            ),
        )),
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn identity(&self) -> &DiskIdentity {
        (**self).identity()
    }

    fn total_sectors(&self) -> u64 {
        (**self).total_sectors()
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_sectors(sector, buf)
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        (**self).write_sectors(sector, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn invalidate_cache(&mut self) -> Result<()> {
        (**self).invalidate_cache()
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn identity(&self) -> &DiskIdentity {
        (**self).identity()
    }

    fn total_sectors(&self) -> u64 {
        (**self).total_sectors()
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_sectors(sector, buf)
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        (**self).write_sectors(sector, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn invalidate_cache(&mut self) -> Result<()> {
        (**self).invalidate_cache()
    }
}
