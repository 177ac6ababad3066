// Read-only loopback backend over a flat image file

use super::{BlockDevice, DiskIdentity, PlatformDiskAccess, SECTOR_SIZE, check_transfer};
use crate::error::{DiskError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info};

/// A disk image exposed as a block device.
///
/// Capacity is the file size rounded up to a whole sector. Reads past the end
/// of the file come back zero-filled. Writes are refused.
#[derive(Debug)]
pub struct ImageFile {
    file: File,
    identity: DiskIdentity,
    file_len: u64,
    total_sectors: u64,
}

impl ImageFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let identity = DiskIdentity::Image {
            path: path.to_path_buf(),
        };
        info!("Opening image {}", path.display());

        let mut file =
            File::open(path).map_err(|e| DiskError::io(format!("open {}", identity), e))?;
        // Block devices report a zero metadata length; ask the platform instead
        let file_len = PlatformDiskAccess::size_bytes(&mut file)
            .map_err(|e| DiskError::io(format!("query size of {}", identity), e))?;
        let total_sectors = file_len.div_ceil(SECTOR_SIZE as u64);
        debug!("{}: {} bytes, {} sectors", identity, file_len, total_sectors);

        Ok(ImageFile {
            file,
            identity,
            file_len,
            total_sectors,
        })
    }
}

impl BlockDevice for ImageFile {
    fn identity(&self) -> &DiskIdentity {
        &self.identity
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        check_transfer(&self.identity, self.total_sectors, sector, buf.len(), "read")?;
        let start = sector * SECTOR_SIZE as u64;
        let available = self.file_len.saturating_sub(start).min(buf.len() as u64) as usize;

        if available > 0 {
            self.file
                .seek(SeekFrom::Start(start))
                .and_then(|_| self.file.read_exact(&mut buf[..available]))
                .map_err(|e| DiskError::io(format!("read sector {} of {}", sector, self.identity), e))?;
        }
        buf[available..].fill(0);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, _buf: &[u8]) -> Result<()> {
        Err(DiskError::Unsupported(format!(
            "write to sector {} of {}: image backend is read-only",
            sector, self.identity
        )))
    }
}
