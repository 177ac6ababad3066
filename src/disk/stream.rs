// Sector driver contract and the byte stream the FAT driver consumes
//
// `SectorDriver` is the status/read/write/control surface a filesystem driver
// sees. `SectorStream` puts `Read + Write + Seek` on top of it, doing
// read-modify-write for byte ranges that do not cover whole sectors.

use super::{BlockDevice, SECTOR_SIZE};
use crate::error::{DiskError, Result};
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{debug, trace};

/// Reported erase block size, in sectors
const BLOCK_SIZE_SECTORS: u32 = 8;

/// Largest transfer the stream issues in one driver call
const MAX_CHUNK_SECTORS: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStatus {
    Ready,
    NotReady,
}

/// Control requests of the driver boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlQuery {
    Sync,
    SectorCount,
    SectorSize,
    BlockSize,
    Trim { start: u64, end: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Done,
    SectorCount(u64),
    SectorSize(u16),
    BlockSize(u32),
}

/// Sector-level driver over a block device
#[derive(Debug)]
pub struct SectorDriver<D> {
    device: Option<D>,
}

impl<D: BlockDevice> SectorDriver<D> {
    pub fn new(device: D) -> Self {
        SectorDriver {
            device: Some(device),
        }
    }

    pub fn status(&self) -> DriveStatus {
        match self.device {
            Some(_) => DriveStatus::Ready,
            None => DriveStatus::NotReady,
        }
    }

    /// Take the device back; the driver reports `NotReady` afterwards
    pub fn detach(&mut self) -> Option<D> {
        self.device.take()
    }

    fn device_mut(&mut self) -> Result<&mut D> {
        self.device
            .as_mut()
            .ok_or_else(|| DiskError::NotFound("sector driver has no device attached".to_string()))
    }

    pub fn read(&mut self, sector: u64, count: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count as usize * SECTOR_SIZE];
        self.read_into(sector, &mut buf)?;
        Ok(buf)
    }

    pub fn read_into(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        trace!("driver read: {} bytes at sector {}", buf.len(), sector);
        self.device_mut()?.read_sectors(sector, buf)
    }

    pub fn write(&mut self, sector: u64, count: u32, data: &[u8]) -> Result<()> {
        if data.len() != count as usize * SECTOR_SIZE {
            return Err(DiskError::InvalidArgument(format!(
                "driver write of {} sectors given {} bytes",
                count,
                data.len()
            )));
        }
        trace!("driver write: {} sectors at sector {}", count, sector);
        self.device_mut()?.write_sectors(sector, data)
    }

    pub fn ioctl(&mut self, query: ControlQuery) -> Result<ControlReply> {
        let device = self.device_mut()?;
        match query {
            ControlQuery::Sync => {
                device.flush()?;
                Ok(ControlReply::Done)
            }
            ControlQuery::SectorCount => Ok(ControlReply::SectorCount(device.total_sectors())),
            ControlQuery::SectorSize => Ok(ControlReply::SectorSize(SECTOR_SIZE as u16)),
            ControlQuery::BlockSize => Ok(ControlReply::BlockSize(BLOCK_SIZE_SECTORS)),
            ControlQuery::Trim { start, end } => {
                debug!("ignoring trim of sectors {}..={}", start, end);
                Ok(ControlReply::Done)
            }
        }
    }
}

/// Byte stream over a block device for consumers that want `Read + Write + Seek`
#[derive(Debug)]
pub struct SectorStream<D> {
    driver: SectorDriver<D>,
    // Current position in bytes
    pos: u64,
    // Device size in bytes
    len: u64,
}

impl<D: BlockDevice> SectorStream<D> {
    pub fn new(device: D) -> Self {
        let len = device.total_sectors() * SECTOR_SIZE as u64;
        SectorStream {
            driver: SectorDriver::new(device),
            pos: 0,
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn driver_mut(&mut self) -> &mut SectorDriver<D> {
        &mut self.driver
    }

    /// Give back the underlying device
    pub fn into_inner(mut self) -> Option<D> {
        self.driver.detach()
    }

    // Sector span of the next transfer: first sector, byte offset into it,
    // bytes to move and sectors touched.
    fn span(&self, want: usize) -> (u64, usize, usize, u64) {
        let first = self.pos / SECTOR_SIZE as u64;
        let skip = (self.pos % SECTOR_SIZE as u64) as usize;
        let max_bytes = (MAX_CHUNK_SECTORS as usize * SECTOR_SIZE) - skip;
        let remaining = (self.len - self.pos) as usize;
        let n = want.min(max_bytes).min(remaining);
        let count = (skip + n).div_ceil(SECTOR_SIZE) as u64;
        (first, skip, n, count)
    }
}

impl<D: BlockDevice> Read for SectorStream<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let (first, skip, n, count) = self.span(buf.len());

        let mut scratch = vec![0u8; count as usize * SECTOR_SIZE];
        self.driver.read_into(first, &mut scratch)?;
        buf[..n].copy_from_slice(&scratch[skip..skip + n]);

        self.pos += n as u64;
        Ok(n)
    }
}

impl<D: BlockDevice> Write for SectorStream<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let (first, skip, n, count) = self.span(buf.len());
        let mut scratch = vec![0u8; count as usize * SECTOR_SIZE];

        // Read back the sectors the write only partly covers
        let tail = (skip + n) % SECTOR_SIZE;
        if skip != 0 {
            self.driver.read_into(first, &mut scratch[..SECTOR_SIZE])?;
        }
        if tail != 0 && (count > 1 || skip == 0) {
            let at = (count as usize - 1) * SECTOR_SIZE;
            self.driver.read_into(first + count - 1, &mut scratch[at..])?;
        }

        scratch[skip..skip + n].copy_from_slice(&buf[..n]);
        self.driver.write(first, count as u32, &scratch)?;

        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.driver.ioctl(ControlQuery::Sync)?;
        Ok(())
    }
}

impl<D: BlockDevice> Seek for SectorStream<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testing::MemDisk;

    #[test]
    fn test_driver_control_queries() {
        let mut driver = SectorDriver::new(MemDisk::new(32));
        assert_eq!(driver.status(), DriveStatus::Ready);
        assert_eq!(
            driver.ioctl(ControlQuery::SectorCount).unwrap(),
            ControlReply::SectorCount(32)
        );
        assert_eq!(
            driver.ioctl(ControlQuery::SectorSize).unwrap(),
            ControlReply::SectorSize(512)
        );
        assert_eq!(
            driver.ioctl(ControlQuery::BlockSize).unwrap(),
            ControlReply::BlockSize(8)
        );
        assert_eq!(
            driver.ioctl(ControlQuery::Trim { start: 0, end: 7 }).unwrap(),
            ControlReply::Done
        );

        assert!(driver.read(31, 2).is_err());
        assert!(driver.write(0, 2, &[0u8; 512]).is_err());

        driver.detach();
        assert_eq!(driver.status(), DriveStatus::NotReady);
        assert!(driver.read(0, 1).is_err());
    }

    #[test]
    fn test_stream_unaligned_write_preserves_neighbours() {
        let mut disk = MemDisk::new(4);
        disk.data.iter_mut().for_each(|b| *b = 0x11);

        let mut stream = SectorStream::new(&mut disk);
        stream.seek(SeekFrom::Start(500)).unwrap();
        stream.write_all(&[0x22; 30]).unwrap();

        stream.seek(SeekFrom::Start(498)).unwrap();
        let mut back = [0u8; 34];
        stream.read_exact(&mut back).unwrap();
        assert_eq!(&back[..2], &[0x11, 0x11]);
        assert!(back[2..32].iter().all(|b| *b == 0x22));
        assert_eq!(&back[32..], &[0x11, 0x11]);
        drop(stream);

        assert_eq!(disk.data[499], 0x11);
        assert_eq!(disk.data[530], 0x11);
    }

    #[test]
    fn test_stream_stops_at_device_end() {
        let mut stream = SectorStream::new(MemDisk::new(1));
        assert_eq!(stream.seek(SeekFrom::End(-2)).unwrap(), 510);
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert!(stream.seek(SeekFrom::Current(-1000)).is_err());
    }
}
