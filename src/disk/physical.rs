// Raw disk backend: physical drives by number, or any disk/image by path

use super::{BlockDevice, DiskIdentity, PlatformDiskAccess, SECTOR_SIZE, check_transfer};
use crate::error::{DiskError, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Read/write sector access to a whole disk
#[derive(Debug)]
pub struct RawDisk {
    // Open handle to the disk node or image file
    file: File,

    identity: DiskIdentity,

    // Capacity in 512-byte sectors, fixed at open time
    total_sectors: u64,
}

impl RawDisk {
    /// Open an OS disk by device number
    pub fn open(number: u32) -> Result<Self> {
        let path = PlatformDiskAccess::device_path(number)
            .map_err(|e| DiskError::io(format!("resolve disk {}", number), e))?;
        info!("Opening disk {} at {}", number, path.display());
        Self::open_with_identity(&path, DiskIdentity::Physical { number, path: path.clone() })
    }

    /// Open a disk node or image file by path for in-place editing.
    ///
    /// A path naming a whole OS disk is opened as that disk, so its volumes
    /// get locked like those of a disk opened by number.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let identity = match PlatformDiskAccess::whole_disk_number(path) {
            Some(number) => {
                info!("Opening disk {} at {}", number, path.display());
                DiskIdentity::Physical {
                    number,
                    path: path.to_path_buf(),
                }
            }
            None => {
                info!("Opening raw disk {}", path.display());
                DiskIdentity::Raw {
                    path: path.to_path_buf(),
                }
            }
        };
        Self::open_with_identity(path, identity)
    }

    fn open_with_identity(path: &Path, identity: DiskIdentity) -> Result<Self> {
        let mut file = PlatformDiskAccess::open(path, true)
            .map_err(|e| DiskError::io(format!("open {}", identity), e))?;
        let size = PlatformDiskAccess::size_bytes(&mut file)
            .map_err(|e| DiskError::io(format!("query size of {}", identity), e))?;

        if size % SECTOR_SIZE as u64 != 0 {
            warn!(
                "{} is {} bytes, not a whole number of sectors; trailing bytes are ignored",
                identity, size
            );
        }
        let total_sectors = size / SECTOR_SIZE as u64;
        debug!("{} has {} sectors", identity, total_sectors);

        Ok(RawDisk {
            file,
            identity,
            total_sectors,
        })
    }

    fn seek_to(&mut self, sector: u64, op: &str) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .map(|_| ())
            .map_err(|e| DiskError::io(format!("seek for {} at sector {} of {}", op, sector, self.identity), e))
    }
}

impl BlockDevice for RawDisk {
    fn identity(&self) -> &DiskIdentity {
        &self.identity
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let count = check_transfer(&self.identity, self.total_sectors, sector, buf.len(), "read")?;
        debug!("Reading {} sector(s) at {} from {}", count, sector, self.identity);
        self.seek_to(sector, "read")?;
        self.file
            .read_exact(buf)
            .map_err(|e| DiskError::io(format!("read sector {} of {}", sector, self.identity), e))
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        let count = check_transfer(&self.identity, self.total_sectors, sector, buf.len(), "write")?;
        debug!("Writing {} sector(s) at {} to {}", count, sector, self.identity);
        self.seek_to(sector, "write")?;
        self.file
            .write_all(buf)
            .map_err(|e| DiskError::io(format!("write sector {} of {}", sector, self.identity), e))
    }

    fn flush(&mut self) -> Result<()> {
        debug!("Flushing {}", self.identity);
        self.file
            .sync_all()
            .map_err(|e| DiskError::io(format!("flush {}", self.identity), e))
    }

    fn invalidate_cache(&mut self) -> Result<()> {
        debug!("Invalidating cached layout of {}", self.identity);
        PlatformDiskAccess::invalidate(&self.file)
            .map_err(|e| DiskError::io(format!("invalidate cache of {}", self.identity), e))
    }
}

/// A disk as reported by `list_disks`
#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    pub number: u32,
    pub path: PathBuf,
    pub size: u64,
    pub description: Option<String>,
    pub removable: Option<bool>,
    pub system: Option<bool>,
}

/// Enumerate the disks that `RawDisk::open` can address.
///
/// Numbers and paths come from the platform backend; descriptions and flags
/// are filled in from rs-drivelist where it knows the device.
pub fn list_disks() -> Result<Vec<DiskInfo>> {
    let mut disks = platform_disks()?;

    match rs_drivelist::drive_list() {
        Ok(drives) => {
            debug!("Found {} drives with rs-drivelist", drives.len());
            for drive in drives {
                let device_path = drive
                    .devicePath
                    .as_ref()
                    .map_or_else(|| drive.device.clone(), |p| p.clone());
                let number = PlatformDiskAccess::disk_number(Path::new(&device_path))
                    .or_else(|| PlatformDiskAccess::disk_number(Path::new(&drive.device)));

                if let Some(info) = disks.iter_mut().find(|d| Some(d.number) == number) {
                    info.description = Some(drive.description.clone());
                    info.removable = Some(drive.isRemovable);
                    info.system = Some(drive.isSystem);
                    if info.size == 0 {
                        info.size = drive.size;
                    }
                }
            }
        }
        Err(e) => warn!("rs-drivelist failed, listing without descriptions: {}", e),
    }

    Ok(disks)
}

#[cfg(target_os = "linux")]
fn platform_disks() -> Result<Vec<DiskInfo>> {
    let names = PlatformDiskAccess::disk_names()
        .map_err(|e| DiskError::io("enumerate /sys/block", e))?;
    Ok(names
        .into_iter()
        .enumerate()
        .map(|(number, name)| DiskInfo {
            number: number as u32,
            size: PlatformDiskAccess::sysfs_size_bytes(&name).unwrap_or(0),
            path: Path::new("/dev").join(&name),
            description: None,
            removable: None,
            system: None,
        })
        .collect())
}

#[cfg(windows)]
fn platform_disks() -> Result<Vec<DiskInfo>> {
    let mut disks = Vec::new();
    for number in PlatformDiskAccess::disk_numbers() {
        let path = PlatformDiskAccess::device_path(number)
            .map_err(|e| DiskError::io(format!("resolve disk {}", number), e))?;
        let size = PlatformDiskAccess::open(&path, false)
            .and_then(|mut f| PlatformDiskAccess::size_bytes(&mut f))
            .unwrap_or(0);
        disks.push(DiskInfo {
            number,
            path,
            size,
            description: None,
            removable: None,
            system: None,
        });
    }
    Ok(disks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_disk_read_write_roundtrip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 8 * SECTOR_SIZE]).unwrap();
        tmp.flush().unwrap();

        let mut disk = RawDisk::open_path(tmp.path()).unwrap();
        assert_eq!(disk.total_sectors(), 8);
        assert!(matches!(disk.identity(), DiskIdentity::Raw { .. }));

        let mut data = vec![0x5Au8; 2 * SECTOR_SIZE];
        data[0] = 1;
        disk.write_sectors(6, &data).unwrap();
        disk.flush().unwrap();

        let mut back = vec![0u8; 2 * SECTOR_SIZE];
        disk.read_sectors(6, &mut back).unwrap();
        assert_eq!(back, data);

        assert!(disk.write_sectors(7, &data).is_err());
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = RawDisk::open_path(dir.path().join("absent.img")).unwrap_err();
        assert!(matches!(err, DiskError::NotFound(_)));
    }
}
