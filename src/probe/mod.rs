// Filesystem type detection for partition boot records

use crate::disk::{BlockDevice, SectorStream};
use crate::error::Result;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

pub mod ntfs;

const NTFS_OEM: &[u8; 8] = b"NTFS    ";
const EXFAT_OEM: &[u8; 8] = b"EXFAT   ";

/// Offset of the FAT BPB reserved sector count (u16)
const FAT_RESERVED_OFFSET: usize = 0x0E;

/// Offset of the exFAT FatOffset field (u32), the sectors ahead of the first FAT
const EXFAT_RESERVED_OFFSET: usize = 0x50;

/// Reserved sectors assumed for NTFS when $Boot cannot be read
pub const NTFS_FALLBACK_RESERVED: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Ntfs,
    Fat12,
    Fat16,
    Fat32,
    ExFat,
    Unknown,
}

impl FsKind {
    pub fn name(&self) -> &'static str {
        match self {
            FsKind::Ntfs => "ntfs",
            FsKind::Fat12 => "fat12",
            FsKind::Fat16 => "fat16",
            FsKind::Fat32 => "fat32",
            FsKind::ExFat => "exfat",
            FsKind::Unknown => "unknown",
        }
    }

    pub fn is_fat(&self) -> bool {
        matches!(self, FsKind::Fat12 | FsKind::Fat16 | FsKind::Fat32)
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identify the filesystem on a partition.
///
/// NTFS and exFAT are recognized by their OEM name. Anything else is handed
/// to the FAT driver, whose mount tells FAT12, FAT16 and FAT32 apart. Only a
/// failure to read the boot sector is an error.
pub fn probe<D: BlockDevice + ?Sized>(dev: &mut D) -> Result<FsKind> {
    let vbr = dev.read_sector(0)?;

    if &vbr[3..11] == NTFS_OEM {
        debug!("{}: NTFS signature", dev.identity());
        return Ok(FsKind::Ntfs);
    }
    if &vbr[3..11] == EXFAT_OEM {
        debug!("{}: exFAT signature", dev.identity());
        return Ok(FsKind::ExFat);
    }

    let stream = SectorStream::new(&mut *dev);
    let kind = match fatfs::FileSystem::new(stream, fatfs::FsOptions::new()) {
        Ok(fs) => match fs.fat_type() {
            fatfs::FatType::Fat12 => FsKind::Fat12,
            fatfs::FatType::Fat16 => FsKind::Fat16,
            fatfs::FatType::Fat32 => FsKind::Fat32,
        },
        Err(e) => {
            debug!("FAT driver declined: {}", e);
            FsKind::Unknown
        }
    };
    debug!("{}: probed as {}", dev.identity(), kind);
    Ok(kind)
}

/// Sectors in front of the filesystem's metadata that boot code may use.
///
/// Advisory only: read failures give 0, and an unreadable NTFS $Boot gives
/// `NTFS_FALLBACK_RESERVED`.
pub fn reserved_sectors<D: BlockDevice + ?Sized>(dev: &mut D, fs: FsKind) -> u64 {
    let vbr = match dev.read_sector(0) {
        Ok(vbr) => vbr,
        Err(e) => {
            warn!("cannot read boot sector for reserved count: {}", e);
            return 0;
        }
    };

    let reserved = match fs {
        FsKind::Fat12 | FsKind::Fat16 | FsKind::Fat32 => {
            u16::from_le_bytes([vbr[FAT_RESERVED_OFFSET], vbr[FAT_RESERVED_OFFSET + 1]]) as u64
        }
        FsKind::ExFat => {
            let at = EXFAT_RESERVED_OFFSET;
            u32::from_le_bytes([vbr[at], vbr[at + 1], vbr[at + 2], vbr[at + 3]]) as u64
        }
        FsKind::Ntfs => match ntfs::boot_file_size(dev) {
            Ok(size) => size >> crate::disk::SECTOR_BITS,
            Err(e) => {
                warn!(
                    "cannot size NTFS $Boot ({}), assuming {} reserved sectors",
                    e, NTFS_FALLBACK_RESERVED
                );
                NTFS_FALLBACK_RESERVED
            }
        },
        FsKind::Unknown => 0,
    };
    debug!("{}: {} reserved sectors", fs, reserved);
    reserved
}
