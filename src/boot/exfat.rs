// exFAT boot region checksum

use crate::disk::{BlockDevice, SECTOR_SIZE};
use crate::error::Result;
use tracing::debug;

/// Sectors of the main boot region covered by the checksum
pub const BOOT_REGION_SECTORS: u64 = 11;

/// Sector holding the repeated checksum of the main boot region
pub const CHECKSUM_SECTOR: u64 = 11;

/// First sector of the backup boot region
pub const BACKUP_REGION_START: u64 = 12;

// VolumeFlags (2 bytes) and PercentInUse change at runtime and are excluded
const SKIPPED: [usize; 3] = [0x6A, 0x6B, 0x70];

/// Checksum of the boot region bytes
pub fn boot_checksum(region: &[u8]) -> u32 {
    region
        .iter()
        .enumerate()
        .filter(|(i, _)| !SKIPPED.contains(i))
        .fold(0u32, |sum, (_, b)| sum.rotate_right(1).wrapping_add(*b as u32))
}

/// A checksum sector: the checksum repeated in little-endian order
pub fn checksum_sector(checksum: u32) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];
    for chunk in sector.chunks_exact_mut(4) {
        chunk.copy_from_slice(&checksum.to_le_bytes());
    }
    sector
}

/// Recompute the checksum of sectors 0..11 and refresh the checksum sector
/// and the whole backup region from them
pub fn write_boot_checksum<D: BlockDevice + ?Sized>(dev: &mut D) -> Result<u32> {
    let mut region = vec![0u8; BOOT_REGION_SECTORS as usize * SECTOR_SIZE];
    dev.read_sectors(0, &mut region)?;

    let checksum = boot_checksum(&region);
    let sector = checksum_sector(checksum);
    debug!("exFAT boot checksum {:08X}", checksum);

    dev.write_sectors(CHECKSUM_SECTOR, &sector)?;
    dev.write_sectors(BACKUP_REGION_START, &region)?;
    dev.write_sectors(BACKUP_REGION_START + CHECKSUM_SECTOR, &sector)?;
    Ok(checksum)
}
