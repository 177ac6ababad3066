// MBR entry editor
//
// Direct edits of the four primary entries in sector 0. These touch only the
// partition table, so no volume is locked.

use crate::disk::BlockDevice;
use crate::error::{DiskError, Result};
use crate::table::mbr::{ACTIVE_FLAG, ENTRY_COUNT, MbrSector};
use tracing::{debug, info, warn};

/// Read sector 0 and check its boot signature
fn read_mbr<D: BlockDevice + ?Sized>(disk: &mut D) -> Result<MbrSector> {
    let mbr = MbrSector::read(disk, 0)?;
    if !mbr.has_signature() {
        return Err(DiskError::BadSignature(format!(
            "sector 0 of {} ends in {:04X}, not AA55",
            disk.identity(),
            mbr.signature()
        )));
    }
    Ok(mbr)
}

/// Zero-based slot of a one-based entry index
fn slot(index: u32) -> Result<usize> {
    if index == 0 || index as usize > ENTRY_COUNT {
        return Err(DiskError::InvalidIndex(format!(
            "MBR entry {} (valid entries are 1 to {})",
            index, ENTRY_COUNT
        )));
    }
    Ok(index as usize - 1)
}

fn write_mbr<D: BlockDevice + ?Sized>(disk: &mut D, mbr: &MbrSector) -> Result<()> {
    disk.write_sectors(0, mbr.as_bytes())?;
    debug!("wrote MBR of {}", disk.identity());
    Ok(())
}

/// Type byte of entry `index` (1 to 4)
pub fn get_type<D: BlockDevice + ?Sized>(disk: &mut D, index: u32) -> Result<u8> {
    let mbr = read_mbr(disk)?;
    let type_id = mbr.entry(slot(index)?).type_id;
    debug!("{} entry {} has type 0x{:02X}", disk.identity(), index, type_id);
    Ok(type_id)
}

pub fn set_type<D: BlockDevice + ?Sized>(disk: &mut D, index: u32, type_id: u8) -> Result<()> {
    let mut mbr = read_mbr(disk)?;
    let slot = slot(index)?;

    let mut entry = mbr.entry(slot);
    info!(
        "{} entry {}: type 0x{:02X} -> 0x{:02X}",
        disk.identity(),
        index,
        entry.type_id,
        type_id
    );
    entry.type_id = type_id;
    mbr.set_entry(slot, &entry);
    write_mbr(disk, &mbr)
}

/// Mark entry `index` active and clear the flag on the other three
pub fn set_active<D: BlockDevice + ?Sized>(disk: &mut D, index: u32) -> Result<()> {
    let mut mbr = read_mbr(disk)?;
    let active = slot(index)?;

    for s in 0..ENTRY_COUNT {
        let mut entry = mbr.entry(s);
        entry.flag = if s == active { ACTIVE_FLAG } else { 0 };
        mbr.set_entry(s, &entry);
    }
    info!("{}: entry {} is now active", disk.identity(), index);
    write_mbr(disk, &mbr)
}

/// Exchange two entries byte for byte.
///
/// Afterwards cached views of the disk are dropped and its buffers flushed;
/// failures of those two steps are only logged.
pub fn swap<D: BlockDevice + ?Sized>(disk: &mut D, a: u32, b: u32) -> Result<()> {
    if a == b {
        return Err(DiskError::InvalidArgument(format!(
            "cannot swap entry {} with itself",
            a
        )));
    }
    let mut mbr = read_mbr(disk)?;
    let (sa, sb) = (slot(a)?, slot(b)?);

    let (ea, eb) = (mbr.entry_bytes(sa), mbr.entry_bytes(sb));
    mbr.set_entry_bytes(sa, &eb);
    mbr.set_entry_bytes(sb, &ea);
    info!("{}: swapping entries {} and {}", disk.identity(), a, b);
    write_mbr(disk, &mbr)?;

    if let Err(e) = disk.invalidate_cache() {
        warn!("cache invalidation after swap failed: {}", e);
    }
    if let Err(e) = disk.flush() {
        warn!("flush after swap failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testing::MemDisk;

    fn disk_with_entries() -> MemDisk {
        let mut disk = MemDisk::new(16);
        let s = disk.sector_mut(0);
        for (slot, type_id) in [(0usize, 0x0Cu8), (1, 0x07), (3, 0x83)] {
            let at = 0x1BE + slot * 16;
            s[at] = if slot == 1 { 0x80 } else { 0 };
            s[at + 4] = type_id;
            s[at + 8] = slot as u8 + 1;
            s[at + 12] = 2;
        }
        s[0x1FE] = 0x55;
        s[0x1FF] = 0xAA;
        disk
    }

    #[test]
    fn test_get_and_set_type() {
        let mut disk = disk_with_entries();
        assert_eq!(get_type(&mut disk, 1).unwrap(), 0x0C);
        assert_eq!(get_type(&mut disk, 3).unwrap(), 0x00);

        set_type(&mut disk, 1, 0x07).unwrap();
        assert_eq!(get_type(&mut disk, 1).unwrap(), 0x07);
        // a type of 0xFF is an ordinary value
        set_type(&mut disk, 4, 0xFF).unwrap();
        assert_eq!(get_type(&mut disk, 4).unwrap(), 0xFF);
    }

    #[test]
    fn test_index_and_signature_checks() {
        let mut disk = disk_with_entries();
        assert!(matches!(get_type(&mut disk, 0), Err(DiskError::InvalidIndex(_))));
        assert!(matches!(set_type(&mut disk, 5, 1), Err(DiskError::InvalidIndex(_))));
        assert!(disk.writes.is_empty());

        let mut blank = MemDisk::new(16);
        assert!(matches!(get_type(&mut blank, 1), Err(DiskError::BadSignature(_))));
        assert!(matches!(set_active(&mut blank, 1), Err(DiskError::BadSignature(_))));
        assert!(blank.writes.is_empty());
    }

    #[test]
    fn test_set_active_leaves_one_flag() {
        let mut disk = disk_with_entries();
        disk.sector_mut(0)[0x1BE + 3 * 16] = 0x80;
        set_active(&mut disk, 3).unwrap();

        let mbr = MbrSector::read(&mut disk, 0).unwrap();
        let flags: Vec<u8> = mbr.entries().iter().map(|e| e.flag).collect();
        assert_eq!(flags, vec![0, 0, 0x80, 0]);
    }

    #[test]
    fn test_swap_twice_restores_entries() {
        let mut disk = disk_with_entries();
        let original = disk.sector(0).to_vec();

        swap(&mut disk, 1, 4).unwrap();
        assert_eq!(get_type(&mut disk, 1).unwrap(), 0x83);
        assert_eq!(get_type(&mut disk, 4).unwrap(), 0x0C);
        assert_eq!(disk.sector(0)[0x1BE + 8], 4);

        swap(&mut disk, 1, 4).unwrap();
        assert_eq!(disk.sector(0), &original[..]);
    }

    #[test]
    fn test_swap_rejects_same_entry() {
        let mut disk = disk_with_entries();
        assert!(matches!(swap(&mut disk, 2, 2), Err(DiskError::InvalidArgument(_))));
        assert!(matches!(swap(&mut disk, 2, 7), Err(DiskError::InvalidIndex(_))));
        assert!(disk.writes.is_empty());
    }
}
