// MBR sector layout and the extended-partition chain walker

use super::{PartitionKind, PartitionRecord, TableFormat};
use crate::disk::{BlockDevice, SECTOR_SIZE};
use crate::error::{DiskError, Result};
use tracing::{debug, trace};

/// Offset of the 32-bit disk signature
pub const DISK_SIGNATURE_OFFSET: usize = 0x1B8;

/// Offset of the first of the four partition entries
pub const ENTRY_TABLE_OFFSET: usize = 0x1BE;

pub const ENTRY_SIZE: usize = 16;

pub const ENTRY_COUNT: usize = 4;

/// Offset of the 0xAA55 boot signature
pub const SIGNATURE_OFFSET: usize = 0x1FE;

pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// Partition type marking a protective MBR in front of a GPT
pub const TYPE_GPT_PROTECTIVE: u8 = 0xEE;

pub const TYPE_EMPTY: u8 = 0x00;

pub const ACTIVE_FLAG: u8 = 0x80;

/// One 16-byte partition entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbrEntry {
    pub flag: u8,
    pub start_chs: [u8; 3],
    pub type_id: u8,
    pub end_chs: [u8; 3],
    /// First sector, relative to the table sector holding this entry
    pub start_lba: u32,
    pub sectors: u32,
}

impl MbrEntry {
    pub fn parse(raw: &[u8]) -> Self {
        MbrEntry {
            flag: raw[0],
            start_chs: [raw[1], raw[2], raw[3]],
            type_id: raw[4],
            end_chs: [raw[5], raw[6], raw[7]],
            start_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            sectors: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = self.flag;
        raw[1..4].copy_from_slice(&self.start_chs);
        raw[4] = self.type_id;
        raw[5..8].copy_from_slice(&self.end_chs);
        raw[8..12].copy_from_slice(&self.start_lba.to_le_bytes());
        raw[12..16].copy_from_slice(&self.sectors.to_le_bytes());
        raw
    }

    pub fn is_empty(&self) -> bool {
        self.type_id == TYPE_EMPTY
    }

    /// DOS, Windows 95 (LBA) and Linux extended containers
    pub fn is_extended(&self) -> bool {
        matches!(self.type_id, 0x05 | 0x0F | 0x85)
    }

    pub fn is_active(&self) -> bool {
        self.flag & ACTIVE_FLAG != 0
    }
}

/// A raw 512-byte MBR or EBR sector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbrSector {
    bytes: [u8; SECTOR_SIZE],
}

impl MbrSector {
    pub fn from_bytes(bytes: [u8; SECTOR_SIZE]) -> Self {
        MbrSector { bytes }
    }

    pub fn read<D: BlockDevice + ?Sized>(disk: &mut D, lba: u64) -> Result<Self> {
        Ok(MbrSector {
            bytes: disk.read_sector(lba)?,
        })
    }

    pub fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.bytes
    }

    pub fn signature(&self) -> u16 {
        u16::from_le_bytes([self.bytes[SIGNATURE_OFFSET], self.bytes[SIGNATURE_OFFSET + 1]])
    }

    pub fn has_signature(&self) -> bool {
        self.signature() == BOOT_SIGNATURE
    }

    pub fn disk_signature(&self) -> u32 {
        let at = DISK_SIGNATURE_OFFSET;
        u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ])
    }

    /// Entry at zero-based `slot`; panics if `slot` is not below 4
    pub fn entry(&self, slot: usize) -> MbrEntry {
        let at = ENTRY_TABLE_OFFSET + slot * ENTRY_SIZE;
        MbrEntry::parse(&self.bytes[at..at + ENTRY_SIZE])
    }

    pub fn entries(&self) -> [MbrEntry; ENTRY_COUNT] {
        [self.entry(0), self.entry(1), self.entry(2), self.entry(3)]
    }

    pub fn set_entry(&mut self, slot: usize, entry: &MbrEntry) {
        let at = ENTRY_TABLE_OFFSET + slot * ENTRY_SIZE;
        self.bytes[at..at + ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
    }

    /// Raw bytes of one entry, for byte-exact swaps
    pub fn entry_bytes(&self, slot: usize) -> [u8; ENTRY_SIZE] {
        let at = ENTRY_TABLE_OFFSET + slot * ENTRY_SIZE;
        let mut raw = [0u8; ENTRY_SIZE];
        raw.copy_from_slice(&self.bytes[at..at + ENTRY_SIZE]);
        raw
    }

    pub fn set_entry_bytes(&mut self, slot: usize, raw: &[u8; ENTRY_SIZE]) {
        let at = ENTRY_TABLE_OFFSET + slot * ENTRY_SIZE;
        self.bytes[at..at + ENTRY_SIZE].copy_from_slice(raw);
    }

    pub fn is_protective(&self) -> bool {
        self.entries().iter().any(|e| e.type_id == TYPE_GPT_PROTECTIVE)
    }
}

// Table sector being walked and the next slot to look at
struct LoadedTable {
    sector: MbrSector,
    slot: usize,
}

/// Lazy walk over the primary table and the extended-partition chain.
///
/// Primary slots are numbered 0..=3 whether or not they hold a partition;
/// logical partitions continue from 4. The chain walk keeps a checkpoint at
/// every power-of-two table count, so a cyclic chain is caught within at most
/// a few laps.
pub struct MbrPartitions<'a, D: BlockDevice + ?Sized> {
    disk: &'a mut D,
    // Current table sector
    offset: u64,
    // First sector of the outermost extended partition, 0 until seen
    ext_offset: u64,
    // Number of tables visited so far
    labeln: u64,
    // Table sector saved at the last power-of-two visit count
    lastaddr: u64,
    number: i64,
    table: Option<LoadedTable>,
    done: bool,
}

impl<'a, D: BlockDevice + ?Sized> MbrPartitions<'a, D> {
    pub fn new(disk: &'a mut D) -> Self {
        MbrPartitions {
            disk,
            offset: 0,
            ext_offset: 0,
            labeln: 0,
            lastaddr: u64::MAX,
            number: -1,
            table: None,
            done: false,
        }
    }

    fn load_table(&mut self) -> Result<LoadedTable> {
        let sector = MbrSector::read(&mut *self.disk, self.offset)?;
        trace!("MBR table at sector {}", self.offset);

        if self.offset == 0 && sector.is_protective() {
            return Err(DiskError::IsGptDisk(format!(
                "{} has a protective MBR",
                self.disk.identity()
            )));
        }

        if self.labeln != 0 && self.lastaddr == self.offset {
            return Err(DiskError::LoopDetected(format!(
                "extended chain of {} revisits sector {}",
                self.disk.identity(),
                self.offset
            )));
        }
        self.labeln += 1;
        if self.labeln.is_power_of_two() {
            self.lastaddr = self.offset;
        }

        if !sector.has_signature() {
            return Err(DiskError::BadTable(format!(
                "no 0xAA55 signature in table sector {} of {}",
                self.offset,
                self.disk.identity()
            )));
        }
        if let Some(bad) = sector.entries().iter().find(|e| e.flag & 0x7F != 0) {
            return Err(DiskError::BadTable(format!(
                "bad boot flag 0x{:02X} in table sector {} of {}",
                bad.flag,
                self.offset,
                self.disk.identity()
            )));
        }

        Ok(LoadedTable { sector, slot: 0 })
    }

    fn record(&self, slot: usize, entry: &MbrEntry) -> PartitionRecord {
        PartitionRecord {
            format: TableFormat::Mbr,
            number: self.number as u32,
            index: slot as u32,
            start_lba: self.offset + entry.start_lba as u64,
            len_sectors: entry.sectors as u64,
            table_lba: self.offset,
            entry_offset: (ENTRY_TABLE_OFFSET + slot * ENTRY_SIZE) as u32,
            kind: PartitionKind::Mbr {
                type_id: entry.type_id,
                active: entry.is_active(),
            },
        }
    }
}

impl<D: BlockDevice + ?Sized> Iterator for MbrPartitions<'_, D> {
    type Item = Result<PartitionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let Some(mut table) = self.table.take() else {
                match self.load_table() {
                    Ok(table) => self.table = Some(table),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
                continue;
            };

            while table.slot < ENTRY_COUNT {
                let slot = table.slot;
                let entry = table.sector.entry(slot);
                table.slot += 1;

                if !entry.is_empty() && !entry.is_extended() {
                    self.number += 1;
                    let record = self.record(slot, &entry);
                    debug!(
                        "partition {}: slot {}, type 0x{:02X}, start {}, len {}",
                        record.number, slot, entry.type_id, record.start_lba, record.len_sectors
                    );
                    self.table = Some(table);
                    return Some(Ok(record));
                } else if self.number < 3 {
                    self.number += 1;
                }
            }

            match table.sector.entries().iter().find(|e| e.is_extended()) {
                Some(ext) => {
                    self.offset = self.ext_offset + ext.start_lba as u64;
                    if self.ext_offset == 0 {
                        self.ext_offset = self.offset;
                    }
                }
                None => self.done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testing::MemDisk;

    fn put_entry(disk: &mut MemDisk, lba: u64, slot: usize, type_id: u8, start: u32, len: u32) {
        let sector = disk.sector_mut(lba);
        sector[SIGNATURE_OFFSET] = 0x55;
        sector[SIGNATURE_OFFSET + 1] = 0xAA;
        let entry = MbrEntry {
            type_id,
            start_lba: start,
            sectors: len,
            ..Default::default()
        };
        let at = ENTRY_TABLE_OFFSET + slot * ENTRY_SIZE;
        sector[at..at + ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
    }

    #[test]
    fn test_primary_and_logical_numbering() {
        let mut disk = MemDisk::new(256);
        put_entry(&mut disk, 0, 0, 0x0C, 8, 16);
        put_entry(&mut disk, 0, 1, 0x0F, 100, 100);
        // first EBR at 100: logical at 100+4, link to next EBR at 100+50
        put_entry(&mut disk, 100, 0, 0x83, 4, 10);
        put_entry(&mut disk, 100, 1, 0x05, 50, 40);
        put_entry(&mut disk, 150, 0, 0x07, 2, 20);

        let parts: Vec<_> = MbrPartitions::new(&mut disk)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(parts.len(), 3);

        assert_eq!(parts[0].number, 0);
        assert_eq!(parts[0].start_lba, 8);
        assert_eq!(parts[1].number, 4);
        assert_eq!(parts[1].start_lba, 104);
        assert_eq!(parts[1].table_lba, 100);
        assert_eq!(parts[2].number, 5);
        assert_eq!(parts[2].start_lba, 152);
        assert_eq!(parts[2].len_sectors, 20);
    }

    #[test]
    fn test_cyclic_chain_is_detected() {
        let mut disk = MemDisk::new(256);
        put_entry(&mut disk, 0, 0, 0x0F, 100, 100);
        put_entry(&mut disk, 100, 0, 0x83, 1, 10);
        // the link points back at the first EBR
        put_entry(&mut disk, 100, 1, 0x05, 0, 100);

        let result = MbrPartitions::new(&mut disk).collect::<Result<Vec<_>>>();
        assert!(matches!(result, Err(DiskError::LoopDetected(_))));
    }

    #[test]
    fn test_protective_mbr_reports_gpt() {
        let mut disk = MemDisk::new(8);
        put_entry(&mut disk, 0, 0, TYPE_GPT_PROTECTIVE, 1, 7);
        let mut iter = MbrPartitions::new(&mut disk);
        assert!(matches!(iter.next(), Some(Err(DiskError::IsGptDisk(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_missing_signature_and_bad_flag() {
        let mut disk = MemDisk::new(8);
        let result = MbrPartitions::new(&mut disk).next();
        assert!(matches!(result, Some(Err(DiskError::BadTable(_)))));

        put_entry(&mut disk, 0, 0, 0x0C, 1, 7);
        disk.sector_mut(0)[ENTRY_TABLE_OFFSET] = 0x81;
        let result = MbrPartitions::new(&mut disk).next();
        assert!(matches!(result, Some(Err(DiskError::BadTable(_)))));
    }
}
