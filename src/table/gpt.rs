// GPT header discovery and entry array walker

use super::mbr::MbrSector;
use super::{PartitionKind, PartitionRecord, TableFormat};
use crate::disk::{BlockDevice, SECTOR_SIZE};
use crate::error::{DiskError, Result};
use crc32fast::Hasher;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Header candidates are searched at LBA `1 << shift` for shifts below this,
/// covering logical sector sizes from 512 bytes to 32 KiB.
pub const MAX_SECTOR_SHIFT: u32 = 7;

/// Bytes of an entry that carry data; larger entries are padded
pub const ENTRY_DATA_SIZE: usize = 128;

/// Largest entry array checked against its CRC
pub const MAX_ENTRY_ARRAY_BYTES: u64 = 1 << 20;

const MIN_HEADER_SIZE: usize = 92;

/// Parsed GPT header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub partition_entries_lba: u64,
    pub num_partition_entries: u32,
    pub partition_entry_size: u32,
    pub partition_entry_array_crc32: u32,

    /// log2 of (device logical sector size / 512)
    pub sector_shift: u32,

    /// 512-byte sector the header was found at
    pub header_lba: u64,
}

fn le_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn le_u64(raw: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(b)
}

fn guid_at(raw: &[u8], at: usize) -> Uuid {
    let mut b = [0u8; 16];
    b.copy_from_slice(&raw[at..at + 16]);
    Uuid::from_bytes_le(b)
}

impl GptHeader {
    /// Parse a header sector; returns `None` when the magic does not match
    pub fn parse(raw: &[u8; SECTOR_SIZE], header_lba: u64, sector_shift: u32) -> Option<Self> {
        if raw[0..8] != GPT_SIGNATURE {
            return None;
        }
        Some(GptHeader {
            revision: le_u32(raw, 8),
            header_size: le_u32(raw, 12),
            header_crc32: le_u32(raw, 16),
            current_lba: le_u64(raw, 24),
            backup_lba: le_u64(raw, 32),
            first_usable_lba: le_u64(raw, 40),
            last_usable_lba: le_u64(raw, 48),
            disk_guid: guid_at(raw, 56),
            partition_entries_lba: le_u64(raw, 72),
            num_partition_entries: le_u32(raw, 80),
            partition_entry_size: le_u32(raw, 84),
            partition_entry_array_crc32: le_u32(raw, 88),
            sector_shift,
            header_lba,
        })
    }

    /// CRC32 of the header with its own CRC field zeroed, or `None` if the
    /// recorded header size does not fit in one sector
    pub fn compute_crc32(raw: &[u8; SECTOR_SIZE]) -> Option<u32> {
        let size = le_u32(raw, 12) as usize;
        if !(MIN_HEADER_SIZE..=SECTOR_SIZE).contains(&size) {
            return None;
        }
        let mut header = raw[..size].to_vec();
        header[16..20].fill(0);

        let mut hasher = Hasher::new();
        hasher.update(&header);
        Some(hasher.finalize())
    }

    /// Locate the header by trying each candidate sector-size shift
    pub fn find<D: BlockDevice + ?Sized>(disk: &mut D) -> Result<Self> {
        let mbr = MbrSector::read(&mut *disk, 0)?;
        if !mbr.has_signature() {
            return Err(DiskError::NoGptPartitionMap(format!(
                "no MBR signature on {}",
                disk.identity()
            )));
        }
        if !mbr.is_protective() {
            return Err(DiskError::NoGptPartitionMap(format!(
                "MBR of {} has no protective entry",
                disk.identity()
            )));
        }

        for shift in 0..MAX_SECTOR_SHIFT {
            let lba = 1u64 << shift;
            let raw = disk.read_sector(lba)?;
            let Some(header) = GptHeader::parse(&raw, lba, shift) else {
                trace!("no GPT magic at sector {}", lba);
                continue;
            };

            debug!(
                "GPT header at sector {} (shift {}): {} entries of {} bytes at LBA {}",
                lba,
                shift,
                header.num_partition_entries,
                header.partition_entry_size,
                header.partition_entries_lba
            );
            match GptHeader::compute_crc32(&raw) {
                Some(crc) if crc != header.header_crc32 => warn!(
                    "GPT header CRC mismatch on {}: stored {:08X}, computed {:08X}",
                    disk.identity(),
                    header.header_crc32,
                    crc
                ),
                None => warn!(
                    "GPT header on {} has unusable size {}; CRC not checked",
                    disk.identity(),
                    header.header_size
                ),
                _ => {}
            }
            return Ok(header);
        }

        Err(DiskError::BadTable(format!(
            "no valid GPT header on {}",
            disk.identity()
        )))
    }

    /// First sector of the entry array in 512-byte units
    pub fn entries_start(&self) -> u64 {
        self.partition_entries_lba << self.sector_shift
    }

    /// Whether the stored entry array CRC matches the array on disk
    pub fn entries_crc_matches<D: BlockDevice + ?Sized>(&self, disk: &mut D) -> Result<bool> {
        let len = self.num_partition_entries as u64 * self.partition_entry_size as u64;
        let disk_bytes = disk.total_sectors().saturating_mul(SECTOR_SIZE as u64);
        if len > MAX_ENTRY_ARRAY_BYTES || len > disk_bytes {
            return Err(DiskError::BadTable(format!(
                "GPT entry array of {} bytes on {} is too large",
                len,
                disk.identity()
            )));
        }
        let mut array = vec![0u8; len as usize];
        disk.read_bytes(self.entries_start(), 0, &mut array)?;

        let mut hasher = Hasher::new();
        hasher.update(&array);
        Ok(hasher.finalize() == self.partition_entry_array_crc32)
    }
}

/// One decoded entry of the partition array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    pub fn parse(raw: &[u8; ENTRY_DATA_SIZE]) -> Self {
        let units: Vec<u16> = raw[56..128]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();
        GptEntry {
            type_guid: guid_at(raw, 0),
            unique_guid: guid_at(raw, 16),
            first_lba: le_u64(raw, 32),
            last_lba: le_u64(raw, 40),
            attributes: le_u64(raw, 48),
            name: String::from_utf16_lossy(&units),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.type_guid.is_nil()
    }
}

struct Cursor {
    header: GptHeader,
    // Entry index
    i: u32,
    // Sector and byte offset of the next entry
    entries: u64,
    last_offset: u64,
}

/// Lazy walk over the non-empty entries of a GPT.
///
/// The header is located on the first call to `next`.
pub struct GptPartitions<'a, D: BlockDevice + ?Sized> {
    disk: &'a mut D,
    cursor: Option<Cursor>,
    done: bool,
}

impl<'a, D: BlockDevice + ?Sized> GptPartitions<'a, D> {
    pub fn new(disk: &'a mut D) -> Self {
        GptPartitions {
            disk,
            cursor: None,
            done: false,
        }
    }

    fn start(&mut self) -> Result<Cursor> {
        let header = GptHeader::find(&mut *self.disk)?;
        let entry_size = header.partition_entry_size as usize;
        if entry_size < ENTRY_DATA_SIZE || entry_size % 8 != 0 {
            return Err(DiskError::BadTable(format!(
                "GPT entry size {} on {} is not usable",
                entry_size,
                self.disk.identity()
            )));
        }
        Ok(Cursor {
            entries: header.entries_start(),
            last_offset: 0,
            i: 0,
            header,
        })
    }

    fn step(&mut self) -> Result<Option<PartitionRecord>> {
        loop {
            if self.cursor.is_none() {
                let c = self.start()?;
                self.cursor = Some(c);
            }
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(None);
            };
            if cursor.i >= cursor.header.num_partition_entries {
                return Ok(None);
            }

            let (i, lba, offset) = (cursor.i, cursor.entries, cursor.last_offset);
            let shift = cursor.header.sector_shift;

            cursor.i += 1;
            cursor.last_offset += cursor.header.partition_entry_size as u64;
            if cursor.last_offset == SECTOR_SIZE as u64 {
                cursor.last_offset = 0;
                cursor.entries += 1;
            }

            let mut raw = [0u8; ENTRY_DATA_SIZE];
            self.disk.read_bytes(lba, offset, &mut raw)?;
            let entry = GptEntry::parse(&raw);
            if entry.is_empty() {
                continue;
            }

            if entry.last_lba < entry.first_lba {
                return Err(DiskError::BadTable(format!(
                    "GPT entry {} on {} ends at {} before its start {}",
                    i,
                    self.disk.identity(),
                    entry.last_lba,
                    entry.first_lba
                )));
            }
            let start = entry.first_lba << shift;
            let len = (entry.last_lba - entry.first_lba).saturating_add(1) << shift;
            debug!("GPT entry {}: start={}, length={}", i, start, len);

            return Ok(Some(PartitionRecord {
                format: TableFormat::Gpt,
                number: i,
                index: i,
                start_lba: start,
                len_sectors: len,
                table_lba: lba + offset / SECTOR_SIZE as u64,
                entry_offset: (offset % SECTOR_SIZE as u64) as u32,
                kind: PartitionKind::Gpt {
                    type_guid: entry.type_guid,
                    unique_guid: entry.unique_guid,
                    attributes: entry.attributes,
                    name: entry.name,
                },
            }));
        }
    }

    /// Header of the table, once iteration has started
    pub fn header(&self) -> Option<&GptHeader> {
        self.cursor.as_ref().map(|c| &c.header)
    }
}

impl<D: BlockDevice + ?Sized> Iterator for GptPartitions<'_, D> {
    type Item = Result<PartitionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing;
    use super::*;
    use crate::disk::testing::MemDisk;

    #[test]
    fn test_entries_skip_empty_slots() {
        let mut disk = MemDisk::new(64);
        testing::protective_mbr(&mut disk);
        testing::header(&mut disk, 0, 8);
        testing::entry(&mut disk, 2, 0, 34, 43);
        testing::entry(&mut disk, 2, 5, 44, 63);

        let parts = GptPartitions::new(&mut disk)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].number, 0);
        assert_eq!(parts[0].start_lba, 34);
        assert_eq!(parts[0].len_sectors, 10);
        assert_eq!(parts[1].number, 5);
        assert_eq!(parts[1].table_lba, 3);
        assert_eq!(parts[1].entry_offset, 128);
        match &parts[1].kind {
            PartitionKind::Gpt { name, type_guid, .. } => {
                assert_eq!(name, "data");
                assert_eq!(
                    type_guid.to_string(),
                    "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7"
                );
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_header_found_at_shifted_sector() {
        let mut disk = MemDisk::new(256);
        testing::protective_mbr(&mut disk);
        // 4096-byte logical sectors: header at 512-byte LBA 8, array at 2 << 3
        testing::header(&mut disk, 3, 4);
        testing::entry(&mut disk, 16, 0, 6, 9);

        let mut iter = GptPartitions::new(&mut disk);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(iter.header().map(|h| h.sector_shift), Some(3));
        assert_eq!(first.start_lba, 48);
        assert_eq!(first.len_sectors, 32);
    }

    #[test]
    fn test_non_gpt_disk_reports_no_map() {
        let mut disk = MemDisk::new(8);
        disk.sector_mut(0)[0x1FE] = 0x55;
        disk.sector_mut(0)[0x1FF] = 0xAA;
        disk.sector_mut(0)[0x1BE + 4] = 0x0C;

        let mut iter = GptPartitions::new(&mut disk);
        assert!(matches!(iter.next(), Some(Err(DiskError::NoGptPartitionMap(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_missing_header_is_bad_table() {
        let mut disk = MemDisk::new(128);
        testing::protective_mbr(&mut disk);
        let result = GptPartitions::new(&mut disk).next();
        assert!(matches!(result, Some(Err(DiskError::BadTable(_)))));
    }

    #[test]
    fn test_inverted_entry_is_bad_table() {
        let mut disk = MemDisk::new(64);
        testing::protective_mbr(&mut disk);
        testing::header(&mut disk, 0, 4);
        testing::entry(&mut disk, 2, 0, 40, 10);

        let mut iter = GptPartitions::new(&mut disk);
        assert!(matches!(iter.next(), Some(Err(DiskError::BadTable(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_oversized_entry_array_not_read() {
        let mut disk = MemDisk::new(64);
        testing::protective_mbr(&mut disk);
        testing::header(&mut disk, 0, u32::MAX);
        let raw = disk.read_sector(1).unwrap();
        let header = GptHeader::parse(&raw, 1, 0).unwrap();
        assert!(matches!(
            header.entries_crc_matches(&mut disk),
            Err(DiskError::BadTable(_))
        ));
    }

    #[test]
    fn test_entry_array_crc_checked() {
        let mut disk = MemDisk::new(64);
        testing::protective_mbr(&mut disk);
        testing::header(&mut disk, 0, 4);
        let raw = disk.read_sector(1).unwrap();
        let header = GptHeader::parse(&raw, 1, 0).unwrap();
        // stored CRC is zero, a zeroed 512-byte array hashes to something else
        assert!(!header.entries_crc_matches(&mut disk).unwrap());
    }

    #[test]
    fn test_header_crc_roundtrip() {
        let mut disk = MemDisk::new(8);
        testing::protective_mbr(&mut disk);
        testing::header(&mut disk, 0, 0);
        let raw = disk.read_sector(1).unwrap();
        let header = GptHeader::parse(&raw, 1, 0).unwrap();
        assert_eq!(GptHeader::compute_crc32(&raw), Some(header.header_crc32));
    }
}
