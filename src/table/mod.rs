// Partition table readers
//
// Both formats are read through lazy iterators that yield one
// `PartitionRecord` per partition and stop at the first error. An iterator is
// single use; reading the table again means creating a new one.

use crate::disk::BlockDevice;
use crate::error::{DiskError, Result};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

pub mod gpt;
pub mod mbr;

pub use gpt::{GptHeader, GptPartitions};
pub use mbr::{MbrEntry, MbrPartitions, MbrSector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableFormat {
    Mbr,
    Gpt,
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableFormat::Mbr => write!(f, "msdos"),
            TableFormat::Gpt => write!(f, "gpt"),
        }
    }
}

/// Format-specific part of a partition record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PartitionKind {
    Mbr {
        type_id: u8,
        active: bool,
    },
    Gpt {
        type_guid: Uuid,
        unique_guid: Uuid,
        attributes: u64,
        name: String,
    },
}

/// One partition as found in a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionRecord {
    pub format: TableFormat,

    /// Zero-based partition number, see `display_number`
    pub number: u32,

    /// MBR: slot 0..=3 within the containing table sector.
    /// GPT: index in the entry array.
    pub index: u32,

    /// First sector, absolute on the disk
    pub start_lba: u64,

    pub len_sectors: u64,

    /// Sector holding the entry (the MBR or EBR sector, or the GPT array sector)
    pub table_lba: u64,

    /// Byte offset of the entry within `table_lba`
    pub entry_offset: u32,

    pub kind: PartitionKind,
}

impl PartitionRecord {
    /// One-based number used to address the partition
    pub fn display_number(&self) -> u32 {
        self.number + 1
    }

    /// One past the last sector
    pub fn end_lba(&self) -> u64 {
        self.start_lba.saturating_add(self.len_sectors)
    }

    /// Short type label: hex byte for MBR, type GUID for GPT
    pub fn type_label(&self) -> String {
        match &self.kind {
            PartitionKind::Mbr { type_id, .. } => format!("0x{:02X}", type_id),
            PartitionKind::Gpt { type_guid, .. } => type_guid.to_string(),
        }
    }
}

/// Find which partition map a disk carries.
///
/// MBR is tried first. A disk whose MBR reader stops on a protective entry, or
/// fails validation, is tried as GPT.
pub fn probe_format<D: BlockDevice + ?Sized>(disk: &mut D) -> Result<TableFormat> {
    let mbr_result = match MbrPartitions::new(&mut *disk).next() {
        None | Some(Ok(_)) => Ok(()),
        Some(Err(e)) => Err(e),
    };
    let mbr_err = match mbr_result {
        Ok(()) => {
            debug!("{}: msdos partition map", disk.identity());
            return Ok(TableFormat::Mbr);
        }
        Err(e) => e,
    };

    let gpt_result = match GptPartitions::new(&mut *disk).next() {
        None | Some(Ok(_)) => Ok(()),
        Some(Err(e)) => Err(e),
    };
    match gpt_result {
        Ok(()) => {
            debug!("{}: gpt partition map", disk.identity());
            Ok(TableFormat::Gpt)
        }
        Err(gpt_err) => {
            debug!(
                "{}: no partition map (msdos: {}, gpt: {})",
                disk.identity(),
                mbr_err,
                gpt_err
            );
            Err(DiskError::BadTable(format!(
                "no recognizable partition map on {}",
                disk.identity()
            )))
        }
    }
}

/// Read every partition of a disk, MBR first and GPT when the MBR is protective
pub fn read_partitions<D: BlockDevice + ?Sized>(disk: &mut D) -> Result<Vec<PartitionRecord>> {
    let mbr = MbrPartitions::new(&mut *disk).collect::<Result<Vec<_>>>();
    match mbr {
        Err(DiskError::IsGptDisk(reason)) => {
            info!("{}; reading GPT", reason);
            GptPartitions::new(disk).collect()
        }
        other => other,
    }
}

/// Select a partition by its one-based number
pub fn find_partition<D: BlockDevice + ?Sized>(
    disk: &mut D,
    partition_number: u32,
) -> Result<PartitionRecord> {
    if partition_number == 0 {
        return Err(DiskError::InvalidIndex(
            "partition numbers start at 1".to_string(),
        ));
    }

    let identity = disk.identity().clone();
    read_partitions(disk)?
        .into_iter()
        .find(|p| p.display_number() == partition_number)
        .ok_or_else(|| {
            DiskError::NotFound(format!("partition {} on {}", partition_number, identity))
        })
}
