// MBR and partition boot record installers
//
// Every check (filesystem, layout, reserved sectors, payload length, device
// size) runs before the first write. Writes are issued in order and stop at
// the first failure; sectors already written stay written.

use super::{
    JUMP_SIZE, MbrLoader, PayloadStore, PbrLoader, exfat, mbr_layout, pbr_layout,
};
use crate::disk::{BlockDevice, SECTOR_SIZE};
use crate::error::{DiskError, Result};
use crate::probe::{self, FsKind};
use crate::table::{self, TableFormat};
use serde::Serialize;
use tracing::{debug, info};

/// Start of the disk signature and partition table inside sector 0
const TABLE_AREA_START: usize = 0x1B8;
/// Start of the boot signature, the end of the preserved area
const TABLE_AREA_END: usize = 0x1FE;

/// One write issued by an installer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteRegion {
    pub sector: u64,
    pub offset: u64,
    pub len: usize,
}

/// What to put in the MBR
#[derive(Debug, Clone, Copy)]
pub enum MbrSource<'a> {
    Loader(MbrLoader),
    /// A caller-supplied boot sector image. With `keep_table` the disk's
    /// signature and partition entries replace bytes 0x1B8..0x1FE of the
    /// image before it is written.
    Image { bytes: &'a [u8], keep_table: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct MbrReport {
    pub payload: String,
    pub writes: Vec<WriteRegion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PbrReport {
    pub loader: PbrLoader,
    pub fs: FsKind,
    pub reserved_sectors: Option<u64>,
    pub payload: String,
    pub exfat_checksum: Option<u32>,
    pub writes: Vec<WriteRegion>,
}

fn write_region<D: BlockDevice + ?Sized>(
    dev: &mut D,
    writes: &mut Vec<WriteRegion>,
    sector: u64,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    debug!(
        "writing {} bytes at sector {} offset 0x{:X}",
        data.len(),
        sector,
        offset
    );
    dev.write_bytes(sector, offset, data)?;
    writes.push(WriteRegion {
        sector,
        offset,
        len: data.len(),
    });
    Ok(())
}

fn ensure_fits<D: BlockDevice + ?Sized>(dev: &D, bytes: u64, what: &str) -> Result<()> {
    let sectors = bytes.div_ceil(SECTOR_SIZE as u64);
    if sectors > dev.total_sectors() {
        return Err(DiskError::InvalidArgument(format!(
            "{} needs {} sectors but {} has {}",
            what,
            sectors,
            dev.identity(),
            dev.total_sectors()
        )));
    }
    Ok(())
}

/// Write boot code to the MBR of a whole disk
pub fn install_mbr<D: BlockDevice + ?Sized>(
    disk: &mut D,
    source: MbrSource<'_>,
    store: &PayloadStore,
) -> Result<MbrReport> {
    let mut writes = Vec::new();

    match source {
        MbrSource::Loader(loader) => {
            let layout = mbr_layout(loader);
            let format = if loader == MbrLoader::Syslinux {
                let format = table::probe_format(&mut *disk)?;
                info!("{} carries a {} partition map", disk.identity(), format);
                format
            } else {
                TableFormat::Mbr
            };

            let payload = store.mbr(loader, format)?;
            if payload.len() < layout.min_len {
                return Err(DiskError::InvalidArgument(format!(
                    "{} is {} bytes, {} needs at least {}",
                    payload.name,
                    payload.len(),
                    loader,
                    layout.min_len
                )));
            }
            let head = &payload.bytes[..layout.head_len.unwrap_or(payload.len())];
            let tail = layout.tail_from.map(|from| &payload.bytes[from..]);
            ensure_fits(
                disk,
                (head.len() + tail.map_or(0, |t| t.len() + SECTOR_SIZE)) as u64,
                &payload.name,
            )?;

            info!("Installing {} MBR on {}", loader, disk.identity());
            write_region(disk, &mut writes, 0, 0, head)?;
            if let Some(tail) = tail {
                write_region(disk, &mut writes, 1, 0, tail)?;
            }
            Ok(MbrReport {
                payload: payload.name,
                writes,
            })
        }
        MbrSource::Image { bytes, keep_table } => {
            if bytes.is_empty() {
                return Err(DiskError::InvalidArgument(
                    "boot sector image is empty".to_string(),
                ));
            }
            ensure_fits(disk, bytes.len() as u64, "boot sector image")?;

            let mut image = bytes.to_vec();
            let keep_end = TABLE_AREA_END.min(image.len());
            if keep_table && keep_end > TABLE_AREA_START {
                let current = disk.read_sector(0)?;
                image[TABLE_AREA_START..keep_end]
                    .copy_from_slice(&current[TABLE_AREA_START..keep_end]);
                debug!(
                    "kept bytes 0x{:X}..0x{:X} of the current MBR",
                    TABLE_AREA_START, keep_end
                );
            }

            info!(
                "Writing {}-byte boot sector image to {}",
                image.len(),
                disk.identity()
            );
            write_region(disk, &mut writes, 0, 0, &image)?;
            Ok(MbrReport {
                payload: "image".to_string(),
                writes,
            })
        }
    }
}

/// Install a boot record into the partition `part` exposes.
///
/// The filesystem is probed to pick the layout. The jump instruction is
/// written first, then the body past the BPB, then the loader stamp, and on
/// exFAT the boot region checksum last.
pub fn install_pbr<D: BlockDevice + ?Sized>(
    part: &mut D,
    loader: PbrLoader,
    store: &PayloadStore,
) -> Result<PbrReport> {
    let fs = probe::probe(&mut *part)?;
    info!("{} partition on {}", fs, part.identity());

    let layout = pbr_layout(loader, fs).ok_or_else(|| {
        DiskError::UnsupportedLayout(format!("no {} boot record for {}", loader, fs))
    })?;

    let reserved_sectors = if layout.min_reserved > 0 {
        let reserved = probe::reserved_sectors(&mut *part, fs);
        if reserved < layout.min_reserved {
            return Err(DiskError::UnsupportedLayout(format!(
                "{} boot record on {} needs {} reserved sectors, found {}",
                loader, fs, layout.min_reserved, reserved
            )));
        }
        Some(reserved)
    } else {
        None
    };

    let payload = store.pbr(layout)?;
    ensure_fits(
        part,
        layout.sectors_needed() * SECTOR_SIZE as u64,
        &payload.name,
    )?;

    info!(
        "Installing {} boot record ({}) on {}",
        loader,
        payload.name,
        part.identity()
    );
    let mut writes = Vec::new();
    write_region(part, &mut writes, 0, 0, &payload.bytes[..JUMP_SIZE])?;
    write_region(
        part,
        &mut writes,
        0,
        layout.body_start as u64,
        &payload.bytes[layout.body_start..layout.payload_len],
    )?;
    if let Some((offset, stamp)) = layout.stamp {
        write_region(part, &mut writes, 0, offset, stamp)?;
    }

    let exfat_checksum = if layout.exfat_checksum {
        let checksum = exfat::write_boot_checksum(&mut *part)?;
        writes.push(WriteRegion {
            sector: exfat::CHECKSUM_SECTOR,
            offset: 0,
            len: SECTOR_SIZE,
        });
        writes.push(WriteRegion {
            sector: exfat::BACKUP_REGION_START,
            offset: 0,
            len: (exfat::BOOT_REGION_SECTORS + 1) as usize * SECTOR_SIZE,
        });
        Some(checksum)
    } else {
        None
    };

    Ok(PbrReport {
        loader,
        fs,
        reserved_sectors,
        payload: payload.name,
        exfat_checksum,
        writes,
    })
}
