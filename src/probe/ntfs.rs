// Size lookup for the NTFS $Boot metadata file
//
// $Boot is MFT record 7. Its unnamed $DATA attribute spans the boot sector
// plus the loader area that follows it, which is the space a boot record
// payload may occupy.

use crate::disk::BlockDevice;
use crate::error::{DiskError, Result};
use tracing::debug;

const BOOT_FILE_RECORD: u64 = 7;

const ATTR_DATA: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;

fn le_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

fn le_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn le_u64(raw: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(b)
}

fn malformed(what: impl Into<String>) -> DiskError {
    DiskError::BadSignature(format!("NTFS: {}", what.into()))
}

/// Geometry taken from the NTFS boot sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsGeometry {
    pub bytes_per_sector: u64,
    pub cluster_size: u64,
    pub mft_lcn: u64,
    pub record_size: u64,
}

impl NtfsGeometry {
    pub fn parse(vbr: &[u8; 512]) -> Result<Self> {
        let bytes_per_sector = le_u16(vbr, 0x0B) as u64;
        if !bytes_per_sector.is_power_of_two() || !(256..=4096).contains(&bytes_per_sector) {
            return Err(malformed(format!("bytes per sector {}", bytes_per_sector)));
        }

        // Values above 0x80 encode the cluster size as a negative power of two
        let spc = match vbr[0x0D] {
            0 => return Err(malformed("zero sectors per cluster")),
            raw if raw > 0x80 => 1u64 << (256 - raw as u32).min(31),
            raw => raw as u64,
        };
        let cluster_size = bytes_per_sector * spc;

        let record_size = match vbr[0x40] as i8 {
            0 => return Err(malformed("zero MFT record size")),
            n if n < 0 => 1u64 << (-(n as i32)).min(31),
            n => n as u64 * cluster_size,
        };
        if !(256..=65536).contains(&record_size) || record_size % bytes_per_sector != 0 {
            return Err(malformed(format!("MFT record size {}", record_size)));
        }

        Ok(NtfsGeometry {
            bytes_per_sector,
            cluster_size,
            mft_lcn: le_u64(vbr, 0x30),
            record_size,
        })
    }
}

/// Undo the update sequence protection of a multi-sector record in place
fn apply_fixups(record: &mut [u8], bytes_per_sector: usize) -> Result<()> {
    let usa_offset = le_u16(record, 0x04) as usize;
    let usa_count = le_u16(record, 0x06) as usize;
    if usa_count == 0 || usa_offset + usa_count * 2 > record.len() {
        return Err(malformed("update sequence array out of range"));
    }

    let seq = [record[usa_offset], record[usa_offset + 1]];
    for i in 1..usa_count {
        let end = i * bytes_per_sector;
        if end > record.len() {
            break;
        }
        if record[end - 2..end] != seq {
            return Err(malformed(format!("torn record at stride {}", i)));
        }
        let fix = usa_offset + i * 2;
        let (a, b) = (record[fix], record[fix + 1]);
        record[end - 2] = a;
        record[end - 1] = b;
    }
    Ok(())
}

/// Real size of the unnamed $DATA attribute in a fixed-up file record
fn data_size(record: &[u8]) -> Result<u64> {
    let mut offset = le_u16(record, 0x14) as usize;

    loop {
        if offset + 8 > record.len() {
            return Err(malformed("attribute list runs past the record"));
        }
        let type_code = le_u32(record, offset);
        if type_code == ATTR_END {
            return Err(DiskError::NotFound("NTFS $Boot has no $DATA attribute".to_string()));
        }

        let length = le_u32(record, offset + 4) as usize;
        if length == 0 || offset + length > record.len() {
            return Err(malformed(format!("attribute length {} at {}", length, offset)));
        }

        let non_resident = record[offset + 8] != 0;
        let name_length = record[offset + 9];
        if type_code == ATTR_DATA && name_length == 0 {
            let size = if non_resident {
                if length < 0x38 {
                    return Err(malformed("short non-resident header"));
                }
                le_u64(record, offset + 0x30)
            } else {
                if length < 0x18 {
                    return Err(malformed("short resident header"));
                }
                le_u32(record, offset + 0x10) as u64
            };
            return Ok(size);
        }

        offset += length;
    }
}

/// Byte size of `/$Boot` on an NTFS volume
pub fn boot_file_size<D: BlockDevice + ?Sized>(dev: &mut D) -> Result<u64> {
    let vbr = dev.read_sector(0)?;
    let geometry = NtfsGeometry::parse(&vbr)?;

    let record_offset = geometry
        .mft_lcn
        .checked_mul(geometry.cluster_size)
        .and_then(|mft| mft.checked_add(BOOT_FILE_RECORD * geometry.record_size))
        .ok_or_else(|| malformed("MFT location overflows"))?;
    debug!(
        "NTFS: reading $Boot record at byte {} ({:?})",
        record_offset, geometry
    );

    let mut record = vec![0u8; geometry.record_size as usize];
    dev.read_bytes(0, record_offset, &mut record)?;
    if &record[0..4] != b"FILE" {
        return Err(malformed("$Boot record has no FILE signature"));
    }
    apply_fixups(&mut record, geometry.bytes_per_sector as usize)?;

    let size = data_size(&record)?;
    debug!("NTFS: $Boot is {} bytes", size);
    Ok(size)
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::disk::testing::MemDisk;

    /// Lay out a minimal NTFS volume: boot sector, MFT at cluster 4 with
    /// 1 KiB records, and a $Boot record whose $DATA is `boot_size` bytes.
    pub fn volume(disk: &mut MemDisk, boot_size: u64) {
        let vbr = disk.sector_mut(0);
        vbr[0] = 0xEB;
        vbr[1] = 0x52;
        vbr[2] = 0x90;
        vbr[3..11].copy_from_slice(b"NTFS    ");
        vbr[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        vbr[0x0D] = 8;
        vbr[0x30..0x38].copy_from_slice(&4u64.to_le_bytes());
        vbr[0x40] = 0xF6; // -10: 1024-byte records
        vbr[0x1FE] = 0x55;
        vbr[0x1FF] = 0xAA;

        // cluster 4 = byte 16384, record 7 = +7 KiB
        let at = 16384 + 7 * 1024;
        let record = &mut disk.data[at..at + 1024];
        record[0..4].copy_from_slice(b"FILE");
        record[0x04..0x06].copy_from_slice(&0x30u16.to_le_bytes());
        record[0x06..0x08].copy_from_slice(&3u16.to_le_bytes());
        record[0x14..0x16].copy_from_slice(&0x38u16.to_le_bytes());
        record[0x16] = 0x01;

        // update sequence number 0x0001, original tail bytes zero
        record[0x30] = 0x01;
        record[510] = 0x01;
        record[1022] = 0x01;

        // $STANDARD_INFORMATION stub, resident, 0x60 long
        let si = 0x38;
        record[si..si + 4].copy_from_slice(&0x10u32.to_le_bytes());
        record[si + 4..si + 8].copy_from_slice(&0x60u32.to_le_bytes());

        // unnamed non-resident $DATA
        let data = si + 0x60;
        record[data..data + 4].copy_from_slice(&0x80u32.to_le_bytes());
        record[data + 4..data + 8].copy_from_slice(&0x48u32.to_le_bytes());
        record[data + 8] = 1;
        record[data + 0x30..data + 0x38].copy_from_slice(&boot_size.to_le_bytes());

        let end = data + 0x48;
        record[end..end + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    }
}
