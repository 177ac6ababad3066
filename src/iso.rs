// ISO9660 images as a read-only file source, through the iso9660 driver

use crate::disk::{BlockDevice, SectorStream};
use crate::error::{DiskError, Result};
use crate::fat::{self, CopyStats};
use fatfs::{Dir, FileSystem, ReadWriteSeek};
use iso9660::{DirectoryEntry, ISO9660, ISO9660Reader, ISODirectory};
use tracing::{debug, info};

/// ISO9660 logical block size
pub const BLOCK_SIZE: u64 = 2048;

/// Standard identifier of every volume descriptor
pub const DESCRIPTOR_MAGIC: &[u8; 5] = b"CD001";

/// The volume descriptor set starts at this block
const FIRST_DESCRIPTOR_BLOCK: u64 = 16;

pub type IsoImage<D> = ISO9660<SectorStream<D>>;

/// Whether `dev` carries an ISO9660 volume descriptor at block 16
pub fn is_iso9660<D: BlockDevice + ?Sized>(dev: &mut D) -> Result<bool> {
    let at = FIRST_DESCRIPTOR_BLOCK * BLOCK_SIZE + 1;
    let needed = (at + DESCRIPTOR_MAGIC.len() as u64).div_ceil(512);
    if dev.total_sectors() < needed {
        return Ok(false);
    }
    let mut magic = [0u8; 5];
    dev.read_bytes(0, at, &mut magic)?;
    Ok(&magic == DESCRIPTOR_MAGIC)
}

/// Parse the volume descriptors of the image on `dev`
pub fn open<D: BlockDevice>(dev: D) -> Result<IsoImage<D>> {
    let identity = dev.identity().to_string();
    let image = ISO9660::new(SectorStream::new(dev))
        .map_err(|e| DiskError::BadSignature(format!("ISO9660 image {}: {}", identity, e)))?;
    debug!("Opened ISO9660 image {}", identity);
    Ok(image)
}

/// Host name of a directory record: `.` and `..` records have none, the
/// `;1` version and the dot of extensionless names are dropped
fn entry_name(identifier: &str) -> Option<String> {
    if matches!(identifier, "" | "." | ".." | "\0" | "\u{1}") {
        return None;
    }
    let base = identifier.split(';').next().unwrap_or(identifier);
    let base = base.strip_suffix('.').unwrap_or(base);
    (!base.is_empty()).then(|| base.to_string())
}

/// Copy every file and directory of `iso` into the root of `dst`.
/// Existing files of the same name are replaced.
pub fn copy_tree<R: ISO9660Reader, T: ReadWriteSeek>(
    iso: &ISO9660<R>,
    dst: &FileSystem<T>,
) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    copy_dir(&iso.root, &dst.root_dir(), "", &mut stats)?;
    info!(
        "Copied {} files in {} directories ({} bytes) from ISO9660",
        stats.files, stats.dirs, stats.bytes
    );
    Ok(stats)
}

fn copy_dir<R: ISO9660Reader, T: ReadWriteSeek>(
    src: &ISODirectory<R>,
    dst: &Dir<'_, T>,
    prefix: &str,
    stats: &mut CopyStats,
) -> Result<()> {
    for entry in src.contents() {
        let entry = entry
            .map_err(|e| DiskError::BadTable(format!("ISO9660 directory {}/: {}", prefix, e)))?;
        match entry {
            DirectoryEntry::Directory(dir) => {
                let Some(name) = entry_name(&dir.identifier) else {
                    continue;
                };
                let path = format!("{}/{}", prefix, name);
                debug!("[+] {}", path);
                let sub = dst
                    .create_dir(&name)
                    .map_err(|e| DiskError::io(format!("create directory {}", path), e))?;
                stats.dirs += 1;
                copy_dir(&dir, &sub, &path, stats)?;
            }
            DirectoryEntry::File(file) => {
                let Some(name) = entry_name(&file.identifier) else {
                    continue;
                };
                let path = format!("{}/{}", prefix, name);
                let bytes = fat::store_file(dst, &name, &path, &mut file.read())?;
                stats.files += 1;
                stats.bytes += bytes;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testing::MemDisk;

    #[test]
    fn test_entry_names() {
        assert_eq!(entry_name("README.TXT;1").as_deref(), Some("README.TXT"));
        assert_eq!(entry_name("KERNEL.;1").as_deref(), Some("KERNEL"));
        assert_eq!(entry_name("BOOT").as_deref(), Some("BOOT"));
        assert_eq!(entry_name("\0"), None);
        assert_eq!(entry_name("\u{1}"), None);
        assert_eq!(entry_name(".."), None);
    }

    #[test]
    fn test_descriptor_magic_detection() {
        let mut disk = MemDisk::new(80);
        assert!(!is_iso9660(&mut disk).unwrap());

        let at = (FIRST_DESCRIPTOR_BLOCK * BLOCK_SIZE) as usize;
        disk.data[at] = 1;
        disk.data[at + 1..at + 6].copy_from_slice(DESCRIPTOR_MAGIC);
        assert!(is_iso9660(&mut disk).unwrap());

        // too small to reach block 16
        let mut tiny = MemDisk::new(8);
        assert!(!is_iso9660(&mut tiny).unwrap());
    }
}
