// File-level access to FAT partitions through the fatfs driver
//
// The driver sees a partition as a byte stream (`SectorStream`) and does all
// directory and cluster handling itself. Paths use `/` and are relative to
// the volume root.

use crate::disk::{BlockDevice, SectorStream};
use crate::error::{DiskError, Result};
use crate::probe::{self, FsKind};
use fatfs::{Dir, FileSystem, FormatVolumeOptions, FsOptions, ReadWriteSeek};
use serde::Serialize;
use std::io::{self, Read, Write};
use tracing::{debug, info};

pub use fatfs::FatType;

pub type FatVolume<'a, D> = FileSystem<SectorStream<&'a mut D>>;

/// Bytes in a boot sector volume label
pub const LABEL_LEN: usize = 11;

/// Label field of a volume without a label
pub const NO_LABEL: &[u8; LABEL_LEN] = b"NO NAME    ";

// Characters FAT forbids in short names and labels
const LABEL_FORBIDDEN: &[u8] = b"\"*+,./:;<=>?[\\]|";

/// One directory entry as listed by `list_dir`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Totals of a tree copy
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
}

/// Mount the FAT filesystem on `dev`
pub fn mount<D: BlockDevice>(dev: &mut D) -> Result<FatVolume<'_, D>> {
    let identity = dev.identity().to_string();
    let fs = FileSystem::new(SectorStream::new(dev), FsOptions::new())
        .map_err(|e| DiskError::io(format!("mount FAT filesystem on {}", identity), e))?;
    debug!("Mounted {:?} filesystem on {}", fs.fat_type(), identity);
    Ok(fs)
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

fn trimmed(path: &str) -> String {
    components(path).collect::<Vec<_>>().join("/")
}

fn open_dir<'a, T: ReadWriteSeek>(fs: &'a FileSystem<T>, path: &str) -> Result<Dir<'a, T>> {
    let path = trimmed(path);
    let root = fs.root_dir();
    if path.is_empty() {
        return Ok(root);
    }
    root.open_dir(&path)
        .map_err(|e| DiskError::io(format!("open directory /{}", path), e))
}

/// Split a path into its parent directory and last component
fn split_parent(path: &str) -> Option<(String, String)> {
    let mut parts: Vec<&str> = components(path).collect();
    let name = parts.pop()?.to_string();
    Some((parts.join("/"), name))
}

fn is_dot(name: &str) -> bool {
    name == "." || name == ".."
}

/// Entries of a directory, without `.` and `..`
pub fn list_dir<T: ReadWriteSeek>(fs: &FileSystem<T>, path: &str) -> Result<Vec<FileEntry>> {
    let dir = open_dir(fs, path)?;
    let mut entries = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(|e| DiskError::io(format!("list {}", path), e))?;
        let name = entry.file_name();
        if is_dot(&name) {
            continue;
        }
        entries.push(FileEntry {
            is_dir: entry.is_dir(),
            size: if entry.is_dir() { 0 } else { entry.len() },
            name,
        });
    }
    Ok(entries)
}

/// Copy a file's content to `out`, returning the byte count
pub fn read_file<T: ReadWriteSeek, W: Write>(
    fs: &FileSystem<T>,
    path: &str,
    out: &mut W,
) -> Result<u64> {
    let path = trimmed(path);
    let mut file = fs
        .root_dir()
        .open_file(&path)
        .map_err(|e| DiskError::io(format!("open /{}", path), e))?;
    io::copy(&mut file, out).map_err(|e| DiskError::io(format!("read /{}", path), e))
}

/// Create or replace a file with the content of `input`.
/// The parent directory must exist.
pub fn write_file<T: ReadWriteSeek, R: Read>(
    fs: &FileSystem<T>,
    path: &str,
    input: &mut R,
) -> Result<u64> {
    let path = trimmed(path);
    let mut file = fs
        .root_dir()
        .create_file(&path)
        .map_err(|e| DiskError::io(format!("create /{}", path), e))?;
    file.truncate()
        .map_err(|e| DiskError::io(format!("truncate /{}", path), e))?;
    let written =
        io::copy(input, &mut file).map_err(|e| DiskError::io(format!("write /{}", path), e))?;
    file.flush()
        .map_err(|e| DiskError::io(format!("flush /{}", path), e))?;
    debug!("Wrote {} bytes to /{}", written, path);
    Ok(written)
}

/// Create a directory and any missing parents
pub fn make_dir<T: ReadWriteSeek>(fs: &FileSystem<T>, path: &str) -> Result<()> {
    let mut dir = fs.root_dir();
    let mut so_far = String::new();
    for name in components(path) {
        so_far.push('/');
        so_far.push_str(name);
        dir = dir
            .create_dir(name)
            .map_err(|e| DiskError::io(format!("create directory {}", so_far), e))?;
    }
    Ok(())
}

/// Delete a file or an empty directory. With `recursive`, a directory is
/// emptied first. Returns the number of entries removed.
pub fn remove<T: ReadWriteSeek>(fs: &FileSystem<T>, path: &str, recursive: bool) -> Result<u64> {
    let (parent, name) = split_parent(path)
        .ok_or_else(|| DiskError::InvalidArgument("cannot remove the root directory".into()))?;
    let parent_dir = open_dir(fs, &parent)?;
    let full = format!("{}/{}", parent, name);

    let mut removed = 0;
    if recursive {
        if let Ok(dir) = parent_dir.open_dir(&name) {
            removed += empty_dir(&dir, &full)?;
        }
    }
    parent_dir
        .remove(&name)
        .map_err(|e| DiskError::io(format!("remove /{}", trimmed(&full)), e))?;
    info!("Removed /{}", trimmed(&full));
    Ok(removed + 1)
}

fn empty_dir<T: ReadWriteSeek>(dir: &Dir<'_, T>, prefix: &str) -> Result<u64> {
    let mut names = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(|e| DiskError::io(format!("list {}/", prefix), e))?;
        let name = entry.file_name();
        if !is_dot(&name) {
            names.push((name, entry.is_dir()));
        }
    }

    let mut removed = 0;
    for (name, is_dir) in names {
        let path = format!("{}/{}", prefix, name);
        if is_dir {
            let sub = dir
                .open_dir(&name)
                .map_err(|e| DiskError::io(format!("open directory {}", path), e))?;
            removed += empty_dir(&sub, &path)?;
        }
        dir.remove(&name)
            .map_err(|e| DiskError::io(format!("remove {}", path), e))?;
        debug!("[-] {}", path);
        removed += 1;
    }
    Ok(removed)
}

/// Move or rename a file or directory. When `dst` names an existing
/// directory the entry is moved into it under its current name.
pub fn rename<T: ReadWriteSeek>(fs: &FileSystem<T>, src: &str, dst: &str) -> Result<()> {
    let (src_parent, src_name) = split_parent(src)
        .ok_or_else(|| DiskError::InvalidArgument("cannot move the root directory".into()))?;
    let src_dir = open_dir(fs, &src_parent)?;

    let (dst_dir, dst_name) = match open_dir(fs, dst) {
        Ok(dir) => (dir, src_name.clone()),
        Err(_) => {
            let (parent, name) = split_parent(dst)
                .ok_or_else(|| DiskError::InvalidArgument(format!("destination {}", dst)))?;
            (open_dir(fs, &parent)?, name)
        }
    };

    src_dir.rename(&src_name, &dst_dir, &dst_name).map_err(|e| {
        DiskError::io(format!("move /{} to {}", trimmed(src), dst), e)
    })?;
    info!("Moved /{} to {}", trimmed(src), dst);
    Ok(())
}

/// Pad and validate a volume label the way FAT stores it. An empty label
/// is stored as `NO NAME`.
pub fn encode_label(label: &str) -> Result<[u8; LABEL_LEN]> {
    if label.is_empty() {
        return Ok(*NO_LABEL);
    }
    let upper = label.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    if bytes.len() > LABEL_LEN {
        return Err(DiskError::InvalidArgument(format!(
            "label {:?} is longer than {} characters",
            label, LABEL_LEN
        )));
    }
    if let Some(bad) = bytes
        .iter()
        .find(|b| !b.is_ascii() || b.is_ascii_control() || LABEL_FORBIDDEN.contains(b))
    {
        return Err(DiskError::InvalidArgument(format!(
            "label {:?} contains {:?}",
            label, *bad as char
        )));
    }
    let mut field = [b' '; LABEL_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// Parameters of `format`; unset fields are picked by the driver from the
/// volume size
#[derive(Debug, Clone, Default)]
pub struct MkfsOptions {
    pub fat_type: Option<FatType>,
    /// Cluster size in bytes, a power of two from 512 to 64 KiB
    pub cluster_size: Option<u32>,
    pub label: Option<String>,
}

/// Create a fresh FAT filesystem on `dev`
pub fn format<D: BlockDevice>(dev: &mut D, mkfs: &MkfsOptions) -> Result<()> {
    let identity = dev.identity().to_string();
    let mut options = FormatVolumeOptions::new();
    if let Some(fat_type) = mkfs.fat_type {
        options = options.fat_type(fat_type);
    }
    if let Some(size) = mkfs.cluster_size {
        if !size.is_power_of_two() || !(512..=65536).contains(&size) {
            return Err(DiskError::InvalidArgument(format!(
                "cluster size {} is not a power of two between 512 and 65536",
                size
            )));
        }
        options = options.bytes_per_cluster(size);
    }
    if let Some(label) = &mkfs.label {
        options = options.volume_label(encode_label(label)?);
    }
    fatfs::format_volume(SectorStream::new(dev), options)
        .map_err(|e| DiskError::io(format!("format {}", identity), e))?;
    info!("Formatted {} as FAT", identity);
    Ok(())
}

/// Volume label from the boot sector, without padding
pub fn label<T: ReadWriteSeek>(fs: &FileSystem<T>) -> String {
    fs.volume_label().trim_end().to_string()
}

/// Rewrite the boot sector volume label of the FAT filesystem on `dev`
pub fn set_label<D: BlockDevice>(dev: &mut D, label: &str) -> Result<()> {
    let field = encode_label(label)?;
    let offset = match probe::probe(dev)? {
        FsKind::Fat12 | FsKind::Fat16 => 0x2B,
        FsKind::Fat32 => 0x47,
        other => {
            return Err(DiskError::Unsupported(format!(
                "label on {} filesystem of {}",
                other,
                dev.identity()
            )));
        }
    };
    dev.write_bytes(0, offset, &field)?;
    dev.flush()?;
    info!("Set label of {} to {:?}", dev.identity(), label);
    Ok(())
}

/// Copy every file and directory of `src` into the root of `dst`.
/// Existing files of the same name are replaced.
pub fn copy_tree<S: ReadWriteSeek, T: ReadWriteSeek>(
    src: &FileSystem<S>,
    dst: &FileSystem<T>,
) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    copy_dir(&src.root_dir(), &dst.root_dir(), "", &mut stats)?;
    info!(
        "Copied {} files in {} directories ({} bytes)",
        stats.files, stats.dirs, stats.bytes
    );
    Ok(stats)
}

fn copy_dir<S: ReadWriteSeek, T: ReadWriteSeek>(
    src: &Dir<'_, S>,
    dst: &Dir<'_, T>,
    prefix: &str,
    stats: &mut CopyStats,
) -> Result<()> {
    for entry in src.iter() {
        let entry = entry.map_err(|e| DiskError::io(format!("list {}/", prefix), e))?;
        let name = entry.file_name();
        if is_dot(&name) {
            continue;
        }
        let path = format!("{}/{}", prefix, name);

        if entry.is_dir() {
            debug!("[+] {}", path);
            let sub = dst
                .create_dir(&name)
                .map_err(|e| DiskError::io(format!("create directory {}", path), e))?;
            stats.dirs += 1;
            copy_dir(&entry.to_dir(), &sub, &path, stats)?;
        } else {
            let bytes = store_file(dst, &name, &path, &mut entry.to_file())?;
            stats.files += 1;
            stats.bytes += bytes;
        }
    }
    Ok(())
}

/// Create or replace `name` in `dir` with the content of `input`
pub(crate) fn store_file<T: ReadWriteSeek, R: Read>(
    dir: &Dir<'_, T>,
    name: &str,
    path: &str,
    input: &mut R,
) -> Result<u64> {
    debug!("--- {}", path);
    let mut output = dir
        .create_file(name)
        .map_err(|e| DiskError::io(format!("create {}", path), e))?;
    output
        .truncate()
        .map_err(|e| DiskError::io(format!("truncate {}", path), e))?;
    let bytes =
        io::copy(input, &mut output).map_err(|e| DiskError::io(format!("copy {}", path), e))?;
    output
        .flush()
        .map_err(|e| DiskError::io(format!("flush {}", path), e))?;
    Ok(bytes)
}
