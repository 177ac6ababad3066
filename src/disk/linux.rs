// Linux-specific disk operations

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// Linux-specific imports
use libc::O_CLOEXEC;

/// BLKFLSBUF from <linux/fs.h>: flush the buffer cache of a block device
const BLKFLSBUF: u64 = 0x1261;

const SYS_BLOCK: &str = "/sys/block";

/// Linux-specific disk access functionality
#[derive(Debug, Clone)]
pub struct LinuxDiskAccess;

impl LinuxDiskAccess {
    /// Whole-disk block device names in device-number order
    ///
    /// Disk number N is the index of the device in the sorted `/sys/block`
    /// listing. RAM-backed virtual devices are left out.
    pub fn disk_names() -> io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(SYS_BLOCK)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with("ram") && !name.starts_with("zram"))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Block device node for a disk number
    pub fn device_path(number: u32) -> io::Result<PathBuf> {
        let names = Self::disk_names()?;
        names
            .get(number as usize)
            .map(|name| Path::new("/dev").join(name))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no disk with number {} ({} disks present)", number, names.len()),
                )
            })
    }

    /// Disk number of a `/dev/<name>` path, if it names a whole disk
    pub fn disk_number(path: &Path) -> Option<u32> {
        let name = path.file_name()?.to_str()?;
        let names = Self::disk_names().ok()?;
        names.iter().position(|n| n == name).map(|i| i as u32)
    }

    /// Disk number of a path that resolves to a whole-disk block device,
    /// following symlinks such as `/dev/disk/by-id/...`
    pub fn whole_disk_number(path: &Path) -> Option<u32> {
        let node = fs::canonicalize(path).ok()?;
        if !fs::metadata(&node).ok()?.file_type().is_block_device() {
            return None;
        }
        Self::disk_number(&node)
    }

    /// Open a disk node or file for raw sector access
    pub fn open(path: &Path, write: bool) -> io::Result<File> {
        debug!("Opening {} (write: {})", path.display(), write);
        OpenOptions::new()
            .read(true)
            .write(write)
            .custom_flags(O_CLOEXEC)
            .open(path)
    }

    /// Size in bytes; block devices report it through seeking to the end
    pub fn size_bytes(file: &mut File) -> io::Result<u64> {
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(size)
    }

    /// Size of a disk as reported by sysfs, in bytes
    pub fn sysfs_size_bytes(name: &str) -> Option<u64> {
        let raw = fs::read_to_string(Path::new(SYS_BLOCK).join(name).join("size")).ok()?;
        raw.trim().parse::<u64>().ok().map(|sectors| sectors * 512)
    }

    /// Drop the kernel's buffer cache for a block device
    ///
    /// Regular files have no such cache; the call is a no-op for them.
    pub fn invalidate(file: &File) -> io::Result<()> {
        if !file.metadata()?.file_type().is_block_device() {
            return Ok(());
        }

        let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKFLSBUF as _) };
        if result < 0 {
            let err = io::Error::last_os_error();
            warn!("BLKFLSBUF failed: {}", err);
            return Err(err);
        }
        Ok(())
    }
}
