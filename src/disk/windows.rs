// Windows-specific disk operations

use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use windows_sys::Win32::Foundation::{GetLastError, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{FILE_SHARE_READ, FILE_SHARE_WRITE};
use windows_sys::Win32::System::IO::DeviceIoControl;

// Control codes from winioctl.h
const IOCTL_DISK_GET_LENGTH_INFO: u32 = 0x0007405C;
const IOCTL_DISK_UPDATE_PROPERTIES: u32 = 0x00070140;

/// Highest `PhysicalDriveN` probed when listing disks
const MAX_PHYSICAL_DRIVES: u32 = 64;

/// Windows-specific disk access functionality
#[derive(Debug, Clone)]
pub struct WindowsDiskAccess;

impl WindowsDiskAccess {
    pub fn device_path(number: u32) -> io::Result<PathBuf> {
        Ok(PathBuf::from(format!(r"\\.\PhysicalDrive{}", number)))
    }

    /// Disk numbers that currently open, in ascending order
    pub fn disk_numbers() -> Vec<u32> {
        (0..MAX_PHYSICAL_DRIVES)
            .filter(|n| {
                Self::device_path(*n)
                    .and_then(|p| Self::open(&p, false))
                    .is_ok()
            })
            .collect()
    }

    /// Extract the drive number from a `\\.\PhysicalDriveN` path
    pub fn disk_number(path: &Path) -> Option<u32> {
        let re = regex::Regex::new(r"(?i)\\\\\.\\PHYSICALDRIVE(\d+)").ok()?;
        let caps = re.captures(path.to_str()?)?;
        caps.get(1)?.as_str().parse::<u32>().ok()
    }

    /// Disk number of a `\\.\PhysicalDriveN` path; other paths are files
    pub fn whole_disk_number(path: &Path) -> Option<u32> {
        Self::disk_number(path)
    }

    /// Open a disk or file for raw sector access
    ///
    /// Other handles may keep reading and writing the disk; volume level
    /// exclusion is taken separately through the volume lock.
    pub fn open(path: &Path, write: bool) -> io::Result<File> {
        debug!("Opening {} (write: {})", path.display(), write);
        OpenOptions::new()
            .read(true)
            .write(write)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
            .open(path)
    }

    /// Size in bytes: the disk length query for devices, metadata for files
    pub fn size_bytes(file: &mut File) -> io::Result<u64> {
        let handle = file.as_raw_handle() as HANDLE;
        let mut length: i64 = 0;
        let mut bytes_returned: u32 = 0;

        let result = unsafe {
            DeviceIoControl(
                handle,
                IOCTL_DISK_GET_LENGTH_INFO,
                std::ptr::null(),
                0,
                &mut length as *mut i64 as *mut std::ffi::c_void,
                std::mem::size_of::<i64>() as u32,
                &mut bytes_returned,
                std::ptr::null_mut(),
            )
        };

        if result != 0 {
            return Ok(length as u64);
        }

        let error_code = unsafe { GetLastError() };
        debug!(
            "Disk length query failed: {} ({}), using file metadata",
            error_code,
            Self::get_windows_error_message(error_code)
        );
        Ok(file.metadata()?.len())
    }

    /// Ask the disk driver to re-read the partition layout
    pub fn invalidate(file: &File) -> io::Result<()> {
        let handle = file.as_raw_handle() as HANDLE;
        let mut bytes_returned: u32 = 0;

        let result = unsafe {
            DeviceIoControl(
                handle,
                IOCTL_DISK_UPDATE_PROPERTIES,
                std::ptr::null(),
                0,
                std::ptr::null_mut(),
                0,
                &mut bytes_returned,
                std::ptr::null_mut(),
            )
        };

        if result == 0 {
            let error_code = unsafe { GetLastError() };
            warn!(
                "Disk property update failed: {} ({})",
                error_code,
                Self::get_windows_error_message(error_code)
            );
            return Err(io::Error::from_raw_os_error(error_code as i32));
        }
        Ok(())
    }

    /// Translate Windows error codes to readable messages
    pub fn get_windows_error_message(code: u32) -> &'static str {
        match code {
            0 => "Operation completed successfully",
            1 => "Incorrect function",
            2 => "The system cannot find the file specified",
            5 => "Access is denied",
            6 => "The handle is invalid",
            19 => "The media is write protected",
            21 => "The device is not ready",
            32 => "The process cannot access the file because it is in use",
            87 => "The parameter is incorrect",
            1117 => "The request could not be performed because of an I/O device error",
            _ => "Unknown error code",
        }
    }
}
