// Windows volumes: GUID volume enumeration and device control queries

use super::{DeviceClass, OpenVolume, VolumeDeviceInfo, VolumeSource};
use crate::disk::PlatformDiskAccess;
use crate::error::{DiskError, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use tracing::{debug, warn};

use windows_sys::Win32::Foundation::{GetLastError, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_SHARE_READ, FILE_SHARE_WRITE, FindFirstVolumeW, FindNextVolumeW, FindVolumeClose,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

// Control codes from winioctl.h
const IOCTL_STORAGE_GET_DEVICE_NUMBER: u32 = 0x002D1080;
const IOCTL_DISK_GET_PARTITION_INFO_EX: u32 = 0x00070048;
const FSCTL_DISMOUNT_VOLUME: u32 = 0x00090020;

const FILE_DEVICE_DISK: u32 = 0x07;
const FILE_DEVICE_DISK_FILE_SYSTEM: u32 = 0x08;
const FILE_DEVICE_FILE_SYSTEM: u32 = 0x09;

/// Volume GUID paths are `\\?\Volume{GUID}\`, well under this
const VOLUME_NAME_LEN: usize = 64;

/// PARTITION_INFORMATION_EX is 144 bytes; StartingOffset sits at byte 8
const PARTITION_INFO_SIZE: usize = 144;
const STARTING_OFFSET_AT: usize = 8;

#[derive(Debug, Default)]
pub struct WindowsVolumes;

impl WindowsVolumes {
    /// Volume enumeration needs no session; always succeeds
    pub fn connect() -> Result<Self> {
        Ok(WindowsVolumes)
    }
}

impl VolumeSource for WindowsVolumes {
    type Volume = WindowsVolume;

    fn volume_paths(&mut self) -> Result<Vec<String>> {
        let mut name = [0u16; VOLUME_NAME_LEN];
        let find = unsafe { FindFirstVolumeW(name.as_mut_ptr(), name.len() as u32) };
        if find == INVALID_HANDLE_VALUE {
            return Err(DiskError::io(
                "enumerate volumes",
                io::Error::last_os_error(),
            ));
        }

        let mut paths = Vec::new();
        loop {
            let len = name.iter().position(|c| *c == 0).unwrap_or(name.len());
            paths.push(String::from_utf16_lossy(&name[..len]));

            name.fill(0);
            let more = unsafe { FindNextVolumeW(find, name.as_mut_ptr(), name.len() as u32) };
            if more == 0 {
                break;
            }
        }
        unsafe { FindVolumeClose(find) };

        debug!("{} volumes present", paths.len());
        Ok(paths)
    }

    fn open(&mut self, path: &str) -> Result<WindowsVolume> {
        // CreateFile opens the volume itself only without the trailing separator
        let device = path.trim_end_matches('\\').to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
            .open(&device)
            .map_err(|e| DiskError::io(format!("open volume {}", device), e))?;
        Ok(WindowsVolume { path: device, file })
    }
}

/// An open volume handle; closing it releases the volume
#[derive(Debug)]
pub struct WindowsVolume {
    path: String,
    file: File,
}

impl WindowsVolume {
    fn control(&self, code: u32, out: &mut [u8], what: &str) -> Result<()> {
        let handle = self.file.as_raw_handle() as HANDLE;
        let mut bytes_returned: u32 = 0;

        let result = unsafe {
            DeviceIoControl(
                handle,
                code,
                std::ptr::null(),
                0,
                if out.is_empty() {
                    std::ptr::null_mut()
                } else {
                    out.as_mut_ptr() as *mut std::ffi::c_void
                },
                out.len() as u32,
                &mut bytes_returned,
                std::ptr::null_mut(),
            )
        };

        if result == 0 {
            let error_code = unsafe { GetLastError() };
            debug!(
                "{} on {} failed: {} ({})",
                what,
                self.path,
                error_code,
                PlatformDiskAccess::get_windows_error_message(error_code)
            );
            return Err(DiskError::io(
                format!("{} on {}", what, self.path),
                io::Error::from_raw_os_error(error_code as i32),
            ));
        }
        Ok(())
    }
}

impl OpenVolume for WindowsVolume {
    fn path(&self) -> &str {
        &self.path
    }

    fn query(&mut self) -> Result<VolumeDeviceInfo> {
        // STORAGE_DEVICE_NUMBER: DeviceType, DeviceNumber, PartitionNumber
        let mut number = [0u8; 12];
        self.control(IOCTL_STORAGE_GET_DEVICE_NUMBER, &mut number, "device number query")?;
        let device_type = u32::from_le_bytes([number[0], number[1], number[2], number[3]]);
        let device_number = u32::from_le_bytes([number[4], number[5], number[6], number[7]]);

        let device_class = match device_type {
            FILE_DEVICE_DISK => DeviceClass::Disk,
            FILE_DEVICE_DISK_FILE_SYSTEM => DeviceClass::DiskFileSystem,
            FILE_DEVICE_FILE_SYSTEM => DeviceClass::FileSystem,
            other => DeviceClass::Other(other),
        };

        let mut partition = [0u8; PARTITION_INFO_SIZE];
        self.control(
            IOCTL_DISK_GET_PARTITION_INFO_EX,
            &mut partition,
            "partition info query",
        )?;
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&partition[STARTING_OFFSET_AT..STARTING_OFFSET_AT + 8]);
        let start_lba = (i64::from_le_bytes(offset) as u64) >> crate::disk::SECTOR_BITS;

        Ok(VolumeDeviceInfo {
            device_class,
            device_number,
            start_lba,
        })
    }

    fn dismount(&mut self) -> Result<()> {
        self.control(FSCTL_DISMOUNT_VOLUME, &mut [], "dismount").map_err(|e| {
            warn!("Could not dismount {}: {}", self.path, e);
            e
        })
    }
}
