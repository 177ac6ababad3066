/// Privilege checks
///
/// Raw disk access needs administrator rights on Windows and root on Linux.
/// The binaries only warn when these are missing; the OS has the final say
/// when a disk is opened.

#[cfg(windows)]
use windows_sys::Win32::{
    Foundation::{CloseHandle, FALSE, HANDLE},
    Security::{GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation},
    System::Threading::{GetCurrentProcess, OpenProcessToken},
};

/// Check if the current process is running with administrator privileges
#[cfg(windows)]
pub fn is_elevated() -> bool {
    unsafe {
        let mut token: HANDLE = 0;

        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == FALSE {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
        let mut return_length = 0u32;

        let result = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut return_length,
        );

        CloseHandle(token);

        result != FALSE && elevation.TokenIsElevated != 0
    }
}

#[cfg(not(windows))]
pub fn is_elevated() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Warning to show before touching disks, or `None` when privileged
pub fn elevation_warning() -> Option<&'static str> {
    if is_elevated() {
        return None;
    }
    if cfg!(windows) {
        Some("Not running as administrator; opening physical disks will likely fail")
    } else {
        Some("Not running as root; opening physical disks will likely fail. Use sudo.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_matches_status() {
        assert_eq!(elevation_warning().is_none(), is_elevated());
    }
}
