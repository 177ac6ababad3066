// Boot code templates: the built-in empty MBR plus vendor blobs on disk

use super::{MBR_CODE_SIZE, MbrLoader, PbrLayout};
use crate::error::{DiskError, Result};
use crate::table::TableFormat;
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// MBR code that halts the machine: `cli; hlt; jmp $-1`
pub const EMPTY_MBR: [u8; MBR_CODE_SIZE] = {
    let mut code = [0u8; MBR_CODE_SIZE];
    code[0] = 0xFA;
    code[1] = 0xF4;
    code[2] = 0xEB;
    code[3] = 0xFD;
    code
};

/// An immutable boot code template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPayload {
    pub name: String,
    pub bytes: Cow<'static, [u8]>,
}

impl BootPayload {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Resolves loader kinds to templates.
///
/// Vendor templates are not shipped; they are read from a directory as
/// `mbr-<loader>.bin` and `pbr-<loader>-<fs>.bin`.
#[derive(Debug, Clone, Default)]
pub struct PayloadStore {
    dir: Option<PathBuf>,
}

impl PayloadStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        PayloadStore { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// File name of an MBR template
    pub fn mbr_file_name(loader: MbrLoader, format: TableFormat) -> String {
        match (loader, format) {
            (MbrLoader::Syslinux, TableFormat::Gpt) => "mbr-syslinux-gpt.bin".to_string(),
            _ => format!("mbr-{}.bin", loader.name()),
        }
    }

    /// MBR template for a loader; `format` picks the syslinux variant
    pub fn mbr(&self, loader: MbrLoader, format: TableFormat) -> Result<BootPayload> {
        if loader == MbrLoader::Empty {
            return Ok(BootPayload {
                name: "empty".to_string(),
                bytes: Cow::Borrowed(&EMPTY_MBR),
            });
        }
        self.load(&Self::mbr_file_name(loader, format))
    }

    /// Boot record template for a layout; its length must match the layout
    pub fn pbr(&self, layout: &PbrLayout) -> Result<BootPayload> {
        let payload = self.load(&layout.payload_name())?;
        if payload.len() != layout.payload_len {
            return Err(DiskError::InvalidArgument(format!(
                "{} is {} bytes, expected {}",
                payload.name,
                payload.len(),
                layout.payload_len
            )));
        }
        Ok(payload)
    }

    fn load(&self, file_name: &str) -> Result<BootPayload> {
        let dir = self.dir.as_ref().ok_or_else(|| {
            DiskError::NotFound(format!(
                "boot payload {} (no payload directory configured)",
                file_name
            ))
        })?;
        let path = dir.join(file_name);
        debug!("Loading boot payload {}", path.display());

        let bytes = fs::read(&path)
            .map_err(|e| DiskError::io(format!("read boot payload {}", path.display()), e))?;
        info!("Loaded boot payload {} ({} bytes)", file_name, bytes.len());

        Ok(BootPayload {
            name: file_name.to_string(),
            bytes: Cow::Owned(bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{PbrLoader, pbr_layout};
    use crate::probe::FsKind;

    #[test]
    fn test_empty_is_builtin() {
        let store = PayloadStore::default();
        let payload = store.mbr(MbrLoader::Empty, TableFormat::Mbr).unwrap();
        assert_eq!(payload.len(), 440);
        assert_eq!(&payload.bytes[..4], &[0xFA, 0xF4, 0xEB, 0xFD]);

        let err = store.mbr(MbrLoader::Nt6, TableFormat::Mbr).unwrap_err();
        assert!(matches!(err, DiskError::NotFound(_)));
    }

    #[test]
    fn test_vendor_files_and_length_check() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mbr-syslinux-gpt.bin"), [7u8; 440]).unwrap();
        fs::write(dir.path().join("pbr-nt6-fat32.bin"), [1u8; 0x400]).unwrap();
        fs::write(dir.path().join("pbr-nt5-fat32.bin"), [1u8; 0x200]).unwrap();
        let store = PayloadStore::new(Some(dir.path().to_path_buf()));

        let payload = store.mbr(MbrLoader::Syslinux, TableFormat::Gpt).unwrap();
        assert_eq!(payload.name, "mbr-syslinux-gpt.bin");
        assert!(store.mbr(MbrLoader::Syslinux, TableFormat::Mbr).is_err());

        let nt6 = pbr_layout(PbrLoader::Nt6, FsKind::Fat32).unwrap();
        assert_eq!(store.pbr(nt6).unwrap().len(), 0x400);

        let nt5 = pbr_layout(PbrLoader::Nt5, FsKind::Fat32).unwrap();
        assert!(matches!(store.pbr(nt5), Err(DiskError::InvalidArgument(_))));
    }
}
