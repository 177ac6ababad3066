// Boot record installation
//
// Loader kinds, the static byte layouts each (loader, filesystem) pair is
// written with, and the installers that apply them.

use crate::probe::FsKind;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

pub mod exfat;
mod install;
mod payload;

pub use install::{MbrReport, MbrSource, PbrReport, WriteRegion, install_mbr, install_pbr};
pub use payload::{BootPayload, EMPTY_MBR, PayloadStore};

/// Bytes of sector 0 that hold MBR boot code, ahead of the disk signature
pub const MBR_CODE_SIZE: usize = 440;

/// Bytes of a boot record that hold the jump instruction
pub const JUMP_SIZE: usize = 3;

pub const GRLDR_STAMP_OFFSET: u64 = 0x1E3;
pub const GRLDR_STAMP: &[u8] = b"GRLDR";

/// Boot code that can be written to a disk's MBR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MbrLoader {
    Empty,
    Nt5,
    Nt6,
    Grub4Dos,
    Syslinux,
    UltraIso,
    Rufus,
}

impl MbrLoader {
    pub const ALL: [MbrLoader; 7] = [
        MbrLoader::Empty,
        MbrLoader::Nt5,
        MbrLoader::Nt6,
        MbrLoader::Grub4Dos,
        MbrLoader::Syslinux,
        MbrLoader::UltraIso,
        MbrLoader::Rufus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MbrLoader::Empty => "empty",
            MbrLoader::Nt5 => "nt5",
            MbrLoader::Nt6 => "nt6",
            MbrLoader::Grub4Dos => "grub4dos",
            MbrLoader::Syslinux => "syslinux",
            MbrLoader::UltraIso => "ultraiso",
            MbrLoader::Rufus => "rufus",
        }
    }
}

impl fmt::Display for MbrLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MbrLoader {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MbrLoader::ALL
            .into_iter()
            .find(|l| l.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown MBR loader '{}'", s))
    }
}

/// Boot code that can be written to a partition boot record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PbrLoader {
    Nt5,
    Nt6,
    Grub4Dos,
}

impl PbrLoader {
    pub const ALL: [PbrLoader; 3] = [PbrLoader::Nt5, PbrLoader::Nt6, PbrLoader::Grub4Dos];

    pub fn name(&self) -> &'static str {
        match self {
            PbrLoader::Nt5 => "nt5",
            PbrLoader::Nt6 => "nt6",
            PbrLoader::Grub4Dos => "grub4dos",
        }
    }
}

impl fmt::Display for PbrLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PbrLoader {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PbrLoader::ALL
            .into_iter()
            .find(|l| l.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown boot record loader '{}'", s))
    }
}

/// How an MBR template is laid onto the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrLayout {
    pub loader: MbrLoader,
    /// Shortest acceptable template
    pub min_len: usize,
    /// Bytes of the template written at sector 0; `None` writes all of it
    pub head_len: Option<usize>,
    /// Template offset whose remainder is written from sector 1 on
    pub tail_from: Option<usize>,
}

pub static MBR_LAYOUTS: &[MbrLayout] = &[
    MbrLayout { loader: MbrLoader::Empty, min_len: 1, head_len: None, tail_from: None },
    MbrLayout { loader: MbrLoader::Nt5, min_len: 1, head_len: None, tail_from: None },
    MbrLayout { loader: MbrLoader::Nt6, min_len: 1, head_len: None, tail_from: None },
    MbrLayout {
        loader: MbrLoader::Grub4Dos,
        min_len: 513,
        head_len: Some(MBR_CODE_SIZE),
        tail_from: Some(512),
    },
    MbrLayout {
        loader: MbrLoader::Syslinux,
        min_len: MBR_CODE_SIZE,
        head_len: Some(MBR_CODE_SIZE),
        tail_from: None,
    },
    MbrLayout { loader: MbrLoader::UltraIso, min_len: 1, head_len: None, tail_from: None },
    MbrLayout { loader: MbrLoader::Rufus, min_len: 1, head_len: None, tail_from: None },
];

pub fn mbr_layout(loader: MbrLoader) -> &'static MbrLayout {
    MBR_LAYOUTS
        .iter()
        .find(|l| l.loader == loader)
        .unwrap_or(&MBR_LAYOUTS[0])
}

/// Where a boot record payload goes for one (loader, filesystem) pair.
///
/// The first `JUMP_SIZE` bytes and the range `body_start..payload_len` of the
/// payload are copied to the same offsets of the partition, leaving the BPB
/// in between untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PbrLayout {
    pub loader: PbrLoader,
    pub fs: &'static [FsKind],
    /// Filesystem tag in the payload file name
    pub payload_fs: &'static str,
    pub body_start: usize,
    pub payload_len: usize,
    /// Reserved sectors the filesystem must have; 0 skips the check
    pub min_reserved: u64,
    pub stamp: Option<(u64, &'static [u8])>,
    pub exfat_checksum: bool,
}

const FAT12_16: &[FsKind] = &[FsKind::Fat12, FsKind::Fat16];
const FAT32: &[FsKind] = &[FsKind::Fat32];
const EXFAT: &[FsKind] = &[FsKind::ExFat];
const NTFS: &[FsKind] = &[FsKind::Ntfs];

#[rustfmt::skip]
pub static PBR_LAYOUTS: &[PbrLayout] = &[
    PbrLayout { loader: PbrLoader::Nt5, fs: FAT12_16, payload_fs: "fat16", body_start: 0x3E, payload_len: 0x200, min_reserved: 0, stamp: None, exfat_checksum: false },
    PbrLayout { loader: PbrLoader::Nt5, fs: FAT32, payload_fs: "fat32", body_start: 0x5A, payload_len: 0x400, min_reserved: 2, stamp: None, exfat_checksum: false },
    PbrLayout { loader: PbrLoader::Nt5, fs: NTFS, payload_fs: "ntfs", body_start: 0x54, payload_len: 0xE00, min_reserved: 7, stamp: None, exfat_checksum: false },
    PbrLayout { loader: PbrLoader::Nt6, fs: FAT12_16, payload_fs: "fat16", body_start: 0x3E, payload_len: 0x200, min_reserved: 0, stamp: None, exfat_checksum: false },
    PbrLayout { loader: PbrLoader::Nt6, fs: FAT32, payload_fs: "fat32", body_start: 0x5A, payload_len: 0x400, min_reserved: 2, stamp: None, exfat_checksum: false },
    PbrLayout { loader: PbrLoader::Nt6, fs: EXFAT, payload_fs: "exfat", body_start: 0x78, payload_len: 0x600, min_reserved: 3, stamp: None, exfat_checksum: true },
    PbrLayout { loader: PbrLoader::Nt6, fs: NTFS, payload_fs: "ntfs", body_start: 0x54, payload_len: 0x1400, min_reserved: 10, stamp: None, exfat_checksum: false },
    PbrLayout { loader: PbrLoader::Grub4Dos, fs: FAT12_16, payload_fs: "fat16", body_start: 0x3E, payload_len: 0x200, min_reserved: 0, stamp: Some((GRLDR_STAMP_OFFSET, GRLDR_STAMP)), exfat_checksum: false },
    PbrLayout { loader: PbrLoader::Grub4Dos, fs: FAT32, payload_fs: "fat32", body_start: 0x5A, payload_len: 0x200, min_reserved: 0, stamp: Some((GRLDR_STAMP_OFFSET, GRLDR_STAMP)), exfat_checksum: false },
    PbrLayout { loader: PbrLoader::Grub4Dos, fs: EXFAT, payload_fs: "exfat", body_start: 0x78, payload_len: 0x400, min_reserved: 2, stamp: Some((GRLDR_STAMP_OFFSET, GRLDR_STAMP)), exfat_checksum: true },
    PbrLayout { loader: PbrLoader::Grub4Dos, fs: NTFS, payload_fs: "ntfs", body_start: 0x54, payload_len: 0x800, min_reserved: 4, stamp: Some((GRLDR_STAMP_OFFSET, GRLDR_STAMP)), exfat_checksum: false },
];

/// Layout for a loader on a filesystem, if that pair is supported
pub fn pbr_layout(loader: PbrLoader, fs: FsKind) -> Option<&'static PbrLayout> {
    PBR_LAYOUTS
        .iter()
        .find(|l| l.loader == loader && l.fs.contains(&fs))
}

impl PbrLayout {
    /// Payload file name in the payload directory
    pub fn payload_name(&self) -> String {
        format!("pbr-{}-{}.bin", self.loader.name(), self.payload_fs)
    }

    /// Sectors the install touches, counting the exFAT backup region
    pub fn sectors_needed(&self) -> u64 {
        if self.exfat_checksum {
            2 * (exfat::BOOT_REGION_SECTORS + 1)
        } else {
            self.payload_len.div_ceil(crate::disk::SECTOR_SIZE) as u64
        }
    }
}
