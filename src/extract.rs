// Source images for tree extraction: FAT volumes or ISO9660 images, told
// apart by the ISO volume descriptor magic

use crate::disk::BlockDevice;
use crate::error::Result;
use crate::fat::{self, CopyStats, FatVolume};
use crate::iso::{self, IsoImage};
use fatfs::{FileSystem, ReadWriteSeek};
use std::fmt;
use tracing::info;

/// An opened image whose files can be copied into a FAT volume
pub enum ExtractSource<'a, D: BlockDevice> {
    Fat(FatVolume<'a, D>),
    Iso(IsoImage<&'a mut D>),
}

impl<'a, D: BlockDevice> ExtractSource<'a, D> {
    /// Open `dev` as ISO9660 when it carries the descriptor magic, as FAT
    /// otherwise
    pub fn open(dev: &'a mut D) -> Result<Self> {
        let source = if iso::is_iso9660(&mut *dev)? {
            ExtractSource::Iso(iso::open(dev)?)
        } else {
            ExtractSource::Fat(fat::mount(dev)?)
        };
        info!("Extract source is {}", source);
        Ok(source)
    }

    /// Copy the whole tree into the root of `dst`
    pub fn copy_into<T: ReadWriteSeek>(&self, dst: &FileSystem<T>) -> Result<CopyStats> {
        match self {
            ExtractSource::Fat(src) => fat::copy_tree(src, dst),
            ExtractSource::Iso(src) => iso::copy_tree(src, dst),
        }
    }
}

impl<D: BlockDevice> fmt::Display for ExtractSource<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractSource::Fat(_) => write!(f, "a FAT image"),
            ExtractSource::Iso(_) => write!(f, "an ISO9660 image"),
        }
    }
}
