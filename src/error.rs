// Error taxonomy shared by every disk, table, lock and patch operation

use std::io;
use thiserror::Error;

/// Errors reported by the disk engine.
///
/// Each variant carries a short context string naming the operation and the
/// target (for example `"read sector 0 of PhysicalDrive1"`), so callers can log
/// a single diagnostic line without unwrapping sources.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("bad signature: {0}")]
    BadSignature(String),

    #[error("bad partition table: {0}")]
    BadTable(String),

    #[error("disk uses a GPT partition map (protective MBR found): {0}")]
    IsGptDisk(String),

    #[error("no GPT partition map found: {0}")]
    NoGptPartitionMap(String),

    #[error("loop detected in extended partition chain: {0}")]
    LoopDetected(String),

    #[error("failed to lock volume: {0}")]
    LockFailed(String),

    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error("invalid partition index: {0}")]
    InvalidIndex(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {context}: {source}")]
    IoError {
        context: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DiskError>;

impl DiskError {
    /// Wrap an `io::Error`, mapping missing devices and permission failures to
    /// their dedicated variants.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        match source.kind() {
            io::ErrorKind::NotFound => DiskError::NotFound(format!("{}: {}", context, source)),
            io::ErrorKind::PermissionDenied => {
                DiskError::AccessDenied(format!("{}: {}", context, source))
            }
            _ => DiskError::IoError { context, source },
        }
    }

    /// Short machine-friendly name of the error kind, used in log fields.
    pub fn kind_name(&self) -> &'static str {
        match self {
            DiskError::NotFound(_) => "NotFound",
            DiskError::AccessDenied(_) => "AccessDenied",
            DiskError::BadSignature(_) => "BadSignature",
            DiskError::BadTable(_) => "BadTable",
            DiskError::IsGptDisk(_) => "IsGptDisk",
            DiskError::NoGptPartitionMap(_) => "NoGptPartitionMap",
            DiskError::LoopDetected(_) => "LoopDetected",
            DiskError::LockFailed(_) => "LockFailed",
            DiskError::UnsupportedLayout(_) => "UnsupportedLayout",
            DiskError::InvalidIndex(_) => "InvalidIndex",
            DiskError::InvalidArgument(_) => "InvalidArgument",
            DiskError::Unsupported(_) => "Unsupported",
            DiskError::IoError { .. } => "IoError",
        }
    }
}

impl From<io::Error> for DiskError {
    fn from(e: io::Error) -> Self {
        DiskError::io("I/O operation", e)
    }
}

// The FAT driver works in io::Error, so engine errors cross back over the
// stream boundary with a matching kind.
impl From<DiskError> for io::Error {
    fn from(e: DiskError) -> Self {
        let kind = match &e {
            DiskError::IoError { source, .. } => source.kind(),
            DiskError::NotFound(_) => io::ErrorKind::NotFound,
            DiskError::AccessDenied(_) => io::ErrorKind::PermissionDenied,
            DiskError::Unsupported(_) => io::ErrorKind::Unsupported,
            DiskError::InvalidArgument(_) | DiskError::InvalidIndex(_) => {
                io::ErrorKind::InvalidInput
            }
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}
