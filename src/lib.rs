// Public library interface for diskpatch
//
// Raw disk access, MBR and GPT readers, volume locking, boot record
// installation, MBR entry editing and FAT file access with ISO9660 images
// as an extra source. The `diskpatch` binary and the
// partition lister are thin front-ends over these modules.

pub mod boot;
pub mod config;
pub mod context;
pub mod disk;
pub mod edit;
pub mod error;
pub mod extract;
pub mod fat;
pub mod iso;
pub mod logging;
pub mod probe;
pub mod table;
pub mod utils;
pub mod volume;

pub use context::{DiskContext, OpenOptions};
pub use error::{DiskError, Result};
