//! memfs core: a concurrent in-memory hierarchical file system
//!
//! Directories, files, symbolic links and hard links live entirely in process
//! memory. Every node carries its own reader/writer lock; paths are walked top
//! down with all locks held until the operation finishes, and copy, move and
//! link lock their two endpoints in one fixed order so they never deadlock.

pub mod config;
pub mod error;
pub mod handle;
pub mod inode;
pub mod lock;
pub mod path;
pub mod types;
pub mod vfs;

mod entry;
mod tree;

// Re-export key types for convenience
pub use config::{CaseSensitivity, EntryDefaults, FsConfig, FsLimits, TimestampResolution};
pub use error::{FsError, FsResult};
pub use handle::FileHandle;
pub use inode::{Inode, InodeId, BLOCK_SIZE, MAX_BLOCKS};
pub use lock::FileLock;
pub use path::FsPath;
pub use tokio_util::sync::CancellationToken;
pub use types::*;
pub use vfs::MemoryFileSystem;
