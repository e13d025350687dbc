//! Core type definitions for memfs

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::inode::InodeId;

/// Opaque file system instance identifier. Stable for the life of the
/// instance and used to order operations spanning two instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FsId(pub(crate) u64);

/// Entry kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// File timestamps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileTimes {
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

impl FileTimes {
    pub(crate) fn at(now: SystemTime) -> Self {
        Self {
            created: now,
            modified: now,
            accessed: now,
        }
    }
}

/// Timestamps to change; `None` leaves the stored value alone
#[derive(Clone, Copy, Debug, Default)]
pub struct SetTimes {
    pub created: Option<SystemTime>,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
}

/// Entry attributes
#[derive(Clone, Debug)]
pub struct Attributes {
    pub file_type: FileType,
    pub size: u64,
    pub times: FileTimes,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Directory entries sharing this entry's storage
    pub nlink: u32,
    /// Storage identity for files, `None` for directories and links
    pub inode: Option<InodeId>,
}

impl Attributes {
    pub fn is_file(&self) -> bool {
        self.file_type.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type.is_symlink()
    }
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

/// Ownership and permission metadata for a new entry. Stored as given;
/// nothing in the core interprets it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateContext {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl CreateContext {
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }
}

/// Options for copy and move
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyOptions {
    pub replace_existing: bool,
    /// Copy timestamps and permissions instead of stamping fresh ones
    pub copy_attributes: bool,
}

impl CopyOptions {
    pub fn replace() -> Self {
        Self {
            replace_existing: true,
            ..Self::default()
        }
    }
}

/// Options for opening a file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub create_new: bool,
    pub delete_on_close: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            truncate: false,
            create: false,
            create_new: false,
            delete_on_close: false,
        }
    }
}

impl OpenOptions {
    pub fn read() -> Self {
        Self::default()
    }

    pub fn write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            ..Self::default()
        }
    }

    pub fn create_new() -> Self {
        Self {
            write: true,
            create_new: true,
            ..Self::default()
        }
    }

    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            create: true,
            ..Self::default()
        }
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn delete_on_close(mut self, delete: bool) -> Self {
        self.delete_on_close = delete;
        self
    }

    pub(crate) fn creates(&self) -> bool {
        self.create || self.create_new
    }
}
