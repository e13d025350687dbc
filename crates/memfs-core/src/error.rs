//! Error types for memfs core

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("not a symbolic link")]
    NotASymlink,
    #[error("file already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("entry is open")]
    StillOpen,
    #[error("too many levels of symbolic links")]
    LinkLoop,
    #[error("already locked")]
    LockConflict,
    #[error("capacity exceeded")]
    CapacityExceeded,
    #[error("interrupted")]
    Interrupted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name not allowed")]
    InvalidName,
    #[error("access denied")]
    AccessDenied,
    #[error("handle is closed")]
    Closed,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("cross-device link")]
    CrossDevice,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        let kind = match e {
            FsError::Io(inner) => return inner,
            FsError::NotFound => io::ErrorKind::NotFound,
            FsError::NotADirectory => io::ErrorKind::NotADirectory,
            FsError::IsADirectory => io::ErrorKind::IsADirectory,
            FsError::AlreadyExists => io::ErrorKind::AlreadyExists,
            FsError::DirectoryNotEmpty => io::ErrorKind::DirectoryNotEmpty,
            FsError::StillOpen | FsError::LockConflict => io::ErrorKind::ResourceBusy,
            FsError::Interrupted => io::ErrorKind::Interrupted,
            FsError::InvalidArgument | FsError::InvalidName | FsError::NotASymlink => {
                io::ErrorKind::InvalidInput
            }
            FsError::AccessDenied => io::ErrorKind::PermissionDenied,
            FsError::CapacityExceeded => io::ErrorKind::FileTooLarge,
            FsError::CrossDevice => io::ErrorKind::CrossesDevices,
            FsError::LinkLoop | FsError::Closed | FsError::TooManyOpenFiles => {
                io::ErrorKind::Other
            }
        };
        io::Error::new(kind, e)
    }
}
