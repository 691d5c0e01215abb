use thiserror::Error;

/// Errors surfaced by the filesystem layer.
///
/// Each variant maps to the POSIX errno the original VSTa service would
/// have returned to the client (see SPEC_FULL.md §7); `to_errno` is kept
/// explicit rather than derived because that mapping is part of the
/// on-the-wire contract, not an implementation detail.
#[derive(Debug, Error, Clone)]
pub enum VfsError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("no such entry: {0}")]
    NotFound(String),
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of space")]
    OutOfSpace,
    #[error("too many extents (max {max})")]
    TooManyExtents { max: usize },
    #[error("name already exists: {0}")]
    AlreadyExists(String),
    #[error("bad superblock: {0}")]
    BadSuperblock(String),
    #[error("corrupted on-disk structure: {0}")]
    Corrupted(String),
    #[error("no rename transaction is pending")]
    NoRenameInProgress,
    #[error("I/O error: {0}")]
    Io(#[from] abc::AbcError),
    #[error("device error: {0}")]
    Device(String),
}

impl From<block_device::DeviceError> for VfsError {
    fn from(e: block_device::DeviceError) -> Self {
        VfsError::Device(e.to_string())
    }
}

impl VfsError {
    /// The errno a client would observe for this failure, per SPEC_FULL.md §7.
    pub fn to_errno(&self) -> i32 {
        match self {
            VfsError::PermissionDenied => libc_errno::EACCES,
            VfsError::NotFound(_) => libc_errno::ENOENT,
            VfsError::NotADirectory => libc_errno::ENOTDIR,
            VfsError::IsADirectory => libc_errno::EISDIR,
            VfsError::InvalidArgument(_) => libc_errno::EINVAL,
            VfsError::OutOfSpace | VfsError::TooManyExtents { .. } => libc_errno::ENOSPC,
            VfsError::AlreadyExists(_) => libc_errno::EEXIST,
            VfsError::BadSuperblock(_) | VfsError::Corrupted(_) => libc_errno::EIO,
            VfsError::NoRenameInProgress => libc_errno::EINVAL,
            VfsError::Io(_) | VfsError::Device(_) => libc_errno::EIO,
        }
    }
}

/// A tiny local stand-in for the handful of errno constants §7 references,
/// so this crate does not need to depend on the `libc` crate just for a
/// dozen integers used only in diagnostic mapping.
#[allow(dead_code)]
mod libc_errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EACCES: i32 = 13;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
}

pub type VfsResult<T> = Result<T, VfsError>;
