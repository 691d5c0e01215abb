//! VSTa-style on-disk filesystem, layered on [`abc`].
//!
//! [`Vfs`] mounts a formatted volume and owns the shared cache/superblock/
//! open-file state; each connection gets its own [`Client`], the request-
//! style API a message transport would otherwise dispatch into. [`mkfs`]
//! and [`fsck`] operate directly on a [`block_device::BlockDevice`], offline,
//! matching the original's single-threaded repair/format tools.

mod alloc;
mod client;
mod config;
mod disk;
mod error;
pub mod fsck;
pub mod format;
mod io;
pub mod mkfs;
mod vfs;

pub use client::{Client, Stat, ACCESS_CHMOD, ACCESS_READ, ACCESS_WRITE};
pub use config::FsConfig;
pub use error::{VfsError, VfsResult};
pub use vfs::Vfs;
