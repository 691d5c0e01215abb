//! Block device port.
//!
//! The buffer cache is the sole client of a [`BlockDevice`]: a synchronous,
//! ordered-sector store. Everything above this trait (the cache, the
//! filesystem) only ever sees sector numbers and whole-sector transfers —
//! partial-sector I/O does not exist at this layer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;

/// Bytes per sector. Fixed for the lifetime of this format.
pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// Requested range falls outside the device.
    #[error("sector range {start}..+{nsec} out of bounds (device has {total} sectors)")]
    OutOfRange { start: u32, nsec: u32, total: u32 },
    /// The underlying I/O primitive failed.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous absolute-sector block device.
///
/// Implementors must be safe to call from two threads at once (the cache's
/// foreground caller and its background worker may both be mid-transfer on
/// different sector ranges); they are not required to support *concurrent*
/// transfers, only to not corrupt state if called from either thread.
pub trait BlockDevice: Send + Sync {
    /// Read `nsec` sectors starting at `start` into `dst`.
    /// `dst.len()` must equal `nsec as usize * SECTOR_SIZE`.
    fn read_sectors(&self, start: u32, nsec: u32, dst: &mut [u8]) -> Result<(), DeviceError>;

    /// Write `nsec` sectors starting at `start` from `src`.
    /// `src.len()` must equal `nsec as usize * SECTOR_SIZE`.
    fn write_sectors(&self, start: u32, nsec: u32, src: &[u8]) -> Result<(), DeviceError>;

    /// Whether a caller may use user-supplied buffers directly as I/O
    /// targets. When `false`, the cache owns all buffers and copies into or
    /// out of client-visible memory.
    fn supports_dma(&self) -> bool;

    /// Total number of addressable sectors.
    fn total_sectors(&self) -> u32;
}

/// A [`BlockDevice`] backed by a regular host file (or raw device node).
///
/// Used by the CLI tools and by the test suite in place of a real disk.
pub struct FileBlockDevice {
    file: Mutex<File>,
    total_sectors: u32,
}

impl FileBlockDevice {
    /// Open an existing image/device file, sizing `total_sectors` from its
    /// current length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            total_sectors: (len / SECTOR_SIZE as u64) as u32,
        })
    }

    /// Create a new image file of exactly `nsectors` sectors, zero-filled.
    pub fn create(path: impl AsRef<Path>, nsectors: u32) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(nsectors as u64 * SECTOR_SIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            total_sectors: nsectors,
        })
    }

    fn check_range(&self, start: u32, nsec: u32) -> Result<(), DeviceError> {
        let end = start as u64 + nsec as u64;
        if end > self.total_sectors as u64 {
            return Err(DeviceError::OutOfRange {
                start,
                nsec,
                total: self.total_sectors,
            });
        }
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_sectors(&self, start: u32, nsec: u32, dst: &mut [u8]) -> Result<(), DeviceError> {
        self.check_range(start, nsec)?;
        debug_assert_eq!(dst.len(), nsec as usize * SECTOR_SIZE);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(start as u64 * SECTOR_SIZE as u64))?;
        file.read_exact(dst)?;
        Ok(())
    }

    fn write_sectors(&self, start: u32, nsec: u32, src: &[u8]) -> Result<(), DeviceError> {
        self.check_range(start, nsec)?;
        debug_assert_eq!(src.len(), nsec as usize * SECTOR_SIZE);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(start as u64 * SECTOR_SIZE as u64))?;
        file.write_all(src)?;
        Ok(())
    }

    fn supports_dma(&self) -> bool {
        false
    }

    fn total_sectors(&self) -> u32 {
        self.total_sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_fresh_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let dev = FileBlockDevice::create(&path, 16).unwrap();
        assert_eq!(dev.total_sectors(), 16);
        assert!(!dev.supports_dma());

        let mut src = vec![0u8; SECTOR_SIZE * 2];
        src[0] = 0xAB;
        src[SECTOR_SIZE] = 0xCD;
        dev.write_sectors(3, 2, &src).unwrap();

        let mut dst = vec![0u8; SECTOR_SIZE * 2];
        dev.read_sectors(3, 2, &mut dst).unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn rejects_out_of_range_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let dev = FileBlockDevice::create(&path, 4).unwrap();
        let buf = vec![0u8; SECTOR_SIZE];
        let err = dev.read_sectors(3, 2, &mut buf.clone()).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfRange { .. }));
        let _ = buf;
    }
}
