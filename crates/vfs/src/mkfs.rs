//! Filesystem initializer (SPEC_FULL.md §4.4).
//!
//! Runs offline against a [`BlockDevice`] directly — no [`abc::Abc`]
//! instance is started, matching the "single-threaded, no concurrent
//! foreground traffic" posture `mkfs` shares with `fsck`.

use std::time::{SystemTime, UNIX_EPOCH};

use block_device::{BlockDevice, SECTOR_SIZE};
use log::info;

use crate::error::{VfsError, VfsResult};
use crate::format::{Extent, FileHeader, FreeNode, Superblock, EXTSIZ, FREE_SEC, ROOT_SEC, TYPE_DIR};

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Write a blank filesystem of `nsectors` sectors onto `device`.
///
/// Requires at least 4 sectors: superblock, root directory header, one
/// free-list node, and at least one free data sector.
pub fn format_device(device: &dyn BlockDevice, nsectors: u32) -> VfsResult<()> {
    if nsectors <= FREE_SEC + 1 {
        return Err(VfsError::InvalidArgument(format!(
            "need at least {} sectors, got {nsectors}",
            FREE_SEC + 2
        )));
    }

    let zero = [0u8; SECTOR_SIZE];
    for s in 0..nsectors {
        device.write_sectors(s, 1, &zero)?;
    }

    let sb = Superblock {
        magic: crate::format::MAGIC,
        total_sectors: nsectors,
        extent_growth_quantum: EXTSIZ,
        free_list_head: FREE_SEC,
        reclaim: Vec::new(),
    };
    device.write_sectors(crate::format::SUPER_SEC, 1, &sb.encode())?;

    let root_hdr = FileHeader::new_empty(TYPE_DIR, Extent { start: ROOT_SEC, length: 1 }, 0, now());
    let mut root_sector = [0u8; SECTOR_SIZE];
    root_sector[..320].copy_from_slice(&root_hdr.encode());
    device.write_sectors(ROOT_SEC, 1, &root_sector)?;

    let free_node = FreeNode {
        next: 0,
        entries: vec![Extent {
            start: FREE_SEC + 1,
            length: nsectors - FREE_SEC - 1,
        }],
    };
    device.write_sectors(FREE_SEC, 1, &free_node.encode())?;

    info!("mkfs: formatted {nsectors} sectors, {} free", nsectors - FREE_SEC - 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::FileBlockDevice;

    #[test]
    fn formats_a_clean_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let dev = FileBlockDevice::create(&path, 4096).unwrap();
        format_device(&dev, 4096).unwrap();

        let mut raw = vec![0u8; SECTOR_SIZE];
        dev.read_sectors(0, 1, &mut raw).unwrap();
        let sb = Superblock::decode(&raw);
        assert_eq!(sb.magic, crate::format::MAGIC);
        assert_eq!(sb.total_sectors, 4096);
        assert_eq!(sb.free_list_head, FREE_SEC);

        dev.read_sectors(ROOT_SEC, 1, &mut raw).unwrap();
        let hdr = FileHeader::decode(&raw[..320]);
        assert_eq!(hdr.kind, TYPE_DIR);
        assert_eq!(hdr.blks, vec![Extent { start: ROOT_SEC, length: 1 }]);

        dev.read_sectors(FREE_SEC, 1, &mut raw).unwrap();
        let node = FreeNode::decode(&raw);
        assert_eq!(node.entries, vec![Extent { start: FREE_SEC + 1, length: 4096 - FREE_SEC - 1 }]);
    }

    #[test]
    fn rejects_too_small_a_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let dev = FileBlockDevice::create(&path, 2).unwrap();
        assert!(format_device(&dev, 2).is_err());
    }
}
