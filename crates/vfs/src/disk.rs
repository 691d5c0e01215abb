//! Thin sector-shaped accessors over [`abc::Abc`] for the fixed-size
//! on-disk metadata records (superblock, free-list nodes, file headers,
//! directory entries). Everything here addresses exactly one sector at a
//! time through a single-sector buf — file/directory *data* goes through
//! the extent-shaped path in [`crate::io`] instead.

use abc::{Abc, FindFlags, Handle};
use block_device::SECTOR_SIZE;

use crate::error::VfsResult;
use crate::format::{FileHeader, FreeNode, Superblock, HEADER_SIZE};

pub(crate) fn read_sector(abc: &Abc, sector: u32) -> VfsResult<[u8; SECTOR_SIZE]> {
    let id = abc.find_buf(sector, 1, FindFlags::FILL)?;
    let data = abc.index_buf(id, 0, 1)?;
    let mut out = [0u8; SECTOR_SIZE];
    out.copy_from_slice(&data);
    Ok(out)
}

pub(crate) fn write_sector(
    abc: &Abc,
    sector: u32,
    data: &[u8; SECTOR_SIZE],
    handle: Option<Handle>,
) -> VfsResult<()> {
    let id = abc.find_buf(sector, 1, FindFlags::NONE)?;
    abc.write_buf(id, 0, 0, data)?;
    abc.dirty_buf(id, handle)?;
    Ok(())
}

pub(crate) fn read_superblock(abc: &Abc) -> VfsResult<Superblock> {
    Ok(Superblock::decode(&read_sector(abc, crate::format::SUPER_SEC)?))
}

pub(crate) fn write_superblock(abc: &Abc, sb: &Superblock, handle: Option<Handle>) -> VfsResult<()> {
    write_sector(abc, crate::format::SUPER_SEC, &sb.encode(), handle)
}

/// Read the `FileHeader` overlaid on the first [`HEADER_SIZE`] bytes of
/// `sector`. The remainder of the sector (user data, for a file/directory
/// small enough that its first data bytes share sector 0 of extent 0) is
/// not touched.
pub(crate) fn read_header(abc: &Abc, sector: u32) -> VfsResult<FileHeader> {
    let raw = read_sector(abc, sector)?;
    Ok(FileHeader::decode(&raw[..HEADER_SIZE]))
}

/// Write `hdr` into the first [`HEADER_SIZE`] bytes of `sector`, preserving
/// whatever data bytes already occupy the tail of the sector.
pub(crate) fn write_header(
    abc: &Abc,
    sector: u32,
    hdr: &FileHeader,
    handle: Option<Handle>,
) -> VfsResult<()> {
    let mut raw = read_sector(abc, sector)?;
    raw[..HEADER_SIZE].copy_from_slice(&hdr.encode());
    write_sector(abc, sector, &raw, handle)
}

pub(crate) fn read_free_node(abc: &Abc, sector: u32) -> VfsResult<FreeNode> {
    Ok(FreeNode::decode(&read_sector(abc, sector)?))
}

pub(crate) fn write_free_node(
    abc: &Abc,
    sector: u32,
    node: &FreeNode,
    handle: Option<Handle>,
) -> VfsResult<()> {
    write_sector(abc, sector, &node.encode(), handle)
}
