//! `bmap` and the byte-range read/write built on top of it
//! (SPEC_FULL.md §4.3.2, §4.3.7).
//!
//! A file's logical bytes are the concatenation of its extents' sectors,
//! except that the first [`HEADER_SIZE`] bytes of extent 0 are the
//! `FileHeader` — user data starts at byte `HEADER_SIZE` of extent 0.

use abc::{Abc, FindFlags, Handle};
use block_device::SECTOR_SIZE;

use crate::error::{VfsError, VfsResult};
use crate::format::{Extent, FileHeader, EXTSIZ, HEADER_SIZE};

/// Translate a logical byte position into the (extent, sector-in-extent,
/// byte-in-sector) triple it falls in, per SPEC_FULL.md §4.3.7. `blks` must
/// be non-empty.
fn locate(blks: &[Extent], logical_pos: u64) -> VfsResult<(usize, u32, usize)> {
    let absolute = logical_pos + HEADER_SIZE as u64;
    let mut sector_of_pos = (absolute / SECTOR_SIZE as u64) as u32;
    let byte_in_sector = (absolute % SECTOR_SIZE as u64) as usize;
    for (i, e) in blks.iter().enumerate() {
        if sector_of_pos < e.length {
            return Ok((i, sector_of_pos, byte_in_sector));
        }
        sector_of_pos -= e.length;
    }
    Err(VfsError::InvalidArgument(format!(
        "position {logical_pos} is past the file's allocated capacity"
    )))
}

/// Given a sector offset within an extent, return the EXTSIZ-aligned window
/// (`window_start` absolute sector, `window_len`, `sector_in_window`) that
/// `sector_in_ext` falls in. A logical extent can grow past [`EXTSIZ`]
/// sectors over time, but no single cached buf is ever asked to represent
/// more than one such window (SPEC_FULL.md §4.3.7).
fn window(ext: Extent, sector_in_ext: u32) -> (u32, u32, u32) {
    let s_aligned = sector_in_ext & !(EXTSIZ - 1);
    let window_len = (ext.length - s_aligned).min(EXTSIZ);
    (ext.start + s_aligned, window_len, sector_in_ext - s_aligned)
}

/// Read up to `len` bytes starting at `pos`, stopping early at the end of
/// the file's allocated capacity (callers clamp further to `byte_length`).
pub(crate) fn read_at(abc: &Abc, hdr: &FileHeader, pos: u64, len: usize) -> VfsResult<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut pos = pos;
    let mut remaining = len;
    while remaining > 0 {
        let (ext_idx, sector_in_ext, byte_off) = match locate(&hdr.blks, pos) {
            Ok(v) => v,
            Err(_) => break,
        };
        let ext = hdr.blks[ext_idx];
        let (win_start, win_len, sector_in_win) = window(ext, sector_in_ext);
        let id = abc.find_buf(win_start, win_len, FindFlags::FILL)?;
        let avail_in_sector = SECTOR_SIZE - byte_off;
        let step = avail_in_sector.min(remaining);
        let data = abc.index_buf(id, sector_in_win, 1)?;
        out.extend_from_slice(&data[byte_off..byte_off + step]);
        pos += step as u64;
        remaining -= step;
    }
    Ok(out)
}

/// Write `data` at `pos`, which must already lie within the file's
/// allocated capacity (growth is the caller's responsibility — see
/// [`crate::vfs::Vfs::grow_to`]).
pub(crate) fn write_at(
    abc: &Abc,
    hdr: &FileHeader,
    pos: u64,
    data: &[u8],
    handle: Handle,
) -> VfsResult<()> {
    let mut pos = pos;
    let mut off = 0usize;
    while off < data.len() {
        let (ext_idx, sector_in_ext, byte_off) = locate(&hdr.blks, pos)?;
        let ext = hdr.blks[ext_idx];
        let (win_start, win_len, sector_in_win) = window(ext, sector_in_ext);
        let id = abc.find_buf(win_start, win_len, FindFlags::FILL)?;
        let avail_in_sector = SECTOR_SIZE - byte_off;
        let step = avail_in_sector.min(data.len() - off);
        abc.write_buf(id, sector_in_win, byte_off as u32, &data[off..off + step])?;
        abc.dirty_buf(id, Some(handle))?;
        pos += step as u64;
        off += step;
    }
    Ok(())
}
