//! Offline consistency checker (SPEC_FULL.md §4.5).
//!
//! Runs directly against a [`BlockDevice`], like `mkfs` — no live `Abc`/`Vfs`
//! instance is started. Single-threaded, one-sector-at-a-time read/modify/
//! write, with every repair gated by a [`Prompter`] so a caller can answer
//! interactively or pass `--yes` for scripted use.

use block_device::{BlockDevice, SECTOR_SIZE};
use log::{info, warn};

use crate::error::{VfsError, VfsResult};
use crate::format::{
    DirEntry, Extent, FileHeader, FreeNode, Superblock, DIRENT_SIZE, FREE_SEC, HEADER_SIZE, MAX_EXTENTS, ROOT_SEC,
    TYPE_DIR, TYPE_FILE,
};

/// Asks the operator whether to apply a described repair. `--yes` is
/// `AlwaysYes`; an interactive CLI supplies its own implementation backed by
/// stdin.
pub trait Prompter {
    fn confirm(&mut self, description: &str) -> bool;
}

/// Non-interactive prompter that accepts every repair, required to drive the
/// fixed-point property of SPEC_FULL.md §8 without a live terminal.
pub struct AlwaysYes;

impl Prompter for AlwaysYes {
    fn confirm(&mut self, description: &str) -> bool {
        info!("fsck: auto-accepting: {description}");
        true
    }
}

/// Summary of one `fsck` pass.
#[derive(Debug, Default)]
pub struct Report {
    pub errors_found: usize,
    pub errors_fixed: usize,
    pub lost_sectors_reclaimed: u32,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.errors_found == 0
    }
}

fn read_sector(device: &dyn BlockDevice, sector: u32) -> VfsResult<[u8; SECTOR_SIZE]> {
    let mut buf = [0u8; SECTOR_SIZE];
    device.read_sectors(sector, 1, &mut buf)?;
    Ok(buf)
}

fn write_sector(device: &dyn BlockDevice, sector: u32, data: &[u8; SECTOR_SIZE]) -> VfsResult<()> {
    device.write_sectors(sector, 1, data)?;
    Ok(())
}

struct Bitmaps {
    freemap: Vec<bool>,
    allocmap: Vec<bool>,
}

impl Bitmaps {
    fn new(total_sectors: u32) -> Self {
        Self {
            freemap: vec![false; total_sectors as usize],
            allocmap: vec![false; total_sectors as usize],
        }
    }

    fn in_bounds(&self, s: u32) -> bool {
        (s as usize) < self.freemap.len()
    }

    fn extent_in_bounds(&self, e: &Extent) -> bool {
        e.length > 0 && self.in_bounds(e.start) && (e.end() as usize) <= self.freemap.len()
    }

    fn mark_free(&mut self, e: &Extent) {
        for s in e.start..e.end() {
            self.freemap[s as usize] = true;
        }
    }

    fn mark_alloc(&mut self, e: &Extent) {
        for s in e.start..e.end() {
            self.allocmap[s as usize] = true;
        }
    }
}

/// Run a full check (and, where the prompter agrees, repair) of `device`,
/// which is assumed to hold `nsectors` sectors.
pub fn check(device: &dyn BlockDevice, nsectors: u32, prompter: &mut dyn Prompter) -> VfsResult<Report> {
    let mut report = Report::default();

    // Phase 1: superblock.
    let mut sb = Superblock::decode(&read_sector(device, crate::format::SUPER_SEC)?);
    if sb.magic != crate::format::MAGIC {
        return Err(VfsError::BadSuperblock(format!("bad magic {:#x}", sb.magic)));
    }
    if sb.total_sectors > nsectors {
        report.errors_found += 1;
        let msg = format!(
            "superblock claims {} sectors, device has {nsectors}",
            sb.total_sectors
        );
        if prompter.confirm(&format!("{msg}; clamp to device size?")) {
            sb.total_sectors = nsectors;
            write_sector(device, crate::format::SUPER_SEC, &sb.encode())?;
            report.errors_fixed += 1;
        } else {
            warn!("fsck: {msg}");
        }
    }
    let mut maps = Bitmaps::new(sb.total_sectors);

    // Phase 2: free-list walk.
    walk_free_list(device, &mut sb, &mut maps, &mut report, prompter)?;

    // Phase 3: directory tree walk from root.
    walk_tree(device, ROOT_SEC, &mut maps, &mut report, prompter)?;

    // Phase 4: lost-block pass.
    lost_block_pass(device, &mut sb, &maps, &mut report, prompter)?;

    info!(
        "fsck: {} error(s) found, {} fixed, {} sector(s) reclaimed",
        report.errors_found, report.errors_fixed, report.lost_sectors_reclaimed
    );
    Ok(report)
}

fn walk_free_list(
    device: &dyn BlockDevice,
    sb: &mut Superblock,
    maps: &mut Bitmaps,
    report: &mut Report,
    prompter: &mut dyn Prompter,
) -> VfsResult<()> {
    let mut cur = sb.free_list_head;
    let mut prev_start: Option<u32> = None;
    let mut guard = 0usize;
    while cur != 0 {
        guard += 1;
        if guard > maps.freemap.len() + 1 {
            report.errors_found += 1;
            warn!("fsck: free-list chain does not terminate; truncating");
            return Ok(());
        }
        if !maps.in_bounds(cur) {
            report.errors_found += 1;
            warn!("fsck: free-list node sector {cur} is out of bounds; stopping walk");
            return Ok(());
        }
        let mut node = FreeNode::decode(&read_sector(device, cur)?);
        maps.mark_alloc(&Extent { start: cur, length: 1 });
        maps.mark_free(&Extent { start: cur, length: 1 });

        let mut kept = Vec::with_capacity(node.entries.len());
        let mut last_start: Option<u32> = None;
        let mut node_dirty = false;
        for e in node.entries.iter() {
            let monotonic = last_start.map(|s| e.start > s).unwrap_or(true);
            let valid = maps.extent_in_bounds(e) && monotonic;
            if !valid {
                report.errors_found += 1;
                if prompter.confirm(&format!("drop invalid free-list entry {e:?} at node {cur}")) {
                    node_dirty = true;
                    report.errors_fixed += 1;
                    continue;
                }
            }
            last_start = Some(e.start);
            kept.push(*e);
            maps.mark_free(e);
        }
        if node_dirty {
            node.entries = kept;
            write_sector(device, cur, &node.encode())?;
        }

        let monotonic_node = prev_start.map(|s| cur > s).unwrap_or(true);
        if !monotonic_node {
            report.errors_found += 1;
            warn!("fsck: free-list node order is not strictly increasing at sector {cur}");
        }
        prev_start = Some(cur);
        cur = node.next;
    }
    Ok(())
}

fn walk_tree(
    device: &dyn BlockDevice,
    sector: u32,
    maps: &mut Bitmaps,
    report: &mut Report,
    prompter: &mut dyn Prompter,
) -> VfsResult<()> {
    if !maps.in_bounds(sector) {
        report.errors_found += 1;
        warn!("fsck: sector {sector} referenced out of bounds");
        return Ok(());
    }
    let raw = read_sector(device, sector)?;
    let mut hdr = FileHeader::decode(&raw[..HEADER_SIZE]);

    if hdr.kind != TYPE_FILE && hdr.kind != TYPE_DIR {
        report.errors_found += 1;
        warn!("fsck: sector {sector} has unknown type tag {}", hdr.kind);
        return Ok(());
    }
    if hdr.blks.is_empty() || hdr.blks.len() > MAX_EXTENTS {
        report.errors_found += 1;
        warn!("fsck: sector {sector} has invalid extent count {}", hdr.blks.len());
        return Ok(());
    }
    if hdr.blks[0].start != sector {
        report.errors_found += 1;
        warn!("fsck: sector {sector}'s first extent does not start at its own header sector");
    }
    if (hdr.byte_length as usize) < HEADER_SIZE {
        report.errors_found += 1;
        warn!("fsck: sector {sector} byte_length {} is smaller than the header", hdr.byte_length);
    }

    let mut any_bad_extent = false;
    for e in &hdr.blks {
        if !maps.extent_in_bounds(e) {
            report.errors_found += 1;
            any_bad_extent = true;
            warn!("fsck: sector {sector} extent {e:?} is out of bounds");
            continue;
        }
        let double_alloc = e.start..e.end();
        let mut conflict = false;
        for s in double_alloc.clone() {
            if maps.allocmap[s as usize] {
                conflict = true;
            }
        }
        if conflict {
            report.errors_found += 1;
            any_bad_extent = true;
            warn!("fsck: sector {sector} extent {e:?} double-allocated");
            continue;
        }
        let mut free_conflict = false;
        for s in double_alloc {
            if maps.freemap[s as usize] {
                free_conflict = true;
            }
        }
        if free_conflict {
            report.errors_found += 1;
            any_bad_extent = true;
            warn!("fsck: sector {sector} extent {e:?} conflicts with the free list");
            continue;
        }
        maps.mark_alloc(e);
    }

    let total_capacity: u32 = hdr.blks.iter().map(|e| e.length).sum();
    let needed_sectors = (hdr.byte_length as u64 + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64;
    if (total_capacity as u64) > needed_sectors {
        let excess = total_capacity as u64 - needed_sectors;
        let prefix_sectors: u64 = hdr.blks[..hdr.blks.len() - 1].iter().map(|e| e.length as u64).sum();
        // Reclaimable only when every needed sector is covered by the
        // extents preceding the last one, i.e. all the slack lies in the
        // final extent past ceil(byte_length/SECSZ) (resolved Open Question,
        // see DESIGN.md).
        let slack_in_final_extent = prefix_sectors <= needed_sectors;
        if slack_in_final_extent {
            report.errors_found += 1;
            if prompter.confirm(&format!("sector {sector} has {excess} excess trailing sector(s); trim?")) {
                let last = hdr.blks.last_mut().unwrap();
                let freed = Extent { start: last.end() - excess as u32, length: excess as u32 };
                last.length -= excess as u32;
                if last.length == 0 && hdr.blks.len() > 1 {
                    hdr.blks.pop();
                }
                for s in freed.start..freed.end() {
                    maps.allocmap[s as usize] = false;
                }
                let mut raw = read_sector(device, sector)?;
                raw[..HEADER_SIZE].copy_from_slice(&hdr.encode());
                write_sector(device, sector, &raw)?;
                report.errors_fixed += 1;
            }
        } else {
            report.errors_found += 1;
            warn!("fsck: sector {sector} has excess capacity not confined to its final extent");
        }
    }

    if any_bad_extent {
        return Ok(());
    }

    if hdr.prev_version != 0 {
        if walk_tree(device, hdr.prev_version, maps, report, prompter).is_err() {
            report.errors_found += 1;
            if prompter.confirm(&format!("break broken version chain at sector {sector}")) {
                let mut fixed = hdr.clone();
                fixed.prev_version = 0;
                let mut raw = read_sector(device, sector)?;
                raw[..HEADER_SIZE].copy_from_slice(&fixed.encode());
                write_sector(device, sector, &raw)?;
                report.errors_fixed += 1;
            }
        }
    }

    if hdr.kind == TYPE_DIR {
        let count = (hdr.byte_length - HEADER_SIZE as u32) / DIRENT_SIZE as u32;
        for idx in 0..count {
            let entry = read_dir_entry(device, &hdr, idx)?;
            if entry.is_tomb() || entry.is_end() {
                continue;
            }
            let printable = entry
                .name_str()
                .bytes()
                .all(|b| (0x20..0x7f).contains(&b));
            if !printable {
                report.errors_found += 1;
                if prompter.confirm(&format!("tomb unprintable directory entry at {sector}[{idx}]")) {
                    tomb_entry(device, &hdr, idx)?;
                    report.errors_fixed += 1;
                }
                continue;
            }
            if walk_tree(device, entry.start, maps, report, prompter).is_err() {
                report.errors_found += 1;
                if prompter.confirm(&format!("tomb entry {:?} at {sector}[{idx}] (recursion failed)", entry.name_str())) {
                    tomb_entry(device, &hdr, idx)?;
                    report.errors_fixed += 1;
                }
            }
        }
    }

    Ok(())
}

fn read_dir_entry(device: &dyn BlockDevice, hdr: &FileHeader, idx: u32) -> VfsResult<DirEntry> {
    let pos = HEADER_SIZE as u64 + idx as u64 * DIRENT_SIZE as u64;
    let (ext_idx, sector_in_ext, byte_off) = locate_for_fsck(&hdr.blks, pos)?;
    let ext = hdr.blks[ext_idx];
    let raw = read_sector(device, ext.start + sector_in_ext)?;
    if byte_off + DIRENT_SIZE <= SECTOR_SIZE {
        Ok(DirEntry::decode(&raw[byte_off..byte_off + DIRENT_SIZE]))
    } else {
        // Entry straddles a sector boundary; not reachable with DIRENT_SIZE=32
        // dividing SECTOR_SIZE evenly, kept only as a defensive fallback.
        Ok(DirEntry::empty())
    }
}

fn tomb_entry(device: &dyn BlockDevice, hdr: &FileHeader, idx: u32) -> VfsResult<()> {
    let pos = HEADER_SIZE as u64 + idx as u64 * DIRENT_SIZE as u64;
    let (ext_idx, sector_in_ext, byte_off) = locate_for_fsck(&hdr.blks, pos)?;
    let ext = hdr.blks[ext_idx];
    let sector = ext.start + sector_in_ext;
    let mut raw = read_sector(device, sector)?;
    raw[byte_off] |= 0x80;
    write_sector(device, sector, &raw)
}

fn locate_for_fsck(blks: &[Extent], absolute_pos: u64) -> VfsResult<(usize, u32, usize)> {
    let mut sector_of_pos = (absolute_pos / SECTOR_SIZE as u64) as u32;
    let byte_in_sector = (absolute_pos % SECTOR_SIZE as u64) as usize;
    for (i, e) in blks.iter().enumerate() {
        if sector_of_pos < e.length {
            return Ok((i, sector_of_pos, byte_in_sector));
        }
        sector_of_pos -= e.length;
    }
    Err(VfsError::Corrupted("directory entry position past allocated capacity".into()))
}

fn lost_block_pass(
    device: &dyn BlockDevice,
    sb: &mut Superblock,
    maps: &Bitmaps,
    report: &mut Report,
    prompter: &mut dyn Prompter,
) -> VfsResult<()> {
    let mut already_reclaimed = vec![false; maps.freemap.len()];
    for e in &sb.reclaim {
        for s in e.start..e.end() {
            if (s as usize) < already_reclaimed.len() {
                already_reclaimed[s as usize] = true;
            }
        }
    }

    let mut lost = Vec::new();
    let mut run: Option<Extent> = None;
    for s in (FREE_SEC + 1)..sb.total_sectors {
        if !maps.freemap[s as usize] && !maps.allocmap[s as usize] && !already_reclaimed[s as usize] {
            match &mut run {
                Some(e) if e.end() == s => e.length += 1,
                _ => {
                    if let Some(e) = run.take() {
                        lost.push(e);
                    }
                    run = Some(Extent { start: s, length: 1 });
                }
            }
        } else if let Some(e) = run.take() {
            lost.push(e);
        }
    }
    if let Some(e) = run.take() {
        lost.push(e);
    }

    if lost.is_empty() {
        return Ok(());
    }
    report.errors_found += lost.len();
    let total: u32 = lost.iter().map(|e| e.length).sum();
    if !prompter.confirm(&format!("{total} lost sector(s) in {} range(s) found; reclaim?", lost.len())) {
        return Ok(());
    }
    let room = Superblock::MAX_RECLAIM.saturating_sub(sb.reclaim.len());
    let taken = lost.len().min(room);
    if taken < lost.len() {
        warn!(
            "fsck: only {taken}/{} lost ranges fit the reclaim queue this pass; the rest remain lost",
            lost.len()
        );
    }
    for e in lost.into_iter().take(taken) {
        report.lost_sectors_reclaimed += e.length;
        sb.reclaim.push(e);
    }
    report.errors_fixed += taken;
    write_sector(device, crate::format::SUPER_SEC, &sb.encode())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkfs::format_device;
    use block_device::FileBlockDevice;

    #[test]
    fn a_freshly_formatted_volume_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileBlockDevice::create(dir.path().join("disk.img"), 2048).unwrap();
        format_device(&dev, 2048).unwrap();
        let report = check(&dev, 2048, &mut AlwaysYes).unwrap();
        assert!(report.is_clean(), "{report:?}");
    }

    #[test]
    fn detects_and_reclaims_a_lost_range() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileBlockDevice::create(dir.path().join("disk.img"), 2048).unwrap();
        format_device(&dev, 2048).unwrap();

        // Steal ten sectors from the free list without telling any file
        // about them, simulating a crash mid-allocation.
        let mut raw = [0u8; SECTOR_SIZE];
        dev.read_sectors(FREE_SEC, 1, &mut raw).unwrap();
        let mut node = FreeNode::decode(&raw);
        let e = node.entries[0];
        node.entries[0] = Extent { start: e.start + 10, length: e.length - 10 };
        dev.write_sectors(FREE_SEC, 1, &node.encode()).unwrap();

        let report = check(&dev, 2048, &mut AlwaysYes).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.lost_sectors_reclaimed, 10);

        let mut raw = [0u8; SECTOR_SIZE];
        dev.read_sectors(crate::format::SUPER_SEC, 1, &mut raw).unwrap();
        let sb = Superblock::decode(&raw);
        assert_eq!(sb.reclaim.len(), 1);
        assert_eq!(sb.reclaim[0].length, 10);

        let second = check(&dev, 2048, &mut AlwaysYes).unwrap();
        assert!(second.is_clean(), "{second:?}");
    }
}
