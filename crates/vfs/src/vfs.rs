use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use abc::{Abc, CacheConfig, Handle};
use block_device::BlockDevice;
use log::{debug, warn};

use crate::alloc;
use crate::config::FsConfig;
use crate::disk;
use crate::error::{VfsError, VfsResult};
use crate::format::{DirEntry, Extent, FileHeader, Superblock, DIRENT_SIZE, HEADER_SIZE, ROOT_SEC, TYPE_DIR, TYPE_FILE};
use crate::io;

pub(crate) struct OpenEntry {
    pub handle: Handle,
    pub first_extent_len: u32,
    pub high_water: u64,
    pub refs: u32,
}

pub(crate) struct VfsShared {
    pub(crate) abc: Arc<Abc>,
    pub(crate) config: FsConfig,
    superblock: Mutex<Superblock>,
    open_files: Mutex<HashMap<u32, OpenEntry>>,
    next_handle: AtomicU64,
}

/// The VSTa-style on-disk filesystem, layered on an [`Abc`].
///
/// Cheaply cloneable (an `Arc` around the shared cache/superblock/open-file
/// state) — each [`crate::Client`] owns one clone.
#[derive(Clone)]
pub struct Vfs(pub(crate) Arc<VfsShared>);

fn now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl Vfs {
    /// Mount an already-formatted volume. Validates the superblock magic
    /// and folds any pending `fsck` reclaim ranges back into the free list.
    pub fn open(device: Arc<dyn BlockDevice>, config: FsConfig) -> VfsResult<Self> {
        let abc = Abc::new(device, CacheConfig::default());
        let mut sb = disk::read_superblock(&abc)?;
        if sb.magic != crate::format::MAGIC {
            return Err(VfsError::BadSuperblock(format!(
                "bad magic {:#x}, expected {:#x}",
                sb.magic,
                crate::format::MAGIC
            )));
        }
        if !sb.reclaim.is_empty() {
            let pending: Vec<Extent> = sb.reclaim.drain(..).collect();
            let handle = Handle(0);
            for e in pending {
                debug!("vfs: reclaiming {} sectors at {} from fsck", e.length, e.start);
                alloc::free_block(&abc, &mut sb, e.start, e.length, handle)?;
            }
            disk::write_superblock(&abc, &sb, Some(handle))?;
            abc.sync_bufs(Some(handle))?;
        }
        Ok(Self(Arc::new(VfsShared {
            abc,
            config,
            superblock: Mutex::new(sb),
            open_files: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })))
    }

    pub(crate) fn abc(&self) -> &Abc {
        &self.0.abc
    }

    pub(crate) fn config(&self) -> FsConfig {
        self.0.config
    }

    /// Root directory's identity (first sector), stable for a volume's
    /// lifetime.
    pub fn root_sector(&self) -> u32 {
        ROOT_SEC
    }

    pub(crate) fn read_header(&self, sector: u32) -> VfsResult<FileHeader> {
        disk::read_header(&self.0.abc, sector)
    }

    pub(crate) fn write_header(&self, sector: u32, hdr: &FileHeader, handle: Handle) -> VfsResult<()> {
        disk::write_header(&self.0.abc, sector, hdr, Some(handle))
    }

    fn new_handle(&self) -> Handle {
        Handle(self.0.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Register interest in `sector`, returning the shared dirty-handle and
    /// high-water mark used across all clients with it open.
    pub(crate) fn retain_open(&self, sector: u32, first_extent_len: u32) -> Handle {
        let mut table = self.0.open_files.lock().unwrap();
        let entry = table.entry(sector).or_insert_with(|| OpenEntry {
            handle: Handle(0),
            first_extent_len,
            high_water: 0,
            refs: 0,
        });
        if entry.refs == 0 {
            entry.handle = self.new_handle();
            entry.first_extent_len = first_extent_len;
            entry.high_water = 0;
        }
        entry.refs += 1;
        entry.handle
    }

    pub(crate) fn note_high_water(&self, sector: u32, pos: u64) {
        let mut table = self.0.open_files.lock().unwrap();
        if let Some(entry) = table.get_mut(&sector) {
            entry.high_water = entry.high_water.max(pos);
        }
    }

    pub(crate) fn handle_of(&self, sector: u32) -> Handle {
        self.0
            .open_files
            .lock()
            .unwrap()
            .get(&sector)
            .map(|e| e.handle)
            .unwrap_or(Handle(0))
    }

    /// Drop one reference to `sector`. On the last reference, trims the
    /// file's `byte_length` to the high-water mark actually written, per
    /// SPEC_FULL.md §4.3.9.
    pub(crate) fn release_open(&self, sector: u32) {
        let (should_trim, handle, high_water) = {
            let mut table = self.0.open_files.lock().unwrap();
            match table.get_mut(&sector) {
                Some(entry) => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        let e = table.remove(&sector).unwrap();
                        (true, e.handle, e.high_water)
                    } else {
                        (false, Handle(0), 0)
                    }
                }
                None => (false, Handle(0), 0),
            }
        };
        if !should_trim {
            return;
        }
        if let Err(e) = self.trim_to_high_water(sector, high_water, handle) {
            warn!("vfs: trim-on-close failed for sector {sector}: {e}");
        }
    }

    fn trim_to_high_water(&self, sector: u32, high_water: u64, handle: Handle) -> VfsResult<()> {
        if high_water == 0 {
            return Ok(());
        }
        let mut hdr = self.read_header(sector)?;
        let trimmed = HEADER_SIZE as u64 + high_water;
        if trimmed < hdr.byte_length as u64 {
            hdr.byte_length = trimmed as u32;
            self.write_header(sector, &hdr, handle)?;
            self.0.abc.sync_bufs(Some(handle))?;
        }
        Ok(())
    }

    fn lock_superblock(&self) -> std::sync::MutexGuard<'_, Superblock> {
        self.0.superblock.lock().unwrap()
    }

    pub(crate) fn write_superblock(&self, sb: &Superblock, handle: Handle) -> VfsResult<()> {
        disk::write_superblock(&self.0.abc, sb, Some(handle))
    }

    /// Grow `hdr`'s allocated capacity so that `need_content_bytes` bytes of
    /// user data are addressable, per SPEC_FULL.md §4.3.6.
    pub(crate) fn grow_to(
        &self,
        sector: u32,
        hdr: &mut FileHeader,
        need_content_bytes: u64,
        handle: Handle,
    ) -> VfsResult<()> {
        let need_total = HEADER_SIZE as u64 + need_content_bytes;
        let have_bytes = hdr.total_capacity_sectors() as u64 * block_device::SECTOR_SIZE as u64;
        if need_total <= have_bytes {
            if need_total > hdr.byte_length as u64 {
                hdr.byte_length = need_total as u32;
                self.write_header(sector, hdr, handle)?;
            }
            return Ok(());
        }

        let quantum = self.0.config.extent_quantum as u64;
        let mut still_needed =
            (need_total - have_bytes + block_device::SECTOR_SIZE as u64 - 1) / block_device::SECTOR_SIZE as u64;
        let mut sb = self.lock_superblock();

        let last = *hdr.blks.last().expect("FileHeader always has >=1 extent");
        let want_extend = still_needed.max(quantum) as u32;
        let taken = alloc::take_block(&self.0.abc, &mut sb, last.end(), want_extend, handle)?;
        if taken > 0 {
            // The extent's logical length can grow past EXTSIZ; the cache
            // only ever sees EXTSIZ-aligned windows of it (crate::io::window),
            // so there is no whole-extent buf here to resize.
            hdr.blks.last_mut().unwrap().length += taken;
            still_needed = still_needed.saturating_sub(taken as u64);
            debug!("vfs: extended trailing extent at {} by {taken} sectors", last.start);
        }

        while still_needed > 0 {
            if hdr.blks.len() >= self.0.config.max_extents {
                self.write_superblock(&sb, handle)?;
                return Err(VfsError::TooManyExtents {
                    max: self.0.config.max_extents,
                });
            }
            let alloc_len = still_needed.max(quantum) as u32;
            let new_start = match alloc::alloc_block(&self.0.abc, &mut sb, alloc_len, handle) {
                Ok(s) => s,
                Err(e) => {
                    self.write_superblock(&sb, handle)?;
                    return Err(e);
                }
            };
            debug!("vfs: allocated new extent {new_start}..+{alloc_len}");
            hdr.blks.push(Extent {
                start: new_start,
                length: alloc_len,
            });
            still_needed = still_needed.saturating_sub(alloc_len as u64);
        }

        self.write_superblock(&sb, handle)?;
        hdr.byte_length = need_total as u32;
        self.write_header(sector, hdr, handle)?;
        Ok(())
    }

    /// Release a file's extents back to the free list (on `remove` once
    /// `nlink` hits zero).
    pub(crate) fn free_extents(&self, hdr: &FileHeader, handle: Handle) -> VfsResult<()> {
        let mut sb = self.lock_superblock();
        for e in &hdr.blks {
            alloc::free_block(&self.0.abc, &mut sb, e.start, e.length, handle)?;
        }
        self.write_superblock(&sb, handle)?;
        Ok(())
    }

    /// Allocate a brand-new file/directory: grab one extent, write an empty
    /// `FileHeader` at its first sector.
    pub(crate) fn create_node(&self, kind: u16, owner: u32, handle: Handle) -> VfsResult<u32> {
        let mut sb = self.lock_superblock();
        let quantum = self.0.config.extent_quantum;
        let start = alloc::alloc_block(&self.0.abc, &mut sb, quantum, handle)?;
        self.write_superblock(&sb, handle)?;
        drop(sb);
        let hdr = FileHeader::new_empty(kind, Extent { start, length: quantum }, owner, now());
        self.write_header(start, &hdr, handle)?;
        Ok(start)
    }

    // ---- Directory helpers --------------------------------------------

    pub(crate) fn dir_entry_count(hdr: &FileHeader) -> u32 {
        (hdr.byte_length - HEADER_SIZE as u32) / DIRENT_SIZE as u32
    }

    pub(crate) fn dir_read_entry(&self, hdr: &FileHeader, idx: u32) -> VfsResult<DirEntry> {
        let bytes = io::read_at(&self.0.abc, hdr, idx as u64 * DIRENT_SIZE as u64, DIRENT_SIZE)?;
        if bytes.len() < DIRENT_SIZE {
            return Ok(DirEntry::empty());
        }
        Ok(DirEntry::decode(&bytes))
    }

    pub(crate) fn dir_write_entry(
        &self,
        sector: u32,
        hdr: &mut FileHeader,
        idx: u32,
        entry: &DirEntry,
        handle: Handle,
    ) -> VfsResult<()> {
        let pos = idx as u64 * DIRENT_SIZE as u64;
        if idx >= Self::dir_entry_count(hdr) {
            self.grow_to(sector, hdr, pos + DIRENT_SIZE as u64, handle)?;
        }
        io::write_at(&self.0.abc, hdr, pos, &entry.encode(), handle)?;
        Ok(())
    }

    /// Linear scan for `name` within a directory. Returns the slot index
    /// and entry if found live.
    pub(crate) fn dir_lookup(&self, hdr: &FileHeader, name: &str) -> VfsResult<Option<(u32, DirEntry)>> {
        let count = Self::dir_entry_count(hdr);
        for idx in 0..count {
            let e = self.dir_read_entry(hdr, idx)?;
            if e.is_live() && e.name_str() == name {
                return Ok(Some((idx, e)));
            }
        }
        Ok(None)
    }

    /// Find the first reusable (tomb) slot, or the append position.
    pub(crate) fn dir_insertion_point(&self, hdr: &FileHeader) -> VfsResult<u32> {
        let count = Self::dir_entry_count(hdr);
        for idx in 0..count {
            let e = self.dir_read_entry(hdr, idx)?;
            if e.is_tomb() {
                return Ok(idx);
            }
        }
        Ok(count)
    }

    /// List the live names in a directory, in slot order.
    pub(crate) fn dir_list(&self, hdr: &FileHeader) -> VfsResult<Vec<String>> {
        let count = Self::dir_entry_count(hdr);
        let mut out = Vec::new();
        for idx in 0..count {
            let e = self.dir_read_entry(hdr, idx)?;
            if e.is_live() {
                out.push(e.name_str().to_string());
            }
        }
        Ok(out)
    }

    pub(crate) fn sync_handle(&self, handle: Handle) -> VfsResult<()> {
        self.0.abc.sync_bufs(Some(handle))?;
        Ok(())
    }

    pub(crate) fn assert_kind(hdr: &FileHeader, expect_dir: bool) -> VfsResult<()> {
        if expect_dir && hdr.kind != TYPE_DIR {
            return Err(VfsError::NotADirectory);
        }
        if !expect_dir && hdr.kind == TYPE_DIR {
            return Err(VfsError::IsADirectory);
        }
        if hdr.kind != TYPE_DIR && hdr.kind != TYPE_FILE {
            return Err(VfsError::Corrupted(format!("unknown file type tag {}", hdr.kind)));
        }
        Ok(())
    }
}
