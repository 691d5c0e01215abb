use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use block_device::{BlockDevice, SECTOR_SIZE};
use log::{debug, trace, warn};

use crate::buf::{BufEntry, BufId, Handle};
use crate::error::{AbcError, AbcResult};
use crate::qio::{Qio, QIO_RING_DEPTH};

/// Tunable knobs for a cache instance. Defaults reproduce the historical
/// constants (`NCACHE = 8 * EXTSIZ` sectors, a 32-deep QIO ring, a 128
/// sector growth quantum).
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum sectors held across all non-locked bufs before aging kicks in.
    pub pool_cap_sectors: u32,
    /// Depth of the background worker's request channel.
    pub ring_depth: usize,
    /// Largest extent, in sectors, a single buf may span.
    pub extent_quantum: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let extent_quantum = 128;
        Self {
            pool_cap_sectors: 8 * extent_quantum,
            ring_depth: QIO_RING_DEPTH,
            extent_quantum,
        }
    }
}

/// Which on-demand behavior `find_buf` should arrange for the returned buf.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindFlags {
    /// A subsequent `index_buf`/`write_buf` call may fault in missing data.
    pub fill: bool,
    /// Enqueue a background fill immediately rather than waiting for a
    /// caller to touch the buf.
    pub bg: bool,
}

impl FindFlags {
    pub const NONE: FindFlags = FindFlags { fill: false, bg: false };
    pub const FILL: FindFlags = FindFlags { fill: true, bg: false };
    pub const FILL_BG: FindFlags = FindFlags { fill: true, bg: true };
}

struct Inner {
    slab: Vec<Option<BufEntry>>,
    free_slots: Vec<u32>,
    by_sector: HashMap<u32, BufId>,
    age_head: Option<BufId>,
    age_tail: Option<BufId>,
    total_cached_sectors: u32,
    poisoned: Option<AbcError>,
}

impl Inner {
    fn new() -> Self {
        Self {
            slab: Vec::new(),
            free_slots: Vec::new(),
            by_sector: HashMap::new(),
            age_head: None,
            age_tail: None,
            total_cached_sectors: 0,
            poisoned: None,
        }
    }

    fn get(&self, id: BufId) -> AbcResult<&BufEntry> {
        self.slab
            .get(id.0 as usize)
            .and_then(|s| s.as_ref())
            .ok_or(AbcError::NoSuchBuf)
    }

    fn get_mut(&mut self, id: BufId) -> AbcResult<&mut BufEntry> {
        self.slab
            .get_mut(id.0 as usize)
            .and_then(|s| s.as_mut())
            .ok_or(AbcError::NoSuchBuf)
    }

    /// Detach `id` from the age list (does not touch the slab/hash map).
    fn age_unlink(&mut self, id: BufId) {
        let (prev, next) = {
            let e = self.slab[id.0 as usize].as_ref().unwrap();
            (e.age_prev, e.age_next)
        };
        match prev {
            Some(p) => self.slab[p.0 as usize].as_mut().unwrap().age_next = next,
            None => self.age_head = next,
        }
        match next {
            Some(n) => self.slab[n.0 as usize].as_mut().unwrap().age_prev = prev,
            None => self.age_tail = prev,
        }
    }

    /// Move (or insert) `id` to the MRU (head) position.
    fn age_touch(&mut self, id: BufId) {
        if self.age_head == Some(id) {
            return;
        }
        if self.slab[id.0 as usize].as_ref().unwrap().age_prev.is_some()
            || self.age_tail == Some(id)
        {
            self.age_unlink(id);
        }
        let old_head = self.age_head;
        {
            let e = self.slab[id.0 as usize].as_mut().unwrap();
            e.age_prev = None;
            e.age_next = old_head;
        }
        if let Some(h) = old_head {
            self.slab[h.0 as usize].as_mut().unwrap().age_prev = Some(id);
        }
        self.age_head = Some(id);
        if self.age_tail.is_none() {
            self.age_tail = Some(id);
        }
    }

    fn alloc_slot(&mut self, entry: BufEntry) -> BufId {
        if let Some(idx) = self.free_slots.pop() {
            self.slab[idx as usize] = Some(entry);
            BufId(idx)
        } else {
            let idx = self.slab.len() as u32;
            self.slab.push(Some(entry));
            BufId(idx)
        }
    }

    fn free_slot(&mut self, id: BufId) {
        self.age_unlink(id);
        let entry = self.slab[id.0 as usize].take().unwrap();
        self.by_sector.remove(&entry.start);
        self.total_cached_sectors -= entry.nsec;
        self.free_slots.push(id.0);
    }

    /// Age bufs out from the tail until `needed` additional sectors fit
    /// under the pool cap, or no more candidates remain. Dirty candidates
    /// are queued for flush (and marked busy so they are not picked twice)
    /// rather than freed immediately.
    fn age_for_room(&mut self, cap: u32, needed: u32, to_send: &mut Vec<Qio>) -> bool {
        let mut scanned = 0usize;
        let mut cur = self.age_tail;
        while self.total_cached_sectors + needed > cap {
            let id = match cur {
                Some(id) => id,
                None => return false,
            };
            scanned += 1;
            if scanned > self.slab.len() + 1 {
                return false;
            }
            let prev = self.slab[id.0 as usize].as_ref().unwrap().age_prev;
            let (locked, busy, dirty) = {
                let e = self.slab[id.0 as usize].as_ref().unwrap();
                (e.lock_count > 0, e.busy, e.dirty)
            };
            if locked || busy {
                cur = prev;
                continue;
            }
            if dirty {
                self.slab[id.0 as usize].as_mut().unwrap().busy = true;
                to_send.push(Qio::FlushBuf(id));
                cur = prev;
                continue;
            }
            self.free_slot(id);
            cur = prev;
        }
        true
    }
}

/// The asynchronous buffer cache: the sole client of a [`BlockDevice`].
pub struct Abc {
    inner: Mutex<Inner>,
    cond: Condvar,
    qio_tx: Option<SyncSender<Qio>>,
    device: Arc<dyn BlockDevice>,
    config: CacheConfig,
    bg_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Abc {
    pub fn new(device: Arc<dyn BlockDevice>, config: CacheConfig) -> Arc<Self> {
        let (tx, rx) = sync_channel(config.ring_depth);
        let abc = Arc::new(Self {
            inner: Mutex::new(Inner::new()),
            cond: Condvar::new(),
            qio_tx: Some(tx),
            device,
            config,
            bg_handle: Mutex::new(None),
        });
        let worker = abc.clone();
        let handle = std::thread::Builder::new()
            .name("abc-bg".into())
            .spawn(move || worker.bg_loop(rx))
            .expect("failed to spawn abc background worker");
        *abc.bg_handle.lock().unwrap() = Some(handle);
        abc
    }

    fn check_poisoned(&self, inner: &Inner) -> AbcResult<()> {
        match &inner.poisoned {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn send_all(&self, qios: Vec<Qio>) {
        for q in qios {
            // A full channel means the background worker is saturated;
            // blocking here is the bounded-ring backpressure the spec calls for.
            let _ = self.qio_tx.send(q);
        }
    }

    fn bg_loop(&self, rx: Receiver<Qio>) {
        while let Ok(qio) = rx.recv() {
            match qio {
                Qio::FillBuf(id) => self.do_fill(id),
                Qio::FlushBuf(id) => self.do_flush(id),
            }
        }
    }

    fn poison(&self, inner: &mut Inner, err: AbcError) {
        warn!("abc: device failure, poisoning cache: {err}");
        inner.poisoned = Some(err);
    }

    fn do_fill(&self, id: BufId) {
        let (start, nsec, need_start, need_len) = {
            let inner = self.inner.lock().unwrap();
            let e = match inner.slab.get(id.0 as usize).and_then(|s| s.as_ref()) {
                Some(e) => e,
                None => return,
            };
            if e.all_valid {
                (e.start, e.nsec, 0u32, 0u32)
            } else if e.sector0_valid {
                (e.start, e.nsec, e.start + 1, e.nsec - 1)
            } else {
                (e.start, e.nsec, e.start, e.nsec)
            }
        };
        let result = if need_len > 0 {
            let mut buf = vec![0u8; need_len as usize * SECTOR_SIZE];
            self.device
                .read_sectors(need_start, need_len, &mut buf)
                .map(|_| Some(buf))
        } else {
            Ok(None)
        };
        let mut inner = self.inner.lock().unwrap();
        match result {
            Ok(maybe_buf) => {
                if let Some(e) = inner.get_mut(id).ok() {
                    if let Some(buf) = maybe_buf {
                        let off = (need_start - start) as usize * SECTOR_SIZE;
                        e.data[off..off + buf.len()].copy_from_slice(&buf);
                    }
                    e.sector0_valid = true;
                    e.all_valid = true;
                    e.busy = false;
                    trace!("abc: fill complete for sector {start} ({nsec} sectors)");
                }
            }
            Err(e) => {
                if let Ok(entry) = inner.get_mut(id) {
                    entry.busy = false;
                }
                self.poison(&mut inner, e.into());
            }
        }
        self.cond.notify_all();
    }

    fn do_flush(&self, id: BufId) {
        let (start, write_start, data) = {
            let inner = self.inner.lock().unwrap();
            let e = match inner.slab.get(id.0 as usize).and_then(|s| s.as_ref()) {
                Some(e) => e,
                None => return,
            };
            if e.all_valid {
                (e.start, e.start, e.data.clone())
            } else {
                (e.start, e.start, e.data[..SECTOR_SIZE].to_vec())
            }
        };
        let nsec = (data.len() / SECTOR_SIZE) as u32;
        let result = self.device.write_sectors(write_start, nsec, &data);
        let mut inner = self.inner.lock().unwrap();
        match result {
            Ok(()) => {
                if let Ok(e) = inner.get_mut(id) {
                    e.dirty = false;
                    e.handles.clear();
                    e.busy = false;
                    trace!("abc: flush complete for sector {start}");
                }
            }
            Err(err) => {
                if let Ok(e) = inner.get_mut(id) {
                    e.busy = false;
                }
                self.poison(&mut inner, err.into());
            }
        }
        self.cond.notify_all();
    }

    /// Block the calling thread until `id`'s busy flag clears.
    fn wait_not_busy<'a>(
        &self,
        mut inner: std::sync::MutexGuard<'a, Inner>,
        id: BufId,
    ) -> AbcResult<std::sync::MutexGuard<'a, Inner>> {
        loop {
            self.check_poisoned(&inner)?;
            let busy = inner.get(id)?.busy;
            if !busy {
                return Ok(inner);
            }
            inner.get_mut(id)?.want = true;
            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn find_buf(&self, start: u32, nsec: u32, flags: FindFlags) -> AbcResult<BufId> {
        if nsec > self.config.extent_quantum {
            return Err(AbcError::ExtentTooLarge {
                max: self.config.extent_quantum,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;

        let id = if let Some(&id) = inner.by_sector.get(&start) {
            inner.age_touch(id);
            id
        } else {
            let mut to_send = Vec::new();
            if !inner.age_for_room(self.config.pool_cap_sectors, nsec, &mut to_send) {
                self.send_all(to_send);
                return Err(AbcError::PoolExhausted { needed: nsec });
            }
            let id = inner.alloc_slot(BufEntry::new(start, nsec));
            inner.by_sector.insert(start, id);
            inner.total_cached_sectors += nsec;
            inner.age_touch(id);
            debug!("abc: allocated buf for sector {start} ({nsec} sectors)");
            self.send_all(to_send);
            id
        };

        let mut to_send = Vec::new();
        if flags.bg {
            let e = inner.get_mut(id)?;
            if !e.all_valid && !e.busy {
                e.busy = true;
                to_send.push(Qio::FillBuf(id));
            }
        }
        let _ = flags.fill; // on-demand fill happens lazily in index_buf/write_buf
        drop(inner);
        self.send_all(to_send);
        Ok(id)
    }

    /// Ensure `[sector_offset, sector_offset+nsec)` is valid, blocking for a
    /// synchronous read if necessary. `nsec == 0` means "sector 0 only".
    fn ensure_valid(&self, id: BufId, need_all: bool) -> AbcResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner = self.wait_not_busy(inner, id)?;
        let (start, nsec, have_enough) = {
            let e = inner.get(id)?;
            let have = if need_all { e.all_valid } else { e.sector0_valid || e.all_valid };
            (e.start, e.nsec, have)
        };
        if have_enough {
            return Ok(());
        }
        let sector0_valid = inner.get(id)?.sector0_valid;
        inner.get_mut(id)?.busy = true;
        drop(inner);

        let (need_start, need_len) = if sector0_valid {
            (start + 1, nsec - 1)
        } else {
            (start, nsec)
        };
        let mut buf = vec![0u8; need_len as usize * SECTOR_SIZE];
        let result = self.device.read_sectors(need_start, need_len, &mut buf);

        let mut inner = self.inner.lock().unwrap();
        match result {
            Ok(()) => {
                let e = inner.get_mut(id)?;
                let off = (need_start - start) as usize * SECTOR_SIZE;
                e.data[off..off + buf.len()].copy_from_slice(&buf);
                e.sector0_valid = true;
                e.all_valid = true;
                e.busy = false;
                self.cond.notify_all();
                Ok(())
            }
            Err(err) => {
                inner.get_mut(id)?.busy = false;
                self.cond.notify_all();
                let abc_err: AbcError = err.into();
                self.poison(&mut inner, abc_err.clone());
                Err(abc_err)
            }
        }
    }

    /// Read `nsec` sectors starting at `sector_offset` within the extent,
    /// faulting in missing data first. Moves the buf to MRU.
    pub fn index_buf(&self, id: BufId, sector_offset: u32, nsec: u32) -> AbcResult<Vec<u8>> {
        let need_all = !(sector_offset == 0 && nsec <= 1);
        self.ensure_valid(id, need_all)?;
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;
        inner.age_touch(id);
        let e = inner.get(id)?;
        let off = sector_offset as usize * SECTOR_SIZE;
        let len = nsec as usize * SECTOR_SIZE;
        Ok(e.data[off..off + len].to_vec())
    }

    /// Copy `data` into the extent at `sector_offset * SECTOR_SIZE +
    /// byte_offset`, faulting in the surrounding sector(s) first so
    /// untouched bytes are not corrupted. Does not mark the buf dirty —
    /// callers must follow up with [`Abc::dirty_buf`].
    pub fn write_buf(
        &self,
        id: BufId,
        sector_offset: u32,
        byte_offset: u32,
        data: &[u8],
    ) -> AbcResult<()> {
        let need_all = !(sector_offset == 0 && (byte_offset as usize + data.len()) <= SECTOR_SIZE);
        self.ensure_valid(id, need_all)?;
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;
        inner.age_touch(id);
        let e = inner.get_mut(id)?;
        let off = sector_offset as usize * SECTOR_SIZE + byte_offset as usize;
        e.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn dirty_buf(&self, id: BufId, handle: Option<Handle>) -> AbcResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;
        let e = inner.get_mut(id)?;
        e.dirty = true;
        if let Some(h) = handle {
            if !e.handles.contains(&h) {
                e.handles.push(h);
            }
        }
        Ok(())
    }

    pub fn lock_buf(&self, id: BufId) -> AbcResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;
        inner.get_mut(id)?.lock_count += 1;
        Ok(())
    }

    pub fn unlock_buf(&self, id: BufId) -> AbcResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;
        let e = inner.get_mut(id)?;
        e.lock_count = e.lock_count.saturating_sub(1);
        Ok(())
    }

    /// Grow or shrink the cached extent in place. Growing with `fill` reads
    /// the newly appended sectors from disk. Shrinking a locked buf below
    /// its currently pinned range is rejected (resolved Open Question, see
    /// DESIGN.md).
    pub fn resize_buf(&self, start: u32, new_nsec: u32, fill: bool) -> AbcResult<()> {
        if new_nsec > self.config.extent_quantum {
            return Err(AbcError::ExtentTooLarge {
                max: self.config.extent_quantum,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;
        let id = *inner.by_sector.get(&start).ok_or(AbcError::NoSuchBuf)?;
        inner = self.wait_not_busy(inner, id)?;

        let (old_nsec, locked, all_valid) = {
            let e = inner.get(id)?;
            (e.nsec, e.lock_count > 0, e.all_valid)
        };
        if new_nsec < old_nsec && locked {
            return Err(AbcError::InvalidRange);
        }
        if new_nsec == old_nsec {
            return Ok(());
        }
        if new_nsec < old_nsec {
            let e = inner.get_mut(id)?;
            e.data.truncate(new_nsec as usize * SECTOR_SIZE);
            inner.total_cached_sectors -= old_nsec - new_nsec;
            let e = inner.get_mut(id)?;
            e.nsec = new_nsec;
            return Ok(());
        }

        // Growing.
        let grow_by = new_nsec - old_nsec;
        let mut to_send = Vec::new();
        inner.age_for_room(self.config.pool_cap_sectors, grow_by, &mut to_send);
        drop(inner);
        self.send_all(to_send);
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;
        let e = inner.get_mut(id)?;
        e.data.resize(new_nsec as usize * SECTOR_SIZE, 0);
        e.nsec = new_nsec;
        if !all_valid {
            e.all_valid = false;
        }
        inner.total_cached_sectors += grow_by;
        drop(inner);

        if fill && all_valid {
            let mut inner2 = self.inner.lock().unwrap();
            inner2.get_mut(id)?.busy = true;
            drop(inner2);
            let mut buf = vec![0u8; grow_by as usize * SECTOR_SIZE];
            let result = self.device.read_sectors(start + old_nsec, grow_by, &mut buf);
            let mut inner2 = self.inner.lock().unwrap();
            match result {
                Ok(()) => {
                    let e = inner2.get_mut(id)?;
                    let off = old_nsec as usize * SECTOR_SIZE;
                    e.data[off..off + buf.len()].copy_from_slice(&buf);
                    e.busy = false;
                }
                Err(err) => {
                    inner2.get_mut(id)?.busy = false;
                    let abc_err: AbcError = err.into();
                    self.poison(&mut inner2, abc_err.clone());
                    self.cond.notify_all();
                    return Err(abc_err);
                }
            }
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Write back now and block until complete.
    pub fn sync_buf(&self, id: BufId) -> AbcResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner = self.wait_not_busy(inner, id)?;
        let (dirty, start, all_valid, data) = {
            let e = inner.get(id)?;
            if !e.dirty {
                (false, 0, false, Vec::new())
            } else if e.all_valid {
                (true, e.start, true, e.data.clone())
            } else {
                (true, e.start, false, e.data[..SECTOR_SIZE].to_vec())
            }
        };
        if !dirty {
            return Ok(());
        }
        inner.get_mut(id)?.busy = true;
        drop(inner);
        let nsec = (data.len() / SECTOR_SIZE) as u32;
        let result = self.device.write_sectors(start, nsec, &data);
        let mut inner = self.inner.lock().unwrap();
        let ret = match result {
            Ok(()) => {
                let e = inner.get_mut(id)?;
                e.dirty = false;
                e.handles.clear();
                e.busy = false;
                let _ = all_valid;
                Ok(())
            }
            Err(err) => {
                inner.get_mut(id)?.busy = false;
                let abc_err: AbcError = err.into();
                self.poison(&mut inner, abc_err.clone());
                Err(abc_err)
            }
        };
        self.cond.notify_all();
        ret
    }

    /// Queue a background flush for every dirty buf (optionally narrowed to
    /// one bearing `handle`). Does not wait for completion.
    pub fn sync_bufs(&self, handle: Option<Handle>) -> AbcResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;
        let mut to_send = Vec::new();
        let ids: Vec<BufId> = inner
            .slab
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| BufId(i as u32)))
            .collect();
        for id in ids {
            let e = inner.get_mut(id)?;
            if !e.dirty || e.busy {
                continue;
            }
            if let Some(h) = handle {
                if !e.handles.contains(&h) {
                    continue;
                }
            }
            e.busy = true;
            to_send.push(Qio::FlushBuf(id));
        }
        drop(inner);
        self.send_all(to_send);
        Ok(())
    }

    /// Drop cached extents in `[start, start+length_sectors)` without
    /// writing them back. Rejects a currently-locked buf.
    pub fn inval_buf(&self, start: u32, length_sectors: u32) -> AbcResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.check_poisoned(&inner)?;
        let ids: Vec<(u32, BufId)> = inner
            .by_sector
            .iter()
            .filter(|(&s, _)| s >= start && s < start + length_sectors)
            .map(|(&s, &id)| (s, id))
            .collect();
        for (_, id) in &ids {
            if inner.get(*id)?.lock_count > 0 {
                return Err(AbcError::InvalidRange);
            }
        }
        for (_, id) in ids {
            inner = self.wait_not_busy(inner, id)?;
            inner.free_slot(id);
        }
        Ok(())
    }

    /// Test/diagnostic helper: block until no buf in the cache is busy.
    pub fn drain(&self) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let any_busy = inner
                .slab
                .iter()
                .any(|s| s.as_ref().map(|e| e.busy).unwrap_or(false));
            if !any_busy {
                return;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Test/diagnostic helper: total sectors currently held across all
    /// cached bufs.
    pub fn total_cached_sectors(&self) -> u32 {
        self.inner.lock().unwrap().total_cached_sectors
    }
}

impl Drop for Abc {
    fn drop(&mut self) {
        // Dropping `qio_tx` closes the channel; the worker's `recv` then
        // returns `Err` and the thread exits on its own.
        if let Some(handle) = self.bg_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
