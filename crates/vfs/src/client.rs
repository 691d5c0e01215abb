//! Per-connection client state and the request-style API of SPEC_FULL.md
//! §6.2. A `Client` stands in for one connection from the (out-of-scope)
//! message transport — callers invoke its methods directly instead of
//! sending typed messages.

use abc::Handle;

use crate::error::{VfsError, VfsResult};
use crate::format::{DirEntry, FileHeader, HEADER_SIZE, TYPE_FILE};
use crate::vfs::Vfs;

/// Requested access, matching the bit positions used by [`crate::format::Prot`].
pub const ACCESS_READ: u8 = 0b001;
pub const ACCESS_WRITE: u8 = 0b010;
pub const ACCESS_CHMOD: u8 = 0b100;

/// A `stat` snapshot of the client's currently open node.
#[derive(Debug, Clone)]
pub struct Stat {
    pub size: u64,
    pub is_dir: bool,
    pub owner: u32,
    pub inode: u32,
    pub mtime: u32,
    pub perm: u8,
}

struct RenameTxn {
    src_idx: u32,
    src_entry: DirEntry,
}

/// Per-connection state: current node, seek position, requested access, and
/// any in-flight two-phase rename.
pub struct Client {
    vfs: Vfs,
    id: u32,
    access: u8,
    cur: u32,
    pos: u64,
    rename_txn: Option<RenameTxn>,
}

impl Vfs {
    /// Allocate a `Client` positioned at the root directory.
    pub fn connect(&self, id: u32, access: u8) -> Client {
        let root = self.root_sector();
        let hdr = self.read_header(root).ok();
        let extent_len = hdr.map(|h| h.blks[0].length).unwrap_or(1);
        self.retain_open(root, extent_len);
        Client {
            vfs: self.clone(),
            id,
            access,
            cur: root,
            pos: 0,
            rename_txn: None,
        }
    }
}

impl Client {
    fn header(&self) -> VfsResult<FileHeader> {
        self.vfs.read_header(self.cur)
    }

    fn handle(&self) -> Handle {
        self.vfs.handle_of(self.cur)
    }

    /// `need` must be granted both by the connection's requested access mode
    /// and by the node's own protection bits for this client's id.
    fn check_access(&self, hdr: &FileHeader, need: u8) -> VfsResult<()> {
        if self.access & need != need || hdr.prot.mask_for(self.id) & need != need {
            return Err(VfsError::PermissionDenied);
        }
        Ok(())
    }

    /// A stable identifier for the currently open node (its first sector).
    pub fn fid(&self) -> u32 {
        self.cur
    }

    /// Shallow-copy this connection, sharing the current node's `OpenFile`
    /// refcount. Mirrors the original's `dup` request.
    pub fn dup(&self) -> Client {
        let hdr = self.header().ok();
        let extent_len = hdr.map(|h| h.blks[0].length).unwrap_or(1);
        self.vfs.retain_open(self.cur, extent_len);
        Client {
            vfs: self.vfs.clone(),
            id: self.id,
            access: self.access,
            cur: self.cur,
            pos: self.pos,
            rename_txn: None,
        }
    }

    /// Walk one path component relative to the current node, which must be
    /// a directory. `create` allocates a new file if `name` is absent.
    pub fn open(&mut self, name: &str, access: u8, create: bool) -> VfsResult<()> {
        if name.is_empty() || name.len() >= crate::format::NAME_LEN {
            return Err(VfsError::InvalidArgument(format!("bad name {name:?}")));
        }
        let hdr = self.header()?;
        Vfs::assert_kind(&hdr, true)?;
        self.check_access(&hdr, ACCESS_READ)?;

        let target_sector = match self.vfs.dir_lookup(&hdr, name)? {
            Some((_, e)) => e.start,
            None => {
                if !create {
                    return Err(VfsError::NotFound(name.to_string()));
                }
                self.check_access(&hdr, ACCESS_WRITE)?;
                let handle = self.handle();
                let new_sector = self.vfs.create_node(TYPE_FILE, self.id, handle)?;
                let mut dir_hdr = hdr.clone();
                let idx = self.vfs.dir_insertion_point(&dir_hdr)?;
                self.vfs
                    .dir_write_entry(self.cur, &mut dir_hdr, idx, &DirEntry::new_live(name, new_sector), handle)?;
                self.vfs.sync_handle(handle)?;
                new_sector
            }
        };

        let new_hdr = self.vfs.read_header(target_sector)?;
        let extent_len = new_hdr.blks[0].length;
        self.vfs.retain_open(target_sector, extent_len);
        self.vfs.release_open(self.cur);
        self.cur = target_sector;
        self.pos = 0;
        self.access = access;
        Ok(())
    }

    /// Absolute seek.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Read up to `count` bytes from the current position. Directory reads
    /// return newline-delimited names instead of raw file bytes.
    pub fn read(&mut self, count: usize) -> VfsResult<Vec<u8>> {
        let data = self.pread(self.pos, count)?;
        self.pos += data.len() as u64;
        Ok(data)
    }

    /// Seek-then-read without disturbing the client's stored position.
    pub fn pread(&self, pos: u64, count: usize) -> VfsResult<Vec<u8>> {
        let hdr = self.header()?;
        self.check_access(&hdr, ACCESS_READ)?;
        if hdr.is_dir() {
            let names = self.vfs.dir_list(&hdr)?;
            let mut text = names.join("\n");
            if !names.is_empty() {
                text.push('\n');
            }
            let bytes = text.into_bytes();
            let start = (pos as usize).min(bytes.len());
            let end = (start + count).min(bytes.len());
            return Ok(bytes[start..end].to_vec());
        }
        let content_len = hdr.byte_length as u64 - HEADER_SIZE as u64;
        if pos >= content_len {
            return Ok(Vec::new());
        }
        let n = count.min((content_len - pos) as usize);
        crate::io::read_at(self.vfs.abc(), &hdr, pos, n)
    }

    /// Write at the current position, growing the file as needed. Directory
    /// writes are rejected — directories are mutated only through
    /// `open(create)`, `remove`, and rename.
    pub fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        let n = self.pwrite(self.pos, data)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn pwrite(&self, pos: u64, data: &[u8]) -> VfsResult<usize> {
        let mut hdr = self.header()?;
        if hdr.is_dir() {
            return Err(VfsError::IsADirectory);
        }
        self.check_access(&hdr, ACCESS_WRITE)?;
        let handle = self.handle();
        let need = pos + data.len() as u64;
        let content_len = hdr.byte_length as u64 - HEADER_SIZE as u64;
        if need > content_len {
            self.vfs.grow_to(self.cur, &mut hdr, need, handle)?;
        }
        crate::io::write_at(self.vfs.abc(), &hdr, pos, data, handle)?;
        self.vfs.note_high_water(self.cur, need.max(content_len));
        Ok(data.len())
    }

    pub fn stat(&self) -> VfsResult<Stat> {
        let hdr = self.header()?;
        Ok(Stat {
            size: hdr.byte_length as u64 - HEADER_SIZE as u64,
            is_dir: hdr.is_dir(),
            owner: hdr.owner,
            inode: self.cur,
            mtime: hdr.mtime,
            perm: hdr.prot.mask_for(self.id),
        })
    }

    /// `field=value` mutation of owner/permission bits. Requires `CHMOD`
    /// access on the current node.
    pub fn wstat(&self, field: &str, value: &str) -> VfsResult<()> {
        let mut hdr = self.header()?;
        self.check_access(&hdr, ACCESS_CHMOD)?;
        let handle = self.handle();
        match field {
            "owner" => {
                hdr.owner = value
                    .parse()
                    .map_err(|_| VfsError::InvalidArgument(format!("bad owner {value:?}")))?;
            }
            "perm" => {
                let bits = u8::from_str_radix(value, 8)
                    .map_err(|_| VfsError::InvalidArgument(format!("bad perm {value:?}")))?;
                hdr.prot.default = bits;
            }
            other => return Err(VfsError::InvalidArgument(format!("unknown wstat field {other:?}"))),
        }
        self.vfs.write_header(self.cur, &hdr, handle)?;
        self.vfs.sync_handle(handle)?;
        Ok(())
    }

    /// Tomb `name` in the current directory; frees the target's extents
    /// once its link count reaches zero.
    pub fn remove(&self, name: &str) -> VfsResult<()> {
        let mut hdr = self.header()?;
        Vfs::assert_kind(&hdr, true)?;
        self.check_access(&hdr, ACCESS_WRITE)?;
        let (idx, mut entry) = self
            .vfs
            .dir_lookup(&hdr, name)?
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        let handle = self.handle();
        entry.tomb();
        self.vfs.dir_write_entry(self.cur, &mut hdr, idx, &entry, handle)?;

        let target_sector = entry.start;
        let mut target_hdr = self.vfs.read_header(target_sector)?;
        target_hdr.nlink = target_hdr.nlink.saturating_sub(1);
        let target_handle = self.vfs.handle_of(target_sector);
        let target_handle = if target_handle.0 == 0 { handle } else { target_handle };
        self.vfs.write_header(target_sector, &target_hdr, target_handle)?;
        if target_hdr.nlink == 0 {
            self.vfs.free_extents(&target_hdr, target_handle)?;
        }
        self.vfs.sync_handle(handle)?;
        self.vfs.sync_handle(target_handle)?;
        Ok(())
    }

    /// Stash the directory entry named `name` and open a rename transaction.
    pub fn begin_rename(&mut self, name: &str) -> VfsResult<()> {
        if self.rename_txn.is_some() {
            return Err(VfsError::InvalidArgument("rename already in progress".into()));
        }
        let hdr = self.header()?;
        Vfs::assert_kind(&hdr, true)?;
        let (idx, entry) = self
            .vfs
            .dir_lookup(&hdr, name)?
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        self.rename_txn = Some(RenameTxn { src_idx: idx, src_entry: entry });
        Ok(())
    }

    /// Insert `new_name` pointing at the stashed entry's target and tomb the
    /// source slot, as one logical step from the client's perspective.
    pub fn commit_rename(&mut self, new_name: &str) -> VfsResult<()> {
        let txn = self.rename_txn.take().ok_or(VfsError::NoRenameInProgress)?;
        let mut hdr = self.header()?;
        self.check_access(&hdr, ACCESS_WRITE)?;
        if self.vfs.dir_lookup(&hdr, new_name)?.is_some() {
            self.rename_txn = Some(txn);
            return Err(VfsError::AlreadyExists(new_name.to_string()));
        }
        let handle = self.handle();
        let idx = self.vfs.dir_insertion_point(&hdr)?;
        self.vfs
            .dir_write_entry(self.cur, &mut hdr, idx, &DirEntry::new_live(new_name, txn.src_entry.start), handle)?;

        let mut src_entry = txn.src_entry;
        src_entry.tomb();
        self.vfs.dir_write_entry(self.cur, &mut hdr, txn.src_idx, &src_entry, handle)?;
        self.vfs.sync_handle(handle)?;
        Ok(())
    }

    /// Abandon a pending rename; the source entry is left untouched.
    pub fn abort_rename(&mut self) {
        self.rename_txn = None;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.vfs.release_open(self.cur);
    }
}
