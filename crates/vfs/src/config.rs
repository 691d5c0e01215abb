use crate::format::{EXTSIZ, MAX_EXTENTS, NAME_LEN};

/// Tunables for the filesystem layer, mirroring [`abc::CacheConfig`] at this
/// level. Defaults reproduce the on-disk constants of SPEC_FULL.md §6.1.
#[derive(Debug, Clone, Copy)]
pub struct FsConfig {
    /// Sectors by which a file's trailing extent grows when it runs out of
    /// room (`EXTSIZ`).
    pub extent_quantum: u32,
    /// Maximum number of extents a single `FileHeader` may list.
    pub max_extents: usize,
    /// Longest name (including terminator) a `DirEntry` can hold.
    pub max_name_len: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            extent_quantum: EXTSIZ,
            max_extents: MAX_EXTENTS,
            max_name_len: NAME_LEN,
        }
    }
}
