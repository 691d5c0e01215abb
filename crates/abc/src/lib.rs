//! Asynchronous Buffer Cache.
//!
//! The sole client of a [`block_device::BlockDevice`]. Maintains an
//! in-memory pool of fixed-extent buffers keyed by starting sector,
//! schedules reads ahead and writes behind on a background worker thread,
//! and ages idle clean buffers out once the pool is full.
//!
//! Buffers are addressed by [`BufId`], an opaque handle into the cache's
//! internal slab — callers never hold a reference into cache-owned memory
//! across a call boundary (see SPEC_FULL.md, Design Notes: no back-pointers
//! from client code into the cache).

mod buf;
mod cache;
mod error;
mod qio;

pub use buf::{BufId, Handle};
pub use cache::{Abc, CacheConfig, FindFlags};
pub use error::{AbcError, AbcResult};
