use thiserror::Error;

/// Errors surfaced by the buffer cache.
///
/// `DeviceFailure` is unrecoverable: once observed, the cache poisons itself
/// and every subsequent call returns the same variant rather than touching
/// the device again (see SPEC_FULL.md, Ambient Stack → Error handling).
#[derive(Debug, Error, Clone)]
pub enum AbcError {
    #[error("requested extent exceeds the {max} sector growth quantum")]
    ExtentTooLarge { max: u32 },
    #[error("sector range is not aligned to the extent quantum")]
    Misaligned,
    #[error("buf is locked and cannot shrink below its pinned range")]
    InvalidRange,
    #[error("unknown buf id")]
    NoSuchBuf,
    #[error("cache pool exhausted: no evictable buf could free {needed} sectors")]
    PoolExhausted { needed: u32 },
    #[error("device failed; cache is no longer usable: {0}")]
    DeviceFailure(String),
}

impl From<block_device::DeviceError> for AbcError {
    fn from(e: block_device::DeviceError) -> Self {
        AbcError::DeviceFailure(e.to_string())
    }
}

pub type AbcResult<T> = Result<T, AbcError>;
