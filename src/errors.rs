use core::fmt;

/// Reasons why an allocator can't be built over the memory it was given.
/// Running out of memory is not an error, see [`crate::MemoryRegion::NULL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    /// Backing memory starts at address 0 or is empty.
    NullRegion,
    /// Alignment is not a power of two.
    InvalidAlignment { alignment: usize },
    /// Buddy regions must be a power of two in length.
    SizeNotPowerOfTwo { size: usize },
    /// Base address doesn't satisfy the requested alignment.
    MisalignedBase { address: usize, alignment: usize },
    /// Chunks can't hold the free list link.
    ChunkTooSmall { chunk_size: usize, minimum: usize },
    /// Not even one chunk, block or header fits in the region.
    RegionTooSmall { size: usize, minimum: usize },
    /// In-band metadata failed a consistency check.
    Corrupted(&'static str),
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullRegion => write!(f, "backing memory is null or empty"),
            Self::InvalidAlignment { alignment } => {
                write!(f, "alignment {alignment} isn't a power of 2")
            }
            Self::SizeNotPowerOfTwo { size } => {
                write!(f, "region size {size} isn't a power of 2")
            }
            Self::MisalignedBase { address, alignment } => write!(
                f,
                "base address {address:#x} isn't aligned to {alignment} bytes"
            ),
            Self::ChunkTooSmall {
                chunk_size,
                minimum,
            } => write!(
                f,
                "chunk size {chunk_size} is smaller than the minimum of {minimum} bytes"
            ),
            Self::RegionTooSmall { size, minimum } => write!(
                f,
                "region of {size} bytes is smaller than the minimum of {minimum} bytes"
            ),
            Self::Corrupted(reason) => write!(f, "corrupted metadata: {reason}"),
        }
    }
}

impl core::error::Error for RegionError {}

pub type Result<T> = core::result::Result<T, RegionError>;

/// Unwraps construction results for the infallible constructors. Contract
/// violations are programmer errors, so they abort the caller.
#[track_caller]
pub(crate) fn or_panic<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => panic!("{error}"),
    }
}
