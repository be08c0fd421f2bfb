//! Error kinds surfaced by the public allocation surface.

use core::fmt;

use crate::backing::BackingError;

/// Errors that can occur during buffer allocation, mapping, and release.
///
/// Validation errors are detected before any resource is touched and are
/// side-effect-free. Mid-group acquisition failures trigger a full rollback
/// of the partial group before being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// A block descriptor has invalid dimensions or an invalid stride.
    InvalidGeometry {
        /// Index of the offending block within the group.
        index: usize,
    },
    /// A block required to be page-sized does not occupy whole pages.
    NotPageAligned {
        /// Index of the offending block within the group.
        index: usize,
    },
    /// A group must contain at least one block.
    TooFewBlocks,
    /// A group may contain at most [`MAX_BLOCKS`](crate::MAX_BLOCKS) blocks.
    TooManyBlocks,
    /// A descriptor passed for acquisition already carries a backing address.
    AlreadyAcquired {
        /// Index of the offending block within the group.
        index: usize,
    },
    /// The backing-store session could not be opened.
    SessionFailed,
    /// The backing store failed to acquire a block mid-group.
    ///
    /// Reported by both the allocation and the mapping path; the partial
    /// group has been rolled back when this is returned.
    AllocationFailed {
        /// Index of the block that failed to acquire.
        index: usize,
    },
    /// The bulk register-and-map step failed; the group has been rolled back.
    MappingFailed,
    /// `map` supports exactly one page-aligned linear block.
    UnsupportedMapShape,
    /// The address does not refer to an outstanding buffer of the expected
    /// acquisition kind.
    UnknownBuffer,
    /// A session release was attempted with no outstanding sessions.
    ImbalancedRelease,
    /// A backing-store failure on a release path.
    Backing(BackingError),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGeometry { index } => {
                write!(f, "invalid geometry for block[{index}]")
            }
            Self::NotPageAligned { index } => {
                write!(f, "block[{index}] is not page-sized")
            }
            Self::TooFewBlocks => write!(f, "a group must contain at least one block"),
            Self::TooManyBlocks => write!(f, "too many blocks in group"),
            Self::AlreadyAcquired { index } => {
                write!(f, "block[{index}] already carries a backing address")
            }
            Self::SessionFailed => write!(f, "failed to open backing-store session"),
            Self::AllocationFailed { index } => {
                write!(f, "backing store failed to acquire block[{index}]")
            }
            Self::MappingFailed => write!(f, "failed to register and map buffer group"),
            Self::UnsupportedMapShape => {
                write!(f, "map supports exactly one page-aligned linear block")
            }
            Self::UnknownBuffer => write!(f, "address is not an outstanding buffer"),
            Self::ImbalancedRelease => write!(f, "no outstanding sessions to release"),
            Self::Backing(err) => write!(f, "backing store failure: {err}"),
        }
    }
}

impl core::error::Error for MemError {}

impl From<BackingError> for MemError {
    fn from(err: BackingError) -> Self {
        Self::Backing(err)
    }
}
