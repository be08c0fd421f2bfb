//! Collaborator contract for the backing store.
//!
//! The backing store is the subsystem that actually places 2D regions in a
//! system address space, serves page-mode allocations, and maps buffer
//! groups into the process. The manager is written once against the
//! [`BackingStore`] trait; the implementation is selected at construction
//! time (a device-backed store out of tree, or the in-tree
//! [`EmulatedStore`](crate::EmulatedStore) for tests and development).

use core::fmt;

use arrayvec::ArrayVec;

use crate::address::{BackingAddress, VirtualAddress};
use crate::block::{BlockDescriptor, BlockKind, MAX_BLOCKS, PixelFormat};

/// Opaque identifier for a registered buffer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u32);

impl GroupId {
    /// Creates a group identifier from a raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Errors reported by a backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingError {
    /// The session is not open.
    NotOpen,
    /// The store has no room for the requested block.
    Exhausted,
    /// The address does not refer to a live block of the expected kind.
    UnknownAddress,
    /// The group identifier does not refer to a registered group.
    UnknownGroup,
    /// The store does not support the requested operation.
    Unsupported,
}

impl fmt::Display for BackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOpen => write!(f, "session not open"),
            Self::Exhausted => write!(f, "backing store exhausted"),
            Self::UnknownAddress => write!(f, "unknown backing address"),
            Self::UnknownGroup => write!(f, "unknown group identifier"),
            Self::Unsupported => write!(f, "operation not supported"),
        }
    }
}

impl core::error::Error for BackingError {}

/// The block descriptors of one registered group, in descriptor order.
pub type GroupBlocks = ArrayVec<BlockDescriptor, MAX_BLOCKS>;

/// Direct address classification, for stores that partition their address
/// space by block kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectClass {
    /// The address belongs to a region of this kind.
    Kind(BlockKind),
    /// The address is known not to belong to any region.
    Unmapped,
}

/// Operations the manager requires of a backing store.
///
/// All calls are made under the manager's state lock, so implementations
/// need no synchronization of their own.
pub trait BackingStore {
    /// Opens the store session. Called on the first outstanding group.
    fn open(&mut self) -> Result<(), BackingError>;

    /// Closes the store session. Called when the last group is released.
    fn close(&mut self) -> Result<(), BackingError>;

    /// Allocates a page-mode block of `length` bytes.
    fn alloc_linear(&mut self, length: usize) -> Result<BackingAddress, BackingError>;

    /// Allocates a tiled block, returning its address and computed row stride.
    fn alloc_tiled(
        &mut self,
        format: PixelFormat,
        width: usize,
        height: usize,
    ) -> Result<(BackingAddress, usize), BackingError>;

    /// Frees a page-mode block.
    fn free_linear(&mut self, addr: BackingAddress) -> Result<(), BackingError>;

    /// Frees a tiled block.
    fn free_tiled(&mut self, addr: BackingAddress) -> Result<(), BackingError>;

    /// Maps `length` bytes of caller-owned memory at `ptr` into the store.
    fn map_linear(
        &mut self,
        ptr: VirtualAddress,
        length: usize,
    ) -> Result<BackingAddress, BackingError>;

    /// Releases a mapping created by [`map_linear`](Self::map_linear).
    fn unmap_linear(&mut self, addr: BackingAddress) -> Result<(), BackingError>;

    /// Registers the acquired blocks as one group and maps them into one
    /// contiguous buffer.
    ///
    /// On success the store back-fills each descriptor's pointer (buffer
    /// base plus the running offset of prior blocks), rewrites backing
    /// addresses where it has no hardware address space of its own, and
    /// records a copy of the descriptors for [`query_group`](Self::query_group).
    /// Returns the buffer base and the group identifier.
    fn register_and_map(
        &mut self,
        blocks: &mut [BlockDescriptor],
    ) -> Result<(VirtualAddress, GroupId), BackingError>;

    /// Returns the recorded block descriptors of a registered group.
    fn query_group(&self, group: GroupId) -> Result<GroupBlocks, BackingError>;

    /// Unregisters a group and releases its buffer mapping.
    fn unregister(&mut self, group: GroupId) -> Result<(), BackingError>;

    /// Classifies an address directly, if this store partitions its address
    /// space by kind.
    ///
    /// Returns `None` when the store cannot classify addresses globally; the
    /// manager then falls back to scanning its registry.
    fn classify_direct(&self, _addr: VirtualAddress) -> Option<DirectClass> {
        None
    }
}
