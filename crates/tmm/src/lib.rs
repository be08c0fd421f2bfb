//! Tiled memory manager.
//!
//! This crate fronts a hardware tiling subsystem: callers describe groups of
//! linear (page-mode) and 2D tiled blocks, and the [`MemoryManager`]
//! acquires each group as one contiguous virtual buffer, tracking every
//! outstanding buffer so addresses can be classified and released later.
//! Group acquisition is atomic: if any step fails, everything already
//! acquired is rolled back before the error is reported.
//!
//! The actual placement of blocks is delegated to a [`BackingStore`]
//! implementation. Production stores drive device-specific machinery out of
//! tree; the in-tree [`EmulatedStore`] runs entirely on the host and is
//! available under the `software-emulation` feature (and in tests).
#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

extern crate alloc;

mod address;
mod backing;
mod block;
#[cfg(any(test, feature = "software-emulation"))]
mod emulated;
mod error;
mod geometry;
mod manager;
mod registry;

pub use address::{BackingAddress, VirtualAddress};
pub use backing::{BackingError, BackingStore, DirectClass, GroupBlocks, GroupId};
pub use block::{
    BlockDescriptor, BlockGeometry, BlockKind, MAX_BLOCKS, PixelFormat, group_size,
};
#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::EmulatedStore;
pub use error::MemError;
pub use geometry::{PAGE_SIZE, default_stride, page_size};
pub use manager::MemoryManager;
