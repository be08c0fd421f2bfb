//! Emulated backing store for testing and development.
//!
//! This store runs entirely on the host: block "allocations" hand out
//! synthetic backing addresses, and group buffers are real heap
//! allocations, which gives every group a unique, stable base address
//! without requiring device access. Live blocks are tracked so tests can
//! verify that rollback returned every partially acquired block.
//!
//! The emulated store has no global address-space partitioning, so it does
//! not implement direct classification; the manager classifies addresses by
//! scanning its registry instead, exactly as the core does when no such
//! partitioning is available.

use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::address::{BackingAddress, VirtualAddress};
use crate::backing::{BackingError, BackingStore, GroupBlocks, GroupId};
use crate::block::{self, BlockDescriptor, MAX_BLOCKS, PixelFormat};
use crate::geometry::default_stride;

/// Synthetic backing addresses start here, clear of the null page.
const BACKING_BASE: usize = 0x1000;

/// How a live block was acquired, so releases can be checked against the
/// matching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveKind {
    Linear,
    Tiled,
    Mapped,
}

struct EmulatedGroup {
    blocks: GroupBlocks,
    /// Owns the group's buffer; dropping it releases the mapping.
    _buffer: Vec<u8>,
}

/// In-memory [`BackingStore`] implementation.
#[derive(Default)]
pub struct EmulatedStore {
    open: bool,
    next_backing: usize,
    next_group: u32,
    live: HashMap<BackingAddress, LiveKind>,
    groups: HashMap<GroupId, EmulatedGroup>,
}

impl EmulatedStore {
    /// Creates a closed emulated store.
    pub fn new() -> Self {
        Self {
            open: false,
            next_backing: BACKING_BASE,
            next_group: 0,
            live: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    /// Returns true while a session is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Number of blocks currently acquired and not yet released.
    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    /// Number of registered groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn require_open(&self) -> Result<(), BackingError> {
        if self.open {
            Ok(())
        } else {
            Err(BackingError::NotOpen)
        }
    }

    fn fresh_backing(&mut self, kind: LiveKind) -> BackingAddress {
        let addr = BackingAddress::new(self.next_backing);
        self.next_backing += 0x1000;
        self.live.insert(addr, kind);
        addr
    }

    fn release(&mut self, addr: BackingAddress, kind: LiveKind) -> Result<(), BackingError> {
        match self.live.get(&addr) {
            Some(live) if *live == kind => {
                self.live.remove(&addr);
                Ok(())
            }
            _ => Err(BackingError::UnknownAddress),
        }
    }
}

impl BackingStore for EmulatedStore {
    fn open(&mut self) -> Result<(), BackingError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackingError> {
        self.require_open()?;
        self.open = false;
        Ok(())
    }

    fn alloc_linear(&mut self, _length: usize) -> Result<BackingAddress, BackingError> {
        self.require_open()?;
        Ok(self.fresh_backing(LiveKind::Linear))
    }

    fn alloc_tiled(
        &mut self,
        format: PixelFormat,
        width: usize,
        _height: usize,
    ) -> Result<(BackingAddress, usize), BackingError> {
        self.require_open()?;
        let addr = self.fresh_backing(LiveKind::Tiled);
        Ok((addr, default_stride(width * format.bytes_per_pixel())))
    }

    fn free_linear(&mut self, addr: BackingAddress) -> Result<(), BackingError> {
        self.require_open()?;
        self.release(addr, LiveKind::Linear)
    }

    fn free_tiled(&mut self, addr: BackingAddress) -> Result<(), BackingError> {
        self.require_open()?;
        self.release(addr, LiveKind::Tiled)
    }

    fn map_linear(
        &mut self,
        ptr: VirtualAddress,
        _length: usize,
    ) -> Result<BackingAddress, BackingError> {
        self.require_open()?;
        if ptr.is_null() {
            return Err(BackingError::UnknownAddress);
        }
        Ok(self.fresh_backing(LiveKind::Mapped))
    }

    fn unmap_linear(&mut self, addr: BackingAddress) -> Result<(), BackingError> {
        self.require_open()?;
        self.release(addr, LiveKind::Mapped)
    }

    fn register_and_map(
        &mut self,
        blocks: &mut [BlockDescriptor],
    ) -> Result<(VirtualAddress, GroupId), BackingError> {
        self.require_open()?;
        if blocks.is_empty() || blocks.len() > MAX_BLOCKS {
            return Err(BackingError::Unsupported);
        }
        for blk in blocks.iter() {
            if blk.backing().is_null() {
                return Err(BackingError::UnknownAddress);
            }
        }

        // One contiguous host buffer stands in for the mapped group; the
        // heap address stays stable for the life of the group.
        let size = block::group_size(blocks);
        let buffer = vec![0u8; size];
        let base = VirtualAddress::from_ptr(buffer.as_ptr());

        // With no system address space of its own, the store rewrites each
        // block's backing address to its computed pointer, re-keying the
        // live-block records to match.
        let mut offset = 0;
        for blk in blocks.iter_mut() {
            let ptr = base + offset;
            let kind = self
                .live
                .remove(&blk.backing)
                .ok_or(BackingError::UnknownAddress)?;
            blk.backing = BackingAddress::new(ptr.as_usize());
            blk.ptr = Some(ptr);
            self.live.insert(blk.backing, kind);
            offset += blk.size();
        }

        self.next_group += 1;
        let group = GroupId::new(self.next_group);
        let recorded: GroupBlocks = blocks.iter().copied().collect();
        self.groups.insert(
            group,
            EmulatedGroup {
                blocks: recorded,
                _buffer: buffer,
            },
        );

        Ok((base, group))
    }

    fn query_group(&self, group: GroupId) -> Result<GroupBlocks, BackingError> {
        self.groups
            .get(&group)
            .map(|g| g.blocks.clone())
            .ok_or(BackingError::UnknownGroup)
    }

    fn unregister(&mut self, group: GroupId) -> Result<(), BackingError> {
        self.require_open()?;
        match self.groups.remove(&group) {
            Some(_) => Ok(()),
            None => Err(BackingError::UnknownGroup),
        }
    }
}
