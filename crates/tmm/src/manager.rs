//! Buffer-group lifecycle orchestration.
//!
//! [`MemoryManager`] is the public surface of the crate: callers hand it a
//! group of block descriptors and get back one contiguous virtual buffer,
//! acquired or released atomically as a group. The manager owns the
//! reference-counted backing-store session and the registry of outstanding
//! buffers, both behind a single lock so every operation is linearizable
//! with respect to concurrent acquire/release calls.
//!
//! Acquisition is a multi-step protocol against the backing store; when a
//! step fails mid-group, everything already done is undone in reverse order
//! before the error is reported, so a group is never partially alive.

use spin::Mutex;

use crate::address::VirtualAddress;
use crate::backing::{BackingError, BackingStore, DirectClass};
use crate::block::{self, BlockDescriptor, BlockGeometry, BlockKind};
use crate::error::MemError;
use crate::geometry::PAGE_SIZE;
use crate::registry::{Origin, Registry};

/// Folds a sub-result into an aggregate: the first error is kept while the
/// remaining teardown steps still run.
fn accumulate(acc: &mut Result<(), MemError>, result: Result<(), MemError>) {
    if acc.is_ok() {
        *acc = result;
    }
}

struct State<B> {
    store: B,
    registry: Registry,
    sessions: usize,
}

/// Allocates and maps groups of linear and tiled memory blocks through a
/// backing store.
///
/// All methods take `&self`; shared state lives behind one mutex. Backing
/// store calls are made while holding the lock, so concurrent operations
/// serialize against each other.
pub struct MemoryManager<B: BackingStore> {
    state: Mutex<State<B>>,
}

impl<B: BackingStore> MemoryManager<B> {
    /// Creates a manager over the given backing store.
    ///
    /// The store session is not opened until the first acquisition.
    pub fn new(store: B) -> Self {
        Self {
            state: Mutex::new(State {
                store,
                registry: Registry::new(),
                sessions: 0,
            }),
        }
    }

    /// Allocates one contiguous buffer spanning all requested blocks.
    ///
    /// Every block except the last must be page-sized. On success each
    /// descriptor carries its backing address and its pointer within the
    /// buffer, and the returned base address must later be passed to
    /// [`free`](Self::free). On failure the descriptors are reset and
    /// nothing remains acquired.
    pub fn alloc(&self, blocks: &mut [BlockDescriptor]) -> Result<VirtualAddress, MemError> {
        let mut state = self.state.lock();
        let result = state.alloc_group(blocks);
        state.check_consistency();
        result
    }

    /// Releases a buffer returned by [`alloc`](Self::alloc).
    ///
    /// Per-block release failures do not stop the teardown; the first error
    /// is reported after every step has run.
    pub fn free(&self, buffer: VirtualAddress) -> Result<(), MemError> {
        let mut state = self.state.lock();
        let result = state.release_group(buffer, Origin::Allocated);
        state.check_consistency();
        result
    }

    /// Maps caller-owned memory through the backing store.
    ///
    /// Currently restricted to exactly one linear block whose pointer is
    /// page-aligned, whose length is page-sized, and whose address is not
    /// already tracked; any other shape fails with
    /// [`UnsupportedMapShape`](MemError::UnsupportedMapShape).
    pub fn map(&self, blocks: &mut [BlockDescriptor]) -> Result<VirtualAddress, MemError> {
        let mut state = self.state.lock();
        let result = state.map_group(blocks);
        state.check_consistency();
        result
    }

    /// Releases a buffer returned by [`map`](Self::map).
    pub fn unmap(&self, buffer: VirtualAddress) -> Result<(), MemError> {
        let mut state = self.state.lock();
        let result = state.release_group(buffer, Origin::Mapped);
        state.check_consistency();
        result
    }

    /// Reports the kind of tracked region `addr` falls in, or `None` if the
    /// address is not within any outstanding buffer.
    pub fn classify(&self, addr: VirtualAddress) -> Option<BlockKind> {
        self.state.lock().classify(addr)
    }

    /// Returns true if `addr` lies within a tracked linear (page-mode) block.
    pub fn is_linear(&self, addr: VirtualAddress) -> bool {
        matches!(self.classify(addr), Some(BlockKind::Linear))
    }

    /// Returns true if `addr` lies within a tracked tiled (2D) block.
    pub fn is_tiled(&self, addr: VirtualAddress) -> bool {
        self.classify(addr).is_some_and(BlockKind::is_tiled)
    }

    /// Returns true if `addr` lies within any tracked block.
    pub fn is_acquired(&self, addr: VirtualAddress) -> bool {
        self.classify(addr).is_some()
    }

    /// Returns the row stride of the block containing `addr`.
    ///
    /// Zero for the null address; the page size when the address is not
    /// tracked.
    pub fn stride_of(&self, addr: VirtualAddress) -> usize {
        self.state.lock().stride_of(addr)
    }

    /// Number of outstanding buffers.
    pub fn outstanding(&self) -> usize {
        self.state.lock().registry.len()
    }
}

impl<B: BackingStore> State<B> {
    /// Takes a session reference, opening the backing store on the first one.
    ///
    /// A failed open leaves the count untouched.
    fn acquire_session(&mut self) -> Result<(), MemError> {
        if self.sessions == 0 {
            self.store.open().map_err(|err| {
                log::error!("failed to open backing-store session: {err}");
                MemError::SessionFailed
            })?;
            log::debug!("backing-store session opened");
        }
        self.sessions += 1;
        Ok(())
    }

    /// Drops a session reference, closing the backing store on the last one.
    fn release_session(&mut self) -> Result<(), MemError> {
        if self.sessions == 0 {
            return Err(MemError::ImbalancedRelease);
        }
        self.sessions -= 1;
        if self.sessions == 0 {
            self.store.close().map_err(MemError::Backing)?;
            log::debug!("backing-store session closed");
        }
        Ok(())
    }

    fn alloc_group(&mut self, blocks: &mut [BlockDescriptor]) -> Result<VirtualAddress, MemError> {
        // All blocks except the last must be page-sized; nothing is touched
        // until the whole group validates.
        block::validate_group(blocks, blocks.len().saturating_sub(1))?;
        self.acquire_session()?;
        self.acquire_group(blocks, Origin::Allocated)
    }

    fn map_group(&mut self, blocks: &mut [BlockDescriptor]) -> Result<VirtualAddress, MemError> {
        // Every block of a mapped group must be page-sized.
        block::validate_group(blocks, blocks.len())?;
        self.acquire_session()?;

        if let Err(err) = self.check_map_shape(blocks) {
            for blk in blocks.iter_mut() {
                blk.reset();
            }
            if let Err(release_err) = self.release_session() {
                log::error!("session release after rejected map failed: {release_err}");
            }
            return Err(err);
        }

        self.acquire_group(blocks, Origin::Mapped)
    }

    /// Only one page-aligned linear block that is not already tracked may be
    /// mapped per group.
    fn check_map_shape(&self, blocks: &[BlockDescriptor]) -> Result<(), MemError> {
        let [blk] = blocks else {
            return Err(MemError::UnsupportedMapShape);
        };
        if blk.kind() != BlockKind::Linear {
            return Err(MemError::UnsupportedMapShape);
        }
        let Some(ptr) = blk.ptr() else {
            return Err(MemError::UnsupportedMapShape);
        };
        if ptr.is_null() || !ptr.is_aligned(PAGE_SIZE) {
            return Err(MemError::UnsupportedMapShape);
        }
        if self.classify(ptr).is_some() {
            return Err(MemError::UnsupportedMapShape);
        }
        Ok(())
    }

    /// Recoverable phase shared by alloc and map: acquires each block in
    /// order, registers and maps the group as one buffer, and records it in
    /// the registry.
    ///
    /// On failure, every block acquired so far is released in reverse order,
    /// the descriptors are reset, and the session reference is dropped, so
    /// the caller observes no state change beyond the error.
    fn acquire_group(
        &mut self,
        blocks: &mut [BlockDescriptor],
        origin: Origin,
    ) -> Result<VirtualAddress, MemError> {
        let (acquired, failure) = match self.acquire_blocks(blocks, origin) {
            Ok(()) => match self.store.register_and_map(blocks) {
                Ok((base, group)) => {
                    self.registry.insert(base, group, origin);
                    return Ok(base);
                }
                Err(err) => {
                    log::error!("register-and-map failed: {err}");
                    (blocks.len(), MemError::MappingFailed)
                }
            },
            Err((acquired, failure)) => (acquired, failure),
        };

        // Undo exactly what was done, newest block first.
        for blk in blocks[..acquired].iter().rev() {
            if let Err(err) = self.release_block(blk, origin) {
                log::error!("rollback release failed for {:?}: {err}", blk.backing());
            }
        }
        for blk in blocks.iter_mut() {
            blk.reset();
        }
        if let Err(err) = self.release_session() {
            log::error!("session release during rollback failed: {err}");
        }

        Err(failure)
    }

    /// Acquires each block from the backing store in descriptor order.
    ///
    /// On failure reports how many blocks were acquired along with the
    /// error, so the caller can roll back.
    fn acquire_blocks(
        &mut self,
        blocks: &mut [BlockDescriptor],
        origin: Origin,
    ) -> Result<(), (usize, MemError)> {
        for (index, blk) in blocks.iter_mut().enumerate() {
            if let Err(err) = Self::acquire_block(&mut self.store, blk, origin) {
                log::error!("block[{index}] acquisition failed: {err}");
                return Err((index, MemError::AllocationFailed { index }));
            }
        }
        Ok(())
    }

    /// Acquires one block: a fresh allocation for `Allocated`, a mapping of
    /// the caller-supplied pointer for `Mapped`. Tiled blocks receive the
    /// stride computed by the store.
    fn acquire_block(
        store: &mut B,
        blk: &mut BlockDescriptor,
        origin: Origin,
    ) -> Result<(), BackingError> {
        match origin {
            Origin::Allocated => {
                blk.ptr = None;
                match &mut blk.geometry {
                    BlockGeometry::Linear { length, .. } => {
                        blk.backing = store.alloc_linear(*length)?;
                    }
                    BlockGeometry::Tiled {
                        format,
                        width,
                        height,
                        stride,
                    } => {
                        let (addr, computed) = store.alloc_tiled(*format, *width, *height)?;
                        blk.backing = addr;
                        *stride = Some(computed);
                    }
                }
            }
            Origin::Mapped => match blk.geometry {
                BlockGeometry::Linear { length, .. } => {
                    let ptr = blk.ptr.ok_or(BackingError::UnknownAddress)?;
                    blk.backing = store.map_linear(ptr, length)?;
                }
                BlockGeometry::Tiled { .. } => return Err(BackingError::Unsupported),
            },
        }
        Ok(())
    }

    /// Returns one block to the backing store through the path matching its
    /// kind and acquisition origin.
    fn release_block(&mut self, blk: &BlockDescriptor, origin: Origin) -> Result<(), MemError> {
        let result = match (origin, blk.kind()) {
            (Origin::Allocated, BlockKind::Linear) => self.store.free_linear(blk.backing()),
            (Origin::Allocated, _) => self.store.free_tiled(blk.backing()),
            (Origin::Mapped, BlockKind::Linear) => self.store.unmap_linear(blk.backing()),
            (Origin::Mapped, _) => Err(BackingError::Unsupported),
        };
        result.map_err(MemError::Backing)
    }

    /// Releases a whole group: frees or unmaps each block, unregisters the
    /// group, and drops the session reference.
    ///
    /// Per-step failures are aggregated rather than short-circuiting, so a
    /// partly failing release still tears down as much as possible.
    fn release_group(&mut self, buffer: VirtualAddress, origin: Origin) -> Result<(), MemError> {
        // Once the entry is removed the buffer is no longer tracked; a
        // racing release of the same address observes UnknownBuffer.
        let group = self
            .registry
            .remove(buffer, origin)
            .ok_or(MemError::UnknownBuffer)?;

        let mut result = Ok(());
        match self.store.query_group(group) {
            Ok(blocks) => {
                accumulate(
                    &mut result,
                    self.store.unregister(group).map_err(MemError::Backing),
                );
                for blk in blocks.iter() {
                    accumulate(&mut result, self.release_block(blk, origin));
                }
            }
            Err(err) => {
                accumulate(&mut result, Err(MemError::Backing(err)));
            }
        }
        accumulate(&mut result, self.release_session());

        if let Err(err) = result {
            log::error!("release of buffer {buffer:?} reported: {err}");
        }
        result
    }

    fn classify(&self, addr: VirtualAddress) -> Option<BlockKind> {
        if addr.is_null() {
            return None;
        }
        if let Some(direct) = self.store.classify_direct(addr) {
            return match direct {
                DirectClass::Kind(kind) => Some(kind),
                DirectClass::Unmapped => None,
            };
        }
        self.find_block(addr).map(|blk| blk.kind())
    }

    /// Scans the recorded geometry of every outstanding group for the block
    /// whose mapped range contains `addr`.
    fn find_block(&self, addr: VirtualAddress) -> Option<BlockDescriptor> {
        for group in self.registry.groups() {
            if let Ok(blocks) = self.store.query_group(group) {
                if let Some(blk) = blocks.iter().find(|blk| blk.contains(addr)) {
                    return Some(*blk);
                }
            }
        }
        None
    }

    fn stride_of(&self, addr: VirtualAddress) -> usize {
        if addr.is_null() {
            return 0;
        }
        match self.find_block(addr) {
            Some(blk) => blk.stride(),
            None => PAGE_SIZE,
        }
    }

    /// The registry must hold exactly one entry per outstanding session
    /// reference after every operation. A mismatch is an internal bug, not a
    /// recoverable error.
    fn check_consistency(&self) {
        assert_eq!(
            self.registry.len(),
            self.sessions,
            "buffer registry out of sync with session count"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::BackingAddress;
    use crate::backing::{GroupBlocks, GroupId};
    use crate::block::PixelFormat;
    use crate::emulated::EmulatedStore;

    /// Backing store that fails on demand, for exercising rollback.
    struct FlakyStore {
        inner: EmulatedStore,
        fail_alloc_at: Option<usize>,
        fail_map: bool,
        fail_register: bool,
        allocs: usize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: EmulatedStore::new(),
                fail_alloc_at: None,
                fail_map: false,
                fail_register: false,
                allocs: 0,
            }
        }

        fn count_alloc(&mut self) -> Result<(), BackingError> {
            if self.fail_alloc_at == Some(self.allocs) {
                return Err(BackingError::Exhausted);
            }
            self.allocs += 1;
            Ok(())
        }
    }

    impl BackingStore for FlakyStore {
        fn open(&mut self) -> Result<(), BackingError> {
            self.inner.open()
        }

        fn close(&mut self) -> Result<(), BackingError> {
            self.inner.close()
        }

        fn alloc_linear(&mut self, length: usize) -> Result<BackingAddress, BackingError> {
            self.count_alloc()?;
            self.inner.alloc_linear(length)
        }

        fn alloc_tiled(
            &mut self,
            format: PixelFormat,
            width: usize,
            height: usize,
        ) -> Result<(BackingAddress, usize), BackingError> {
            self.count_alloc()?;
            self.inner.alloc_tiled(format, width, height)
        }

        fn free_linear(&mut self, addr: BackingAddress) -> Result<(), BackingError> {
            self.inner.free_linear(addr)
        }

        fn free_tiled(&mut self, addr: BackingAddress) -> Result<(), BackingError> {
            self.inner.free_tiled(addr)
        }

        fn map_linear(
            &mut self,
            ptr: VirtualAddress,
            length: usize,
        ) -> Result<BackingAddress, BackingError> {
            if self.fail_map {
                return Err(BackingError::Exhausted);
            }
            self.inner.map_linear(ptr, length)
        }

        fn unmap_linear(&mut self, addr: BackingAddress) -> Result<(), BackingError> {
            self.inner.unmap_linear(addr)
        }

        fn register_and_map(
            &mut self,
            blocks: &mut [BlockDescriptor],
        ) -> Result<(VirtualAddress, GroupId), BackingError> {
            if self.fail_register {
                return Err(BackingError::Exhausted);
            }
            self.inner.register_and_map(blocks)
        }

        fn query_group(&self, group: GroupId) -> Result<GroupBlocks, BackingError> {
            self.inner.query_group(group)
        }

        fn unregister(&mut self, group: GroupId) -> Result<(), BackingError> {
            self.inner.unregister(group)
        }
    }

    fn manager() -> MemoryManager<EmulatedStore> {
        MemoryManager::new(EmulatedStore::new())
    }

    /// Allocates a page-aligned region of caller-owned memory for map tests.
    fn page_aligned_region(pages: usize) -> (Vec<u8>, VirtualAddress) {
        let backing = vec![0u8; (pages + 1) * PAGE_SIZE];
        let raw = backing.as_ptr() as usize;
        let aligned = (raw + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        (backing, VirtualAddress::new(aligned))
    }

    #[test]
    fn alloc_single_block() {
        let mgr = manager();
        let mut blocks = [BlockDescriptor::linear(PAGE_SIZE)];

        let base = mgr.alloc(&mut blocks).unwrap();
        assert!(!base.is_null());
        assert_eq!(blocks[0].ptr(), Some(base));
        assert!(!blocks[0].backing().is_null());
        assert_eq!(mgr.outstanding(), 1);

        {
            let state = mgr.state.lock();
            assert_eq!(state.sessions, 1);
            assert!(state.store.is_open());
        }

        mgr.free(base).unwrap();
        assert_eq!(mgr.outstanding(), 0);

        let state = mgr.state.lock();
        assert_eq!(state.sessions, 0);
        assert!(!state.store.is_open());
        assert_eq!(state.store.live_blocks(), 0);
    }

    #[test]
    fn alloc_lays_out_blocks_contiguously() {
        let mgr = manager();
        let mut blocks = [
            BlockDescriptor::linear(2 * PAGE_SIZE),
            BlockDescriptor::linear(PAGE_SIZE),
            BlockDescriptor::tiled(PixelFormat::Bit16, PAGE_SIZE / 4, 8),
        ];

        let base = mgr.alloc(&mut blocks).unwrap();
        assert_eq!(blocks[0].ptr(), Some(base));
        assert_eq!(blocks[1].ptr(), Some(base + 2 * PAGE_SIZE));
        assert_eq!(blocks[2].ptr(), Some(base + 3 * PAGE_SIZE));

        // The occupied span equals the group size.
        let last = &blocks[2];
        let span = last.ptr().unwrap().as_usize() + last.size() - base.as_usize();
        assert_eq!(span, block::group_size(&blocks));

        mgr.free(base).unwrap();
    }

    #[test]
    fn alloc_allows_odd_sized_last_block() {
        let mgr = manager();
        let mut blocks = [
            BlockDescriptor::linear(PAGE_SIZE),
            BlockDescriptor::linear(100),
        ];
        let base = mgr.alloc(&mut blocks).unwrap();
        mgr.free(base).unwrap();
    }

    #[test]
    fn alloc_validation_failure_is_side_effect_free() {
        let mgr = manager();
        let mut blocks = [
            BlockDescriptor::linear(100),
            BlockDescriptor::linear(PAGE_SIZE),
        ];

        assert_eq!(
            mgr.alloc(&mut blocks),
            Err(MemError::NotPageAligned { index: 0 })
        );

        let state = mgr.state.lock();
        assert_eq!(state.sessions, 0);
        assert!(!state.store.is_open());
        assert_eq!(state.store.live_blocks(), 0);
    }

    #[test]
    fn alloc_rolls_back_on_block_failure() {
        let mut store = FlakyStore::new();
        store.fail_alloc_at = Some(1);
        let mgr = MemoryManager::new(store);

        let mut blocks = [
            BlockDescriptor::linear(PAGE_SIZE),
            BlockDescriptor::linear(PAGE_SIZE),
            BlockDescriptor::linear(PAGE_SIZE),
        ];

        assert_eq!(
            mgr.alloc(&mut blocks),
            Err(MemError::AllocationFailed { index: 1 })
        );

        // The first block was acquired and must have been returned.
        for blk in &blocks {
            assert!(blk.backing().is_null());
            assert_eq!(blk.ptr(), None);
        }
        assert_eq!(mgr.outstanding(), 0);

        let state = mgr.state.lock();
        assert_eq!(state.sessions, 0);
        assert_eq!(state.store.inner.live_blocks(), 0);
        assert!(!state.store.inner.is_open());
    }

    #[test]
    fn alloc_rolls_back_on_register_failure() {
        let mut store = FlakyStore::new();
        store.fail_register = true;
        let mgr = MemoryManager::new(store);

        let mut blocks = [
            BlockDescriptor::linear(PAGE_SIZE),
            BlockDescriptor::linear(PAGE_SIZE),
        ];

        assert_eq!(mgr.alloc(&mut blocks), Err(MemError::MappingFailed));
        for blk in &blocks {
            assert!(blk.backing().is_null());
        }

        let state = mgr.state.lock();
        assert_eq!(state.sessions, 0);
        assert_eq!(state.store.inner.live_blocks(), 0);
    }

    #[test]
    fn map_rolls_back_on_map_failure() {
        let mut store = FlakyStore::new();
        store.fail_map = true;
        let mgr = MemoryManager::new(store);

        let (_backing_mem, ptr) = page_aligned_region(1);
        let mut blocks = [BlockDescriptor::linear_at(ptr, PAGE_SIZE)];

        assert_eq!(
            mgr.map(&mut blocks),
            Err(MemError::AllocationFailed { index: 0 })
        );
        assert!(blocks[0].backing().is_null());
        assert_eq!(blocks[0].ptr(), None);
        assert_eq!(mgr.outstanding(), 0);

        let state = mgr.state.lock();
        assert_eq!(state.sessions, 0);
        assert_eq!(state.store.inner.live_blocks(), 0);
        assert!(!state.store.inner.is_open());
    }

    #[test]
    fn map_rolls_back_on_register_failure() {
        let mut store = FlakyStore::new();
        store.fail_register = true;
        let mgr = MemoryManager::new(store);

        let (_backing_mem, ptr) = page_aligned_region(1);
        let mut blocks = [BlockDescriptor::linear_at(ptr, PAGE_SIZE)];

        assert_eq!(mgr.map(&mut blocks), Err(MemError::MappingFailed));

        // The mapping made before registration failed must have been undone.
        assert!(blocks[0].backing().is_null());
        assert_eq!(blocks[0].ptr(), None);
        assert_eq!(mgr.outstanding(), 0);

        let state = mgr.state.lock();
        assert_eq!(state.sessions, 0);
        assert_eq!(state.store.inner.live_blocks(), 0);
        assert!(!state.store.inner.is_open());
    }

    #[test]
    fn free_unknown_buffer() {
        let mgr = manager();
        assert_eq!(
            mgr.free(VirtualAddress::new(0xdead_0000)),
            Err(MemError::UnknownBuffer)
        );
        assert_eq!(mgr.state.lock().sessions, 0);
    }

    #[test]
    fn double_free_reports_unknown_buffer() {
        let mgr = manager();
        let mut blocks = [BlockDescriptor::linear(PAGE_SIZE)];
        let base = mgr.alloc(&mut blocks).unwrap();

        assert_eq!(mgr.free(base), Ok(()));
        assert_eq!(mgr.free(base), Err(MemError::UnknownBuffer));
    }

    #[test]
    fn map_single_linear_block() {
        let mgr = manager();
        let (_backing_mem, ptr) = page_aligned_region(2);
        let mut blocks = [BlockDescriptor::linear_at(ptr, 2 * PAGE_SIZE)];

        let base = mgr.map(&mut blocks).unwrap();
        assert!(!base.is_null());
        assert_eq!(mgr.outstanding(), 1);
        assert_eq!(mgr.classify(base), Some(BlockKind::Linear));

        mgr.unmap(base).unwrap();
        assert_eq!(mgr.outstanding(), 0);
        assert_eq!(mgr.state.lock().sessions, 0);
    }

    #[test]
    fn mapped_buffer_cannot_be_freed() {
        let mgr = manager();
        let (_backing_mem, ptr) = page_aligned_region(1);
        let mut blocks = [BlockDescriptor::linear_at(ptr, PAGE_SIZE)];

        let base = mgr.map(&mut blocks).unwrap();
        // Release must use the matching operation for the acquisition kind.
        assert_eq!(mgr.free(base), Err(MemError::UnknownBuffer));
        assert_eq!(mgr.outstanding(), 1);
        assert_eq!(mgr.unmap(base), Ok(()));
    }

    #[test]
    fn allocated_buffer_cannot_be_unmapped() {
        let mgr = manager();
        let mut blocks = [BlockDescriptor::linear(PAGE_SIZE)];
        let base = mgr.alloc(&mut blocks).unwrap();

        assert_eq!(mgr.unmap(base), Err(MemError::UnknownBuffer));
        assert_eq!(mgr.free(base), Ok(()));
    }

    #[test]
    fn map_rejects_two_blocks() {
        let mgr = manager();
        let (_mem_a, ptr_a) = page_aligned_region(1);
        let (_mem_b, ptr_b) = page_aligned_region(1);
        let mut blocks = [
            BlockDescriptor::linear_at(ptr_a, PAGE_SIZE),
            BlockDescriptor::linear_at(ptr_b, PAGE_SIZE),
        ];

        assert_eq!(mgr.map(&mut blocks), Err(MemError::UnsupportedMapShape));

        // The attempted session reference was rolled back.
        let state = mgr.state.lock();
        assert_eq!(state.sessions, 0);
        assert!(!state.store.is_open());
    }

    #[test]
    fn map_rejects_unaligned_pointer() {
        let mgr = manager();
        let (_backing_mem, ptr) = page_aligned_region(1);
        let mut blocks = [BlockDescriptor::linear_at(ptr + 4, PAGE_SIZE)];

        assert_eq!(mgr.map(&mut blocks), Err(MemError::UnsupportedMapShape));
        assert_eq!(mgr.state.lock().sessions, 0);
    }

    #[test]
    fn map_rejects_tiled_block() {
        let mgr = manager();
        let mut blocks = [BlockDescriptor::tiled(PixelFormat::Bit8, PAGE_SIZE, 4)];

        assert_eq!(mgr.map(&mut blocks), Err(MemError::UnsupportedMapShape));
    }

    #[test]
    fn map_rejects_missing_pointer() {
        let mgr = manager();
        let mut blocks = [BlockDescriptor::linear(PAGE_SIZE)];

        assert_eq!(mgr.map(&mut blocks), Err(MemError::UnsupportedMapShape));
    }

    #[test]
    fn map_rejects_odd_length() {
        let mgr = manager();
        let (_backing_mem, ptr) = page_aligned_region(1);
        let mut blocks = [BlockDescriptor::linear_at(ptr, 100)];

        assert_eq!(
            mgr.map(&mut blocks),
            Err(MemError::NotPageAligned { index: 0 })
        );
    }

    #[test]
    fn map_rejects_already_tracked_address() {
        let mgr = manager();
        let (_backing_mem, ptr) = page_aligned_region(1);
        let mut blocks = [BlockDescriptor::linear_at(ptr, PAGE_SIZE)];
        let base = mgr.map(&mut blocks).unwrap();

        // The mapped buffer itself is tracked and cannot be mapped again.
        let mut again = [BlockDescriptor::linear_at(base, PAGE_SIZE)];
        assert_eq!(mgr.map(&mut again), Err(MemError::UnsupportedMapShape));

        mgr.unmap(base).unwrap();
    }

    #[test]
    fn classifies_blocks_by_contained_address() {
        let mgr = manager();
        let mut blocks = [
            BlockDescriptor::linear(PAGE_SIZE),
            BlockDescriptor::tiled(PixelFormat::Bit16, PAGE_SIZE / 4, 8),
        ];
        let base = mgr.alloc(&mut blocks).unwrap();
        let tiled_base = blocks[1].ptr().unwrap();

        assert_eq!(mgr.classify(base), Some(BlockKind::Linear));
        assert_eq!(mgr.classify(base + PAGE_SIZE - 1), Some(BlockKind::Linear));
        assert_eq!(mgr.classify(tiled_base), Some(BlockKind::Tiled16));
        assert_eq!(
            mgr.classify(tiled_base + blocks[1].size() - 1),
            Some(BlockKind::Tiled16)
        );
        assert_eq!(mgr.classify(tiled_base + blocks[1].size()), None);
        assert_eq!(mgr.classify(VirtualAddress::NULL), None);

        assert!(mgr.is_linear(base));
        assert!(!mgr.is_tiled(base));
        assert!(mgr.is_tiled(tiled_base));
        assert!(mgr.is_acquired(base));
        assert!(!mgr.is_acquired(VirtualAddress::new(0xdead_0000)));

        mgr.free(base).unwrap();
        assert_eq!(mgr.classify(base), None);
    }

    #[test]
    fn stride_queries() {
        let mgr = manager();
        let mut blocks = [
            BlockDescriptor::linear(PAGE_SIZE),
            BlockDescriptor::tiled(PixelFormat::Bit32, PAGE_SIZE / 2, 4),
        ];
        let base = mgr.alloc(&mut blocks).unwrap();
        let tiled_base = blocks[1].ptr().unwrap();

        // The tiled block reports the stride computed at allocation; a plain
        // linear block has no row structure.
        assert_eq!(mgr.stride_of(tiled_base), 2 * PAGE_SIZE);
        assert_eq!(mgr.stride_of(base), 0);
        assert_eq!(mgr.stride_of(VirtualAddress::NULL), 0);
        assert_eq!(mgr.stride_of(VirtualAddress::new(0xdead_0000)), PAGE_SIZE);

        mgr.free(base).unwrap();
    }

    #[test]
    fn registry_tracks_one_entry_per_session() {
        let mgr = manager();
        let (_backing_mem, ptr) = page_aligned_region(1);

        let mut a = [BlockDescriptor::linear(PAGE_SIZE)];
        let mut b = [BlockDescriptor::tiled(PixelFormat::Bit8, PAGE_SIZE / 2, 2)];
        let mut c = [BlockDescriptor::linear_at(ptr, PAGE_SIZE)];

        // Consistency is asserted inside every call; this exercises a mixed
        // sequence of acquisitions and releases.
        let buf_a = mgr.alloc(&mut a).unwrap();
        let buf_b = mgr.alloc(&mut b).unwrap();
        let buf_c = mgr.map(&mut c).unwrap();
        assert_eq!(mgr.outstanding(), 3);
        assert_eq!(mgr.state.lock().sessions, 3);

        mgr.free(buf_b).unwrap();
        assert_eq!(mgr.outstanding(), 2);
        mgr.unmap(buf_c).unwrap();
        mgr.free(buf_a).unwrap();
        assert_eq!(mgr.outstanding(), 0);
        assert_eq!(mgr.state.lock().sessions, 0);
    }

    #[test]
    fn descriptors_are_reusable_after_failure() {
        let mut store = FlakyStore::new();
        store.fail_alloc_at = Some(0);
        let mgr = MemoryManager::new(store);

        let mut blocks = [BlockDescriptor::linear(PAGE_SIZE)];
        assert_eq!(
            mgr.alloc(&mut blocks),
            Err(MemError::AllocationFailed { index: 0 })
        );

        // After rollback the descriptor is fresh and passes validation again.
        mgr.state.lock().store.fail_alloc_at = None;
        let base = mgr.alloc(&mut blocks).unwrap();
        mgr.free(base).unwrap();
    }
}
