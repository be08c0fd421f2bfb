//! Bookkeeping of outstanding buffers.
//!
//! The registry is the unique record of which virtual buffers are
//! outstanding and which backing-store group each belongs to. Entries are
//! keyed by buffer address and removed by address *and* acquisition kind: a
//! buffer acquired by mapping must be released by unmap, not free, and vice
//! versa.

use hashbrown::HashMap;

use crate::address::VirtualAddress;
use crate::backing::GroupId;

/// How a buffer was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Freshly allocated from the backing store.
    Allocated,
    /// Mapped from caller-owned memory.
    Mapped,
}

#[derive(Debug, Clone, Copy)]
struct RegistryEntry {
    group: GroupId,
    origin: Origin,
}

/// Mapping from outstanding buffer addresses to their backing groups.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: HashMap<VirtualAddress, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Records a newly acquired buffer.
    pub fn insert(&mut self, addr: VirtualAddress, group: GroupId, origin: Origin) {
        let prev = self.entries.insert(addr, RegistryEntry { group, origin });
        debug_assert!(prev.is_none(), "duplicate registry entry for {addr:?}");
    }

    /// Removes the entry for `addr` if it exists with the given origin,
    /// returning its group. An entry of the other origin is left untouched.
    pub fn remove(&mut self, addr: VirtualAddress, origin: Origin) -> Option<GroupId> {
        match self.entries.get(&addr) {
            Some(entry) if entry.origin == origin => {
                let group = entry.group;
                self.entries.remove(&addr);
                Some(group)
            }
            _ => None,
        }
    }

    /// Number of outstanding buffers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over the groups of all outstanding buffers.
    pub fn groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.entries.values().map(|entry| entry.group)
    }
}
