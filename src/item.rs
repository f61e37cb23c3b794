//! The cache item and its lifecycle flags.

use bitflags::bitflags;

use crate::arena::{Index, NIL};
use crate::slab::ChunkId;

bitflags! {
    /// Bit-set of lifecycle states.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct ItemState: u8 {
        const LINKED = 0b0001;
        const SLABBED = 0b0010;
        const DELETED = 0b0100;
        const CAS_ENABLED = 0b1000;
    }
}

/// The unit of storage. Key and value bytes live in a slab chunk owned by
/// the global [`crate::slab::SlabAllocator`]; this struct is the metadata
/// and link state, and is itself owned by a partition's [`crate::arena::Arena`].
pub struct Item {
    pub key_len: u16,
    pub value_len: u32,
    pub flags: u32,
    /// 0 = never expires. Otherwise an absolute instant measured in seconds
    /// since the engine's epoch (see `Engine::now`).
    pub expiration: u32,
    pub cas: u64,
    pub hash: u32,
    pub refcount: u32,
    pub slab_class_id: u16,
    pub chunk_id: ChunkId,
    pub last_access_time: u64,
    pub state: ItemState,

    /// Hash bucket chain (C2).
    pub h_next: Index,
    /// LRU list within `(partition, slab_class_id)` (C3).
    pub lru_prev: Index,
    pub lru_next: Index,
}

impl Item {
    #[allow(clippy::too_many_arguments)]
    pub fn new_detached(
        key_len: u16,
        value_len: u32,
        flags: u32,
        expiration: u32,
        hash: u32,
        slab_class_id: u16,
        chunk_id: ChunkId,
        now: u64,
    ) -> Self {
        Self {
            key_len,
            value_len,
            flags,
            expiration,
            cas: 0,
            hash,
            refcount: 1,
            slab_class_id,
            chunk_id,
            last_access_time: now,
            state: ItemState::empty(),
            h_next: NIL,
            lru_prev: NIL,
            lru_next: NIL,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.state.contains(ItemState::LINKED)
    }

    pub fn is_deleted(&self) -> bool {
        self.state.contains(ItemState::DELETED)
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expiration != 0 && (self.expiration as u64) <= now
    }

    /// Total on-wire footprint used to pick a slab class: header-equivalent
    /// fields are fixed cost so only key + value (+ CAS, if enabled) vary.
    pub fn total_size(key_len: usize, value_len: usize, use_cas: bool) -> usize {
        const ITEM_OVERHEAD: usize = 48; // flags, exptime, refcount, link fields, etc.
        let cas_bytes = if use_cas { 8 } else { 0 };
        ITEM_OVERHEAD + key_len + value_len + cas_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_flags_are_independent() {
        let mut s = ItemState::empty();
        assert!(!s.contains(ItemState::LINKED));
        s.insert(ItemState::LINKED);
        assert!(s.contains(ItemState::LINKED));
        assert!(!s.contains(ItemState::DELETED));
        s.insert(ItemState::DELETED);
        assert!(s.contains(ItemState::LINKED) && s.contains(ItemState::DELETED));
        s.remove(ItemState::LINKED);
        assert!(!s.contains(ItemState::LINKED));
        assert!(s.contains(ItemState::DELETED));
    }

    #[test]
    fn expiry_check() {
        let item = Item::new_detached(1, 1, 0, 100, 0, 1, 0, 50);
        assert!(!item.is_expired_at(99));
        assert!(item.is_expired_at(100));
        assert!(item.is_expired_at(200));
        let never = Item::new_detached(1, 1, 0, 0, 0, 1, 0, 50);
        assert!(!never.is_expired_at(u64::MAX));
    }
}
