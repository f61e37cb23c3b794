//! A single shard: hash index (C2) + per-class LRU and eviction (C3).
//!
//! Grounded on `assoc.c` for the resize protocol (`assoc_find`, `assoc_insert`,
//! `assoc_maintenance_thread`) and on `items.c` for LRU linking and eviction
//! (`item_link_q`, `item_unlink_q`, `evict_from_partition`, `item_flush_expired`).
//! Both tables live behind the single partition mutex the caller already
//! holds (`Engine` wraps each `Partition` in a `parking_lot::Mutex`), so every
//! method here takes `&mut self`.

use crate::arena::{Arena, Index, NIL};
use crate::item::{Item, ItemState};
use crate::slab::SlabAllocator;

const TOUCH_THROTTLE_SECS: u64 = 60;
const EVICT_SCAN_LIMIT: usize = 50;

#[derive(Debug, Default, Clone, Copy)]
pub struct ClassStats {
    pub evictions: u64,
    pub out_of_memory: u64,
    pub expired_unlinked: u64,
}

pub struct DeferredDelete {
    pub index: Index,
    pub ready_at: u64,
}

pub struct Partition {
    pub arena: Arena<Item>,

    primary: Vec<Index>,
    old: Vec<Index>,
    hashpower: u32,
    expanding: bool,
    expand_bucket: usize,
    hash_items: usize,

    lru_head: Vec<Index>,
    lru_tail: Vec<Index>,
    class_stats: Vec<ClassStats>,

    pub delete_queue: Vec<DeferredDelete>,
}

fn hashmask(power: u32) -> u32 {
    (1u32 << power) - 1
}

impl Partition {
    pub fn new(num_classes: usize, initial_buckets: usize) -> Self {
        assert!(initial_buckets.is_power_of_two());
        let hashpower = initial_buckets.trailing_zeros();
        Self {
            arena: Arena::new(),
            primary: vec![NIL; initial_buckets],
            old: Vec::new(),
            hashpower,
            expanding: false,
            expand_bucket: 0,
            hash_items: 0,
            lru_head: vec![NIL; num_classes],
            lru_tail: vec![NIL; num_classes],
            class_stats: vec![ClassStats::default(); num_classes],
            delete_queue: Vec::new(),
        }
    }

    pub fn is_expanding(&self) -> bool {
        self.expanding
    }

    pub fn class_stats(&self, class_id: u16) -> ClassStats {
        self.class_stats[class_id as usize]
    }

    pub fn item_count(&self) -> usize {
        self.hash_items
    }

    // ---- C2: hash index --------------------------------------------------

    fn bucket_for(&self, hash: u32) -> (bool, usize) {
        if self.expanding {
            let old_bucket = (hash & hashmask(self.hashpower - 1)) as usize;
            if old_bucket >= self.expand_bucket {
                return (true, old_bucket);
            }
        }
        (false, (hash & hashmask(self.hashpower)) as usize)
    }

    /// Walk one bucket chain comparing `(hash, key_len, key_bytes)`.
    pub fn find(&self, slab: &SlabAllocator, key: &[u8], hash: u32) -> Option<Index> {
        let (use_old, bucket) = self.bucket_for(hash);
        let mut cur = if use_old {
            self.old[bucket]
        } else {
            self.primary[bucket]
        };
        while cur != NIL {
            let item = self.arena.get(cur);
            if item.hash == hash
                && item.key_len as usize == key.len()
                && &slab.bytes(item.slab_class_id, item.chunk_id)[..key.len()] == key
            {
                return Some(cur);
            }
            cur = item.h_next;
        }
        None
    }

    /// Precondition: no item with this key is currently present.
    pub fn insert(&mut self, idx: Index, hash_bulk_move: usize) {
        let hash = self.arena.get(idx).hash;
        let (use_old, bucket) = self.bucket_for(hash);
        let head = if use_old {
            &mut self.old[bucket]
        } else {
            &mut self.primary[bucket]
        };
        let old_head = *head;
        *head = idx;
        self.arena.get_mut(idx).h_next = old_head;

        self.hash_items += 1;
        if !self.expanding && self.hash_items > (self.primary.len() * 3) / 2 {
            self.begin_expand();
        }
        // Opportunistically fold in a migration step on the insert path too,
        // so a burst of inserts doesn't starve the background worker.
        if self.expanding {
            self.migrate_buckets(hash_bulk_move);
        }
    }

    /// Unlink `idx` from its bucket chain. Caller guarantees it is present.
    pub fn remove_from_hash(&mut self, idx: Index) {
        let hash = self.arena.get(idx).hash;
        let (use_old, bucket) = self.bucket_for(hash);
        let table = if use_old {
            &mut self.old
        } else {
            &mut self.primary
        };
        let mut cur = table[bucket];
        if cur == idx {
            table[bucket] = self.arena.get(idx).h_next;
            self.arena.get_mut(idx).h_next = NIL;
            self.hash_items -= 1;
            return;
        }
        loop {
            let next = self.arena.get(cur).h_next;
            assert_ne!(next, NIL, "remove_from_hash: index not present in chain");
            if next == idx {
                let after = self.arena.get(idx).h_next;
                self.arena.get_mut(cur).h_next = after;
                self.arena.get_mut(idx).h_next = NIL;
                self.hash_items -= 1;
                return;
            }
            cur = next;
        }
    }

    fn begin_expand(&mut self) {
        let new_buckets = vec![NIL; self.primary.len() * 2];
        self.old = std::mem::replace(&mut self.primary, new_buckets);
        self.hashpower += 1;
        self.expanding = true;
        self.expand_bucket = 0;
    }

    /// Migrate up to `n` old buckets into the new table. Returns whether the
    /// partition is still expanding afterward.
    pub fn migrate_buckets(&mut self, n: usize) -> bool {
        for _ in 0..n.max(1) {
            if !self.expanding {
                break;
            }
            let mut cur = self.old[self.expand_bucket];
            while cur != NIL {
                let next = self.arena.get(cur).h_next;
                let hash = self.arena.get(cur).hash;
                let new_bucket = (hash & hashmask(self.hashpower)) as usize;
                self.arena.get_mut(cur).h_next = self.primary[new_bucket];
                self.primary[new_bucket] = cur;
                cur = next;
            }
            self.old[self.expand_bucket] = NIL;
            self.expand_bucket += 1;
            if self.expand_bucket == hashmask(self.hashpower - 1) as usize + 1 {
                self.expanding = false;
                self.old = Vec::new();
            }
        }
        self.expanding
    }

    // ---- C3: LRU & eviction -----------------------------------------------

    pub fn link_lru(&mut self, idx: Index) {
        let class_id = self.arena.get(idx).slab_class_id as usize;
        let old_head = self.lru_head[class_id];
        {
            let item = self.arena.get_mut(idx);
            item.lru_prev = NIL;
            item.lru_next = old_head;
        }
        if old_head != NIL {
            self.arena.get_mut(old_head).lru_prev = idx;
        } else {
            self.lru_tail[class_id] = idx;
        }
        self.lru_head[class_id] = idx;
    }

    pub fn unlink_lru(&mut self, idx: Index) {
        let class_id = self.arena.get(idx).slab_class_id as usize;
        let (prev, next) = {
            let item = self.arena.get(idx);
            (item.lru_prev, item.lru_next)
        };
        if prev != NIL {
            self.arena.get_mut(prev).lru_next = next;
        } else {
            self.lru_head[class_id] = next;
        }
        if next != NIL {
            self.arena.get_mut(next).lru_prev = prev;
        } else {
            self.lru_tail[class_id] = prev;
        }
        let item = self.arena.get_mut(idx);
        item.lru_prev = NIL;
        item.lru_next = NIL;
    }

    /// Move to head if the last reposition was more than 60s ago.
    pub fn touch(&mut self, idx: Index, now: u64) {
        let item = self.arena.get(idx);
        if !item.is_linked() {
            return;
        }
        if now.saturating_sub(item.last_access_time) <= TOUCH_THROTTLE_SECS {
            return;
        }
        self.unlink_lru(idx);
        self.arena.get_mut(idx).last_access_time = now;
        self.link_lru(idx);
    }

    /// Scan from the tail up to 50 items; evict the first unreferenced one.
    pub fn evict_one(&mut self, class_id: u16, slab: &mut SlabAllocator) -> Option<Index> {
        let mut cur = self.lru_tail[class_id as usize];
        let mut scanned = 0;
        while cur != NIL && scanned < EVICT_SCAN_LIMIT {
            let prev = self.arena.get(cur).lru_prev;
            if self.arena.get(cur).refcount == 0 {
                self.unlink_lru(cur);
                self.remove_from_hash(cur);
                let item = self.arena.get_mut(cur);
                item.state.remove(ItemState::LINKED);
                let (cid, chunk) = (item.slab_class_id, item.chunk_id);
                slab.free(cid, chunk);
                self.arena.remove(cur);
                self.class_stats[class_id as usize].evictions += 1;
                return Some(cur);
            }
            cur = prev;
            scanned += 1;
        }
        self.class_stats[class_id as usize].out_of_memory += 1;
        None
    }

    /// Steal an expired, unreferenced item from the tail (up to 50 items)
    /// without counting it as an eviction. Returns the stolen index still
    /// linked in the arena but unlinked from hash/LRU, ready for reuse.
    pub fn steal_expired(&mut self, class_id: u16, now: u64) -> Option<Index> {
        let mut cur = self.lru_tail[class_id as usize];
        let mut scanned = 0;
        while cur != NIL && scanned < EVICT_SCAN_LIMIT {
            let prev = self.arena.get(cur).lru_prev;
            let item = self.arena.get(cur);
            if item.refcount == 0 && item.is_expired_at(now) {
                self.unlink_lru(cur);
                self.remove_from_hash(cur);
                self.arena.get_mut(cur).state.remove(ItemState::LINKED);
                return Some(cur);
            }
            cur = prev;
            scanned += 1;
        }
        None
    }

    /// Walk head-to-tail per the literal reaper contract; the list is
    /// monotonic by insertion time so the walk stops at the first item
    /// older than `cutoff`. Correctness of FLUSH is independent of this
    /// method succeeding: `get()` enforces the `oldest_live` watermark
    /// lazily regardless (see `Engine::get`). This is purely an eager
    /// reclaim pass run from the maintenance loop.
    pub fn flush_expired(&mut self, cutoff: u64, slab: &mut SlabAllocator) -> usize {
        let mut reclaimed = 0;
        for class_id in 0..self.lru_head.len() {
            let mut cur = self.lru_head[class_id];
            while cur != NIL {
                let item = self.arena.get(cur);
                if item.last_access_time < cutoff {
                    break;
                }
                let next = item.lru_next;
                if item.refcount == 0 {
                    self.unlink_lru(cur);
                    self.remove_from_hash(cur);
                    let item = self.arena.get_mut(cur);
                    item.state.remove(ItemState::LINKED);
                    let (cid, chunk) = (item.slab_class_id, item.chunk_id);
                    slab.free(cid, chunk);
                    self.arena.remove(cur);
                    reclaimed += 1;
                }
                cur = next;
            }
        }
        reclaimed
    }

    /// Reap deferred deletes whose lock window has elapsed.
    ///
    /// A queued item is still fully linked — present in its hash chain and
    /// LRU list, with `LINKED` set — so it can keep blocking a same-key ADD
    /// until the lock window elapses. Reaping it therefore has to undo that
    /// linkage here before freeing the slab chunk and arena slot, or the
    /// bucket chain and LRU are left pointing at a freed (and possibly
    /// reused) index. Returns the slab class of each item actually
    /// reclaimed, so the caller can reconcile engine-wide byte/item counts.
    pub fn reap_deferred(&mut self, now: u64, slab: &mut SlabAllocator) -> Vec<u16> {
        let mut reclaimed_classes = Vec::new();
        let mut still_pending = Vec::new();
        for d in std::mem::take(&mut self.delete_queue) {
            if d.ready_at > now {
                still_pending.push(d);
                continue;
            }
            if self.arena.get(d.index).refcount == 0 {
                self.unlink_lru(d.index);
                self.remove_from_hash(d.index);
                let item = self.arena.get_mut(d.index);
                item.state.remove(ItemState::LINKED);
                let (cid, chunk) = (item.slab_class_id, item.chunk_id);
                slab.free(cid, chunk);
                self.arena.remove(d.index);
                reclaimed_classes.push(cid);
            } else {
                // Still referenced: leave in queue, it'll be swept again.
                still_pending.push(d);
            }
        }
        self.delete_queue = still_pending;
        reclaimed_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::SlabAllocator;

    fn new_slab() -> SlabAllocator {
        SlabAllocator::with_page_size(64, 4096, 1.25, 1 << 20, 1024)
    }

    fn store_item(p: &mut Partition, slab: &mut SlabAllocator, key: &[u8], hash: u32) -> Index {
        let class = slab.class_for(key.len());
        let chunk = slab.alloc(class).unwrap();
        slab.bytes_mut(class, chunk)[..key.len()].copy_from_slice(key);
        let item = Item::new_detached(key.len() as u16, 0, 0, 0, hash, class, chunk, 0);
        let idx = p.arena.insert(item);
        p.insert(idx, 1);
        p.arena.get_mut(idx).state.insert(ItemState::LINKED);
        p.link_lru(idx);
        idx
    }

    #[test]
    fn find_after_insert() {
        let mut p = Partition::new(64, 8);
        let mut slab = new_slab();
        let idx = store_item(&mut p, &mut slab, b"hello", 42);
        assert_eq!(p.find(&slab, b"hello", 42), Some(idx));
        assert_eq!(p.find(&slab, b"nope", 43), None);
    }

    #[test]
    fn remove_from_hash_then_not_found() {
        let mut p = Partition::new(64, 8);
        let mut slab = new_slab();
        let idx = store_item(&mut p, &mut slab, b"a", 1);
        p.remove_from_hash(idx);
        assert_eq!(p.find(&slab, b"a", 1), None);
    }

    #[test]
    fn expansion_preserves_all_keys() {
        let mut p = Partition::new(4, 8);
        let mut slab = new_slab();
        let mut indices = Vec::new();
        for i in 0..500u32 {
            let key = i.to_be_bytes();
            let idx = store_item(&mut p, &mut slab, &key, i);
            indices.push((key, i, idx));
        }
        // Drive any in-flight migration to completion.
        while p.is_expanding() {
            p.migrate_buckets(4);
        }
        for (key, hash, idx) in indices {
            assert_eq!(p.find(&slab, &key, hash), Some(idx));
        }
    }

    #[test]
    fn lru_order_is_most_recent_first() {
        let mut p = Partition::new(64, 8);
        let mut slab = new_slab();
        let a = store_item(&mut p, &mut slab, b"a", 1);
        let b = store_item(&mut p, &mut slab, b"b", 2);
        assert_eq!(p.lru_head[slab.class_for(1) as usize], b);
        p.touch(a, 1000);
        assert_eq!(p.lru_head[slab.class_for(1) as usize], a);
    }

    #[test]
    fn evict_one_frees_unreferenced_tail() {
        let mut p = Partition::new(64, 8);
        let mut slab = new_slab();
        let class = slab.class_for(1);
        let idx = store_item(&mut p, &mut slab, b"a", 1);
        p.arena.get_mut(idx).refcount = 0;
        let evicted = p.evict_one(class, &mut slab);
        assert_eq!(evicted, Some(idx));
        assert_eq!(p.find(&slab, b"a", 1), None);
    }

    #[test]
    fn evict_one_skips_pinned_items() {
        let mut p = Partition::new(64, 8);
        let mut slab = new_slab();
        let class = slab.class_for(1);
        let idx = store_item(&mut p, &mut slab, b"a", 1);
        // refcount stays 1 (pinned)
        let evicted = p.evict_one(class, &mut slab);
        assert_eq!(evicted, None);
        assert_eq!(p.class_stats(class).out_of_memory, 1);
        assert_eq!(p.find(&slab, b"a", 1), Some(idx));
    }
}
