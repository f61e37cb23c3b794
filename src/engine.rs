//! The operation engine (C4): ADD/SET/REPLACE/APPEND/PREPEND/CAS/INCR/DECR/
//! DELETE/FLUSH/GET, built on top of the slab allocator (C1) and the
//! partitioned hash index + LRU (C2/C3).
//!
//! Per-opcode semantics follow `items.c`'s `do_item_alloc`/`do_item_link`/
//! `do_item_unlink`/`do_item_replace`/`do_item_update`/`do_item_get`. `Engine`
//! itself is a single facade owning its shards and background maintenance
//! task, backed by a small set of associated functions over shared state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::arena::Index;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::item::{Item, ItemState};
use crate::partition::{DeferredDelete, Partition};
use crate::slab::{SlabAllocator, INVALID_CLASS};
use crate::stats::{Snapshot, Stats};

pub const MAX_KEY_LEN: usize = 250;
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Add,
    Set,
    Replace,
    Append,
    Prepend,
    Cas,
}

pub struct StoreReq<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub flags: u32,
    pub exptime: u32,
    /// 0 means "no CAS check".
    pub cas: u64,
}

/// A handle to a referenced item. The holder owns one refcount until it
/// calls [`Engine::release`].
pub struct ItemRef {
    partition: usize,
    index: Index,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
    pub exptime: u32,
}

/// Everything the maintenance thread and the public facade share. Held
/// behind an `Arc` so the maintenance thread can outlive a single method
/// call on `Engine` without borrowing it.
struct Inner {
    partitions: Vec<Mutex<Partition>>,
    slab: Mutex<SlabAllocator>,
    stats: Stats,
    cas_counter: AtomicU64,
    /// Value of `now()` when `flush(when)` was last called; items linked at
    /// or before this instant are candidates for flushing.
    oldest_live_value: AtomicU64,
    /// The instant (seconds since engine start) at which the pending flush
    /// becomes effective. `u64::MAX` means no flush is scheduled.
    oldest_live_effective_at: AtomicU64,
    config: EngineConfig,
    start: Instant,
}

/// The cache storage engine: N partitions, one slab allocator, process-wide
/// stats and CAS counter, and the background maintenance task.
pub struct Engine {
    inner: Arc<Inner>,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let slab = SlabAllocator::new(
            config.chunk_size_min,
            config.chunk_size_max,
            config.factor,
            config.max_bytes,
        );
        let num_classes = slab.num_classes();
        let partitions = (0..config.num_partitions)
            .map(|_| Mutex::new(Partition::new(num_classes, config.initial_buckets)))
            .collect();

        let inner = Arc::new(Inner {
            partitions,
            slab: Mutex::new(slab),
            stats: Stats::default(),
            cas_counter: AtomicU64::new(0),
            oldest_live_value: AtomicU64::new(0),
            oldest_live_effective_at: AtomicU64::new(u64::MAX),
            config,
            start: Instant::now(),
        });
        let engine = Self {
            inner,
            shutdown: Arc::new((Mutex::new(false), Condvar::new())),
            maintenance: Mutex::new(None),
        };
        engine.spawn_maintenance();
        info!(
            partitions = engine.inner.config.num_partitions,
            max_bytes = engine.inner.config.max_bytes,
            "engine constructed"
        );
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn now(&self) -> u64 {
        self.inner.start.elapsed().as_secs()
    }

    fn partition_index(&self, hash: u32) -> usize {
        (hash as usize) % self.inner.partitions.len()
    }

    fn is_flushed(&self, item_time: u64, now: u64) -> bool {
        let effective_at = self.inner.oldest_live_effective_at.load(Ordering::Relaxed);
        let value = self.inner.oldest_live_value.load(Ordering::Relaxed);
        effective_at != u64::MAX && now >= effective_at && item_time <= value
    }

    // ---- facade: size checks ------------------------------------------

    /// `flags` is accepted to match the dispatcher-facing signature but does
    /// not affect the bound: it is a fixed-size field already folded into
    /// each item's overhead regardless of its value.
    pub fn size_ok(&self, nkey: usize, _flags: u32, nbytes: usize) -> bool {
        nkey > 0 && nkey <= MAX_KEY_LEN && nbytes <= MAX_VALUE_LEN
    }

    fn validate_key(&self, key: &[u8]) -> EngineResult<()> {
        if key.is_empty() {
            return Err(EngineError::InvalidArgument("empty key"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(EngineError::TooLarge {
                nkey: key.len(),
                nbytes: 0,
            });
        }
        Ok(())
    }

    fn validate_value(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        if value.len() > MAX_VALUE_LEN {
            return Err(EngineError::TooLarge {
                nkey: key.len(),
                nbytes: value.len(),
            });
        }
        Ok(())
    }

    // ---- facade: allocate / release ----------------------------------

    /// `do_item_alloc`: derive a class, steal an expired tail item if one is
    /// available, else allocate from the slab allocator, else evict.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        &self,
        partition_idx: usize,
        part: &mut MutexGuard<'_, Partition>,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: u32,
        hash: u32,
    ) -> EngineResult<Index> {
        let total = Item::total_size(key.len(), value.len(), self.inner.config.use_cas);
        let class_id = {
            let slab = self.inner.slab.lock();
            slab.class_for(total)
        };
        if class_id == INVALID_CLASS {
            return Err(EngineError::TooLarge {
                nkey: key.len(),
                nbytes: value.len(),
            });
        }

        let now = self.now();

        // Step 2: steal an expired tail item of this class before touching
        // the allocator lock at all.
        if let Some(stolen) = part.steal_expired(class_id, now) {
            // The stolen item was previously linked and counted in engine
            // stats; it never went through `unlink`, so reclaim its
            // footprint here before reusing its chunk.
            Stats::inc(&self.inner.stats.expired_unlinked);
            Stats::sub(&self.inner.stats.current_items, 1);
            Stats::sub(
                &self.inner.stats.current_bytes,
                self.inner.slab.lock().chunk_size(class_id) as u64,
            );
            let chunk_id = part.arena.get(stolen).chunk_id;
            let mut slab = self.inner.slab.lock();
            self.write_chunk(&mut slab, class_id, chunk_id, key, value);
            let item = part.arena.get_mut(stolen);
            *item = Item::new_detached(
                key.len() as u16,
                value.len() as u32,
                flags,
                exptime,
                hash,
                class_id,
                chunk_id,
                now,
            );
            return Ok(stolen);
        }

        // Steps 3-5: allocator, then evict-own-partition, then evict-all.
        let chunk_id = self.alloc_chunk_with_eviction(partition_idx, part, class_id)?;
        {
            let mut slab = self.inner.slab.lock();
            self.write_chunk(&mut slab, class_id, chunk_id, key, value);
        }
        let item = Item::new_detached(
            key.len() as u16,
            value.len() as u32,
            flags,
            exptime,
            hash,
            class_id,
            chunk_id,
            now,
        );
        Ok(part.arena.insert(item))
    }

    fn write_chunk(
        &self,
        slab: &mut SlabAllocator,
        class_id: u16,
        chunk_id: u32,
        key: &[u8],
        value: &[u8],
    ) {
        let bytes = slab.bytes_mut(class_id, chunk_id);
        bytes[..key.len()].copy_from_slice(key);
        bytes[key.len()..key.len() + value.len()].copy_from_slice(value);
    }

    fn alloc_chunk_with_eviction(
        &self,
        partition_idx: usize,
        part: &mut MutexGuard<'_, Partition>,
        class_id: u16,
    ) -> EngineResult<u32> {
        {
            let mut slab = self.inner.slab.lock();
            if let Some(chunk) = slab.alloc(class_id) {
                return Ok(chunk);
            }
        }
        if !self.inner.config.evict_to_free {
            return Err(EngineError::OutOfMemory);
        }

        // Evict from the owning partition first.
        {
            let mut slab = self.inner.slab.lock();
            if part.evict_one(class_id, &mut slab).is_some() {
                self.record_eviction(class_id, &slab);
                if let Some(chunk) = slab.alloc(class_id) {
                    return Ok(chunk);
                }
            }
        }

        // Round-robin the remaining partitions. A thread may hold at most one
        // partition mutex at a time, so `MutexGuard::unlocked` releases the
        // owning partition's lock for the duration of each other partition's
        // eviction attempt and reacquires it before returning. Without this,
        // two threads sweeping into each other's partitions in opposite
        // order would deadlock.
        for offset in 1..self.inner.partitions.len() {
            let idx = (partition_idx + offset) % self.inner.partitions.len();
            let evicted = MutexGuard::unlocked(part, || {
                let mut other = self.inner.partitions[idx].lock();
                let mut slab = self.inner.slab.lock();
                if other.evict_one(class_id, &mut slab).is_some() {
                    self.record_eviction(class_id, &slab);
                    true
                } else {
                    false
                }
            });
            if evicted {
                let mut slab = self.inner.slab.lock();
                if let Some(chunk) = slab.alloc(class_id) {
                    return Ok(chunk);
                }
            }
        }
        warn!(class_id, "allocation failed after full eviction sweep");
        Err(EngineError::OutOfMemory)
    }

    /// Partition-level eviction frees the slab chunk and unlinks the item
    /// but has no access to engine-wide stats; update them here.
    fn record_eviction(&self, class_id: u16, slab: &SlabAllocator) {
        Stats::inc(&self.inner.stats.total_evictions);
        Stats::sub(&self.inner.stats.current_items, 1);
        Stats::sub(&self.inner.stats.current_bytes, slab.chunk_size(class_id) as u64);
    }

    pub fn release(&self, item_ref: ItemRef) {
        let mut part = self.inner.partitions[item_ref.partition].lock();
        let item = part.arena.get_mut(item_ref.index);
        debug_assert!(item.refcount > 0);
        item.refcount -= 1;
        if item.refcount == 0 && !item.is_linked() {
            let (class_id, chunk_id) = (item.slab_class_id, item.chunk_id);
            part.arena.remove(item_ref.index);
            let mut slab = self.inner.slab.lock();
            slab.free(class_id, chunk_id);
        }
    }

    fn next_cas(&self) -> u64 {
        self.inner.cas_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Assign the next monotonic CAS value to a not-yet-linked item.
    fn set_cas(&self, part: &mut Partition, idx: Index) -> u64 {
        let cas = self.next_cas();
        let item = part.arena.get_mut(idx);
        item.cas = cas;
        if self.inner.config.use_cas {
            item.state.insert(ItemState::CAS_ENABLED);
        }
        cas
    }

    fn link(&self, part: &mut Partition, idx: Index) {
        part.insert(idx, self.inner.config.hash_bulk_move);
        part.arena.get_mut(idx).state.insert(ItemState::LINKED);
        part.link_lru(idx);
        Stats::inc(&self.inner.stats.total_items);
        Stats::inc(&self.inner.stats.current_items);
        let size = self.item_footprint(part, idx);
        Stats::add(&self.inner.stats.current_bytes, size);
    }

    fn item_footprint(&self, part: &Partition, idx: Index) -> u64 {
        let item = part.arena.get(idx);
        let slab = self.inner.slab.lock();
        slab.chunk_size(item.slab_class_id) as u64
    }

    /// Unlink an item that still has a live caller reference: clears LINKED,
    /// removes from hash + LRU, but only frees to slab once the refcount
    /// drops to zero (possibly immediately).
    fn unlink(&self, part: &mut Partition, idx: Index) {
        part.unlink_lru(idx);
        part.remove_from_hash(idx);
        let item = part.arena.get_mut(idx);
        item.state.remove(ItemState::LINKED);
        let size = {
            let slab = self.inner.slab.lock();
            slab.chunk_size(item.slab_class_id) as u64
        };
        Stats::sub(&self.inner.stats.current_bytes, size);
        Stats::sub(&self.inner.stats.current_items, 1);
        if item.refcount == 0 {
            let (class_id, chunk_id) = (item.slab_class_id, item.chunk_id);
            part.arena.remove(idx);
            let mut slab = self.inner.slab.lock();
            slab.free(class_id, chunk_id);
        }
    }

    // ---- facade: get --------------------------------------------------

    /// Find a live item, lazily expiring it if its expiration or the global
    /// flush watermark has passed; bumps refcount and touches LRU on a hit.
    pub fn get_ref(&self, key: &[u8]) -> EngineResult<ItemRef> {
        self.validate_key(key)?;
        let hash = fnv1a32(key);
        let pidx = self.partition_index(hash);
        let mut part = self.inner.partitions[pidx].lock();
        let now = self.now();

        let found = {
            let slab = self.inner.slab.lock();
            part.find(&slab, key, hash)
        };
        let Some(idx) = found else {
            Stats::inc(&self.inner.stats.get_misses);
            return Err(EngineError::KeyNotFound);
        };

        let (expired, deleted) = {
            let item = part.arena.get(idx);
            (
                item.is_expired_at(now) || self.is_flushed(item.last_access_time, now),
                item.is_deleted(),
            )
        };
        if deleted {
            // Owned by the deferred-delete queue: `reap_deferred` is the only
            // path allowed to unlink and free it once its lock window
            // elapses. Unlinking it here too would free an arena slot the
            // queue still references, handing out a stale index.
            Stats::inc(&self.inner.stats.get_misses);
            return Err(EngineError::KeyNotFound);
        }
        if expired {
            Stats::inc(&self.inner.stats.get_misses);
            Stats::inc(&self.inner.stats.expired_unlinked);
            self.unlink(&mut part, idx);
            return Err(EngineError::KeyNotFound);
        }

        part.touch(idx, now);
        part.arena.get_mut(idx).refcount += 1;
        Stats::inc(&self.inner.stats.get_hits);
        Ok(ItemRef {
            partition: pidx,
            index: idx,
        })
    }

    pub fn item_info(&self, item_ref: &ItemRef) -> ItemInfo {
        let part = self.inner.partitions[item_ref.partition].lock();
        let item = part.arena.get(item_ref.index);
        let slab = self.inner.slab.lock();
        let bytes = slab.bytes(item.slab_class_id, item.chunk_id);
        let value = bytes[item.key_len as usize..item.key_len as usize + item.value_len as usize]
            .to_vec();
        ItemInfo {
            value,
            flags: item.flags,
            cas: item.cas,
            exptime: item.expiration,
        }
    }

    /// Convenience wrapper combining `get_ref` + `item_info` + `release`.
    pub fn get(&self, key: &[u8]) -> EngineResult<ItemInfo> {
        let item_ref = self.get_ref(key)?;
        let info = self.item_info(&item_ref);
        self.release(item_ref);
        Ok(info)
    }

    // ---- facade: store ----------------------------------------------

    pub fn store(&self, op: StoreOp, req: StoreReq<'_>) -> EngineResult<u64> {
        self.validate_key(req.key)?;
        self.validate_value(req.key, req.value)?;
        let hash = fnv1a32(req.key);
        let pidx = self.partition_index(hash);
        let mut part = self.inner.partitions[pidx].lock();
        let now = self.now();

        let existing = {
            let slab = self.inner.slab.lock();
            part.find(&slab, req.key, hash)
        };
        let existing = existing.filter(|&idx| {
            let item = part.arena.get(idx);
            !(item.is_expired_at(now) || self.is_flushed(item.last_access_time, now) || item.is_deleted())
        });

        match op {
            StoreOp::Add => {
                if existing.is_some() {
                    return Err(EngineError::KeyExists);
                }
                self.link_new(pidx, &mut part, &req, now)
            }
            StoreOp::Set => {
                if let Some(old) = existing {
                    self.unlink(&mut part, old);
                }
                self.link_new(pidx, &mut part, &req, now)
            }
            StoreOp::Replace => match existing {
                Some(old) => {
                    self.unlink(&mut part, old);
                    self.link_new(pidx, &mut part, &req, now)
                }
                None => Err(EngineError::NotStored),
            },
            StoreOp::Cas => match existing {
                None => Err(EngineError::KeyNotFound),
                Some(old) => {
                    if part.arena.get(old).cas != req.cas {
                        return Err(EngineError::KeyExists);
                    }
                    self.unlink(&mut part, old);
                    self.link_new(pidx, &mut part, &req, now)
                }
            },
            StoreOp::Append | StoreOp::Prepend => match existing {
                None => Err(EngineError::NotStored),
                Some(old) => {
                    let old_value = {
                        let old_item = part.arena.get(old);
                        let slab = self.inner.slab.lock();
                        slab.bytes(old_item.slab_class_id, old_item.chunk_id)[old_item.key_len
                            as usize
                            ..old_item.key_len as usize + old_item.value_len as usize]
                            .to_vec()
                    };
                    let combined = if op == StoreOp::Append {
                        [old_value.as_slice(), req.value].concat()
                    } else {
                        [req.value, old_value.as_slice()].concat()
                    };
                    let (flags, exptime) = {
                        let old_item = part.arena.get(old);
                        (old_item.flags, old_item.expiration)
                    };
                    self.unlink(&mut part, old);
                    let combined_req = StoreReq {
                        key: req.key,
                        value: &combined,
                        flags,
                        exptime,
                        cas: 0,
                    };
                    self.link_new(pidx, &mut part, &combined_req, now)
                }
            },
        }
    }

    fn link_new(
        &self,
        pidx: usize,
        part: &mut MutexGuard<'_, Partition>,
        req: &StoreReq<'_>,
        now: u64,
    ) -> EngineResult<u64> {
        let _ = now;
        let hash = fnv1a32(req.key);
        let idx = self.allocate(pidx, part, req.key, req.value, req.flags, req.exptime, hash)?;
        let cas = self.set_cas(part, idx);
        self.link(part, idx);
        // `allocate` hands back a reference owned by this call; `store`/
        // `arithmetic` return only the new CAS, not a handle, so drop it
        // here rather than leaking a permanently pinned refcount.
        part.arena.get_mut(idx).refcount -= 1;
        Ok(cas)
    }

    // ---- facade: remove ---------------------------------------------

    pub fn remove(&self, key: &[u8], cas: u64, exptime: u32) -> EngineResult<()> {
        self.validate_key(key)?;
        let hash = fnv1a32(key);
        let pidx = self.partition_index(hash);
        let mut part = self.inner.partitions[pidx].lock();
        let now = self.now();

        let idx = {
            let slab = self.inner.slab.lock();
            part.find(&slab, key, hash)
        };
        let Some(idx) = idx else {
            return Err(EngineError::KeyNotFound);
        };
        let item_cas = part.arena.get(idx).cas;
        if cas != 0 && cas != item_cas {
            return Err(EngineError::KeyExists);
        }

        if exptime == 0 {
            self.unlink(&mut part, idx);
        } else {
            part.arena.get_mut(idx).state.insert(ItemState::DELETED);
            part.delete_queue.push(DeferredDelete {
                index: idx,
                ready_at: now + self.inner.config.delete_lock_window_secs.max(exptime as u64),
            });
        }
        Ok(())
    }

    // ---- facade: arithmetic ------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn arithmetic(
        &self,
        key: &[u8],
        incr: bool,
        delta: u64,
        initial: u64,
        create: bool,
        exptime: u32,
    ) -> EngineResult<u64> {
        self.validate_key(key)?;
        let hash = fnv1a32(key);
        let pidx = self.partition_index(hash);
        let mut part = self.inner.partitions[pidx].lock();
        let now = self.now();

        let existing = {
            let slab = self.inner.slab.lock();
            part.find(&slab, key, hash)
        };
        let existing = existing.filter(|&idx| {
            let item = part.arena.get(idx);
            !(item.is_expired_at(now)
                || self.is_flushed(item.last_access_time, now)
                || item.is_deleted())
        });

        match existing {
            None => {
                if !create {
                    return Err(EngineError::KeyNotFound);
                }
                let value = initial.to_string();
                let req = StoreReq {
                    key,
                    value: value.as_bytes(),
                    flags: 0,
                    exptime,
                    cas: 0,
                };
                self.link_new(pidx, &mut part, &req, now)?;
                Ok(initial)
            }
            Some(idx) => {
                let (flags, exptime, old_value) = {
                    let item = part.arena.get(idx);
                    let slab = self.inner.slab.lock();
                    let bytes = slab.bytes(item.slab_class_id, item.chunk_id);
                    let value = bytes[item.key_len as usize
                        ..item.key_len as usize + item.value_len as usize]
                        .to_vec();
                    (item.flags, item.expiration, value)
                };
                let current: u64 = std::str::from_utf8(&old_value)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or(EngineError::InvalidArgument("value is not a decimal number"))?;
                let new_value = if incr {
                    current.wrapping_add(delta)
                } else {
                    current.saturating_sub(delta)
                };
                self.unlink(&mut part, idx);
                let value_str = new_value.to_string();
                let req = StoreReq {
                    key,
                    value: value_str.as_bytes(),
                    flags,
                    exptime,
                    cas: 0,
                };
                self.link_new(pidx, &mut part, &req, now)?;
                Ok(new_value)
            }
        }
    }

    // ---- facade: flush ----------------------------------------------

    pub fn flush(&self, when: u32) {
        let now = self.now();
        let effective_at = now + when as u64;
        // Bias the watermark one second below the effective instant so a key
        // linked in the same second the flush becomes effective is treated
        // as "after" rather than "at or before" it and survives, matching
        // the immediate-flush convention of comparing against `now - 1`.
        self.inner
            .oldest_live_value
            .store(effective_at.saturating_sub(1), Ordering::Relaxed);
        self.inner
            .oldest_live_effective_at
            .store(effective_at, Ordering::Relaxed);
        debug!(when, "flush scheduled");
    }

    // ---- facade: stats -----------------------------------------------

    pub fn get_stats(&self) -> Snapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    pub fn num_partitions(&self) -> usize {
        self.inner.partitions.len()
    }

    pub fn partition_item_count(&self, idx: usize) -> usize {
        self.inner.partitions[idx].lock().item_count()
    }

    // ---- maintenance task ----------------------------------------------------

    fn spawn_maintenance(&self) {
        let shutdown = Arc::clone(&self.shutdown);
        let inner = Arc::clone(&self.inner);
        let interval = Duration::from_secs(inner.config.maintenance_interval_secs.max(1));

        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*shutdown;
            loop {
                let mut guard = lock.lock();
                if *guard {
                    return;
                }
                let woken_early = !cvar.wait_for(&mut guard, interval).timed_out();
                if *guard {
                    return;
                }
                drop(guard);
                if woken_early {
                    // Notified without a shutdown request: nothing to do yet.
                    continue;
                }

                let now = inner.start.elapsed().as_secs();
                for part_lock in &inner.partitions {
                    let mut part = part_lock.lock();
                    part.migrate_buckets(inner.config.hash_bulk_move);
                    let mut slab = inner.slab.lock();
                    let reclaimed = part.reap_deferred(now, &mut slab);
                    for class_id in reclaimed {
                        Stats::sub(&inner.stats.current_items, 1);
                        Stats::sub(&inner.stats.current_bytes, slab.chunk_size(class_id) as u64);
                    }
                }
            }
        });
        *self.maintenance.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        {
            let (lock, cvar) = &*self.shutdown;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.maintenance.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(max_bytes: u64) -> Engine {
        let cfg = EngineConfig::default()
            .with_max_bytes(max_bytes)
            .with_num_partitions(4);
        Engine::new(cfg)
    }

    fn set(e: &Engine, key: &[u8], value: &[u8]) -> u64 {
        e.store(
            StoreOp::Set,
            StoreReq {
                key,
                value,
                flags: 0,
                exptime: 0,
                cas: 0,
            },
        )
        .unwrap()
    }

    #[test]
    fn basic_set_get() {
        let e = engine(1 << 20);
        let cas = e
            .store(
                StoreOp::Set,
                StoreReq {
                    key: b"foo",
                    value: b"bar",
                    flags: 7,
                    exptime: 0,
                    cas: 0,
                },
            )
            .unwrap();
        let info = e.get(b"foo").unwrap();
        assert_eq!(info.value, b"bar");
        assert_eq!(info.flags, 7);
        assert_eq!(info.cas, cas);
    }

    #[test]
    fn cas_collision() {
        let e = engine(1 << 20);
        let c1 = set(&e, b"k", b"v1");
        let c2 = e
            .store(
                StoreOp::Cas,
                StoreReq {
                    key: b"k",
                    value: b"v2",
                    flags: 0,
                    exptime: 0,
                    cas: c1,
                },
            )
            .unwrap();
        assert!(c2 > c1);
        let err = e.store(
            StoreOp::Cas,
            StoreReq {
                key: b"k",
                value: b"v3",
                flags: 0,
                exptime: 0,
                cas: c1,
            },
        );
        assert_eq!(err, Err(EngineError::KeyExists));
    }

    #[test]
    fn add_uniqueness() {
        let e = engine(1 << 20);
        e.store(
            StoreOp::Add,
            StoreReq {
                key: b"k",
                value: b"a",
                flags: 0,
                exptime: 0,
                cas: 0,
            },
        )
        .unwrap();
        let err = e.store(
            StoreOp::Add,
            StoreReq {
                key: b"k",
                value: b"b",
                flags: 0,
                exptime: 0,
                cas: 0,
            },
        );
        assert_eq!(err, Err(EngineError::KeyExists));
        assert_eq!(e.get(b"k").unwrap().value, b"a");
    }

    #[test]
    fn incr_create_and_decr_clamp() {
        let e = engine(1 << 20);
        let v = e.arithmetic(b"n", true, 5, 10, true, 0).unwrap();
        assert_eq!(v, 10);
        let v = e.arithmetic(b"n", true, 5, 10, true, 0).unwrap();
        assert_eq!(v, 15);
        let v = e.arithmetic(b"n", false, 100, 0, false, 0).unwrap();
        assert_eq!(v, 0);
    }

    #[test]
    fn delete_then_get_not_found() {
        let e = engine(1 << 20);
        set(&e, b"k", b"v");
        e.remove(b"k", 0, 0).unwrap();
        assert_eq!(e.get(b"k"), Err(EngineError::KeyNotFound));
    }

    #[test]
    fn append_and_prepend_concat_raw_bytes() {
        let e = engine(1 << 20);
        set(&e, b"k", b"mid");
        e.store(
            StoreOp::Append,
            StoreReq {
                key: b"k",
                value: b"-end",
                flags: 0,
                exptime: 0,
                cas: 0,
            },
        )
        .unwrap();
        assert_eq!(e.get(b"k").unwrap().value, b"mid-end");
        e.store(
            StoreOp::Prepend,
            StoreReq {
                key: b"k",
                value: b"start-",
                flags: 0,
                exptime: 0,
                cas: 0,
            },
        )
        .unwrap();
        assert_eq!(e.get(b"k").unwrap().value, b"start-mid-end");
    }

    #[test]
    fn replace_requires_existing() {
        let e = engine(1 << 20);
        let err = e.store(
            StoreOp::Replace,
            StoreReq {
                key: b"missing",
                value: b"v",
                flags: 0,
                exptime: 0,
                cas: 0,
            },
        );
        assert_eq!(err, Err(EngineError::NotStored));
    }

    #[test]
    fn eviction_under_pressure_bounds_memory() {
        let e = engine(4 * 1024 * 1024);
        for i in 0..8192 {
            let key = format!("key-{i}");
            let value = vec![b'x'; 1024];
            let _ = e.store(
                StoreOp::Set,
                StoreReq {
                    key: key.as_bytes(),
                    value: &value,
                    flags: 0,
                    exptime: 0,
                    cas: 0,
                },
            );
        }
        let snap = e.get_stats();
        assert!(snap.current_items < 8192, "eviction should bound item count below what was inserted");
        assert!(snap.total_evictions > 0);
        assert_eq!(e.get(b"key-0"), Err(EngineError::KeyNotFound));
    }

    #[test]
    fn boundary_key_and_value_sizes() {
        let e = engine(8 << 20);
        let err = e.store(
            StoreOp::Set,
            StoreReq {
                key: b"",
                value: b"v",
                flags: 0,
                exptime: 0,
                cas: 0,
            },
        );
        assert_eq!(err, Err(EngineError::InvalidArgument("empty key")));

        let key_250 = vec![b'k'; 250];
        e.store(
            StoreOp::Set,
            StoreReq {
                key: &key_250,
                value: b"v",
                flags: 0,
                exptime: 0,
                cas: 0,
            },
        )
        .unwrap();

        let key_251 = vec![b'k'; 251];
        let err = e.store(
            StoreOp::Set,
            StoreReq {
                key: &key_251,
                value: b"v",
                flags: 0,
                exptime: 0,
                cas: 0,
            },
        );
        assert!(matches!(err, Err(EngineError::TooLarge { .. })));
    }

    #[test]
    fn incr_on_non_numeric_is_invalid() {
        let e = engine(1 << 20);
        set(&e, b"k", b"not-a-number");
        let err = e.arithmetic(b"k", true, 1, 0, false, 0);
        assert_eq!(
            err,
            Err(EngineError::InvalidArgument("value is not a decimal number"))
        );
    }

    #[test]
    fn flush_zero_hides_existing_keys_immediately() {
        let e = engine(1 << 20);
        set(&e, b"k", b"v");
        e.flush(0);
        assert_eq!(e.get(b"k"), Err(EngineError::KeyNotFound));
    }
}
