//! The in-memory write buffer at the head of the LSM tree.
//!
//! A memtable holds two lock-free skiplists over one shared arena budget: one
//! for point entries and one for range tombstones. Writes follow a two-phase
//! protocol. `prepare` reserves worst-case arena capacity and takes a
//! reference, which lets many writers queue without blocking each other;
//! `apply` then streams the batch into the skiplists and may run concurrently
//! with other applies and with readers.
//!
//! # Lifecycle
//!
//! A memtable is created with one reference held by its owner. Every
//! prepared batch holds another until it is applied and released. When the
//! count reaches zero the memtable is immutable in practice and the flush
//! signal fires; the flusher then persists it and drops it, which is the only
//! point memory is reclaimed.
//!
//! # Range tombstones
//!
//! Tombstones are kept unfragmented in their own skiplist. Readers need the
//! fragmented form, which is expensive to build, so the memtable caches the
//! fragmented sequence behind a counter and rebuilds it lazily after each
//! tombstone write invalidates it.

mod arena;
mod map;

pub use arena::Arena;
pub use map::{ArenaMap, Inserter, MapIter};

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::batch::Batch;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{BytewiseComparer, Comparer, InternalKey, Kind};
use crate::rangedel::{self, FragmentIter, Tombstone};

/// A level-triggered signal, set exactly once when a memtable's reference
/// count drops to zero.
#[derive(Debug, Default)]
pub struct FlushSignal {
    set: Mutex<bool>,
    ready: Condvar,
}

impl FlushSignal {
    fn notify(&self) {
        let mut set = self.set.lock().unwrap();
        *set = true;
        self.ready.notify_all();
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        let mut set = self.set.lock().unwrap();
        while !*set {
            set = self.ready.wait(set).unwrap();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap()
    }
}

#[derive(Debug, Default)]
struct TombstoneCache {
    /// Number of range tombstones written so far.
    count: AtomicU32,
    /// The fragmented form of the tombstones, rebuilt lazily. None after a
    /// tombstone write invalidates it.
    fragments: Mutex<Option<Arc<Vec<Tombstone>>>>,
}

/// A memory-backed table of internal keys, safe for concurrent reads and
/// writes.
///
/// Memory consumption grows monotonically, even when keys are deleted or
/// overwritten. The owner rotates a full memtable out and flushes it rather
/// than reclaiming space in place.
#[derive(Debug)]
pub struct Memtable<C: Comparer = BytewiseComparer> {
    cmp: C,
    arena: Arc<Arena>,
    points: ArenaMap<C>,
    range_dels: ArenaMap<C>,
    /// Arena usage right after construction; the memtable is empty iff usage
    /// still equals it.
    empty_size: usize,
    /// Bytes promised to prepared but not yet applied batches. Only `prepare`
    /// mutates this, and `prepare` is serialized by the commit pipeline.
    reserved: AtomicUsize,
    refs: AtomicI32,
    flushed: FlushSignal,
    tombstones: TombstoneCache,
}

impl Memtable<BytewiseComparer> {
    /// A memtable over byte-ordered user keys.
    pub fn new(config: &Config) -> Self {
        Self::with_comparer(BytewiseComparer, config.memtable_capacity)
    }
}

impl<C: Comparer> Memtable<C> {
    pub fn with_comparer(cmp: C, capacity: usize) -> Self {
        let arena = Arc::new(Arena::new(capacity));
        let points = ArenaMap::new(cmp.clone(), arena.clone());
        let range_dels = ArenaMap::new(cmp.clone(), arena.clone());
        let empty_size = arena.size();
        Self {
            cmp,
            arena,
            points,
            range_dels,
            empty_size,
            reserved: AtomicUsize::new(0),
            refs: AtomicI32::new(1),
            flushed: FlushSignal::default(),
            tombstones: TombstoneCache::default(),
        }
    }

    /// Reserves arena capacity for `batch` and references the memtable so it
    /// cannot be flushed until the batch is applied and released.
    ///
    /// Not safe to call concurrently with another `prepare`; the commit
    /// pipeline serializes preparers. Safe concurrently with `apply` and
    /// with readers.
    pub fn prepare(&self, batch: &Batch) -> Result<()> {
        if self.refs.load(Ordering::SeqCst) == 1 {
            // No applies are in flight, so the accumulated worst-case
            // reservation can be replaced with the exact arena usage.
            self.reserved.store(self.arena.size(), Ordering::SeqCst);
        }
        let reserved = self.reserved.load(Ordering::SeqCst);
        if batch.memtable_size() > self.arena.capacity() - reserved {
            return Err(Error::ArenaFull);
        }
        self.reserved
            .store(reserved + batch.memtable_size(), Ordering::SeqCst);
        self.retain();
        Ok(())
    }

    /// Streams `batch` into the memtable, assigning the i-th entry the
    /// sequence number `start_seq + i`.
    ///
    /// Safe to call concurrently with other applies. On error the batch may
    /// be partially visible; the caller discards the memtable in that case.
    pub fn apply(&self, batch: &Batch, start_seq: u64) -> Result<()> {
        let mut inserter = Inserter::new();
        let mut seq = start_seq;
        for (kind, user_key, value) in batch.iter() {
            let key = InternalKey::new(user_key, seq, kind);
            seq += 1;
            if kind == Kind::RangeDelete {
                let added = self.range_dels.add(key, value.to_vec());
                // The count goes up before the cache pointer is cleared, so a
                // reader observing a positive count with no cache rebuilds.
                self.tombstones.count.fetch_add(1, Ordering::SeqCst);
                *self.tombstones.fragments.lock().unwrap() = None;
                added?;
            } else {
                inserter.add(&self.points, key, value.to_vec())?;
            }
        }
        if seq != start_seq + u64::from(batch.count()) {
            panic!("emberdb: inconsistent batch count");
        }
        Ok(())
    }

    /// Returns the value of the newest visible version of `key`.
    ///
    /// Merge entries return their raw value; combining them across layers is
    /// the merge operator's job, above this one.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut iter = self.points.iter();
        if !iter.seek_ge(key) {
            return Err(Error::NotFound);
        }
        let Some(found) = iter.key() else {
            return Err(Error::NotFound);
        };
        if !self.cmp.equal(key, &found.user_key) {
            return Err(Error::NotFound);
        }
        if found.kind() == Kind::Delete {
            return Err(Error::NotFound);
        }
        Ok(iter.value().unwrap_or_default().to_vec())
    }

    /// An unpositioned iterator over the point entries.
    pub fn new_iter(&self) -> MapIter<'_, C> {
        self.points.iter()
    }

    /// An iterator over the fragmented range tombstones, or None when the
    /// memtable holds none.
    pub fn new_range_del_iter(&self) -> Option<FragmentIter<C>> {
        if self.tombstones.count.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let cached = self.tombstones.fragments.lock().unwrap().clone();
        let fragments = match cached {
            Some(fragments) => fragments,
            None => self.rebuild_tombstone_cache(),
        };
        Some(FragmentIter::new(self.cmp.clone(), fragments))
    }

    fn rebuild_tombstone_cache(&self) -> Arc<Vec<Tombstone>> {
        let mut collected = Vec::new();
        let mut iter = self.range_dels.iter();
        let mut valid = iter.first();
        while valid {
            if let (Some(key), Some(end)) = (iter.key(), iter.value()) {
                collected.push(Tombstone::new(key.clone(), end));
            }
            valid = iter.next();
        }
        let fragments = Arc::new(
            rangedel::fragment(&self.cmp, collected)
                .expect("skiplist scans tombstones in order"),
        );
        let mut slot = self.tombstones.fragments.lock().unwrap();
        match &*slot {
            // A concurrent rebuild won the race with a longer sequence.
            // Adding tombstones only ever grows the fragment count, so the
            // longer sequence is the newer one.
            Some(existing) if existing.len() > fragments.len() => existing.clone(),
            _ => {
                tracing::debug!(fragments = fragments.len(), "rebuilt tombstone cache");
                *slot = Some(fragments.clone());
                fragments
            }
        }
    }

    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops one reference. The call that lands on zero fires the flush
    /// signal and returns true; dropping below zero is a programming error.
    pub fn release(&self) -> bool {
        let refs = self.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if refs < 0 {
            panic!("emberdb: inconsistent memtable reference count");
        }
        if refs == 0 {
            tracing::debug!("memtable ready for flush");
            self.flushed.notify();
            return true;
        }
        false
    }

    /// Fires once the reference count reaches zero.
    pub fn flushed(&self) -> &FlushSignal {
        &self.flushed
    }

    pub fn ready_for_flush(&self) -> bool {
        self.refs.load(Ordering::SeqCst) == 0
    }

    /// Whether no entry was ever inserted.
    pub fn empty(&self) -> bool {
        self.arena.size() == self.empty_size
    }

    /// Current arena usage in bytes. Monotone non-decreasing.
    pub fn approximate_size(&self) -> usize {
        self.arena.size()
    }

    pub fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl<C: Comparer> Memtable<C> {
    /// Inserts a single entry, bypassing the prepare/apply protocol. Keeps
    /// the tombstone bookkeeping of the batch path.
    pub fn set(&self, key: InternalKey, value: &[u8]) -> Result<()> {
        if key.kind() == Kind::RangeDelete {
            self.range_dels.add(key, value.to_vec())?;
            self.tombstones.count.fetch_add(1, Ordering::SeqCst);
            *self.tombstones.fragments.lock().unwrap() = None;
            return Ok(());
        }
        self.points.add(key, value.to_vec())
    }

    /// The number of point entries, counted by iteration.
    pub fn count(&self) -> usize {
        let mut iter = self.new_iter();
        let mut n = 0;
        let mut valid = iter.first();
        while valid {
            n += 1;
            valid = iter.next();
        }
        n
    }
}
