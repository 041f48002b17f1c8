//! An ordered collection of writes applied to a memtable as a unit.
//!
//! The batch records the worst-case memtable footprint of its entries as they
//! are added, so `prepare` can reserve arena capacity without re-walking the
//! batch.

use crate::key::Kind;
use crate::memtable::Arena;

#[derive(Debug, Clone)]
struct BatchEntry {
    kind: Kind,
    key: Vec<u8>,
    value: Vec<u8>,
}

/// A write batch. Entries are applied in insertion order, each consuming one
/// sequence number.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    memtable_size: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: Kind, key: Vec<u8>, value: Vec<u8>) {
        self.memtable_size += Arena::node_footprint(key.len(), value.len());
        self.entries.push(BatchEntry { kind, key, value });
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.push(Kind::Set, key.into(), value.into());
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.push(Kind::Delete, key.into(), Vec::new());
    }

    pub fn merge(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.push(Kind::Merge, key.into(), value.into());
    }

    /// Deletes all user keys in `[start, end)`. The end key is carried as the
    /// entry value.
    pub fn delete_range(&mut self, start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) {
        self.push(Kind::RangeDelete, start.into(), end.into());
    }

    pub fn count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Worst-case bytes the batch consumes in a memtable arena.
    pub fn memtable_size(&self) -> usize {
        self.memtable_size
    }

    /// Iterates entries as `(kind, user_key, value)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Kind, &[u8], &[u8])> {
        self.entries
            .iter()
            .map(|e| (e.kind, e.key.as_slice(), e.value.as_slice()))
    }
}
