//! Byte accounting for a memtable's fixed allocation budget.
//!
//! Skiplist nodes live on the heap, but every insert charges this accountant
//! first, so a memtable behaves exactly like one backed by a bump allocator
//! of fixed capacity: usage grows monotonically, nothing is ever returned,
//! and exhaustion surfaces as [`Error::ArenaFull`].

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::key::TRAILER_SIZE;

// Cost model for one skiplist node beyond its key and value bytes. The
// header covers the node struct and value metadata; each tower level adds a
// pair of links.
const NODE_HEADER: usize = 48;
const LINK_SIZE: usize = 16;
const MAX_HEIGHT: usize = 20;

/// Tracks bytes allocated against a fixed capacity.
#[derive(Debug)]
pub struct Arena {
    size: AtomicUsize,
    capacity: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        Self { size: AtomicUsize::new(0), capacity }
    }

    /// Bytes allocated so far. Monotone non-decreasing.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Charges `n` bytes, failing with [`Error::ArenaFull`] when the charge
    /// would exceed capacity. Lock-free; concurrent callers race on a CAS.
    pub fn alloc(&self, n: usize) -> Result<()> {
        let mut size = self.size.load(Ordering::Relaxed);
        loop {
            let new_size = size + n;
            if new_size > self.capacity {
                return Err(Error::ArenaFull);
            }
            match self.size.compare_exchange_weak(
                size,
                new_size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => size = observed,
            }
        }
    }

    /// Worst-case bytes an entry can consume: assumes the node draws the
    /// maximum tower height. Reservations made from this estimate always
    /// cover the actual charge taken by the insert.
    pub fn node_footprint(key_len: usize, value_len: usize) -> usize {
        NODE_HEADER + MAX_HEIGHT * LINK_SIZE + key_len + TRAILER_SIZE + value_len
    }

    /// The exact charge taken when an entry is inserted.
    pub fn node_size(key_len: usize, value_len: usize) -> usize {
        NODE_HEADER + LINK_SIZE + key_len + TRAILER_SIZE + value_len
    }
}
