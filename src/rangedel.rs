//! Range tombstones and their fragmentation.
//!
//! A tombstone `[start, end) @ seq` deletes every user key in the range at
//! sequence numbers <= seq. Tombstones written at different times overlap
//! arbitrarily; readers need them rewritten into fragments with disjoint
//! ranges so that a single forward scan can resolve visibility. Fragmentation
//! splits the input at every distinct start and end coordinate and emits one
//! tombstone per (fragment, seq) covering it, ordered ascending by start and
//! then descending by seq.

use std::cmp::Ordering;
use std::fmt::Display;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{compare_keys, Comparer, InternalKey};

/// A range deletion: `start` carries the sequence number and kind, the
/// exclusive end key is the value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tombstone {
    pub start: InternalKey,
    pub end: Vec<u8>,
}

impl Tombstone {
    pub fn new(start: InternalKey, end: impl Into<Vec<u8>>) -> Self {
        Self { start, end: end.into() }
    }

    pub fn seq(&self) -> u64 {
        self.start.seq()
    }

    /// Whether this tombstone deletes `key` as observed at `seq`.
    pub fn deletes<C: Comparer>(&self, cmp: &C, key: &[u8], seq: u64) -> bool {
        seq <= self.seq()
            && cmp.cmp(&self.start.user_key, key) != Ordering::Greater
            && cmp.cmp(key, &self.end) == Ordering::Less
    }
}

impl Display for Tombstone {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.start, String::from_utf8_lossy(&self.end))
    }
}

/// Rewrites a stream of tombstones into disjoint fragments.
///
/// Input must arrive ascending by start user key; tombstones sharing a start
/// may arrive in any sequence order. The fragmenter buffers the tombstones
/// covering the current start coordinate and flushes completed fragments to
/// `emit`, one same-start group per call, newest first within the group.
pub struct Fragmenter<C: Comparer, F: FnMut(Vec<Tombstone>)> {
    cmp: C,
    emit: F,
    // All buffered tombstones share the same start user key.
    pending: Vec<Tombstone>,
    finished: bool,
}

impl<C: Comparer, F: FnMut(Vec<Tombstone>)> Fragmenter<C, F> {
    pub fn new(cmp: C, emit: F) -> Self {
        Self { cmp, emit, pending: Vec::new(), finished: false }
    }

    pub fn add(&mut self, start: InternalKey, end: impl Into<Vec<u8>>) -> Result<()> {
        let end = end.into();
        if self.finished {
            return Err(Error::KeyOrder(
                "tombstone added after fragmenter finished".to_string(),
            ));
        }
        // An empty range deletes nothing.
        if self.cmp.cmp(&start.user_key, &end) != Ordering::Less {
            return Ok(());
        }
        if let Some(first) = self.pending.first() {
            match self.cmp.cmp(&first.start.user_key, &start.user_key) {
                Ordering::Greater => {
                    return Err(Error::KeyOrder(format!(
                        "tombstone starts must be ascending: {} then {}",
                        first.start, start
                    )));
                }
                Ordering::Equal => {
                    self.pending.push(Tombstone::new(start, end));
                    return Ok(());
                }
                Ordering::Less => {
                    // The buffered range ends at the new start; flush the
                    // prefix it no longer shares with the new tombstone.
                    let split = start.user_key.clone();
                    self.flush_to(Some(&split));
                }
            }
        }
        self.pending.push(Tombstone::new(start, end));
        Ok(())
    }

    /// Flushes all remaining fragments. The fragmenter accepts no further
    /// input afterwards.
    pub fn finish(&mut self) {
        self.finished = true;
        self.flush_to(None);
    }

    // Emits fragments covering [pending start, upto), or everything when no
    // limit is given. Remaining tombstones are rebased onto the split point.
    fn flush_to(&mut self, upto: Option<&[u8]>) {
        while let Some(first) = self.pending.first() {
            let start = first.start.user_key.clone();
            if let Some(limit) = upto {
                if self.cmp.cmp(&start, limit) != Ordering::Less {
                    return;
                }
            }
            let min_end = self
                .pending
                .iter()
                .map(|t| t.end.clone())
                .min_by(|a, b| self.cmp.cmp(a, b))
                .expect("pending is non-empty");
            let split = match upto {
                Some(limit) if self.cmp.cmp(limit, &min_end) == Ordering::Less => {
                    limit.to_vec()
                }
                _ => min_end,
            };

            // One fragment per covering tombstone, newest first.
            let mut group: Vec<Tombstone> = self
                .pending
                .iter()
                .map(|t| Tombstone::new(t.start.clone(), split.clone()))
                .collect();
            group.sort_by(|a, b| b.start.trailer.cmp(&a.start.trailer));
            (self.emit)(group);

            let rebased = std::mem::take(&mut self.pending)
                .into_iter()
                .filter(|t| self.cmp.cmp(&t.end, &split) == Ordering::Greater)
                .map(|t| {
                    Tombstone::new(
                        InternalKey { user_key: split.clone(), trailer: t.start.trailer },
                        t.end,
                    )
                })
                .collect();
            self.pending = rebased;
        }
    }
}

/// Fragments `tombstones` in one call. Input must be ascending by start user
/// key, which is the order a range-del skiplist scan produces.
pub fn fragment<C: Comparer>(
    cmp: &C,
    tombstones: impl IntoIterator<Item = Tombstone>,
) -> Result<Vec<Tombstone>> {
    let mut out = Vec::new();
    let mut fragmenter = Fragmenter::new(cmp.clone(), |group| out.extend(group));
    for t in tombstones {
        fragmenter.add(t.start, t.end)?;
    }
    fragmenter.finish();
    drop(fragmenter);
    Ok(out)
}

/// Collects tombstones that are already fragmented, as required when building
/// a table. Unlike [`Fragmenter`], overlapping input is rejected rather than
/// split.
pub struct Builder<C: Comparer> {
    cmp: C,
    tombstones: Vec<Tombstone>,
}

impl<C: Comparer> Builder<C> {
    pub fn new(cmp: C) -> Self {
        Self { cmp, tombstones: Vec::new() }
    }

    pub fn add(&mut self, start: InternalKey, end: impl Into<Vec<u8>>) -> Result<()> {
        let end = end.into();
        if let Some(last) = self.tombstones.last() {
            if compare_keys(&self.cmp, &last.start, &start) != Ordering::Less {
                return Err(Error::KeyOrder(format!(
                    "tombstone keys must be strictly ascending: {} then {}",
                    last.start, start
                )));
            }
            if self.cmp.equal(&last.start.user_key, &start.user_key) {
                // Same fragment at an older sequence number; the ranges must
                // coincide exactly.
                if !self.cmp.equal(&last.end, &end) {
                    return Err(Error::OverlappingTombstones);
                }
            } else if self.cmp.cmp(&start.user_key, &last.end) == Ordering::Less {
                return Err(Error::OverlappingTombstones);
            }
        }
        self.tombstones.push(Tombstone::new(start, end));
        Ok(())
    }

    pub fn finish(self) -> Vec<Tombstone> {
        self.tombstones
    }
}

/// An iterator over an immutable fragmented tombstone sequence. The entry key
/// is the fragment's start key and the value is its exclusive end key.
pub struct FragmentIter<C: Comparer> {
    cmp: C,
    tombstones: Arc<Vec<Tombstone>>,
    // -1 before the first entry, len() after the last.
    index: isize,
}

impl<C: Comparer> FragmentIter<C> {
    pub fn new(cmp: C, tombstones: Arc<Vec<Tombstone>>) -> Self {
        Self { cmp, tombstones, index: -1 }
    }

    fn at(&self) -> Option<&Tombstone> {
        if self.index < 0 {
            return None;
        }
        self.tombstones.get(self.index as usize)
    }
}

impl<C: Comparer> InternalIterator for FragmentIter<C> {
    fn seek_ge(&mut self, key: &[u8]) -> bool {
        self.index = self
            .tombstones
            .partition_point(|t| self.cmp.cmp(&t.start.user_key, key) == Ordering::Less)
            as isize;
        self.valid()
    }

    fn seek_lt(&mut self, key: &[u8]) -> bool {
        self.index = self
            .tombstones
            .partition_point(|t| self.cmp.cmp(&t.start.user_key, key) == Ordering::Less)
            as isize
            - 1;
        self.valid()
    }

    fn first(&mut self) -> bool {
        self.index = 0;
        self.valid()
    }

    fn last(&mut self) -> bool {
        self.index = self.tombstones.len() as isize - 1;
        self.valid()
    }

    fn next(&mut self) -> bool {
        if self.index >= self.tombstones.len() as isize {
            return false;
        }
        self.index += 1;
        self.valid()
    }

    fn prev(&mut self) -> bool {
        if self.index < 0 {
            return false;
        }
        self.index -= 1;
        self.valid()
    }

    fn key(&self) -> Option<&InternalKey> {
        self.at().map(|t| &t.start)
    }

    fn value(&self) -> Option<&[u8]> {
        self.at().map(|t| t.end.as_slice())
    }

    fn valid(&self) -> bool {
        self.index >= 0 && (self.index as usize) < self.tombstones.len()
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;
    use crate::key::{BytewiseComparer, Kind};

    fn rangedel(start: &str, seq: u64, end: &str) -> Tombstone {
        Tombstone::new(
            InternalKey::new(start.as_bytes(), seq, Kind::RangeDelete),
            end.as_bytes(),
        )
    }

    fn render(tombstones: &[Tombstone]) -> String {
        tombstones.iter().map(|t| t.to_string()).join(" ")
    }

    #[test]
    fn test_fragment_disjoint_is_identity() {
        let input = vec![rangedel("a", 3, "c"), rangedel("d", 1, "e")];
        let out = fragment(&BytewiseComparer, input.clone()).expect("fragment");
        assert_eq!(out, input);
    }

    #[test]
    fn test_fragment_fragmented_is_identity() {
        // Same-start fragments at different seqs stay untouched.
        let input = vec![
            rangedel("a", 3, "f"),
            rangedel("f", 3, "j"),
            rangedel("f", 2, "j"),
            rangedel("j", 1, "m"),
        ];
        let out = fragment(&BytewiseComparer, input.clone()).expect("fragment");
        assert_eq!(out, input);
    }

    #[test]
    fn test_fragment_overlapping() {
        let input = vec![
            rangedel("a", 3, "m"),
            rangedel("f", 2, "s"),
            rangedel("j", 1, "z"),
        ];
        let out = fragment(&BytewiseComparer, input).expect("fragment");
        assert_eq!(
            render(&out),
            "a#3,15:f f#3,15:j f#2,15:j j#3,15:m j#2,15:m j#1,15:m \
             m#2,15:s m#1,15:s s#1,15:z"
        );
    }

    #[test]
    fn test_fragment_nested() {
        // An inner range fully contained in an outer one.
        let input = vec![rangedel("a", 1, "z"), rangedel("j", 9, "m")];
        let out = fragment(&BytewiseComparer, input).expect("fragment");
        assert_eq!(render(&out), "a#1,15:j j#9,15:m j#1,15:m m#1,15:z");
    }

    #[test]
    fn test_fragment_empty_range_ignored() {
        let input = vec![rangedel("c", 1, "c"), rangedel("d", 1, "e")];
        let out = fragment(&BytewiseComparer, input).expect("fragment");
        assert_eq!(render(&out), "d#1,15:e");
    }

    #[test]
    fn test_fragment_out_of_order() {
        let input = vec![rangedel("m", 1, "z"), rangedel("a", 2, "c")];
        assert!(matches!(
            fragment(&BytewiseComparer, input),
            Err(Error::KeyOrder(_))
        ));
    }

    #[test]
    fn test_builder_accepts_fragmented() {
        let mut builder = Builder::new(BytewiseComparer);
        for t in [
            rangedel("a", 3, "f"),
            rangedel("f", 3, "j"),
            rangedel("f", 2, "j"),
            rangedel("s", 1, "z"),
        ] {
            builder.add(t.start, t.end).expect("add");
        }
        assert_eq!(builder.finish().len(), 4);
    }

    #[test]
    fn test_builder_rejects_overlap() {
        let mut builder = Builder::new(BytewiseComparer);
        builder.add(rangedel("a", 3, "m").start, "m").expect("add");
        assert_eq!(
            builder.add(rangedel("f", 2, "s").start, "s"),
            Err(Error::OverlappingTombstones)
        );
    }

    #[test]
    fn test_builder_rejects_same_start_different_end() {
        let mut builder = Builder::new(BytewiseComparer);
        builder.add(rangedel("f", 3, "j").start, "j").expect("add");
        assert_eq!(
            builder.add(rangedel("f", 2, "k").start, "k"),
            Err(Error::OverlappingTombstones)
        );
    }

    #[test]
    fn test_builder_rejects_unsorted() {
        let mut builder = Builder::new(BytewiseComparer);
        builder.add(rangedel("f", 2, "j").start, "j").expect("add");
        // At the same start, a higher seq sorts earlier and must come first.
        assert!(matches!(
            builder.add(rangedel("f", 3, "j").start, "j"),
            Err(Error::KeyOrder(_))
        ));
    }

    #[test]
    fn test_deletes() {
        let cmp = BytewiseComparer;
        let t = rangedel("d", 4, "g");
        assert!(t.deletes(&cmp, b"d", 4));
        assert!(t.deletes(&cmp, b"f", 0));
        assert!(!t.deletes(&cmp, b"g", 4), "end is exclusive");
        assert!(!t.deletes(&cmp, b"e", 5), "newer writes survive");
        assert!(!t.deletes(&cmp, b"c", 0));
    }

    #[test]
    fn test_fragment_iter() {
        let frags = Arc::new(vec![
            rangedel("a", 3, "f"),
            rangedel("f", 3, "j"),
            rangedel("f", 2, "j"),
        ]);
        let mut iter = FragmentIter::new(BytewiseComparer, frags);
        assert!(!iter.valid());
        assert!(iter.first());
        assert_eq!(iter.key().expect("key").to_string(), "a#3,15");
        assert_eq!(iter.value(), Some(b"f".as_slice()));
        assert!(iter.seek_ge(b"f"));
        assert_eq!(iter.key().expect("key").seq(), 3);
        assert!(iter.next());
        assert_eq!(iter.key().expect("key").seq(), 2);
        assert!(!iter.next());
        assert!(iter.prev());
        assert!(iter.seek_lt(b"f"));
        assert_eq!(iter.key().expect("key").to_string(), "a#3,15");
        assert!(iter.last());
        assert_eq!(iter.key().expect("key").seq(), 2);
    }
}
