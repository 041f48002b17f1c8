//! The ordered map underneath a memtable: a lock-free skiplist keyed by
//! internal key, with every insert charged against the shared [`Arena`].
//!
//! `crossbeam_skiplist::SkipMap` provides the concurrent skiplist. Multiple
//! threads may insert and read simultaneously; readers never block writers.
//! Entries are never removed, so memory use only grows until the whole
//! memtable is dropped.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;

use super::arena::Arena;
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{compare_keys, Comparer, InternalKey};

/// A skiplist key: the internal key plus the comparer that orders it.
#[derive(Debug)]
pub(crate) struct MapKey<C: Comparer> {
    cmp: C,
    pub(crate) key: InternalKey,
}

impl<C: Comparer> PartialEq for MapKey<C> {
    fn eq(&self, other: &Self) -> bool {
        compare_keys(&self.cmp, &self.key, &other.key) == Ordering::Equal
    }
}

impl<C: Comparer> Eq for MapKey<C> {}

impl<C: Comparer> PartialOrd for MapKey<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Ord::cmp(self, other))
    }
}

impl<C: Comparer> Ord for MapKey<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.cmp, &self.key, &other.key)
    }
}

/// An arena-bounded concurrent map ordered by internal key.
pub struct ArenaMap<C: Comparer> {
    cmp: C,
    arena: Arc<Arena>,
    map: SkipMap<MapKey<C>, Vec<u8>>,
}

impl<C: Comparer> std::fmt::Debug for ArenaMap<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaMap")
            .field("entries", &self.map.len())
            .finish()
    }
}

impl<C: Comparer> ArenaMap<C> {
    pub fn new(cmp: C, arena: Arc<Arena>) -> Self {
        Self { cmp, arena, map: SkipMap::new() }
    }

    pub fn comparer(&self) -> &C {
        &self.cmp
    }

    fn map_key(&self, key: InternalKey) -> MapKey<C> {
        MapKey { cmp: self.cmp.clone(), key }
    }

    fn charge_and_insert(&self, key: MapKey<C>, value: Vec<u8>) -> Result<()> {
        self.arena
            .alloc(Arena::node_size(key.key.user_key.len(), value.len()))?;
        self.map.insert(key, value);
        Ok(())
    }

    /// Inserts an entry, failing with [`Error::RecordExists`] if the internal
    /// key is already present and [`Error::ArenaFull`] if the arena budget is
    /// exhausted.
    pub fn add(&self, key: InternalKey, value: Vec<u8>) -> Result<()> {
        let key = self.map_key(key);
        if self.map.contains_key(&key) {
            return Err(Error::RecordExists);
        }
        self.charge_and_insert(key, value)
    }

    // Insert without the duplicate lookup. Callers guarantee the key is new.
    pub(crate) fn add_assume_new(&self, key: InternalKey, value: Vec<u8>) -> Result<()> {
        let key = self.map_key(key);
        self.charge_and_insert(key, value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// An unpositioned cursor over the map.
    pub fn iter(&self) -> MapIter<'_, C> {
        MapIter { map: self, pos: Pos::BeforeFirst }
    }
}

/// Serializes one writer's inserts and skips the duplicate check while the
/// input stays in ascending key order, which is the common case for batch
/// application.
#[derive(Default)]
pub struct Inserter {
    last: Option<InternalKey>,
}

impl Inserter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<C: Comparer>(
        &mut self,
        map: &ArenaMap<C>,
        key: InternalKey,
        value: Vec<u8>,
    ) -> Result<()> {
        let ascending = match &self.last {
            Some(last) => compare_keys(map.comparer(), last, &key) == Ordering::Less,
            None => false,
        };
        let inserted = key.clone();
        if ascending {
            map.add_assume_new(key, value)?;
        } else {
            map.add(key, value)?;
        }
        self.last = Some(inserted);
        Ok(())
    }
}

enum Pos<'a, C: Comparer> {
    BeforeFirst,
    At(Entry<'a, MapKey<C>, Vec<u8>>),
    AfterLast,
}

/// A cursor over an [`ArenaMap`]. Starts unpositioned; stepping off either
/// end parks the cursor there so the opposite step re-enters the map.
pub struct MapIter<'a, C: Comparer> {
    map: &'a ArenaMap<C>,
    pos: Pos<'a, C>,
}

impl<'a, C: Comparer> MapIter<'a, C> {
    fn settle(&mut self, entry: Option<Entry<'a, MapKey<C>, Vec<u8>>>, off_end: Pos<'a, C>) -> bool {
        match entry {
            Some(entry) => {
                self.pos = Pos::At(entry);
                true
            }
            None => {
                self.pos = off_end;
                false
            }
        }
    }
}

impl<C: Comparer> InternalIterator for MapIter<'_, C> {
    fn seek_ge(&mut self, key: &[u8]) -> bool {
        let search = self.map.map_key(InternalKey::search_key(key));
        let entry = self.map.map.lower_bound(Bound::Included(&search));
        self.settle(entry, Pos::AfterLast)
    }

    fn seek_lt(&mut self, key: &[u8]) -> bool {
        let search = self.map.map_key(InternalKey::search_key(key));
        let entry = self.map.map.upper_bound(Bound::Excluded(&search));
        self.settle(entry, Pos::BeforeFirst)
    }

    fn first(&mut self) -> bool {
        let entry = self.map.map.front();
        self.settle(entry, Pos::AfterLast)
    }

    fn last(&mut self) -> bool {
        let entry = self.map.map.back();
        self.settle(entry, Pos::BeforeFirst)
    }

    fn next(&mut self) -> bool {
        let entry = match &self.pos {
            Pos::BeforeFirst => self.map.map.front(),
            Pos::At(entry) => entry.next(),
            Pos::AfterLast => return false,
        };
        self.settle(entry, Pos::AfterLast)
    }

    fn prev(&mut self) -> bool {
        let entry = match &self.pos {
            Pos::BeforeFirst => return false,
            Pos::At(entry) => entry.prev(),
            Pos::AfterLast => self.map.map.back(),
        };
        self.settle(entry, Pos::BeforeFirst)
    }

    fn key(&self) -> Option<&InternalKey> {
        match &self.pos {
            Pos::At(entry) => Some(&entry.key().key),
            _ => None,
        }
    }

    fn value(&self) -> Option<&[u8]> {
        match &self.pos {
            Pos::At(entry) => Some(entry.value().as_slice()),
            _ => None,
        }
    }

    fn valid(&self) -> bool {
        matches!(self.pos, Pos::At(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparer, Kind};

    fn new_map() -> ArenaMap<BytewiseComparer> {
        ArenaMap::new(BytewiseComparer, Arc::new(Arena::new(1 << 20)))
    }

    fn set(key: &str, seq: u64) -> InternalKey {
        InternalKey::new(key.as_bytes(), seq, Kind::Set)
    }

    #[test]
    fn test_add_and_scan() {
        let map = new_map();
        map.add(set("b", 1), b"2".to_vec()).expect("add");
        map.add(set("a", 1), b"1".to_vec()).expect("add");
        map.add(set("c", 1), b"3".to_vec()).expect("add");

        let mut iter = map.iter();
        let mut got = Vec::new();
        let mut valid = iter.first();
        while valid {
            got.push(iter.key().expect("key").text());
            valid = iter.next();
        }
        assert_eq!(got, vec!["a.SET.1", "b.SET.1", "c.SET.1"]);
        assert!(!iter.valid());
        // Stepping back from past-the-end lands on the last entry.
        assert!(iter.prev());
        assert_eq!(iter.key().expect("key").text(), "c.SET.1");
    }

    #[test]
    fn test_duplicate_add_fails() {
        let map = new_map();
        map.add(set("a", 1), b"x".to_vec()).expect("add");
        assert_eq!(map.add(set("a", 1), b"y".to_vec()), Err(Error::RecordExists));
        // A different trailer is a different internal key.
        map.add(set("a", 2), b"y".to_vec()).expect("add");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_newest_version_first() {
        let map = new_map();
        map.add(set("a", 1), b"old".to_vec()).expect("add");
        map.add(set("a", 3), b"new".to_vec()).expect("add");
        map.add(InternalKey::new(b"a".to_vec(), 2, Kind::Delete), Vec::new())
            .expect("add");

        let mut iter = map.iter();
        assert!(iter.seek_ge(b"a"));
        assert_eq!(iter.key().expect("key").seq(), 3);
        assert_eq!(iter.value(), Some(b"new".as_slice()));
        assert!(iter.next());
        assert_eq!(iter.key().expect("key").seq(), 2);
    }

    #[test]
    fn test_seek_lt() {
        let map = new_map();
        for key in ["a", "c", "e"] {
            map.add(set(key, 1), Vec::new()).expect("add");
        }
        let mut iter = map.iter();
        assert!(iter.seek_lt(b"d"));
        assert_eq!(iter.key().expect("key").text(), "c.SET.1");
        // Seeking below the first key invalidates, and next() recovers from
        // the front.
        assert!(!iter.seek_lt(b"a"));
        assert!(iter.next());
        assert_eq!(iter.key().expect("key").text(), "a.SET.1");
    }

    #[test]
    fn test_arena_exhaustion() {
        let map = ArenaMap::new(BytewiseComparer, Arc::new(Arena::new(256)));
        map.add(set("a", 1), vec![0; 64]).expect("add");
        assert_eq!(map.add(set("b", 1), vec![0; 64]), Err(Error::ArenaFull));
    }

    #[test]
    fn test_inserter_ascending() {
        let map = new_map();
        let mut ins = Inserter::new();
        for i in 0..100u64 {
            let key = format!("key{i:04}");
            ins.add(&map, set(&key, i), Vec::new()).expect("add");
        }
        assert_eq!(map.len(), 100);
        // Out-of-order inserts fall back to the checked path.
        let mut ins = Inserter::new();
        ins.add(&map, set("zzz", 1), Vec::new()).expect("add");
        assert_eq!(
            ins.add(&map, set("key0000", 0), Vec::new()),
            Err(Error::RecordExists)
        );
    }
}
