//! File metadata for one level of the tree, and a merged iterator over it.
//!
//! Levels below the first hold files with disjoint key ranges, so the level
//! can be read as one logical sorted run: position in the right file, iterate
//! it, and hop to the neighbor when it is exhausted.
//!
//! The one wrinkle is range deletion tombstones. When a tombstone is the
//! smallest or largest key of a file, a consumer merging this level with
//! others must not advance past the file while the tombstone can still
//! shadow keys from other levels. The level iterator therefore materializes
//! such a boundary key as a synthetic entry with no value, holding the
//! merging iterator in place until the boundary is no longer the minimal (or
//! maximal) pending key.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::io::{Cursor, Read};
use std::rc::Rc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use itertools::Itertools;

use crate::config::ReadOptions;
use crate::errdata;
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{compare_keys, Comparer, InternalKey, Kind, RANGE_DELETE_SENTINEL};

/// Metadata describing one immutable sorted table.
#[derive(Clone, Debug, PartialEq)]
pub struct FileMetadata {
    pub file_num: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

impl FileMetadata {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.file_num).unwrap();
        for key in [&self.smallest, &self.largest] {
            let encoded = key.encode();
            buf.write_u32::<BigEndian>(encoded.len() as u32).unwrap();
            buf.extend_from_slice(&encoded);
        }
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let file_num = cursor.read_u64::<BigEndian>()?;
        let smallest = Self::decode_key(cursor)?;
        let largest = Self::decode_key(cursor)?;
        Ok(FileMetadata { file_num, smallest, largest })
    }

    fn decode_key(cursor: &mut Cursor<&[u8]>) -> Result<InternalKey> {
        let len = cursor.read_u32::<BigEndian>()? as usize;
        let mut encoded = vec![0u8; len];
        cursor.read_exact(&mut encoded)?;
        InternalKey::decode(&encoded)
    }
}

/// The files of one level, sorted by smallest key and non-overlapping.
#[derive(Clone, Debug, Default)]
pub struct Level {
    pub level_num: u32,
    pub files: Vec<FileMetadata>,
}

impl Level {
    pub fn new(level_num: u32, files: Vec<FileMetadata>) -> Self {
        Self { level_num, files }
    }

    /// Validates the level invariant: files sorted by smallest key, and
    /// consecutive files disjoint. Adjacent files may share a user key only
    /// across a range deletion sentinel boundary.
    pub fn check_ordering<C: Comparer>(&self, cmp: &C) -> Result<()> {
        for (a, b) in self.files.iter().tuple_windows() {
            if compare_keys(cmp, &a.smallest, &b.smallest) != Ordering::Less {
                return Err(errdata!(
                    "level {}: files out of order: {} then {}",
                    self.level_num, a.smallest, b.smallest
                ));
            }
            match cmp.cmp(&a.largest.user_key, &b.smallest.user_key) {
                Ordering::Greater => {
                    return Err(errdata!(
                        "level {}: file {} overlaps file {}",
                        self.level_num, a.file_num, b.file_num
                    ));
                }
                Ordering::Equal => {
                    if a.largest.trailer != RANGE_DELETE_SENTINEL
                        && b.smallest.trailer != RANGE_DELETE_SENTINEL
                    {
                        return Err(errdata!(
                            "level {}: files {} and {} share boundary key {}",
                            self.level_num,
                            a.file_num,
                            b.file_num,
                            b.smallest
                        ));
                    }
                }
                Ordering::Less => {}
            }
        }
        Ok(())
    }
}

pub type BoxedIterator<'a> = Box<dyn InternalIterator + 'a>;

/// A slot the level iterator fills with the current file's range deletion
/// iterator, so the enclosing merging iterator can apply tombstones without
/// holding them past the file.
pub type RangeDelSlot<'a> = Rc<RefCell<Option<BoxedIterator<'a>>>>;

/// Opens the point and range deletion iterators of a table. Either may be
/// absent.
pub type NewIters<'a> = Box<
    dyn FnMut(&FileMetadata, &ReadOptions) -> Result<(Option<BoxedIterator<'a>>, Option<BoxedIterator<'a>>)>
        + 'a,
>;

/// A merged view over the tables of one level.
///
/// At most one file iterator is open at a time. Exactly one of the open
/// iterator and the materialized boundary key is present whenever the level
/// iterator is positioned on a valid entry.
pub struct LevelIter<'a, C: Comparer> {
    opts: ReadOptions,
    cmp: C,
    index: isize,
    // The key returned when paused at a file boundary that is a range
    // deletion tombstone. Set only while `iter` is None.
    boundary: Option<InternalKey>,
    iter: Option<BoxedIterator<'a>>,
    new_iters: NewIters<'a>,
    range_del: Option<RangeDelSlot<'a>>,
    files: &'a [FileMetadata],
    err: Option<Error>,
}

impl<'a, C: Comparer> LevelIter<'a, C> {
    pub fn new(
        opts: ReadOptions,
        cmp: C,
        new_iters: NewIters<'a>,
        files: &'a [FileMetadata],
    ) -> Self {
        Self {
            opts,
            cmp,
            index: -1,
            boundary: None,
            iter: None,
            new_iters,
            range_del: None,
            files,
            err: None,
        }
    }

    /// Installs the out-parameter slot for the current file's range deletion
    /// iterator.
    pub fn init_range_del(&mut self, slot: RangeDelSlot<'a>) {
        self.range_del = Some(slot);
    }

    // The first file whose largest key is past `key`. A file whose largest
    // key equals `key` at the range deletion sentinel cannot contain `key`
    // and must not be loaded just to search for it; point lookups composed
    // over this iterator rely on that.
    fn find_file_ge(&self, key: &[u8]) -> isize {
        self.files.partition_point(|f| {
            match self.cmp.cmp(&f.largest.user_key, key) {
                Ordering::Less => true,
                Ordering::Equal => f.largest.trailer == RANGE_DELETE_SENTINEL,
                Ordering::Greater => false,
            }
        }) as isize
    }

    // The last file whose smallest user key is < `key`.
    fn find_file_lt(&self, key: &[u8]) -> isize {
        let index = self
            .files
            .partition_point(|f| self.cmp.cmp(&f.smallest.user_key, key) == Ordering::Less);
        index as isize - 1
    }

    fn clear_range_del_slot(&mut self) {
        if let Some(slot) = &self.range_del {
            *slot.borrow_mut() = None;
        }
    }

    // Positions on the file at `index`, walking in direction `dir` past
    // files excluded by the bounds. A file cut off by a bound in the
    // direction opposite to `dir` ends the walk; nothing further can match.
    fn load_file(&mut self, index: isize, dir: isize) -> bool {
        self.boundary = None;
        if self.index == index {
            return self.iter.is_some();
        }
        if let Some(mut iter) = self.iter.take() {
            if let Err(err) = iter.close() {
                self.err = Some(err);
                return false;
            }
        }
        self.clear_range_del_slot();

        let mut index = index;
        loop {
            self.index = index;
            if index < 0 || index >= self.files.len() as isize {
                return false;
            }

            let f = &self.files[index as usize];
            if let Some(lower) = self.opts.lower_bound() {
                if self.cmp.cmp(&f.largest.user_key, lower) == Ordering::Less {
                    // The entire file is below the lower bound.
                    if dir < 0 {
                        return false;
                    }
                    index += dir;
                    continue;
                }
            }
            if let Some(upper) = self.opts.upper_bound() {
                if self.cmp.cmp(&f.smallest.user_key, upper) != Ordering::Less {
                    // The entire file is at or above the upper bound.
                    if dir > 0 {
                        return false;
                    }
                    index += dir;
                    continue;
                }
            }

            match (self.new_iters)(f, &self.opts) {
                Err(err) => {
                    tracing::warn!(file_num = f.file_num, %err, "failed to open table");
                    self.err = Some(err);
                    return false;
                }
                Ok((point, range_del)) => {
                    let Some(point) = point else {
                        return false;
                    };
                    self.iter = Some(point);
                    if let Some(slot) = &self.range_del {
                        *slot.borrow_mut() = range_del;
                    }
                    return true;
                }
            }
        }
    }

    // Advances over files whose point iterator has nothing (left) to return.
    // When the current file's boundary key in the direction of travel is a
    // range deletion tombstone and a range-del slot is installed, the
    // boundary is surfaced as a synthetic entry instead.
    fn skip_empty_file_forward(&mut self) -> bool {
        loop {
            if let Some(mut iter) = self.iter.take() {
                if let Err(err) = iter.close() {
                    self.err = Some(err);
                    return false;
                }
            }

            if self.range_del.is_some() {
                let f = &self.files[self.index as usize];
                if f.largest.kind() == Kind::RangeDelete {
                    self.boundary = Some(f.largest.clone());
                    return true;
                }
                self.clear_range_del_slot();
            }

            if !self.load_file(self.index + 1, 1) {
                return false;
            }
            if let Some(iter) = self.iter.as_mut() {
                if iter.first() {
                    return true;
                }
            }
        }
    }

    fn skip_empty_file_backward(&mut self) -> bool {
        loop {
            if let Some(mut iter) = self.iter.take() {
                if let Err(err) = iter.close() {
                    self.err = Some(err);
                    return false;
                }
            }

            if self.range_del.is_some() {
                let f = &self.files[self.index as usize];
                if f.smallest.kind() == Kind::RangeDelete {
                    self.boundary = Some(f.smallest.clone());
                    return true;
                }
                self.clear_range_del_slot();
            }

            if !self.load_file(self.index - 1, -1) {
                return false;
            }
            if let Some(iter) = self.iter.as_mut() {
                if iter.last() {
                    return true;
                }
            }
        }
    }
}

impl<C: Comparer> InternalIterator for LevelIter<'_, C> {
    fn seek_ge(&mut self, key: &[u8]) -> bool {
        if !self.load_file(self.find_file_ge(key), 1) {
            return false;
        }
        if let Some(iter) = self.iter.as_mut() {
            if iter.seek_ge(key) {
                return true;
            }
        }
        self.skip_empty_file_forward()
    }

    fn seek_lt(&mut self, key: &[u8]) -> bool {
        if !self.load_file(self.find_file_lt(key), -1) {
            return false;
        }
        if let Some(iter) = self.iter.as_mut() {
            if iter.seek_lt(key) {
                return true;
            }
        }
        self.skip_empty_file_backward()
    }

    fn first(&mut self) -> bool {
        if !self.load_file(0, 1) {
            return false;
        }
        if let Some(iter) = self.iter.as_mut() {
            if iter.first() {
                return true;
            }
        }
        self.skip_empty_file_forward()
    }

    fn last(&mut self) -> bool {
        if !self.load_file(self.files.len() as isize - 1, -1) {
            return false;
        }
        if let Some(iter) = self.iter.as_mut() {
            if iter.last() {
                return true;
            }
        }
        self.skip_empty_file_backward()
    }

    fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        if self.iter.is_none() {
            if self.boundary.is_some() {
                // Leaving a materialized boundary resumes at the next file.
                if self.load_file(self.index + 1, 1) {
                    if let Some(iter) = self.iter.as_mut() {
                        if iter.first() {
                            return true;
                        }
                    }
                    return self.skip_empty_file_forward();
                }
                return false;
            }
            if self.index == -1 && self.load_file(0, 1) {
                // The iterator was positioned off the beginning of the level.
                if let Some(iter) = self.iter.as_mut() {
                    if iter.first() {
                        return true;
                    }
                }
                return self.skip_empty_file_forward();
            }
            return false;
        }

        if let Some(iter) = self.iter.as_mut() {
            if iter.next() {
                return true;
            }
        }
        self.skip_empty_file_forward()
    }

    fn prev(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        if self.iter.is_none() {
            if self.boundary.is_some() {
                if self.load_file(self.index - 1, -1) {
                    if let Some(iter) = self.iter.as_mut() {
                        if iter.last() {
                            return true;
                        }
                    }
                    return self.skip_empty_file_backward();
                }
                return false;
            }
            let n = self.files.len() as isize;
            if self.index == n && self.load_file(n - 1, -1) {
                // The iterator was positioned off the end of the level.
                if let Some(iter) = self.iter.as_mut() {
                    if iter.last() {
                        return true;
                    }
                }
                return self.skip_empty_file_backward();
            }
            return false;
        }

        if let Some(iter) = self.iter.as_mut() {
            if iter.prev() {
                return true;
            }
        }
        self.skip_empty_file_backward()
    }

    fn key(&self) -> Option<&InternalKey> {
        match &self.iter {
            Some(iter) => iter.key(),
            None => self.boundary.as_ref(),
        }
    }

    fn value(&self) -> Option<&[u8]> {
        self.iter.as_ref().and_then(|iter| iter.value())
    }

    fn valid(&self) -> bool {
        match &self.iter {
            Some(iter) => iter.valid(),
            None => self.boundary.is_some(),
        }
    }

    fn error(&self) -> Option<Error> {
        if self.err.is_some() || self.iter.is_none() {
            return self.err.clone();
        }
        self.iter.as_ref().and_then(|iter| iter.error())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut iter) = self.iter.take() {
            if let Err(err) = iter.close() {
                if self.err.is_none() {
                    self.err = Some(err);
                }
            }
        }
        if let Some(slot) = &self.range_del {
            if let Some(mut range_del) = slot.borrow_mut().take() {
                if let Err(err) = range_del.close() {
                    if self.err.is_none() {
                        self.err = Some(err);
                    }
                }
            }
        }
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
