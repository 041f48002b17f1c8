//! The internal iterator surface shared by memtables, fragmented tombstone
//! sequences, and level iterators. Positioning methods return true iff the
//! iterator landed on a valid entry, which keeps merge loops branch-light.

use crate::error::{Error, Result};
use crate::key::InternalKey;

/// A bidirectional cursor over internal keys and values.
///
/// Seeks take a user key; the iterator positions itself relative to the
/// smallest internal key for that user key, so `seek_ge` lands on the newest
/// version. An iterator starts unpositioned and must be positioned with one
/// of `seek_ge`, `seek_lt`, `first` or `last` before `next`/`prev` are
/// meaningful.
pub trait InternalIterator {
    /// Positions at the first entry whose user key is >= `key`.
    fn seek_ge(&mut self, key: &[u8]) -> bool;

    /// Positions at the last entry whose user key is < `key`.
    fn seek_lt(&mut self, key: &[u8]) -> bool;

    fn first(&mut self) -> bool;

    fn last(&mut self) -> bool;

    fn next(&mut self) -> bool;

    fn prev(&mut self) -> bool;

    /// The current internal key, or None when invalid.
    fn key(&self) -> Option<&InternalKey>;

    /// The current value. None when invalid, or when positioned on a
    /// synthetic boundary entry.
    fn value(&self) -> Option<&[u8]>;

    fn valid(&self) -> bool;

    /// The first error the iterator encountered, if any. Once set, further
    /// positioning calls return false without advancing.
    fn error(&self) -> Option<Error> {
        None
    }

    /// Releases underlying resources. Implementations must tolerate repeated
    /// calls.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
