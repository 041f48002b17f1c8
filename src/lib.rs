//! EmberDB: the in-memory core of an LSM-tree storage engine.
//!
//! This crate implements the two hottest pieces of the engine read and write
//! paths:
//!
//! - The **memtable**, a write buffer backed by lock-free skiplists over a
//!   fixed arena budget. Writers reserve capacity up front and then apply
//!   batches concurrently with readers; arena exhaustion is the signal to
//!   rotate the memtable out for flushing.
//! - The **level iterator**, which presents the sorted, non-overlapping
//!   tables of one level as a single bidirectional stream, pausing at table
//!   boundaries backed by range deletion tombstones so an enclosing merging
//!   iterator observes a consistent order.
//!
//! ```text
//!            writes                       reads
//!              │                            │
//!              ▼                            ▼
//!      ┌───────────────┐           ┌─────────────────┐
//!      │ Batch         │           │ merging iterator│ (above this crate)
//!      └──────┬────────┘           └───────┬─────────┘
//!             │ prepare/apply              │
//!             ▼                            ▼
//!      ┌───────────────┐           ┌─────────────────┐
//!      │ Memtable      │           │ LevelIter per   │
//!      │  point keys   │           │ level of tables │
//!      │  range dels   │           └─────────────────┘
//!      └───────────────┘
//! ```
//!
//! Durability is out of scope here: the memtable is volatile, and table
//! contents are reached through caller-provided open callbacks.

pub mod batch;
pub mod config;
pub mod error;
pub mod iterator;
pub mod key;
pub mod level;
pub mod memtable;
pub mod rangedel;

pub use batch::Batch;
pub use config::{Config, ReadOptions};
pub use error::{Error, Result};
pub use iterator::InternalIterator;
pub use key::{BytewiseComparer, Comparer, InternalKey, Kind};
pub use level::{FileMetadata, Level, LevelIter};
pub use memtable::Memtable;
pub use rangedel::{Fragmenter, Tombstone};
