use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The memtable arena cannot fit the requested reservation. The caller is
    /// expected to rotate in a fresh memtable and retry.
    ArenaFull,
    /// Invalid data, typically decoding errors, corruption, or unexpected
    /// internal values.
    InvalidData(String),
    /// An IO error, surfaced through table-opening callbacks.
    IO(String),
    /// Keys were presented out of order to a build path that requires sorted
    /// input.
    KeyOrder(String),
    /// The key does not exist, or is shadowed by a deletion.
    NotFound,
    /// Raw tombstone input overlaps a previously added tombstone.
    OverlappingTombstones,
    /// An entry with the same internal key already exists.
    RecordExists,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ArenaFull => write!(f, "memtable arena full"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::KeyOrder(msg) => write!(f, "key order violation: {msg}"),
            Error::NotFound => write!(f, "key not found"),
            Error::OverlappingTombstones => {
                write!(f, "overlapping tombstones must be fragmented")
            }
            Error::RecordExists => write!(f, "record already exists"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
