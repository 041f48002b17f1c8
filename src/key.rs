//! Internal keys pair a user key with a packed (sequence number, kind)
//! trailer. The trailer orders multiple versions of the same user key so that
//! newer writes sort first, which lets readers stop at the first match during
//! a seek.

use std::cmp::Ordering;
use std::fmt::Display;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::errdata;

/// The maximum representable sequence number (56 bits).
pub const SEQ_NUM_MAX: u64 = (1 << 56) - 1;

/// Number of bytes the trailer occupies in the wire form.
pub const TRAILER_SIZE: usize = 8;

/// The trailer used as the exclusive upper bound of a range tombstone. It
/// sorts before any real key with the same user key.
pub const RANGE_DELETE_SENTINEL: u64 = (SEQ_NUM_MAX << 8) | Kind::RangeDelete as u64;

/// The kind of an internal key. Values are compatibility-critical with the
/// on-disk table format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Delete = 0,
    Set = 1,
    Merge = 2,
    RangeDelete = 15,
}

impl Kind {
    pub fn from_u8(b: u8) -> Result<Kind> {
        match b {
            0 => Ok(Kind::Delete),
            1 => Ok(Kind::Set),
            2 => Ok(Kind::Merge),
            15 => Ok(Kind::RangeDelete),
            _ => Err(errdata!("unknown internal key kind {b}")),
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Kind::Delete => "DEL",
            Kind::Set => "SET",
            Kind::Merge => "MERGE",
            Kind::RangeDelete => "RANGEDEL",
        };
        write!(f, "{name}")
    }
}

/// A total order over user keys. Implementations must be cheap to clone; the
/// comparer is embedded in every skiplist key.
pub trait Comparer: Clone + Send + Sync + 'static {
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) == Ordering::Equal
    }
}

/// Orders user keys lexicographically by their bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BytewiseComparer;

impl Comparer for BytewiseComparer {
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

/// A user key paired with a (sequence number, kind) trailer.
///
/// Internal keys order ascending by user key and then descending by trailer,
/// so the newest version of a user key is encountered first when scanning
/// forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub trailer: u64,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, seq: u64, kind: Kind) -> Self {
        Self {
            user_key: user_key.into(),
            trailer: (seq << 8) | kind as u64,
        }
    }

    /// The exclusive upper bound marker of a range tombstone ending at
    /// `user_key`.
    pub fn range_delete_sentinel(user_key: impl Into<Vec<u8>>) -> Self {
        Self {
            user_key: user_key.into(),
            trailer: RANGE_DELETE_SENTINEL,
        }
    }

    /// The smallest internal key for `user_key`, used to position a seek at
    /// the newest version of that key.
    pub fn search_key(user_key: impl Into<Vec<u8>>) -> Self {
        Self::new(user_key, SEQ_NUM_MAX, Kind::Delete)
    }

    pub fn seq(&self) -> u64 {
        self.trailer >> 8
    }

    pub fn kind(&self) -> Kind {
        // The low trailer byte is only ever written from a Kind.
        Kind::from_u8((self.trailer & 0xff) as u8).expect("valid kind in trailer")
    }

    /// Encodes to the wire form `user_key || trailer`, trailer little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.user_key.len() + TRAILER_SIZE);
        buf.extend_from_slice(&self.user_key);
        let mut trailer = [0u8; TRAILER_SIZE];
        LittleEndian::write_u64(&mut trailer, self.trailer);
        buf.extend_from_slice(&trailer);
        buf
    }

    /// Decodes the wire form produced by [`InternalKey::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TRAILER_SIZE {
            return Err(errdata!("internal key too short: {} bytes", buf.len()));
        }
        let split = buf.len() - TRAILER_SIZE;
        let trailer = LittleEndian::read_u64(&buf[split..]);
        Kind::from_u8((trailer & 0xff) as u8)?;
        Ok(Self { user_key: buf[..split].to_vec(), trailer })
    }

    /// Parses the text form `<user_key>.<KIND>.<seq>`, e.g. `a.SET.1`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(3, '.');
        let seq = parts.next();
        let kind = parts.next();
        let user_key = parts.next();
        let (Some(seq), Some(kind), Some(user_key)) = (seq, kind, user_key) else {
            return Err(errdata!("malformed internal key {s:?}"));
        };
        let kind = match kind {
            "DEL" => Kind::Delete,
            "SET" => Kind::Set,
            "MERGE" => Kind::Merge,
            "RANGEDEL" => Kind::RangeDelete,
            _ => return Err(errdata!("unknown internal key kind {kind:?}")),
        };
        let seq: u64 = seq
            .parse()
            .map_err(|_| errdata!("malformed sequence number {seq:?}"))?;
        if seq > SEQ_NUM_MAX {
            return Err(errdata!("sequence number {seq} out of range"));
        }
        Ok(Self::new(user_key.as_bytes(), seq, kind))
    }

    /// Prints the text form parsed by [`InternalKey::parse`].
    pub fn text(&self) -> String {
        format!(
            "{}.{}.{}",
            String::from_utf8_lossy(&self.user_key),
            self.kind(),
            self.seq()
        )
    }
}

impl Display for InternalKey {
    /// Prints `<user_key>#<seq>,<kind>` with the trailer fields in decimal.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}#{},{}",
            String::from_utf8_lossy(&self.user_key),
            self.seq(),
            self.trailer & 0xff
        )
    }
}

/// Compares two internal keys: ascending by user key under `cmp`, then
/// descending by trailer.
pub fn compare_keys<C: Comparer>(cmp: &C, a: &InternalKey, b: &InternalKey) -> Ordering {
    match cmp.cmp(&a.user_key, &b.user_key) {
        Ordering::Equal => b.trailer.cmp(&a.trailer),
        ord => ord,
    }
}
