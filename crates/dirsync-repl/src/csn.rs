//! Change sequence numbers: the logical clock stamped on every replicated write.
//!
//! A CSN orders logically by `(timestamp, seqnum, replica_id)`. Its wire form
//! is `replica_id(2) || timestamp(8) || seqnum(4)` big-endian, and byte-wise
//! comparison of that form is a different order (replica first). The two are
//! kept apart: [`Ord`] on [`Csn`] is the logical order, [`CsnWireKey`] is the
//! byte order used for keyed storage.

use crate::error::{ReplError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Identifier of a replica inside a replication topology.
pub type ReplicaId = u16;

/// A change sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Csn {
    timestamp: i64,
    seqnum: u32,
    replica_id: ReplicaId,
}

impl Csn {
    /// Encoded size of the wire form in bytes.
    pub const WIRE_LEN: usize = 14;

    /// Length of the textual (hex) form.
    pub const STRING_LEN: usize = 28;

    /// Create a CSN.
    pub const fn new(timestamp: i64, seqnum: u32, replica_id: ReplicaId) -> Self {
        Self {
            timestamp,
            seqnum,
            replica_id,
        }
    }

    /// Milliseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Sequence number within the millisecond.
    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    /// Replica that issued this CSN.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// True if `self` happened before `other`.
    pub fn is_older_than(&self, other: &Csn) -> bool {
        self < other
    }

    /// True if `self` happened after `other`.
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }

    /// True if `self` is older than or equal to `other`.
    pub fn is_older_than_or_equal(&self, other: &Csn) -> bool {
        self <= other
    }

    /// True if `self` is newer than or equal to `other`.
    pub fn is_newer_than_or_equal(&self, other: &Csn) -> bool {
        self >= other
    }

    /// Like [`Csn::is_older_than`], with an absent CSN older than everything.
    pub fn is_older_than_opt(&self, other: Option<&Csn>) -> bool {
        other.is_some_and(|o| self < o)
    }

    /// Like [`Csn::is_newer_than`], with an absent CSN older than everything.
    pub fn is_newer_than_opt(&self, other: Option<&Csn>) -> bool {
        other.map_or(true, |o| self > o)
    }

    /// Like [`Csn::is_newer_than_or_equal`], with an absent CSN older than everything.
    pub fn is_newer_than_or_equal_opt(&self, other: Option<&Csn>) -> bool {
        other.map_or(true, |o| self >= o)
    }

    /// Encode into the 14-byte wire form.
    pub fn to_wire_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u16(self.replica_id);
        buf.put_i64(self.timestamp);
        buf.put_u32(self.seqnum);
        let mut out = [0u8; Self::WIRE_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode from the 14-byte wire form.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::WIRE_LEN {
            return Err(ReplError::InvalidCsn {
                msg: format!("expected {} bytes, got {}", Self::WIRE_LEN, bytes.len()),
            });
        }
        let mut buf = bytes;
        let replica_id = buf.get_u16();
        let timestamp = buf.get_i64();
        let seqnum = buf.get_u32();
        Ok(Self::new(timestamp, seqnum, replica_id))
    }

    /// Key that orders CSNs by their wire bytes.
    pub fn wire_key(&self) -> CsnWireKey {
        CsnWireKey(self.to_wire_bytes())
    }

    /// Compare two CSNs by their wire bytes rather than logically.
    pub fn cmp_wire(&self, other: &Csn) -> Ordering {
        self.wire_key().cmp(&other.wire_key())
    }
}

impl Ord for Csn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.seqnum.cmp(&other.seqnum))
            .then(self.replica_id.cmp(&other.replica_id))
    }
}

impl PartialOrd for Csn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.timestamp as u64, self.replica_id, self.seqnum
        )
    }
}

impl fmt::Debug for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Csn({}.{}@{})",
            self.timestamp, self.seqnum, self.replica_id
        )
    }
}

impl FromStr for Csn {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != Self::STRING_LEN || !s.is_ascii() {
            return Err(ReplError::InvalidCsn {
                msg: format!("expected {} hex digits, got {s:?}", Self::STRING_LEN),
            });
        }
        let bad = |_| ReplError::InvalidCsn {
            msg: format!("not a hex CSN: {s:?}"),
        };
        let timestamp = u64::from_str_radix(&s[0..16], 16).map_err(bad)? as i64;
        let replica_id = u16::from_str_radix(&s[16..20], 16).map_err(bad)?;
        let seqnum = u32::from_str_radix(&s[20..28], 16).map_err(bad)?;
        Ok(Self::new(timestamp, seqnum, replica_id))
    }
}

/// Byte-wise ordering key over the wire form of a CSN.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CsnWireKey([u8; Csn::WIRE_LEN]);

impl CsnWireKey {
    /// The raw wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode back into a CSN.
    pub fn csn(&self) -> Csn {
        let mut buf = &self.0[..];
        let replica_id = buf.get_u16();
        let timestamp = buf.get_i64();
        let seqnum = buf.get_u32();
        Csn::new(timestamp, seqnum, replica_id)
    }
}

impl From<Csn> for CsnWireKey {
    fn from(csn: Csn) -> Self {
        csn.wire_key()
    }
}
