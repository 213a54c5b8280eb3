//! # dsrepl-types: Core value types for the directory-server replication core
//!
//! This crate contains the value types shared by the CSN pending list, the
//! replica update vector, and the incremental replication session state
//! machine:
//! - Change sequence numbers ([`Csn`]) and the replica identifiers they
//!   carry ([`Rid`])
//! - Replica generations ([`ReplicaGeneration`]), used to detect that two
//!   replicas have diverged and require reinitialization
//! - Partial URLs ([`Purl`]) identifying an origin replica, and the hex
//!   last-modified timestamps ([`LastModified`]) recorded per origin
//! - The replica's role ([`ReplicaType`])
//!
//! None of these types perform I/O or hold locks; they are plain values
//! shared between `dsrepl-core`'s pending list, RUV, and protocol state
//! machine.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Rid - Copy (2-byte replica identifier)
// ============================================================================

/// Identifies the replica that originated a [`Csn`].
///
/// `Rid::READ_ONLY` (`0xFFFF`) is the sentinel used by read-only replicas,
/// which never originate writes and therefore never appear as the `rid` of
/// a CSN they generated themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid(u16);

impl Rid {
    /// Sentinel meaning "read-only / no origin".
    pub const READ_ONLY: Rid = Rid(0xFFFF);

    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// True iff this is the read-only sentinel.
    pub fn is_read_only(self) -> bool {
        self == Self::READ_ONLY
    }
}

impl Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Rid {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Rid> for u16 {
    fn from(rid: Rid) -> Self {
        rid.0
    }
}

// ============================================================================
// Csn - Copy (12-byte total-ordered change sequence number)
// ============================================================================

/// Change Sequence Number: a totally ordered identifier assigned to every
/// accepted write.
///
/// Field declaration order is significant: `#[derive(PartialOrd, Ord)]`
/// compares fields lexicographically in declaration order, which is exactly
/// the `(timestamp, seq, rid, subseq)` ordering the replication protocol
/// requires. Do not reorder these fields.
///
/// CSNs are immutable once created; a [`Rid`] of [`Rid::READ_ONLY`] marks
/// "no origin" (read-only replica).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Csn {
    timestamp: u32,
    seq: u16,
    rid: Rid,
    subseq: u32,
}

/// Number of hex digits in the canonical string form: 8 (timestamp) + 4
/// (seq) + 4 (rid) + 4 (subseq, low 16 bits).
pub const CSN_STRING_LEN: usize = 20;

impl Csn {
    pub fn new(timestamp: u32, seq: u16, rid: Rid, subseq: u32) -> Self {
        Self {
            timestamp,
            seq,
            rid,
            subseq,
        }
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn subseq(&self) -> u32 {
        self.subseq
    }

    /// Returns the CSN with `seq` incremented, or `None` on overflow (the
    /// caller advances the virtual timestamp by one second and resets `seq`
    /// to 0 instead).
    pub fn next_seq(&self) -> Option<Csn> {
        self.seq.checked_add(1).map(|seq| Csn { seq, ..*self })
    }
}

impl Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}{:04x}{:04x}{:04x}",
            self.timestamp,
            self.seq,
            self.rid.as_u16(),
            (self.subseq & 0xFFFF) as u16,
        )
    }
}

impl FromStr for Csn {
    type Err = ParseCsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CSN_STRING_LEN {
            return Err(ParseCsnError::WrongLength(s.len()));
        }
        let parse_field = |range: std::ops::Range<usize>| -> Result<u32, ParseCsnError> {
            u32::from_str_radix(&s[range.clone()], 16)
                .map_err(|_| ParseCsnError::NotHex(s[range].to_string()))
        };
        let timestamp = parse_field(0..8)?;
        let seq = parse_field(8..12)? as u16;
        let rid = parse_field(12..16)? as u16;
        let subseq = parse_field(16..20)?;
        Ok(Csn::new(timestamp, seq, Rid::new(rid), subseq))
    }
}

/// Error parsing a CSN's canonical string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseCsnError {
    /// The string was not exactly [`CSN_STRING_LEN`] characters.
    WrongLength(usize),
    /// A field did not contain valid hex digits.
    NotHex(String),
}

impl Display for ParseCsnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength(len) => {
                write!(f, "CSN string must be {CSN_STRING_LEN} hex digits, got {len}")
            }
            Self::NotHex(field) => write!(f, "CSN field is not valid hex: {field:?}"),
        }
    }
}

impl std::error::Error for ParseCsnError {}

// ============================================================================
// ReplicaGeneration - opaque, CSN-shaped identifier
// ============================================================================

/// Stamped at replica creation; two RUVs with differing generations are
/// incompatible and imply reinitialization.
///
/// Compared only for equality — the generation has no meaningful ordering,
/// it is a one-shot fingerprint of "which dataset this replica was seeded
/// from".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaGeneration(String);

impl ReplicaGeneration {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh generation stamped from a CSN-shaped value, as the
    /// source does at replica creation (it reuses the CSN generator to mint
    /// the generation string).
    pub fn from_csn(csn: Csn) -> Self {
        Self(csn.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ReplicaGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReplicaGeneration {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Purl - partial URL identifying an origin replica
// ============================================================================

/// Partial URL: scheme + host + port identifying an origin replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Purl(String);

impl Purl {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Purl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Purl {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Purl {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// LastModified - Copy (hex wall-clock seconds)
// ============================================================================

/// Wall-clock seconds since Unix epoch, recorded per RUV element and
/// rendered as a hex string in the on-wire RUV format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LastModified(u32);

impl LastModified {
    pub fn new(secs: u32) -> Self {
        Self(secs)
    }

    pub fn as_secs(self) -> u32 {
        self.0
    }
}

impl Display for LastModified {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for LastModified {
    type Err = ParseCsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s, 16)
            .map(LastModified)
            .map_err(|_| ParseCsnError::NotHex(s.to_string()))
    }
}

// ============================================================================
// ReplicaType - Copy (replica role, mirrors nsDS5ReplicaType wire values)
// ============================================================================

/// The role a replica plays in the topology.
///
/// Discriminants match the persisted `nsDS5ReplicaType` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaType {
    /// Single-master primary; accepts writes, never supplies to anyone else.
    Primary = 1,
    /// Multi-master participant; accepts writes and replicates both ways.
    ReadWrite = 2,
    /// Consumer-only; never originates writes, `repl_id` is always
    /// [`Rid::READ_ONLY`].
    ReadOnly = 3,
}

impl ReplicaType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Primary),
            2 => Some(Self::ReadWrite),
            3 => Some(Self::ReadOnly),
            _ => None,
        }
    }

    /// True iff this role accepts locally-originated writes.
    pub fn accepts_writes(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

impl Display for ReplicaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::ReadWrite => write!(f, "read-write"),
            Self::ReadOnly => write!(f, "read-only"),
        }
    }
}
