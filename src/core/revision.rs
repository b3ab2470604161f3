//! Revision numbers and metadata content ids.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Position of a revision within a (TLF, branch) history.
///
/// Strictly positive and dense per branch. Zero is the uninitialized
/// sentinel and never appears in a stored revision.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MetadataRevision(u64);

impl MetadataRevision {
    pub const UNINITIALIZED: MetadataRevision = MetadataRevision(0);
    pub const INITIAL: MetadataRevision = MetadataRevision(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_initialized(self) -> bool {
        self.0 >= Self::INITIAL.0
    }

    pub fn next(self) -> MetadataRevision {
        MetadataRevision(self.0 + 1)
    }
}

impl fmt::Display for MetadataRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const MD_ID_BYTE_LEN: usize = 32;

/// Content hash of a revision's canonical encoding; the chain pointer.
///
/// The all-zero value is the "no previous revision" sentinel carried by
/// initial revisions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MdId([u8; MD_ID_BYTE_LEN]);

impl MdId {
    pub const ZERO: MdId = MdId([0u8; MD_ID_BYTE_LEN]);

    pub fn from_bytes(bytes: [u8; MD_ID_BYTE_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash of a canonical metadata encoding.
    pub fn of_encoded(encoded: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(encoded);
        let out = hasher.finalize();
        let mut buf = [0u8; MD_ID_BYTE_LEN];
        buf.copy_from_slice(&out);
        Self(buf)
    }

    /// Parses the lowercase-hex form produced by `Display`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() != MD_ID_BYTE_LEN * 2 {
            return None;
        }
        let mut buf = [0u8; MD_ID_BYTE_LEN];
        for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
            let pair = [chunk[0] as char, chunk[1] as char];
            let hi = pair[0].to_digit(16)?;
            let lo = pair[1].to_digit(16)?;
            if pair.iter().any(|c| c.is_ascii_uppercase()) {
                return None;
            }
            buf[i] = (hi << 4 | lo) as u8;
        }
        Some(Self(buf))
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; MD_ID_BYTE_LEN] {
        &self.0
    }
}

impl fmt::Display for MdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MdId({self})")
    }
}
