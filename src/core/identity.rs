//! Identity atoms.
//!
//! TlfId: top-level folder identifier with a public/private suffix byte
//! BranchId: branch identifier; the all-zero value is the master branch
//! UserId: opaque user identifier

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidId};

pub const ID_BYTE_LEN: usize = 16;

const TLF_SUFFIX_PRIVATE: u8 = 0x16;
const TLF_SUFFIX_PUBLIC: u8 = 0x17;

fn parse_id_bytes(raw: &str, kind: fn(String, String) -> InvalidId) -> Result<[u8; ID_BYTE_LEN], CoreError> {
    if raw.len() != ID_BYTE_LEN * 2 {
        return Err(kind(raw.to_string(), "wrong length".into()).into());
    }
    let mut buf = [0u8; ID_BYTE_LEN];
    for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
        let hi = hex_val(chunk[0]);
        let lo = hex_val(chunk[1]);
        match (hi, lo) {
            (Some(hi), Some(lo)) => buf[i] = hi << 4 | lo,
            _ => return Err(kind(raw.to_string(), "not lowercase hex".into()).into()),
        }
    }
    Ok(buf)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// Top-level folder identifier.
///
/// Sixteen opaque bytes; the last byte distinguishes public from private
/// folders. Immutable once minted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TlfId([u8; ID_BYTE_LEN]);

impl TlfId {
    pub fn from_bytes(bytes: [u8; ID_BYTE_LEN]) -> Result<Self, CoreError> {
        match bytes[ID_BYTE_LEN - 1] {
            TLF_SUFFIX_PRIVATE | TLF_SUFFIX_PUBLIC => Ok(Self(bytes)),
            suffix => Err(InvalidId::Tlf {
                raw: format!("{suffix:#04x}"),
                reason: "unknown folder suffix byte".into(),
            }
            .into()),
        }
    }

    /// Mint a fresh random id.
    pub fn mint(public: bool) -> Self {
        let mut bytes = [0u8; ID_BYTE_LEN];
        rand::rng().fill_bytes(&mut bytes);
        bytes[ID_BYTE_LEN - 1] = if public {
            TLF_SUFFIX_PUBLIC
        } else {
            TLF_SUFFIX_PRIVATE
        };
        Self(bytes)
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let bytes = parse_id_bytes(raw, |raw, reason| InvalidId::Tlf { raw, reason })?;
        Self::from_bytes(bytes)
    }

    pub fn is_public(&self) -> bool {
        self.0[ID_BYTE_LEN - 1] == TLF_SUFFIX_PUBLIC
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTE_LEN] {
        &self.0
    }
}

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlfId({self})")
    }
}

impl TryFrom<String> for TlfId {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, CoreError> {
        Self::parse(&raw)
    }
}

impl From<TlfId> for String {
    fn from(id: TlfId) -> String {
        id.to_string()
    }
}

/// Branch identifier.
///
/// The all-zero value ([`BranchId::NULL`]) names the master (merged)
/// branch; any other value names an unmerged branch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchId([u8; ID_BYTE_LEN]);

impl BranchId {
    pub const NULL: BranchId = BranchId([0u8; ID_BYTE_LEN]);

    pub fn from_bytes(bytes: [u8; ID_BYTE_LEN]) -> Self {
        Self(bytes)
    }

    /// Mint a fresh random non-null branch id.
    pub fn mint() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; ID_BYTE_LEN];
        loop {
            rng.fill_bytes(&mut bytes);
            if bytes != [0u8; ID_BYTE_LEN] {
                return Self(bytes);
            }
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let bytes = parse_id_bytes(raw, |raw, reason| InvalidId::Branch { raw, reason })?;
        Ok(Self(bytes))
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Merge status implied by this branch id.
    pub fn merge_status(&self) -> MergeStatus {
        if self.is_null() {
            MergeStatus::Merged
        } else {
            MergeStatus::Unmerged
        }
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTE_LEN] {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchId({self})")
    }
}

impl TryFrom<String> for BranchId {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, CoreError> {
        Self::parse(&raw)
    }
}

impl From<BranchId> for String {
    fn from(id: BranchId) -> String {
        id.to_string()
    }
}

/// Opaque user identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId([u8; ID_BYTE_LEN]);

impl UserId {
    pub fn from_bytes(bytes: [u8; ID_BYTE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let bytes = parse_id_bytes(raw, |raw, reason| InvalidId::User { raw, reason })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTE_LEN] {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({self})")
    }
}

impl TryFrom<String> for UserId {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, CoreError> {
        Self::parse(&raw)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> String {
        id.to_string()
    }
}

/// Whether a revision sits on the master branch or an unmerged one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    Unmerged,
}

impl MergeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStatus::Merged => "merged",
            MergeStatus::Unmerged => "unmerged",
        }
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlf_id_suffix_round_trip() {
        let public = TlfId::mint(true);
        assert!(public.is_public());
        let private = TlfId::mint(false);
        assert!(!private.is_public());

        let parsed = TlfId::parse(&public.to_string()).unwrap();
        assert_eq!(parsed, public);
    }

    #[test]
    fn tlf_id_rejects_unknown_suffix() {
        let err = TlfId::from_bytes([0u8; ID_BYTE_LEN]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidId(InvalidId::Tlf { .. })));
    }

    #[test]
    fn null_branch_is_merged() {
        assert!(BranchId::NULL.is_null());
        assert_eq!(BranchId::NULL.merge_status(), MergeStatus::Merged);

        let bid = BranchId::mint();
        assert!(!bid.is_null());
        assert_eq!(bid.merge_status(), MergeStatus::Unmerged);
    }

    #[test]
    fn id_parse_rejects_bad_hex() {
        assert!(BranchId::parse("xyz").is_err());
        assert!(UserId::parse(&"g".repeat(ID_BYTE_LEN * 2)).is_err());
    }
}
