//! Metadata-server error taxonomy.
//!
//! Every kind has a stable integer code that crosses the RPC boundary as a
//! [`ServerStatus`] record; [`unwrap_server_status`] turns a received
//! status back into the typed kind. Unknown codes survive as
//! [`MdServerError::AppStatus`] carrying the full record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ctx::Cancelled;
use crate::core::identity::TlfId;
use crate::core::revision::{MdId, MetadataRevision};

/// Generic server-side failure.
pub const STATUS_CODE_SERVER_ERROR: u32 = 2800;
/// Generic client-side failure.
pub const STATUS_CODE_BAD_REQUEST: u32 = 2801;
/// Revision number conflicts with current history.
pub const STATUS_CODE_CONFLICT_REVISION: u32 = 2802;
/// Previous-root pointer conflicts with current history.
pub const STATUS_CODE_CONFLICT_PREV_ROOT: u32 = 2803;
/// Disk-usage counter conflicts with current history.
pub const STATUS_CODE_CONFLICT_DISK_USAGE: u32 = 2804;
/// The folder truncation lock is held by someone else.
pub const STATUS_CODE_LOCKED: u32 = 2805;
/// Caller may not perform the operation (also used for not-found).
pub const STATUS_CODE_UNAUTHORIZED: u32 = 2806;
/// Caller should back off before retrying.
pub const STATUS_CODE_THROTTLE: u32 = 2807;
/// A conditional write lost a race; treat as a conflict.
pub const STATUS_CODE_CONDITION_FAILED: u32 = 2808;
/// Caller may not write to this folder.
pub const STATUS_CODE_WRITE_ACCESS: u32 = 2809;
/// Handle-to-folder mapping mismatch.
pub const STATUS_CODE_CONFLICT_FOLDER_MAPPING: u32 = 2810;

/// Status record as it crosses the RPC boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub code: u32,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MdServerError {
    #[error("server error: {reason}")]
    Server { reason: String },
    #[error("bad request: {reason}")]
    BadRequest { reason: String },
    #[error("conflict: expected revision {expected}, actual {actual}")]
    ConflictRevision {
        expected: MetadataRevision,
        actual: MetadataRevision,
    },
    #[error("conflict: expected previous root {expected}, actual {actual}")]
    ConflictPrevRoot { expected: MdId, actual: MdId },
    #[error("conflict: expected disk usage {expected}, actual {actual}")]
    ConflictDiskUsage { expected: u64, actual: u64 },
    #[error("folder truncation lock is held")]
    Locked,
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
    #[error("throttled, back off {backoff_ms}ms before retrying")]
    Throttle { backoff_ms: u64 },
    #[error("write condition failed: {reason}")]
    ConditionFailed { reason: String },
    #[error("no write access to folder")]
    WriteAccess,
    #[error("conflict: expected folder id {expected}, actual {actual}")]
    ConflictFolderMapping { expected: TlfId, actual: TlfId },
    /// Local cancellation; never crosses the wire.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    /// A status with a code outside the taxonomy.
    #[error("application status {code} ({name}): {description}")]
    AppStatus {
        code: u32,
        name: String,
        description: String,
        fields: BTreeMap<String, String>,
    },
}

impl MdServerError {
    pub fn code(&self) -> u32 {
        match self {
            MdServerError::Server { .. } | MdServerError::Cancelled(_) => STATUS_CODE_SERVER_ERROR,
            MdServerError::BadRequest { .. } => STATUS_CODE_BAD_REQUEST,
            MdServerError::ConflictRevision { .. } => STATUS_CODE_CONFLICT_REVISION,
            MdServerError::ConflictPrevRoot { .. } => STATUS_CODE_CONFLICT_PREV_ROOT,
            MdServerError::ConflictDiskUsage { .. } => STATUS_CODE_CONFLICT_DISK_USAGE,
            MdServerError::Locked => STATUS_CODE_LOCKED,
            MdServerError::Unauthorized { .. } => STATUS_CODE_UNAUTHORIZED,
            MdServerError::Throttle { .. } => STATUS_CODE_THROTTLE,
            MdServerError::ConditionFailed { .. } => STATUS_CODE_CONDITION_FAILED,
            MdServerError::WriteAccess => STATUS_CODE_WRITE_ACCESS,
            MdServerError::ConflictFolderMapping { .. } => STATUS_CODE_CONFLICT_FOLDER_MAPPING,
            MdServerError::AppStatus { code, .. } => *code,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MdServerError::Server { .. } | MdServerError::Cancelled(_) => "SERVER_ERROR",
            MdServerError::BadRequest { .. } => "BAD_REQUEST",
            MdServerError::ConflictRevision { .. } => "CONFLICT_REVISION",
            MdServerError::ConflictPrevRoot { .. } => "CONFLICT_PREV_ROOT",
            MdServerError::ConflictDiskUsage { .. } => "CONFLICT_DISK_USAGE",
            MdServerError::Locked => "LOCKED",
            MdServerError::Unauthorized { .. } => "UNAUTHORIZED",
            MdServerError::Throttle { .. } => "THROTTLE",
            MdServerError::ConditionFailed { .. } => "CONDITION_FAILED",
            MdServerError::WriteAccess => "WRITE_ACCESS",
            MdServerError::ConflictFolderMapping { .. } => "CONFLICT_FOLDER_MAPPING",
            MdServerError::AppStatus { name, .. } => name,
        }
    }

    /// Exports this error as a wire status record.
    pub fn to_status(&self) -> ServerStatus {
        let mut fields = BTreeMap::new();
        match self {
            MdServerError::ConflictRevision { expected, actual } => {
                fields.insert("expected".to_string(), expected.to_string());
                fields.insert("actual".to_string(), actual.to_string());
            }
            MdServerError::ConflictPrevRoot { expected, actual } => {
                fields.insert("expected".to_string(), expected.to_string());
                fields.insert("actual".to_string(), actual.to_string());
            }
            MdServerError::ConflictDiskUsage { expected, actual } => {
                fields.insert("expected".to_string(), expected.to_string());
                fields.insert("actual".to_string(), actual.to_string());
            }
            MdServerError::ConflictFolderMapping { expected, actual } => {
                fields.insert("expected".to_string(), expected.to_string());
                fields.insert("actual".to_string(), actual.to_string());
            }
            MdServerError::Throttle { backoff_ms } => {
                fields.insert("backoff_ms".to_string(), backoff_ms.to_string());
            }
            MdServerError::AppStatus {
                fields: app_fields, ..
            } => {
                fields = app_fields.clone();
            }
            _ => {}
        }
        ServerStatus {
            code: self.code(),
            name: self.name().to_string(),
            description: self.to_string(),
            fields,
        }
    }
}

/// Turns a received status record back into the typed error.
///
/// A zero code means success and yields `None`. Codes outside the taxonomy
/// come back as [`MdServerError::AppStatus`] with the record intact.
pub fn unwrap_server_status(status: ServerStatus) -> Option<MdServerError> {
    if status.code == 0 {
        return None;
    }
    let field_u64 = |key: &str| -> u64 {
        status
            .fields
            .get(key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    };
    let field_md_id = |key: &str| -> MdId {
        status
            .fields
            .get(key)
            .and_then(|raw| MdId::parse(raw))
            .unwrap_or(MdId::ZERO)
    };
    Some(match status.code {
        STATUS_CODE_SERVER_ERROR => MdServerError::Server {
            reason: status.description,
        },
        STATUS_CODE_BAD_REQUEST => MdServerError::BadRequest {
            reason: status.description,
        },
        STATUS_CODE_CONFLICT_REVISION => MdServerError::ConflictRevision {
            expected: MetadataRevision::new(field_u64("expected")),
            actual: MetadataRevision::new(field_u64("actual")),
        },
        STATUS_CODE_CONFLICT_PREV_ROOT => MdServerError::ConflictPrevRoot {
            expected: field_md_id("expected"),
            actual: field_md_id("actual"),
        },
        STATUS_CODE_CONFLICT_DISK_USAGE => MdServerError::ConflictDiskUsage {
            expected: field_u64("expected"),
            actual: field_u64("actual"),
        },
        STATUS_CODE_LOCKED => MdServerError::Locked,
        STATUS_CODE_UNAUTHORIZED => MdServerError::Unauthorized {
            reason: status.description,
        },
        STATUS_CODE_THROTTLE => MdServerError::Throttle {
            backoff_ms: field_u64("backoff_ms"),
        },
        STATUS_CODE_CONDITION_FAILED => MdServerError::ConditionFailed {
            reason: status.description,
        },
        STATUS_CODE_WRITE_ACCESS => MdServerError::WriteAccess,
        STATUS_CODE_CONFLICT_FOLDER_MAPPING => {
            let field_tlf = |key: &str| {
                status
                    .fields
                    .get(key)
                    .and_then(|raw| TlfId::parse(raw).ok())
            };
            match (field_tlf("expected"), field_tlf("actual")) {
                (Some(expected), Some(actual)) => {
                    MdServerError::ConflictFolderMapping { expected, actual }
                }
                _ => MdServerError::BadRequest {
                    reason: status.description,
                },
            }
        }
        _ => MdServerError::AppStatus {
            code: status.code,
            name: status.name,
            description: status.description,
            fields: status.fields,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_revision_round_trips_with_fields() {
        let err = MdServerError::ConflictRevision {
            expected: MetadataRevision::new(11),
            actual: MetadataRevision::new(10),
        };
        let status = err.to_status();
        assert_eq!(status.code, 2802);
        assert_eq!(status.name, "CONFLICT_REVISION");
        assert_eq!(unwrap_server_status(status), Some(err));
    }

    #[test]
    fn prev_root_round_trips() {
        let err = MdServerError::ConflictPrevRoot {
            expected: MdId::of_encoded(b"a"),
            actual: MdId::of_encoded(b"b"),
        };
        assert_eq!(unwrap_server_status(err.to_status()), Some(err));
    }

    #[test]
    fn condition_failed_has_its_own_code() {
        let err = MdServerError::ConditionFailed {
            reason: "lost the race".to_string(),
        };
        let status = err.to_status();
        assert_eq!(status.code, 2808);
        assert_ne!(status.code, MdServerError::Throttle { backoff_ms: 0 }.code());
        assert!(matches!(
            unwrap_server_status(status),
            Some(MdServerError::ConditionFailed { .. })
        ));
    }

    #[test]
    fn zero_code_means_success() {
        let status = ServerStatus {
            code: 0,
            name: String::new(),
            description: String::new(),
            fields: BTreeMap::new(),
        };
        assert_eq!(unwrap_server_status(status), None);
    }

    #[test]
    fn unknown_code_becomes_app_status() {
        let mut fields = BTreeMap::new();
        fields.insert("k".to_string(), "v".to_string());
        let status = ServerStatus {
            code: 1999,
            name: "SOMETHING_ELSE".to_string(),
            description: "out of taxonomy".to_string(),
            fields: fields.clone(),
        };
        let err = unwrap_server_status(status).unwrap();
        assert_eq!(
            err,
            MdServerError::AppStatus {
                code: 1999,
                name: "SOMETHING_ELSE".to_string(),
                description: "out of taxonomy".to_string(),
                fields,
            }
        );
    }

    #[test]
    fn throttle_carries_backoff() {
        let err = MdServerError::Throttle { backoff_ms: 250 };
        let status = err.to_status();
        assert_eq!(status.fields.get("backoff_ms").unwrap(), "250");
        assert_eq!(unwrap_server_status(status), Some(err));
    }
}
