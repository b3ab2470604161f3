//! Per-TLF metadata journal: a durable ordered log of signed revisions
//! owned by one device, drained to the metadata server one entry at a
//! time.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::codec::{DecodeError, EncodeError};
use crate::core::ctx::Cancelled;
use crate::core::identity::{BranchId, MergeStatus, UserId};
use crate::core::metadata::{MdValidationError, SuccessorError};
use crate::core::revision::MdId;
use crate::core::sign::SignError;
use crate::server::errors::MdServerError;

pub mod conflict;
pub mod md_journal;
pub mod ordered_log;

pub use conflict::{WriterDeviceDateRenamer, split_extension};
pub use md_journal::{MdFlushTarget, MdJournal};
pub use ordered_log::{DiskLog, LogError, LogResult};

/// Returned by `put` when a merged record arrives while the journal has
/// already forked. The caller re-stamps the record as unmerged with the
/// journal's branch id and retries.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("journal is on a branch; metadata must be unmerged with the journal's branch id")]
pub struct MdJournalConflictError;

pub type MdJournalResult<T> = Result<T, MdJournalError>;

#[derive(Debug, Error)]
pub enum MdJournalError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error(transparent)]
    Conflict(#[from] MdJournalConflictError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("stored journal entry is undecodable: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Validation(#[from] MdValidationError),
    #[error("chain invariant violated: {0}")]
    Successor(#[from] SuccessorError),
    #[error("merge status {status} is inconsistent with branch id {branch_id}")]
    InconsistentBranch {
        status: MergeStatus,
        branch_id: BranchId,
    },
    #[error("metadata branch id {actual} does not match journal branch id {expected}")]
    BranchMismatch {
        expected: BranchId,
        actual: BranchId,
    },
    #[error("journal is already on a branch")]
    AlreadyConverted,
    #[error("clearing the master branch is not allowed")]
    ClearMaster,
    #[error("head replacement must keep merge status {expected}, got {actual}")]
    ReplaceStatusMismatch {
        expected: MergeStatus,
        actual: MergeStatus,
    },
    #[error("head replacement must keep previous root {expected}, got {actual}")]
    ReplacePrevRootMismatch { expected: MdId, actual: MdId },
    #[error("journal entry at index {index} was modified by {actual}, expected {expected}")]
    ForeignEntry {
        index: u64,
        expected: UserId,
        actual: UserId,
    },
    #[error("journal header corrupt at {path:?}: {source}")]
    HeaderCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("journal state invalid: {reason}")]
    Corrupt { reason: String },
    #[error(transparent)]
    Server(#[from] MdServerError),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
}
