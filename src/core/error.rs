//! Core capability errors (identifier parsing, handle validation).
//!
//! These are bounded and stable: they represent domain/refusal states, not
//! library implementation details.

use thiserror::Error;

/// Invalid identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("folder id `{raw}` is invalid: {reason}")]
    Tlf { raw: String, reason: String },
    #[error("branch id `{raw}` is invalid: {reason}")]
    Branch { raw: String, reason: String },
    #[error("user id `{raw}` is invalid: {reason}")]
    User { raw: String, reason: String },
}

/// Malformed folder handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("folder handle is invalid: {reason}")]
pub struct InvalidHandle {
    pub reason: String,
}

/// Canonical error enum for the core capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandle),
}
