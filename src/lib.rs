#![forbid(unsafe_code)]

//! Per-folder metadata journal and metadata-server protocol for an
//! encrypted distributed filesystem client.
//!
//! Each top-level folder (TLF) has a hash-chained history of signed
//! revisions. Devices write into a local [`journal::MdJournal`] while
//! offline and drain it one entry at a time to an authoritative
//! [`server::MdServer`], which arbitrates merges and forks.

pub mod config;
pub mod core;
pub mod error;
pub mod journal;
pub mod server;
pub mod testing;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::config::JournalConfig;
pub use crate::core::{
    BranchId, CancelHandle, Cancelled, Clock, CoreError, Ctx, DecodeError, DeviceSigner,
    EncodeError, FixedClock, ImmutableRootMetadata, InvalidHandle, InvalidId, MdId,
    MdValidationError, MergeStatus, MetadataRevision, RootMetadata, RootMetadataSigned, SigVer,
    SignError, SignatureInfo, Signer, SuccessorError, SystemClock, TlfHandle, TlfId, TlfKeyBundle,
    UserId, VerifyError, VerifyingKey, decode_signed_metadata, encode_handle,
    encode_signed_metadata,
};
pub use crate::journal::{
    DiskLog, LogError, MdFlushTarget, MdJournal, MdJournalConflictError, MdJournalError,
    WriterDeviceDateRenamer,
};
pub use crate::server::{
    MdServer, MdServerDisk, MdServerError, MdServerMemory, ServerStatus, UpdateStream,
    unwrap_server_status,
};
