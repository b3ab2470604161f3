//! Core types: identities, revisions, handles, signatures, canonical codec.

pub mod clock;
pub mod codec;
pub mod ctx;
pub mod error;
pub mod handle;
pub mod identity;
pub mod keys;
pub mod metadata;
pub mod revision;
pub mod sign;

pub use clock::{Clock, FixedClock, SystemClock};
pub use codec::{
    DecodeError, EncodeError, decode_signed_metadata, encode_handle, encode_root_metadata,
    encode_signed_metadata, encode_writer_metadata,
};
pub use ctx::{CancelHandle, Cancelled, Ctx};
pub use error::{CoreError, InvalidHandle, InvalidId};
pub use handle::TlfHandle;
pub use identity::{BranchId, ID_BYTE_LEN, MergeStatus, TlfId, UserId};
pub use keys::TlfKeyBundle;
pub use metadata::{
    ImmutableRootMetadata, MdValidationError, RootMetadata, RootMetadataSigned, SuccessorError,
    WriterMetadata,
};
pub use revision::{MD_ID_BYTE_LEN, MdId, MetadataRevision};
pub use sign::{
    DeviceSigner, SigVer, SignError, SignatureInfo, Signer, VERIFYING_KEY_BYTE_LEN, VerifyError,
    VerifyingKey,
};
