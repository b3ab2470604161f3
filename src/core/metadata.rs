//! Root metadata records: the unit the journal stores and the server
//! arbitrates.
//!
//! A [`RootMetadata`] is the mutable builder higher layers fill in. Signing
//! it produces a [`RootMetadataSigned`]; pairing that with its content hash
//! yields an [`ImmutableRootMetadata`], the only form the journal persists.

use std::collections::BTreeSet;

use bytes::Bytes;
use thiserror::Error;

use super::codec::{EncodeError, encode_root_metadata, encode_writer_metadata};
use super::error::CoreError;
use super::handle::TlfHandle;
use super::identity::{BranchId, MergeStatus, TlfId, UserId};
use super::keys::TlfKeyBundle;
use super::revision::{MdId, MetadataRevision};
use super::sign::{SignatureInfo, VerifyError, VerifyingKey};

/// The writer-signed portion of a revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriterMetadata {
    pub(crate) tlf_id: TlfId,
    pub(crate) branch_id: BranchId,
    pub(crate) unmerged: bool,
    pub(crate) writers: BTreeSet<UserId>,
    pub(crate) last_modifying_writer: UserId,
    pub(crate) private_payload: Bytes,
    pub(crate) key_bundle: TlfKeyBundle,
    pub(crate) disk_usage: u64,
}

impl WriterMetadata {
    pub fn tlf_id(&self) -> TlfId {
        self.tlf_id
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    pub fn merge_status(&self) -> MergeStatus {
        if self.unmerged {
            MergeStatus::Unmerged
        } else {
            MergeStatus::Merged
        }
    }

    pub fn last_modifying_writer(&self) -> UserId {
        self.last_modifying_writer
    }

    pub fn disk_usage(&self) -> u64 {
        self.disk_usage
    }
}

/// Mutable root-metadata builder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootMetadata {
    pub(crate) writer_md: WriterMetadata,
    pub(crate) writer_sig: Option<SignatureInfo>,
    pub(crate) readers: BTreeSet<UserId>,
    pub(crate) public: bool,
    pub(crate) last_modifying_user: UserId,
    pub(crate) revision: MetadataRevision,
    pub(crate) prev_root: MdId,
}

impl RootMetadata {
    pub fn new(tlf_id: TlfId, handle: &TlfHandle) -> Result<Self, CoreError> {
        handle.validate()?;
        let first_writer = *handle
            .writers()
            .iter()
            .next()
            .expect("validated handle has a writer");
        Ok(Self {
            writer_md: WriterMetadata {
                tlf_id,
                branch_id: BranchId::NULL,
                unmerged: false,
                writers: handle.writers().clone(),
                last_modifying_writer: first_writer,
                private_payload: Bytes::new(),
                key_bundle: TlfKeyBundle::default(),
                disk_usage: 0,
            },
            writer_sig: None,
            readers: handle.readers().clone(),
            public: handle.is_public(),
            last_modifying_user: first_writer,
            revision: MetadataRevision::UNINITIALIZED,
            prev_root: MdId::ZERO,
        })
    }

    pub fn writer_md(&self) -> &WriterMetadata {
        &self.writer_md
    }

    pub fn tlf_id(&self) -> TlfId {
        self.writer_md.tlf_id
    }

    pub fn branch_id(&self) -> BranchId {
        self.writer_md.branch_id
    }

    pub fn merge_status(&self) -> MergeStatus {
        self.writer_md.merge_status()
    }

    pub fn revision(&self) -> MetadataRevision {
        self.revision
    }

    pub fn prev_root(&self) -> MdId {
        self.prev_root
    }

    pub fn disk_usage(&self) -> u64 {
        self.writer_md.disk_usage
    }

    pub fn last_modifying_user(&self) -> UserId {
        self.last_modifying_user
    }

    pub fn writer_sig(&self) -> Option<&SignatureInfo> {
        self.writer_sig.as_ref()
    }

    /// Reassembles the handle this revision was minted against. Not
    /// validated here; `is_valid_and_signed` covers that.
    pub fn handle(&self) -> TlfHandle {
        TlfHandle::from_parts(
            self.writer_md.writers.clone(),
            self.readers.clone(),
            self.public,
        )
    }

    pub fn set_revision(&mut self, revision: MetadataRevision) {
        self.revision = revision;
    }

    pub fn set_prev_root(&mut self, prev_root: MdId) {
        self.prev_root = prev_root;
    }

    pub fn set_branch_id(&mut self, branch_id: BranchId) {
        self.writer_md.branch_id = branch_id;
        self.writer_sig = None;
    }

    /// Flags this revision as belonging to an unmerged branch.
    pub fn set_unmerged(&mut self) {
        self.writer_md.unmerged = true;
        self.writer_sig = None;
    }

    pub fn set_merged(&mut self) {
        self.writer_md.unmerged = false;
        self.writer_sig = None;
    }

    pub fn set_disk_usage(&mut self, disk_usage: u64) {
        self.writer_md.disk_usage = disk_usage;
        self.writer_sig = None;
    }

    pub fn set_private_payload(&mut self, payload: Bytes) {
        self.writer_md.private_payload = payload;
        self.writer_sig = None;
    }

    pub fn set_key_bundle(&mut self, bundle: TlfKeyBundle) {
        self.writer_md.key_bundle = bundle;
        self.writer_sig = None;
    }

    pub fn set_last_modifier(&mut self, uid: UserId) {
        self.writer_md.last_modifying_writer = uid;
        self.last_modifying_user = uid;
        self.writer_sig = None;
    }

    pub fn set_writer_sig(&mut self, sig: SignatureInfo) {
        self.writer_sig = Some(sig);
    }

    /// Canonical bytes of the writer portion (the writer-signature input).
    pub fn writer_bytes(&self) -> Result<Bytes, EncodeError> {
        encode_writer_metadata(&self.writer_md)
    }

    /// Canonical bytes of the whole record (the root-signature and MdId
    /// input). Requires the writer signature to be in place.
    pub fn root_bytes(&self) -> Result<Bytes, EncodeError> {
        encode_root_metadata(self)
    }

    /// Content id of this record.
    pub fn md_id(&self) -> Result<MdId, EncodeError> {
        Ok(MdId::of_encoded(&self.root_bytes()?))
    }

    /// Checks that `next` is the immediate chain successor of this record,
    /// whose content id is `prev_id`. Each violation has its own error kind
    /// so conflict handling can tell them apart.
    pub fn check_valid_successor(
        &self,
        prev_id: MdId,
        next: &RootMetadata,
    ) -> Result<(), SuccessorError> {
        let expected = self.revision.next();
        if next.revision != expected {
            return Err(SuccessorError::Revision {
                expected,
                actual: next.revision,
            });
        }
        if next.prev_root != prev_id {
            return Err(SuccessorError::PrevRoot {
                expected: prev_id,
                actual: next.prev_root,
            });
        }
        if next.branch_id() != self.branch_id() {
            return Err(SuccessorError::Branch {
                expected: self.branch_id(),
                actual: next.branch_id(),
            });
        }
        if next.merge_status() != self.merge_status() {
            return Err(SuccessorError::MergeStatus {
                expected: self.merge_status(),
                actual: next.merge_status(),
            });
        }
        Ok(())
    }
}

/// A root metadata record with both signatures filled in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootMetadataSigned {
    pub md: RootMetadata,
    pub sig: SignatureInfo,
}

impl RootMetadataSigned {
    /// Structural and cryptographic validity of one revision in isolation.
    pub fn is_valid_and_signed(&self) -> Result<(), MdValidationError> {
        let md = &self.md;
        md.handle().validate()?;

        if !md.revision.is_initialized() {
            return Err(MdValidationError::UninitializedRevision(md.revision));
        }
        if md.revision == MetadataRevision::INITIAL {
            if !md.prev_root.is_zero() {
                return Err(MdValidationError::InitialWithPrevRoot);
            }
        } else if md.prev_root.is_zero() {
            return Err(MdValidationError::MissingPrevRoot);
        }

        let status = md.merge_status();
        if (status == MergeStatus::Merged) != md.branch_id().is_null() {
            return Err(MdValidationError::BranchMergeMismatch {
                status,
                branch_id: md.branch_id(),
            });
        }

        let writer_sig = md
            .writer_sig
            .as_ref()
            .ok_or(MdValidationError::MissingWriterSig)?;
        writer_sig
            .verify(&md.writer_bytes()?)
            .map_err(MdValidationError::WriterSig)?;
        self.sig
            .verify(&md.root_bytes()?)
            .map_err(MdValidationError::RootSig)?;
        Ok(())
    }

    /// Checks that `uid` on device `key` produced this revision.
    pub fn is_last_modified_by(
        &self,
        uid: UserId,
        key: VerifyingKey,
    ) -> Result<(), MdValidationError> {
        if self.md.last_modifying_user != uid {
            return Err(MdValidationError::WrongLastModifier {
                expected: uid,
                actual: self.md.last_modifying_user,
            });
        }
        if self.md.writer_md.last_modifying_writer != uid {
            return Err(MdValidationError::WrongLastModifier {
                expected: uid,
                actual: self.md.writer_md.last_modifying_writer,
            });
        }
        if let Some(writer_sig) = &self.md.writer_sig
            && writer_sig.verifying_key != key
        {
            return Err(MdValidationError::WrongSigningKey {
                expected: key,
                actual: writer_sig.verifying_key,
            });
        }
        if self.sig.verifying_key != key {
            return Err(MdValidationError::WrongSigningKey {
                expected: key,
                actual: self.sig.verifying_key,
            });
        }
        Ok(())
    }
}

/// A signed revision pinned to its content id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImmutableRootMetadata {
    rmds: RootMetadataSigned,
    md_id: MdId,
}

impl ImmutableRootMetadata {
    pub fn new(rmds: RootMetadataSigned) -> Result<Self, EncodeError> {
        let md_id = rmds.md.md_id()?;
        Ok(Self { rmds, md_id })
    }

    pub fn rmds(&self) -> &RootMetadataSigned {
        &self.rmds
    }

    pub fn md(&self) -> &RootMetadata {
        &self.rmds.md
    }

    pub fn md_id(&self) -> MdId {
        self.md_id
    }

    pub fn revision(&self) -> MetadataRevision {
        self.rmds.md.revision
    }

    pub fn branch_id(&self) -> BranchId {
        self.rmds.md.branch_id()
    }

    pub fn merge_status(&self) -> MergeStatus {
        self.rmds.md.merge_status()
    }

    pub fn prev_root(&self) -> MdId {
        self.rmds.md.prev_root
    }

    pub fn into_rmds(self) -> RootMetadataSigned {
        self.rmds
    }
}

/// Successor-check violations, one kind per broken adjacency rule.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SuccessorError {
    #[error("revision mismatch: expected {expected}, got {actual}")]
    Revision {
        expected: MetadataRevision,
        actual: MetadataRevision,
    },
    #[error("previous root mismatch: expected {expected}, got {actual}")]
    PrevRoot { expected: MdId, actual: MdId },
    #[error("branch id mismatch: expected {expected}, got {actual}")]
    Branch { expected: BranchId, actual: BranchId },
    #[error("merge status mismatch: expected {expected}, got {actual}")]
    MergeStatus {
        expected: MergeStatus,
        actual: MergeStatus,
    },
}

#[derive(Debug, Error)]
pub enum MdValidationError {
    #[error(transparent)]
    Handle(#[from] CoreError),
    #[error("revision {0} is below the initial revision")]
    UninitializedRevision(MetadataRevision),
    #[error("initial revision carries a previous root")]
    InitialWithPrevRoot,
    #[error("non-initial revision is missing its previous root")]
    MissingPrevRoot,
    #[error("merge status {status} is inconsistent with branch id {branch_id}")]
    BranchMergeMismatch {
        status: MergeStatus,
        branch_id: BranchId,
    },
    #[error("writer metadata is unsigned")]
    MissingWriterSig,
    #[error("writer signature invalid: {0}")]
    WriterSig(#[source] VerifyError),
    #[error("root signature invalid: {0}")]
    RootSig(#[source] VerifyError),
    #[error("last modified by {actual}, expected {expected}")]
    WrongLastModifier { expected: UserId, actual: UserId },
    #[error("signed by key {actual}, expected {expected}")]
    WrongSigningKey {
        expected: VerifyingKey,
        actual: VerifyingKey,
    },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
