//! Test support: deterministic fake ids, metadata factories, and
//! environment-selected server backends. Not for production use.

use std::path::PathBuf;

use bytes::Bytes;
use rand::RngCore;

use crate::core::ctx::Ctx;
use crate::core::handle::TlfHandle;
use crate::core::identity::{BranchId, ID_BYTE_LEN, TlfId, UserId};
use crate::core::keys::TlfKeyBundle;
use crate::core::metadata::{RootMetadata, RootMetadataSigned};
use crate::core::revision::{MdId, MetadataRevision};
use crate::core::sign::{DeviceSigner, Signer};
use crate::server::disk::MdServerDisk;
use crate::server::errors::MdServerError;
use crate::server::memory::MdServerMemory;
use crate::server::MdServer;

/// Selects the test server backend: unset for in-memory,
/// [`TEMPDIR_SERVER_ADDR`] for an on-disk server in a temporary
/// directory, anything else for a remote address.
pub const ENV_TEST_MDSERVER: &str = "TLFMD_TEST_MDSERVER";

/// Special [`ENV_TEST_MDSERVER`] value requesting the on-disk backend.
pub const TEMPDIR_SERVER_ADDR: &str = "tempdir";

pub fn fake_uid(b: u8) -> UserId {
    UserId::from_bytes([b; ID_BYTE_LEN])
}

pub fn fake_tlf_id(b: u8, public: bool) -> TlfId {
    let mut bytes = [b; ID_BYTE_LEN];
    bytes[ID_BYTE_LEN - 1] = if public { 0x17 } else { 0x16 };
    TlfId::from_bytes(bytes).expect("suffix byte is valid")
}

pub fn fake_branch_id(b: u8) -> BranchId {
    assert_ne!(b, 0, "zero would be the null branch id");
    BranchId::from_bytes([b; ID_BYTE_LEN])
}

pub fn fake_md_id(b: u8) -> MdId {
    MdId::of_encoded(&[b])
}

pub fn test_signer(seed: u8) -> DeviceSigner {
    DeviceSigner::from_seed([seed; 32])
}

pub fn single_writer_handle(writer: UserId) -> TlfHandle {
    TlfHandle::new([writer], [], false).expect("single-writer handle is valid")
}

/// A metadata record the way journal tests build one: payload filled,
/// first-generation key bundle, revision and chain pointer set.
pub fn make_md_for_test(
    id: TlfId,
    handle: &TlfHandle,
    revision: MetadataRevision,
    uid: UserId,
    key_source: &DeviceSigner,
    prev_root: MdId,
) -> RootMetadata {
    let mut md = RootMetadata::new(id, handle).expect("test handle is valid");
    md.set_revision(revision);
    md.set_prev_root(prev_root);
    md.set_private_payload(Bytes::from_static(&[0x1]));
    md.set_last_modifier(uid);
    md.set_key_bundle(TlfKeyBundle::initial(
        handle
            .writers()
            .iter()
            .map(|writer| (*writer, key_source.verifying_key())),
    ));
    md
}

/// Signs writer metadata then the whole record, the way the journal does.
pub fn sign_md_for_test(signer: &dyn Signer, md: &mut RootMetadata) -> RootMetadataSigned {
    let ctx = Ctx::background();
    let writer_sig = signer
        .sign(&ctx, &md.writer_bytes().expect("writer encoding"))
        .expect("test signer never refuses");
    md.set_writer_sig(writer_sig);
    let sig = signer
        .sign(&ctx, &md.root_bytes().expect("root encoding"))
        .expect("test signer never refuses");
    RootMetadataSigned { md: md.clone(), sig }
}

/// Builds the server backend selected by [`ENV_TEST_MDSERVER`].
///
/// A remote address errors: the RPC transport lives outside this crate.
pub fn make_test_mdserver(uid: UserId) -> Result<Box<dyn MdServer>, MdServerError> {
    match std::env::var(ENV_TEST_MDSERVER) {
        Err(_) => Ok(Box::new(MdServerMemory::new(uid))),
        Ok(addr) if addr.is_empty() => Ok(Box::new(MdServerMemory::new(uid))),
        Ok(addr) if addr == TEMPDIR_SERVER_ADDR => {
            let root = fresh_tempdir("tlfmd-mdserver");
            Ok(Box::new(MdServerDisk::open(&root, uid, 8 * 1024 * 1024)?))
        }
        Ok(addr) => Err(MdServerError::Server {
            reason: format!("no RPC transport for remote mdserver {addr}"),
        }),
    }
}

fn fresh_tempdir(prefix: &str) -> PathBuf {
    let mut suffix = [0u8; 8];
    rand::rng().fill_bytes(&mut suffix);
    let name: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
    std::env::temp_dir().join(format!("{prefix}-{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_ids_are_deterministic() {
        assert_eq!(fake_md_id(1), fake_md_id(1));
        assert_ne!(fake_md_id(1), fake_md_id(2));
        assert!(!fake_md_id(1).is_zero());
        assert!(fake_tlf_id(3, true).is_public());
        assert!(!fake_branch_id(7).is_null());
    }

    #[test]
    fn signed_test_md_validates() {
        let uid = fake_uid(1);
        let signer = test_signer(9);
        let handle = single_writer_handle(uid);
        let mut md = make_md_for_test(
            fake_tlf_id(1, false),
            &handle,
            MetadataRevision::new(1),
            uid,
            &signer,
            MdId::ZERO,
        );
        let rmds = sign_md_for_test(&signer, &mut md);
        rmds.is_valid_and_signed().unwrap();
        rmds.is_last_modified_by(uid, signer.verifying_key()).unwrap();
    }
}
