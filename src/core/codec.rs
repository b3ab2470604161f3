//! Canonical CBOR encoding for metadata records.
//!
//! Signatures and content ids are computed over these bytes, so the
//! encoding must be deterministic: definite lengths only, fixed field
//! order, sorted map keys for id-keyed maps, no floats. Decoding rejects
//! duplicate keys and trailing bytes; unknown keys are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::handle::TlfHandle;
use super::identity::{BranchId, ID_BYTE_LEN, TlfId, UserId};
use super::keys::TlfKeyBundle;
use super::metadata::{RootMetadata, RootMetadataSigned, WriterMetadata};
use super::revision::{MD_ID_BYTE_LEN, MdId, MetadataRevision};
use super::sign::{SigVer, SignatureInfo, VERIFYING_KEY_BYTE_LEN, VerifyingKey};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
    #[error("writer metadata is unsigned")]
    MissingWriterSig,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("duplicate map key: {0}")]
    DuplicateKey(String),
    #[error("trailing bytes after metadata record")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

/// Canonical bytes of the writer portion; the writer-signature input.
pub fn encode_writer_metadata(wmd: &WriterMetadata) -> Result<Bytes, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_writer_metadata_map(&mut enc, wmd)?;
    Ok(Bytes::from(buf))
}

/// Canonical bytes of the whole record, writer signature included; the
/// root-signature and MdId input.
pub fn encode_root_metadata(md: &RootMetadata) -> Result<Bytes, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_root_metadata_map(&mut enc, md)?;
    Ok(Bytes::from(buf))
}

/// Wire/storage form of a fully signed record.
pub fn encode_signed_metadata(rmds: &RootMetadataSigned) -> Result<Bytes, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("metadata")?;
    encode_root_metadata_map(&mut enc, &rmds.md)?;
    enc.str("sig")?;
    encode_signature_map(&mut enc, &rmds.sig)?;
    Ok(Bytes::from(buf))
}

pub fn decode_signed_metadata(bytes: &[u8]) -> Result<RootMetadataSigned, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;
    let mut seen = BTreeSet::new();
    let mut md = None;
    let mut sig = None;
    for _ in 0..map_len {
        let key = dec.str()?;
        ensure_unique_key(&mut seen, key)?;
        match key {
            "metadata" => md = Some(decode_root_metadata_map(&mut dec)?),
            "sig" => sig = Some(decode_signature_map(&mut dec)?),
            _ => dec.skip()?,
        }
    }
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(RootMetadataSigned {
        md: md.ok_or(DecodeError::MissingField("metadata"))?,
        sig: sig.ok_or(DecodeError::MissingField("sig"))?,
    })
}

/// Canonical handle bytes; the server's handle-to-folder mapping key.
pub fn encode_handle(handle: &TlfHandle) -> Result<Bytes, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("writers")?;
    encode_uid_array(&mut enc, handle.writers())?;
    enc.str("readers")?;
    encode_uid_array(&mut enc, handle.readers())?;
    enc.str("public")?;
    enc.bool(handle.is_public())?;
    Ok(Bytes::from(buf))
}

fn encode_writer_metadata_map(
    enc: &mut Encoder<&mut Vec<u8>>,
    wmd: &WriterMetadata,
) -> Result<(), EncodeError> {
    enc.map(8)?;
    enc.str("tlf_id")?;
    enc.bytes(wmd.tlf_id.as_bytes())?;
    enc.str("branch_id")?;
    enc.bytes(wmd.branch_id.as_bytes())?;
    enc.str("unmerged")?;
    enc.bool(wmd.unmerged)?;
    enc.str("writers")?;
    encode_uid_array(enc, &wmd.writers)?;
    enc.str("last_modifying_writer")?;
    enc.bytes(wmd.last_modifying_writer.as_bytes())?;
    enc.str("private_payload")?;
    enc.bytes(&wmd.private_payload)?;
    enc.str("key_bundle")?;
    encode_key_bundle_map(enc, &wmd.key_bundle)?;
    enc.str("disk_usage")?;
    enc.u64(wmd.disk_usage)?;
    Ok(())
}

fn encode_root_metadata_map(
    enc: &mut Encoder<&mut Vec<u8>>,
    md: &RootMetadata,
) -> Result<(), EncodeError> {
    let writer_sig = md.writer_sig().ok_or(EncodeError::MissingWriterSig)?;
    enc.map(7)?;
    enc.str("writer_metadata")?;
    encode_writer_metadata_map(enc, md.writer_md())?;
    enc.str("writer_sig")?;
    encode_signature_map(enc, writer_sig)?;
    enc.str("readers")?;
    encode_uid_array(enc, &md.readers)?;
    enc.str("public")?;
    enc.bool(md.public)?;
    enc.str("last_modifying_user")?;
    enc.bytes(md.last_modifying_user().as_bytes())?;
    enc.str("revision")?;
    enc.u64(md.revision().get())?;
    enc.str("prev_root")?;
    enc.bytes(md.prev_root().as_bytes())?;
    Ok(())
}

fn encode_signature_map(
    enc: &mut Encoder<&mut Vec<u8>>,
    sig: &SignatureInfo,
) -> Result<(), EncodeError> {
    enc.map(3)?;
    enc.str("version")?;
    enc.u8(sig.version.as_u8())?;
    enc.str("signature")?;
    enc.bytes(&sig.signature)?;
    enc.str("verifying_key")?;
    enc.bytes(sig.verifying_key.as_bytes())?;
    Ok(())
}

fn encode_key_bundle_map(
    enc: &mut Encoder<&mut Vec<u8>>,
    bundle: &TlfKeyBundle,
) -> Result<(), EncodeError> {
    enc.map(2)?;
    enc.str("generation")?;
    enc.u64(bundle.generation)?;
    enc.str("writer_keys")?;
    enc.map(bundle.writer_keys.len() as u64)?;
    for (uid, key) in &bundle.writer_keys {
        enc.bytes(uid.as_bytes())?;
        enc.bytes(key.as_bytes())?;
    }
    Ok(())
}

fn encode_uid_array(
    enc: &mut Encoder<&mut Vec<u8>>,
    uids: &BTreeSet<UserId>,
) -> Result<(), EncodeError> {
    enc.array(uids.len() as u64)?;
    for uid in uids {
        enc.bytes(uid.as_bytes())?;
    }
    Ok(())
}

fn decode_root_metadata_map(dec: &mut Decoder<'_>) -> Result<RootMetadata, DecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut writer_md = None;
    let mut writer_sig = None;
    let mut readers = None;
    let mut public = None;
    let mut last_modifying_user = None;
    let mut revision = None;
    let mut prev_root = None;
    for _ in 0..map_len {
        let key = dec.str()?;
        ensure_unique_key(&mut seen, key)?;
        match key {
            "writer_metadata" => writer_md = Some(decode_writer_metadata_map(dec)?),
            "writer_sig" => writer_sig = Some(decode_signature_map(dec)?),
            "readers" => readers = Some(decode_uid_array(dec, "readers")?),
            "public" => public = Some(dec.bool()?),
            "last_modifying_user" => {
                last_modifying_user = Some(decode_uid(dec, "last_modifying_user")?);
            }
            "revision" => revision = Some(MetadataRevision::new(dec.u64()?)),
            "prev_root" => {
                let bytes = decode_fixed_bytes::<MD_ID_BYTE_LEN>(dec, "prev_root")?;
                prev_root = Some(MdId::from_bytes(bytes));
            }
            _ => dec.skip()?,
        }
    }
    Ok(RootMetadata {
        writer_md: writer_md.ok_or(DecodeError::MissingField("writer_metadata"))?,
        writer_sig: Some(writer_sig.ok_or(DecodeError::MissingField("writer_sig"))?),
        readers: readers.ok_or(DecodeError::MissingField("readers"))?,
        public: public.ok_or(DecodeError::MissingField("public"))?,
        last_modifying_user: last_modifying_user
            .ok_or(DecodeError::MissingField("last_modifying_user"))?,
        revision: revision.ok_or(DecodeError::MissingField("revision"))?,
        prev_root: prev_root.ok_or(DecodeError::MissingField("prev_root"))?,
    })
}

fn decode_writer_metadata_map(dec: &mut Decoder<'_>) -> Result<WriterMetadata, DecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut tlf_id = None;
    let mut branch_id = None;
    let mut unmerged = None;
    let mut writers = None;
    let mut last_modifying_writer = None;
    let mut private_payload = None;
    let mut key_bundle = None;
    let mut disk_usage = None;
    for _ in 0..map_len {
        let key = dec.str()?;
        ensure_unique_key(&mut seen, key)?;
        match key {
            "tlf_id" => {
                let bytes = decode_fixed_bytes::<ID_BYTE_LEN>(dec, "tlf_id")?;
                tlf_id = Some(TlfId::from_bytes(bytes).map_err(|err| {
                    DecodeError::InvalidField {
                        field: "tlf_id",
                        reason: err.to_string(),
                    }
                })?);
            }
            "branch_id" => {
                let bytes = decode_fixed_bytes::<ID_BYTE_LEN>(dec, "branch_id")?;
                branch_id = Some(BranchId::from_bytes(bytes));
            }
            "unmerged" => unmerged = Some(dec.bool()?),
            "writers" => writers = Some(decode_uid_array(dec, "writers")?),
            "last_modifying_writer" => {
                last_modifying_writer = Some(decode_uid(dec, "last_modifying_writer")?);
            }
            "private_payload" => {
                private_payload = Some(Bytes::copy_from_slice(dec.bytes()?));
            }
            "key_bundle" => key_bundle = Some(decode_key_bundle_map(dec)?),
            "disk_usage" => disk_usage = Some(dec.u64()?),
            _ => dec.skip()?,
        }
    }
    Ok(WriterMetadata {
        tlf_id: tlf_id.ok_or(DecodeError::MissingField("tlf_id"))?,
        branch_id: branch_id.ok_or(DecodeError::MissingField("branch_id"))?,
        unmerged: unmerged.ok_or(DecodeError::MissingField("unmerged"))?,
        writers: writers.ok_or(DecodeError::MissingField("writers"))?,
        last_modifying_writer: last_modifying_writer
            .ok_or(DecodeError::MissingField("last_modifying_writer"))?,
        private_payload: private_payload.ok_or(DecodeError::MissingField("private_payload"))?,
        key_bundle: key_bundle.ok_or(DecodeError::MissingField("key_bundle"))?,
        disk_usage: disk_usage.ok_or(DecodeError::MissingField("disk_usage"))?,
    })
}

fn decode_signature_map(dec: &mut Decoder<'_>) -> Result<SignatureInfo, DecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut version = None;
    let mut signature = None;
    let mut verifying_key = None;
    for _ in 0..map_len {
        let key = dec.str()?;
        ensure_unique_key(&mut seen, key)?;
        match key {
            "version" => {
                let raw = dec.u64()?;
                let raw = u8::try_from(raw).map_err(|_| DecodeError::InvalidField {
                    field: "version",
                    reason: format!("out of range: {raw}"),
                })?;
                version = Some(SigVer::from_u8(raw).ok_or(DecodeError::InvalidField {
                    field: "version",
                    reason: format!("unknown signature version {raw}"),
                })?);
            }
            "signature" => signature = Some(Bytes::copy_from_slice(dec.bytes()?)),
            "verifying_key" => {
                let bytes = decode_fixed_bytes::<VERIFYING_KEY_BYTE_LEN>(dec, "verifying_key")?;
                verifying_key = Some(VerifyingKey::from_bytes(bytes));
            }
            _ => dec.skip()?,
        }
    }
    Ok(SignatureInfo {
        version: version.ok_or(DecodeError::MissingField("version"))?,
        signature: signature.ok_or(DecodeError::MissingField("signature"))?,
        verifying_key: verifying_key.ok_or(DecodeError::MissingField("verifying_key"))?,
    })
}

fn decode_key_bundle_map(dec: &mut Decoder<'_>) -> Result<TlfKeyBundle, DecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut generation = None;
    let mut writer_keys: Option<BTreeMap<UserId, VerifyingKey>> = None;
    for _ in 0..map_len {
        let key = dec.str()?;
        ensure_unique_key(&mut seen, key)?;
        match key {
            "generation" => generation = Some(dec.u64()?),
            "writer_keys" => {
                let entries = decode_map_len(dec)?;
                let mut keys = BTreeMap::new();
                for _ in 0..entries {
                    let uid = decode_uid(dec, "writer_keys")?;
                    let key_bytes =
                        decode_fixed_bytes::<VERIFYING_KEY_BYTE_LEN>(dec, "writer_keys")?;
                    if keys
                        .insert(uid, VerifyingKey::from_bytes(key_bytes))
                        .is_some()
                    {
                        return Err(DecodeError::DuplicateKey(uid.to_string()));
                    }
                }
                writer_keys = Some(keys);
            }
            _ => dec.skip()?,
        }
    }
    Ok(TlfKeyBundle {
        generation: generation.ok_or(DecodeError::MissingField("generation"))?,
        writer_keys: writer_keys.ok_or(DecodeError::MissingField("writer_keys"))?,
    })
}

fn decode_uid_array(
    dec: &mut Decoder<'_>,
    field: &'static str,
) -> Result<BTreeSet<UserId>, DecodeError> {
    let len = dec.array()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut uids = BTreeSet::new();
    for _ in 0..len {
        let uid = decode_uid(dec, field)?;
        if !uids.insert(uid) {
            return Err(DecodeError::DuplicateKey(uid.to_string()));
        }
    }
    Ok(uids)
}

fn decode_uid(dec: &mut Decoder<'_>, field: &'static str) -> Result<UserId, DecodeError> {
    let bytes = decode_fixed_bytes::<ID_BYTE_LEN>(dec, field)?;
    Ok(UserId::from_bytes(bytes))
}

fn decode_fixed_bytes<const N: usize>(
    dec: &mut Decoder<'_>,
    field: &'static str,
) -> Result<[u8; N], DecodeError> {
    let raw = dec.bytes()?;
    if raw.len() != N {
        return Err(DecodeError::InvalidField {
            field,
            reason: format!("expected {N} bytes, got {}", raw.len()),
        });
    }
    let mut buf = [0u8; N];
    buf.copy_from_slice(raw);
    Ok(buf)
}

fn decode_map_len(dec: &mut Decoder<'_>) -> Result<u64, DecodeError> {
    dec.map()?.ok_or(DecodeError::IndefiniteLength)
}

fn ensure_unique_key(seen: &mut BTreeSet<String>, key: &str) -> Result<(), DecodeError> {
    if !seen.insert(key.to_string()) {
        return Err(DecodeError::DuplicateKey(key.to_string()));
    }
    Ok(())
}
