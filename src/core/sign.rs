//! Signature values and the signer collaborator boundary.
//!
//! The journal and server only deal in [`SignatureInfo`] values and the
//! [`Signer`] trait; the identity service decides which keys exist. The
//! concrete device signer here is Ed25519.

use std::fmt;

use bytes::Bytes;
use ed25519_dalek::Signer as _;
use rand::RngCore;
use thiserror::Error;

use super::ctx::{Cancelled, Ctx};

pub const VERIFYING_KEY_BYTE_LEN: usize = 32;

/// Signature scheme tag carried inside every signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SigVer {
    Ed25519,
}

impl SigVer {
    pub fn as_u8(self) -> u8 {
        match self {
            SigVer::Ed25519 => 1,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(SigVer::Ed25519),
            _ => None,
        }
    }
}

/// Public half of a device signing key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VerifyingKey([u8; VERIFYING_KEY_BYTE_LEN]);

impl VerifyingKey {
    pub fn from_bytes(bytes: [u8; VERIFYING_KEY_BYTE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFYING_KEY_BYTE_LEN] {
        &self.0
    }
}

impl fmt::Display for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKey({self})")
    }
}

/// A signature together with the scheme and key that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub version: SigVer,
    pub signature: Bytes,
    pub verifying_key: VerifyingKey,
}

impl SignatureInfo {
    /// Verifies this signature over `message` against its embedded key.
    pub fn verify(&self, message: &[u8]) -> Result<(), VerifyError> {
        match self.version {
            SigVer::Ed25519 => {
                let key = ed25519_dalek::VerifyingKey::from_bytes(self.verifying_key.as_bytes())
                    .map_err(|_| VerifyError::MalformedKey)?;
                let sig = ed25519_dalek::Signature::from_slice(&self.signature)
                    .map_err(|_| VerifyError::MalformedSignature)?;
                key.verify_strict(message, &sig)
                    .map_err(|_| VerifyError::Mismatch)
            }
        }
    }
}

impl fmt::Debug for SignatureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureInfo")
            .field("version", &self.version)
            .field("verifying_key", &self.verifying_key)
            .field("signature_len", &self.signature.len())
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("verifying key is malformed")]
    MalformedKey,
    #[error("signature bytes are malformed")]
    MalformedSignature,
    #[error("signature does not verify")]
    Mismatch,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("signer refused: {reason}")]
    Refused { reason: String },
}

/// Signing collaborator. Must be pure given the key.
pub trait Signer {
    fn sign(&self, ctx: &Ctx, message: &[u8]) -> Result<SignatureInfo, SignError>;

    fn verifying_key(&self) -> VerifyingKey;
}

/// Ed25519 device signer holding the private key in memory.
pub struct DeviceSigner {
    key: ed25519_dalek::SigningKey,
}

impl DeviceSigner {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }
}

impl Signer for DeviceSigner {
    fn sign(&self, ctx: &Ctx, message: &[u8]) -> Result<SignatureInfo, SignError> {
        ctx.check()?;
        let sig = self.key.sign(message);
        Ok(SignatureInfo {
            version: SigVer::Ed25519,
            signature: Bytes::copy_from_slice(&sig.to_bytes()),
            verifying_key: self.verifying_key(),
        })
    }

    fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from_bytes(self.key.verifying_key().to_bytes())
    }
}

impl fmt::Debug for DeviceSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceSigner({})", self.verifying_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let signer = DeviceSigner::from_seed([7u8; 32]);
        let ctx = Ctx::background();
        let info = signer.sign(&ctx, b"message").unwrap();
        assert_eq!(info.verifying_key, signer.verifying_key());
        info.verify(b"message").unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let signer = DeviceSigner::from_seed([7u8; 32]);
        let info = signer.sign(&Ctx::background(), b"message").unwrap();
        assert_eq!(info.verify(b"other"), Err(VerifyError::Mismatch));
    }

    #[test]
    fn wrong_key_fails() {
        let signer = DeviceSigner::from_seed([7u8; 32]);
        let other = DeviceSigner::from_seed([8u8; 32]);
        let mut info = signer.sign(&Ctx::background(), b"message").unwrap();
        info.verifying_key = other.verifying_key();
        assert_eq!(info.verify(b"message"), Err(VerifyError::Mismatch));
    }

    #[test]
    fn cancelled_ctx_blocks_signing() {
        let signer = DeviceSigner::from_seed([7u8; 32]);
        let (ctx, cancel) = Ctx::cancellable();
        cancel.cancel();
        assert_eq!(
            signer.sign(&ctx, b"message"),
            Err(SignError::Cancelled(Cancelled))
        );
    }

    #[test]
    fn signing_is_deterministic_per_key() {
        let signer = DeviceSigner::from_seed([9u8; 32]);
        let ctx = Ctx::background();
        let a = signer.sign(&ctx, b"m").unwrap();
        let b = signer.sign(&ctx, b"m").unwrap();
        assert_eq!(a, b);
    }
}
