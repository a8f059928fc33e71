//! Master-key derivation: passphrase → (cipher key, signature, password blob)
//!
//! The passphrase is first "promoted": `base64(lower(p) ‖ p ‖ upper(p))`.
//! Promotion injects length and character-class variation before hashing so
//! that case-variants of the same passphrase derive distinct keys while the
//! whole pipeline stays deterministic.
//!
//! From the promoted bytes:
//!   - `signature`  = SHA-224(promoted) — 28 bytes, written at the head of
//!     every envelope as a wrong-key guard.
//!   - `key`        = SHA-256(base64(promoted)) — the AES-256 cipher key.
//!   - `password_blob` = base64(SHA-512(signature) ‖ fixed-IV encryption of
//!     the promoted bytes under `key`) — an opaque verifier that is safe to
//!     store on disk and compare for passphrase validation.

use std::fmt;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha224, Sha256, Sha512};
use zeroize::Zeroize;

use xv_core::{Error, Result};

use crate::bytes::encrypt_bytes_fixed;
use crate::{KEY_SIZE, SIGNATURE_SIZE};

/// An immutable master key. Derive once per session, share behind an `Arc`.
///
/// The cipher key bytes are zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    pub(crate) key: Vec<u8>,
    pub(crate) signature: Vec<u8>,
    pub(crate) password_blob: Vec<u8>,
}

impl MasterKey {
    /// Derives a master key from a passphrase.
    ///
    /// The trimmed passphrase must be non-empty and the raw passphrase must
    /// contain at least eight Unicode code points.
    pub fn from_password(pass: &str) -> Result<Self> {
        if pass.trim().is_empty() {
            return Err(Error::EmptyPassword);
        }
        if pass.chars().count() < 8 {
            return Err(Error::InvalidPassword);
        }

        let promoted = promote_password(pass);
        let signature = Sha224::digest(&promoted).to_vec();
        let key = Sha256::digest(STANDARD_NO_PAD.encode(&promoted).as_bytes()).to_vec();

        // The IV must be a function of the plaintext here: deriving twice
        // from the same passphrase has to yield the same blob.
        let encrypted = encrypt_bytes_fixed(&key, &promoted)?;

        let mut blob = Sha512::digest(&signature).to_vec();
        blob.extend_from_slice(&encrypted);
        let password_blob = STANDARD_NO_PAD.encode(&blob).into_bytes();

        Ok(Self {
            key,
            signature,
            password_blob,
        })
    }

    /// Returns true iff `pass` derives a key with a byte-equal password blob.
    ///
    /// Never fails: structural problems and derivation errors all map to
    /// `false`.
    pub fn validate(&self, pass: &str) -> bool {
        if !self.is_valid() {
            return false;
        }
        match Self::from_password(pass) {
            Ok(candidate) => candidate.password_blob == self.password_blob,
            Err(_) => false,
        }
    }

    /// Structural check: 32-byte key, 28-byte signature, non-empty blob.
    pub fn is_valid(&self) -> bool {
        self.key.len() == KEY_SIZE
            && self.signature.len() == SIGNATURE_SIZE
            && !self.password_blob.is_empty()
    }

    /// The 28-byte envelope signature.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The opaque passphrase verifier. Safe to persist.
    pub fn password_blob(&self) -> &[u8] {
        &self.password_blob
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .field("signature", &self.signature)
            .finish()
    }
}

fn promote_password(pass: &str) -> Vec<u8> {
    let merged = format!("{}{}{}", pass.to_lowercase(), pass, pass.to_uppercase());
    STANDARD_NO_PAD.encode(merged.as_bytes()).into_bytes()
}
