//! Byte-level AES-CFB helpers
//!
//! Output layout: `[16-byte IV][CFB ciphertext of base64(text)]`.
//!
//! `encrypt_bytes` draws a fresh random IV, so two encryptions of the same
//! input differ. `encrypt_bytes_fixed` derives the IV from the plaintext
//! (first 16 bytes of its SHA-224), so equal `(key, text)` pairs produce
//! byte-equal output; the master-key password blob relies on this.

use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha224};

use xv_core::{Error, Result};

use crate::IV_SIZE;

/// Incremental CFB-128 encryptor over AES-128/192/256, selected by key length.
pub(crate) enum CfbEnc {
    Aes128(BufEncryptor<Aes128>),
    Aes192(BufEncryptor<Aes192>),
    Aes256(BufEncryptor<Aes256>),
}

impl CfbEnc {
    pub(crate) fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(Self::Aes128(
                BufEncryptor::new_from_slices(key, iv).map_err(|_| Error::KeyLength(key.len()))?,
            )),
            24 => Ok(Self::Aes192(
                BufEncryptor::new_from_slices(key, iv).map_err(|_| Error::KeyLength(key.len()))?,
            )),
            32 => Ok(Self::Aes256(
                BufEncryptor::new_from_slices(key, iv).map_err(|_| Error::KeyLength(key.len()))?,
            )),
            n => Err(Error::KeyLength(n)),
        }
    }

    /// XORs the keystream into `buf` in place, advancing the cipher state.
    pub(crate) fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.encrypt(buf),
            Self::Aes192(c) => c.encrypt(buf),
            Self::Aes256(c) => c.encrypt(buf),
        }
    }
}

/// Incremental CFB-128 decryptor, the inverse of [`CfbEnc`].
pub(crate) enum CfbDec {
    Aes128(BufDecryptor<Aes128>),
    Aes192(BufDecryptor<Aes192>),
    Aes256(BufDecryptor<Aes256>),
}

impl CfbDec {
    pub(crate) fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(Self::Aes128(
                BufDecryptor::new_from_slices(key, iv).map_err(|_| Error::KeyLength(key.len()))?,
            )),
            24 => Ok(Self::Aes192(
                BufDecryptor::new_from_slices(key, iv).map_err(|_| Error::KeyLength(key.len()))?,
            )),
            32 => Ok(Self::Aes256(
                BufDecryptor::new_from_slices(key, iv).map_err(|_| Error::KeyLength(key.len()))?,
            )),
            n => Err(Error::KeyLength(n)),
        }
    }

    pub(crate) fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.decrypt(buf),
            Self::Aes192(c) => c.decrypt(buf),
            Self::Aes256(c) => c.decrypt(buf),
        }
    }
}

/// Encrypts `text` under `key` with a fresh random IV.
///
/// Two calls with the same input produce different output.
pub fn encrypt_bytes(key: &[u8], text: &[u8]) -> Result<Vec<u8>> {
    encrypt_with_iv(key, text, random_iv())
}

/// Encrypts `text` under `key` with an IV derived from the plaintext.
///
/// Two calls with the same `(key, text)` pair produce byte-equal output.
pub fn encrypt_bytes_fixed(key: &[u8], text: &[u8]) -> Result<Vec<u8>> {
    encrypt_with_iv(key, text, fixed_iv(text))
}

/// Decrypts a blob produced by [`encrypt_bytes`] or [`encrypt_bytes_fixed`].
pub fn decrypt_bytes(key: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < IV_SIZE {
        return Err(Error::InvalidCiphertext);
    }
    let (iv, ciphertext) = blob.split_at(IV_SIZE);
    let mut cipher = CfbDec::new(key, iv)?;
    let mut payload = ciphertext.to_vec();
    cipher.apply(&mut payload);
    Ok(STANDARD_NO_PAD.decode(&payload)?)
}

fn encrypt_with_iv(key: &[u8], text: &[u8], iv: [u8; IV_SIZE]) -> Result<Vec<u8>> {
    let mut cipher = CfbEnc::new(key, &iv)?;
    let mut payload = STANDARD_NO_PAD.encode(text).into_bytes();
    cipher.apply(&mut payload);

    let mut out = Vec::with_capacity(IV_SIZE + payload.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&payload);
    Ok(out)
}

pub(crate) fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn fixed_iv(text: &[u8]) -> [u8; IV_SIZE] {
    let digest = Sha224::digest(text);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&digest[..IV_SIZE]);
    iv
}
