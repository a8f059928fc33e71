//! xv-crypto: master-key derivation and the streaming cipher envelope
//!
//! Envelope layout (byte-exact):
//! ```text
//! [28 bytes: SHA-224 signature of the promoted password]
//! [16 bytes: initialisation vector]
//! [N bytes:  AES-CFB ciphertext, same length as the plaintext]
//! ```
//!
//! The signature prefix detects decryption with the wrong key; the envelope
//! is NOT authenticated encryption. A flipped ciphertext bit flips the
//! corresponding plaintext bit without any error.

pub mod bytes;
pub mod kdf;
pub mod stream;

pub use kdf::MasterKey;
pub use stream::{ByteSink, ByteSource, Decoder, Encoder};

/// Size of the AES-256 master key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the SHA-224 key signature in bytes.
pub const SIGNATURE_SIZE: usize = 28;

/// Size of the initialisation vector (one AES block).
pub const IV_SIZE: usize = 16;

/// Cipher chunk size used when a caller passes 0.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
