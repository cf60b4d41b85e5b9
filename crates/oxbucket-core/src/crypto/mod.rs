//! Cryptographic primitives for encrypted buckets

pub mod master_secret;
pub mod stream;

use thiserror::Error;

/// Errors that can occur during bucket encryption or decryption.
///
/// # Security Classification
///
/// Errors marked `[INTEGRITY VIOLATION]` mean the ciphertext on disk does not
/// authenticate: it was tampered with, truncated, or written under another key.
/// Callers must never use any plaintext produced by the failing stream.
#[derive(Error, Debug)]
pub enum CryptoError {
    // =========================================================================
    // INTEGRITY VIOLATIONS - Potential adversarial tampering
    // =========================================================================
    /// A chunk failed AES-GCM tag verification.
    ///
    /// **[INTEGRITY VIOLATION]** The chunk was modified, reordered, or spliced
    /// from another stream.
    #[error("[INTEGRITY VIOLATION] chunk {chunk_number} failed authentication")]
    ChunkDecryptionFailed { chunk_number: u64 },

    /// The stream ended before its final chunk.
    ///
    /// **[INTEGRITY VIOLATION]** The ciphertext was truncated.
    #[error("[INTEGRITY VIOLATION] encrypted stream truncated: {reason}")]
    Truncated { reason: String },

    // =========================================================================
    // PROGRAMMING ERRORS - Invalid parameters or implementation bugs
    // =========================================================================
    /// The AES key is not 16, 24 or 32 bytes long.
    #[error("Invalid AES key length: expected 16, 24 or 32 bytes, got {actual}")]
    InvalidKeyLength { actual: usize },

    /// Encrypting a chunk failed unexpectedly.
    #[error("Chunk {chunk_number} encryption failed: {reason}")]
    ChunkEncryptionFailed { chunk_number: u64, reason: String },
}

/// AES key sizes accepted by encrypted buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl KeySize {
    /// Map a raw key length to a key size.
    pub fn from_len(len: usize) -> Result<Self, CryptoError> {
        match len {
            16 => Ok(KeySize::Aes128),
            24 => Ok(KeySize::Aes192),
            32 => Ok(KeySize::Aes256),
            actual => Err(CryptoError::InvalidKeyLength { actual }),
        }
    }

    #[must_use]
    pub fn key_len(self) -> usize {
        match self {
            KeySize::Aes128 => 16,
            KeySize::Aes192 => 24,
            KeySize::Aes256 => 32,
        }
    }
}

// Re-export commonly used types
pub use master_secret::MasterSecret;
pub use stream::{AeadStreamReader, AeadStreamWriter};
