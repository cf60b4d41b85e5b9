//! Master secret and per-bucket key derivation.
//!
//! Each encrypted bucket gets its own key, derived as HMAC-SHA256 over a fresh
//! random salt keyed by the master secret. Derived keys are handed out in
//! [`Zeroizing`] buffers; the secret itself never leaves its [`SecretBox`].

use std::fmt;

use rand::RngCore;
use ring::hmac;
use secrecy::{ExposeSecret, SecretBox};
use zeroize::Zeroizing;

use super::CryptoError;

/// Length of the master secret in bytes.
pub const MASTER_SECRET_LEN: usize = 32;

/// Length of keys handed out by [`MasterSecret::create_symmetric_key`].
pub const DERIVED_KEY_LEN: usize = 32;

const BUCKET_KEY_DOMAIN: &[u8] = b"oxbucket:bucket-key:v1";

/// Process-wide secret from which encrypted bucket keys are derived.
///
/// The secret is held in a [`SecretBox`], which zeroes it on drop. Each call to
/// [`create_symmetric_key`](Self::create_symmetric_key) mixes in a fresh random
/// salt, so no two buckets share a key even though they share the secret.
///
/// # Thread Safety
///
/// `MasterSecret` is `Send + Sync`; share it with `Arc<MasterSecret>`.
pub struct MasterSecret {
    secret: SecretBox<[u8; MASTER_SECRET_LEN]>,
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterSecret")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl MasterSecret {
    /// Generate a new random master secret.
    pub fn random() -> Self {
        let mut bytes = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
        rand::rng().fill_bytes(&mut *bytes);
        Self {
            secret: SecretBox::new(Box::new(*bytes)),
        }
    }

    /// Build a master secret from existing key material.
    ///
    /// The caller is responsible for zeroing `bytes` afterwards.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; MASTER_SECRET_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    actual: bytes.len(),
                })?;
        Ok(Self {
            secret: SecretBox::new(Box::new(array)),
        })
    }

    /// Create a fresh 256-bit key for one encrypted bucket.
    ///
    /// `HMAC-SHA256(secret, domain || salt)` with a random 32-byte salt.
    pub fn create_symmetric_key(&self) -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
        let mut salt = [0u8; 32];
        rand::rng().fill_bytes(&mut salt);

        let key = hmac::Key::new(hmac::HMAC_SHA256, self.secret.expose_secret());
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(BUCKET_KEY_DOMAIN);
        ctx.update(&salt);
        let tag = ctx.sign();

        let mut derived = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
        derived.copy_from_slice(tag.as_ref());
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(MasterSecret::from_bytes(&[0u8; 16]).is_err());
        assert!(MasterSecret::from_bytes(&[0u8; 33]).is_err());
        assert!(MasterSecret::from_bytes(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_symmetric_keys_are_unique() {
        let secret = MasterSecret::from_bytes(&[0x42; 32]).unwrap();
        let a = secret.create_symmetric_key();
        let b = secret.create_symmetric_key();
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let secret = MasterSecret::from_bytes(&[0xAB; 32]).unwrap();
        let debug = format!("{secret:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("171"));
        assert!(!debug.to_lowercase().contains("abab"));
    }
}
