//! Symmetric cipher for organization-scoped payload encryption.
//!
//! AES-256-CBC with PKCS#7 padding. The key is an organization key string
//! (for example `orgApiKey-4f0c…`), turned into exactly 32 bytes: its UTF-8
//! bytes are copied into a zeroed 32-byte buffer and anything past 32 bytes
//! is dropped. Stored ciphertext depends on this contract, so it is fixed.
//!
//! # Security model
//!
//! - Every encryption draws a fresh 16-byte IV from `OsRng`.
//! - The IV is returned base64-encoded and must be stored next to the
//!   ciphertext reference; decryption needs both.
//! - Derived key buffers are zeroized on drop.
//! - A wrong key or IV almost always fails the padding check with
//!   [`CryptoError::Decryption`]. CBC has no authentication, so roughly one
//!   wrong key in 256 still yields (garbage) plaintext.

use std::fmt;

use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Key length for AES-256 (256 bits).
pub const KEY_LEN: usize = 32;

/// IV length for AES-CBC (one block).
pub const IV_LEN: usize = 16;

/// A 256-bit key derived from an organization key string, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey([u8; KEY_LEN]);

impl CipherKey {
    /// Derive the fixed-size key from an organization key string.
    #[must_use]
    pub fn from_org_key(org_key: &str) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        let src = org_key.as_bytes();
        let len = src.len().min(KEY_LEN);
        bytes[..len].copy_from_slice(&src[..len]);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Output of [`encrypt`]: the ciphertext and the base64 IV token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: String,
}

/// Encrypt `plaintext` under `org_key` with a fresh random IV.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the cipher cannot be initialized.
pub fn encrypt(plaintext: &[u8], org_key: &str) -> Result<EncryptedPayload, CryptoError> {
    let key = CipherKey::from_org_key(org_key);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv).map_err(|e| {
        CryptoError::Encryption {
            reason: e.to_string(),
        }
    })?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok(EncryptedPayload {
        ciphertext,
        iv: BASE64.encode(iv),
    })
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// # Errors
///
/// - [`CryptoError::InvalidIv`] if `iv` is not base64 for exactly 16 bytes.
/// - [`CryptoError::Decryption`] if the ciphertext is not whole blocks or the
///   padding does not verify (wrong key, wrong IV, or corrupted data).
pub fn decrypt(ciphertext: &[u8], org_key: &str, iv: &str) -> Result<Vec<u8>, CryptoError> {
    let iv_bytes = BASE64.decode(iv.trim()).map_err(|e| CryptoError::InvalidIv {
        reason: e.to_string(),
    })?;
    if iv_bytes.len() != IV_LEN {
        return Err(CryptoError::InvalidIv {
            reason: format!("expected {IV_LEN} bytes, got {}", iv_bytes.len()),
        });
    }
    if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
        return Err(CryptoError::Decryption {
            reason: format!(
                "ciphertext length {} is not a positive multiple of {IV_LEN}",
                ciphertext.len()
            ),
        });
    }

    let key = CipherKey::from_org_key(org_key);
    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), &iv_bytes).map_err(|e| {
        CryptoError::Decryption {
            reason: e.to_string(),
        }
    })?;

    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decryption {
            reason: "padding check failed (wrong key or iv)".to_owned(),
        })
}
