//! Authenticated encryption with ChaCha20-Poly1305.

use crate::constants::{AEAD_KEY_SIZE, AEAD_NONCE_SIZE};
use crate::errors::{CryptoError, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroizing;

/// Encrypt `plaintext` under `key` with the given nonce and additional data.
///
/// The returned ciphertext carries the 16-byte Poly1305 tag at its end.
pub fn aead_encrypt(
    key: &[u8; AEAD_KEY_SIZE],
    nonce: &[u8; AEAD_NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptFailed)
}

/// Decrypt and authenticate `ciphertext`.
///
/// # Errors
///
/// [`CryptoError::AuthFailed`] when the tag does not verify; no plaintext is
/// ever returned in that case.
pub fn aead_decrypt(
    key: &[u8; AEAD_KEY_SIZE],
    nonce: &[u8; AEAD_NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AuthFailed)
}
