//! Key derivation using HKDF-SHA256.

use crate::errors::{CryptoError, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Derive key material using HKDF-SHA256.
///
/// # Arguments
///
/// * `ikm` - Input key material
/// * `info` - Domain separation string and context
/// * `output_len` - Length of output key material
pub fn hkdf_derive(ikm: &[u8], info: &[u8], output_len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut output = Zeroizing::new(vec![0u8; output_len]);

    hkdf.expand(info, &mut output)
        .map_err(|_| CryptoError::KdfFailed)?;

    Ok(output)
}

/// Derive a 32-byte key using HKDF-SHA256.
///
/// This is the common case for AEAD keys and returns a fixed-size array.
pub fn hkdf_derive_32(ikm: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let output = hkdf_derive(ikm, info, 32)?;
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&output);
    Ok(key)
}
