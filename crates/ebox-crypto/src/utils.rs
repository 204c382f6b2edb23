//! Common utility functions for ebox cryptographic operations.

use crate::errors::{CryptoError, Result};
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in seconds.
///
/// # Panics
///
/// Panics if the system time is set before the Unix epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before Unix epoch")
        .as_secs()
}

/// Fill a fixed-size array from the system CSPRNG.
///
/// # Example
///
/// ```
/// use ebox_crypto::generate_random_bytes;
///
/// let nonce: [u8; 12] = generate_random_bytes().unwrap();
/// let key: [u8; 32] = generate_random_bytes().unwrap();
/// ```
pub fn generate_random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    rand::thread_rng()
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::RandomFailed(e.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_timestamp_is_reasonable() {
        let ts = current_timestamp();
        assert!(ts > 1_600_000_000, "timestamp should be after Sep 2020");
    }

    #[test]
    fn test_generate_random_bytes_different() {
        let a: [u8; 32] = generate_random_bytes().unwrap();
        let b: [u8; 32] = generate_random_bytes().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_random_bytes_sizes() {
        let _small: [u8; 12] = generate_random_bytes().unwrap();
        let _medium: [u8; 16] = generate_random_bytes().unwrap();
        let _large: [u8; 32] = generate_random_bytes().unwrap();
    }
}
