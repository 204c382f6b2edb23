//! Cryptographic constants and domain separation strings.
//!
//! All constants here are normative for the ebox wire formats; changing any
//! of them breaks compatibility with previously sealed boxes.

/// Size of X25519 public key points in bytes
pub const EC_POINT_SIZE: usize = 32;

/// Size of ChaCha20-Poly1305 keys in bytes
pub const AEAD_KEY_SIZE: usize = 32;

/// Size of ChaCha20-Poly1305 nonces in bytes (96 bits)
pub const AEAD_NONCE_SIZE: usize = 12;

/// Size of ChaCha20-Poly1305 authentication tags in bytes (128 bits)
pub const AEAD_TAG_SIZE: usize = 16;

/// Size of the intermediate recovery key protecting a recovery payload
pub const RECOVERY_KEY_SIZE: usize = 32;

/// Size of stream session keys in bytes
pub const STREAM_KEY_SIZE: usize = 32;

/// Size of challenge nonces in bytes
pub const CHALLENGE_NONCE_SIZE: usize = 16;

/// Number of verification words derived from a challenge nonce
pub const CHALLENGE_WORD_COUNT: usize = 4;

/// Domain separation for sealed-box AEAD key derivation
pub const DOMAIN_SEALED_BOX_KDF: &[u8] = b"ebox:sealed-box-kdf:v1";

/// Domain separation for sealed-box AEAD additional data
pub const DOMAIN_SEALED_BOX_AAD: &[u8] = b"ebox:sealed-box:v1";

/// Domain separation prefix for recovery payload AEAD additional data
pub const DOMAIN_RECOVERY_AAD: &[u8] = b"ebox:recovery-payload:v1";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_correct_sizes() {
        assert_eq!(EC_POINT_SIZE, 32);
        assert_eq!(AEAD_KEY_SIZE, 32);
        assert_eq!(AEAD_NONCE_SIZE, 12);
        assert_eq!(AEAD_TAG_SIZE, 16);
        assert_eq!(CHALLENGE_NONCE_SIZE, 16);
    }

    #[test]
    fn test_domain_strings_are_versioned() {
        for d in [
            DOMAIN_SEALED_BOX_KDF,
            DOMAIN_SEALED_BOX_AAD,
            DOMAIN_RECOVERY_AAD,
        ] {
            let s = std::str::from_utf8(d).unwrap();
            assert!(s.starts_with("ebox:"), "{s} missing ebox: prefix");
            assert!(s.ends_with(":v1"), "{s} missing :v1 version tag");
        }
    }
}
