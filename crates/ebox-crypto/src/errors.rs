//! Error types for cryptographic operations.

use std::fmt;

/// Errors produced by the primitives in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The system RNG failed to produce entropy
    RandomFailed(String),
    /// HKDF expansion failed (requested output too long)
    KdfFailed,
    /// AEAD encryption failed
    EncryptFailed,
    /// AEAD decryption failed authentication
    AuthFailed,
    /// A key-agreement provider holds no private key for the requested public key
    NoMatchingKey,
    /// The named elliptic curve is not supported
    UnsupportedCurve(String),
    /// A public key point had the wrong length for its curve
    InvalidPoint { expected: usize, actual: usize },
    /// Shamir secret splitting failed
    SplitFailed(String),
    /// Shamir secret reconstruction failed
    CombineFailed(String),
    /// A share was structurally invalid (bad index or length)
    InvalidShare(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RandomFailed(msg) => write!(f, "random generation failed: {msg}"),
            Self::KdfFailed => write!(f, "HKDF key derivation failed"),
            Self::EncryptFailed => write!(f, "AEAD encryption failed"),
            Self::AuthFailed => write!(f, "AEAD authentication failed"),
            Self::NoMatchingKey => write!(f, "provider holds no key for the requested public key"),
            Self::UnsupportedCurve(name) => write!(f, "unsupported curve: {name}"),
            Self::InvalidPoint { expected, actual } => {
                write!(f, "invalid point length: expected {expected}, got {actual}")
            }
            Self::SplitFailed(msg) => write!(f, "secret splitting failed: {msg}"),
            Self::CombineFailed(msg) => write!(f, "secret reconstruction failed: {msg}"),
            Self::InvalidShare(msg) => write!(f, "invalid share: {msg}"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, CryptoError>;
