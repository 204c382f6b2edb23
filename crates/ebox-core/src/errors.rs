//! Error types for ebox operations.

use ebox_crypto::CryptoError;
use std::fmt;

/// Errors produced by ebox operations.
///
/// Unseal failures (`NoKey`, `AuthFailed`) are recoverable by trying another
/// part or configuration; `Corrupt` is terminal for the attempt that raised
/// it. The library never retries internally.
#[derive(Debug, Clone)]
pub enum Error {
    /// Malformed serialized input
    InvalidFormat(String),
    /// Version field beyond what this implementation understands
    UnsupportedVersion(u8),
    /// Violated precondition (threshold out of range, empty key, ...)
    InvalidArg(String),
    /// Operation not legal in the object's current state
    InvalidState(String),
    /// AEAD tag mismatch
    AuthFailed,
    /// No provider key material matches the requested recipient
    NoKey,
    /// Fewer than threshold shares available for recovery
    Insufficient {
        /// Shares required by the configuration threshold
        needed: usize,
        /// Shares currently revealed
        have: usize,
    },
    /// An integrity-checked payload failed to verify
    Corrupt(String),
    /// The part or configuration is already satisfied
    Again,
    /// RNG or primitive failure
    Crypto(CryptoError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat(msg) => write!(f, "invalid format: {msg}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
            Self::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::NoKey => write!(f, "no matching key available"),
            Self::Insufficient { needed, have } => {
                write!(f, "insufficient shares: need {needed}, have {have}")
            }
            Self::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Self::Again => write!(f, "already satisfied"),
            Self::Crypto(e) => write!(f, "cryptographic failure: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Crypto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::NoMatchingKey => Self::NoKey,
            CryptoError::AuthFailed => Self::AuthFailed,
            other => Self::Crypto(other),
        }
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
