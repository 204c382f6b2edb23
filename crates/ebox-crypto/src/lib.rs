//! # ebox-crypto
//!
//! Cryptographic primitives for the ebox key-escrow container.
//!
//! This crate carries no protocol or wire-format knowledge; it provides the
//! building blocks the `ebox-core` crate assembles into sealed boxes,
//! recovery configurations, and encrypted streams:
//!
//! - X25519 key pairs and the [`KeyAgreement`] capability used to model
//!   hardware-token ECDH oracles,
//! - ChaCha20-Poly1305 authenticated encryption with caller-supplied AAD,
//! - HKDF-SHA256 key derivation,
//! - Shamir secret sharing over GF(2⁸),
//! - secret-memory buffers that are wiped on drop and locked against swap,
//! - proquint word encoding for voice-channel challenge verification.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod constants;
pub mod errors;
pub mod kdf;
pub mod keys;
pub mod secret;
pub mod shamir;
pub mod utils;
pub mod words;

pub use aead::{aead_decrypt, aead_encrypt};
pub use constants::*;
pub use errors::{CryptoError, Result};
pub use kdf::{hkdf_derive, hkdf_derive_32};
pub use keys::{EcCurve, EcKeyPair, EcPublicKey, KeyAgreement};
pub use secret::SecretBuf;
pub use shamir::{combine_shares, split_secret, KeyShare};
pub use utils::{current_timestamp, generate_random_bytes};
pub use words::challenge_words;
