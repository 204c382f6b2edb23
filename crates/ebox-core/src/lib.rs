//! # ebox-core
//!
//! Key-escrow containers with policy-based recovery.
//!
//! An **ebox** seals a symmetric secret (typically a disk-encryption key or
//! recovery token) under a policy described by a [`template`]: any number of
//! *primary* configurations, where one hardware-token holder unlocks alone,
//! and *recovery* configurations, where `k` of `n` holders cooperate
//! through an interactive [`challenge`]/response exchange to reconstruct a
//! Shamir-split recovery key.
//!
//! The crate is a pure library: it surfaces byte buffers and typed objects,
//! with deterministic big-endian serialization for every object. Private
//! keys are never touched directly; every unseal goes through the
//! [`KeyAgreement`](ebox_crypto::KeyAgreement) capability so hardware
//! backends stay external.
//!
//! ## Typical flows
//!
//! Sealing: build an [`EboxTemplate`], call [`Ebox::create`], serialize
//! with [`Ebox::to_bytes`]. Primary unlock: parse, unseal the part's
//! [`SealedBox`] through the token, [`Ebox::unlock`], read [`Ebox::key`].
//! Recovery: [`Ebox::gen_challenge`] per part, ship each sealed challenge
//! to its holder, feed responses to [`Ebox::process_response`], then
//! [`Ebox::recover`].
//!
//! [`stream`] layers a chunked authenticated-encryption container on top:
//! the stream's session key lives in an embedded one-shot ebox.
//!
//! Objects are single-threaded; operations on distinct instances may run in
//! parallel, operations on one instance must be externally serialized.

pub mod challenge;
pub mod codec;
pub mod ebox;
pub mod errors;
pub mod sealedbox;
pub mod stream;
pub mod template;

pub use challenge::{Challenge, ChallengeKind, CHALLENGE_VERSION};
pub use codec::{Decoder, Encoder};
pub use ebox::{Ebox, EboxConfig, EboxPart, RecoveryPayload, EBOX_MAGIC, EBOX_VERSION};
pub use errors::{Error, Result};
pub use sealedbox::{SealedBox, MAX_CIPHERTEXT_LEN, SEALED_BOX_VERSION};
pub use stream::{
    EboxStream, StreamChunk, StreamMode, DEFAULT_CHUNK_SIZE, STREAM_MAGIC, STREAM_VERSION,
};
pub use template::{
    ConfigKind, EboxTemplate, TemplateConfig, TemplatePart, TEMPLATE_MAGIC, TEMPLATE_VERSION,
};

// Re-export the pieces of ebox-crypto that appear in this crate's API.
pub use ebox_crypto::{EcCurve, EcKeyPair, EcPublicKey, KeyAgreement, KeyShare, SecretBuf};
