//! Elliptic-curve key types and the key-agreement oracle interface.
//!
//! The ebox model addresses every recipient by an EC public key whose
//! private half normally lives on a hardware token. The core never touches
//! private key material directly; every unseal operation goes through the
//! [`KeyAgreement`] capability, which a hardware backend implements by
//! performing ECDH on the device. [`EcKeyPair`] is the in-software
//! implementation, used for requester-side ephemeral keys and in tests.

use crate::constants::EC_POINT_SIZE;
use crate::errors::{CryptoError, Result};
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};
use zeroize::Zeroizing;

/// Elliptic curves usable for ebox recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    /// Curve25519 / X25519
    Curve25519,
}

impl EcCurve {
    /// Wire name of the curve, as carried in serialized public keys.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Curve25519 => "curve25519",
        }
    }

    /// Resolve a wire name to a curve.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "curve25519" => Ok(Self::Curve25519),
            other => Err(CryptoError::UnsupportedCurve(other.to_string())),
        }
    }

    /// Length in bytes of a public key point on this curve.
    pub fn point_size(&self) -> usize {
        match self {
            Self::Curve25519 => EC_POINT_SIZE,
        }
    }
}

/// An EC public key: the identity of an ebox recipient.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EcPublicKey {
    curve: EcCurve,
    point: [u8; EC_POINT_SIZE],
}

impl EcPublicKey {
    /// Construct from a curve and raw point bytes.
    pub fn from_point(curve: EcCurve, point: &[u8]) -> Result<Self> {
        if point.len() != curve.point_size() {
            return Err(CryptoError::InvalidPoint {
                expected: curve.point_size(),
                actual: point.len(),
            });
        }
        let mut bytes = [0u8; EC_POINT_SIZE];
        bytes.copy_from_slice(point);
        Ok(Self {
            curve,
            point: bytes,
        })
    }

    /// The curve this key lives on.
    pub fn curve(&self) -> EcCurve {
        self.curve
    }

    /// Raw point bytes.
    pub fn point(&self) -> &[u8] {
        &self.point
    }
}

impl std::fmt::Debug for EcPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EcPublicKey({}:{})", self.curve.name(), hex::encode(self.point))
    }
}

/// Capability interface for ECDH key agreement.
///
/// `agree` returns the shared secret between the private key the provider
/// holds for `recipient` and the supplied `ephemeral` public key. A hardware
/// backend implements this by asking the device to perform the agreement;
/// the private key never crosses the interface. Implementations may block
/// indefinitely on device I/O or PIN entry; cancellation surfaces as an
/// error return.
pub trait KeyAgreement {
    /// Perform ECDH between the resident private key for `recipient` and
    /// `ephemeral`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoMatchingKey`] when the provider has no private key
    /// for `recipient`.
    fn agree(&self, recipient: &EcPublicKey, ephemeral: &EcPublicKey) -> Result<Zeroizing<[u8; 32]>>;
}

/// An in-software X25519 key pair.
///
/// Stands in for a hardware token wherever a private key is legitimately
/// held in memory: requester-side challenge ephemerals, and test recipients.
pub struct EcKeyPair {
    secret: X25519Secret,
    public: EcPublicKey,
}

impl EcKeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng()
            .try_fill_bytes(seed.as_mut())
            .map_err(|e| CryptoError::RandomFailed(e.to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Construct deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = X25519Secret::from(*seed);
        let public_point = X25519Public::from(&secret);
        let public = EcPublicKey {
            curve: EcCurve::Curve25519,
            point: *public_point.as_bytes(),
        };
        Self { secret, public }
    }

    /// The public half of this key pair.
    pub fn public_key(&self) -> &EcPublicKey {
        &self.public
    }

    /// Raw Diffie-Hellman against another public key.
    pub fn diffie_hellman(&self, their_public: &EcPublicKey) -> Zeroizing<[u8; 32]> {
        let point = X25519Public::from(
            <[u8; 32]>::try_from(their_public.point()).expect("point is 32 bytes"),
        );
        Zeroizing::new(*self.secret.diffie_hellman(&point).as_bytes())
    }
}

impl Clone for EcKeyPair {
    fn clone(&self) -> Self {
        Self {
            secret: X25519Secret::from(self.secret.to_bytes()),
            public: self.public.clone(),
        }
    }
}

impl std::fmt::Debug for EcKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the secret half.
        f.debug_struct("EcKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl KeyAgreement for EcKeyPair {
    fn agree(&self, recipient: &EcPublicKey, ephemeral: &EcPublicKey) -> Result<Zeroizing<[u8; 32]>> {
        if recipient != &self.public {
            return Err(CryptoError::NoMatchingKey);
        }
        Ok(self.diffie_hellman(ephemeral))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_keys() {
        let a = EcKeyPair::generate().unwrap();
        let b = EcKeyPair::generate().unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = EcKeyPair::from_seed(&[7u8; 32]);
        let b = EcKeyPair::from_seed(&[7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_diffie_hellman_agrees() {
        let a = EcKeyPair::from_seed(&[1u8; 32]);
        let b = EcKeyPair::from_seed(&[2u8; 32]);

        let ab = a.diffie_hellman(b.public_key());
        let ba = b.diffie_hellman(a.public_key());
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_agree_rejects_foreign_recipient() {
        let holder = EcKeyPair::from_seed(&[3u8; 32]);
        let other = EcKeyPair::from_seed(&[4u8; 32]);
        let ephemeral = EcKeyPair::from_seed(&[5u8; 32]);

        let err = holder
            .agree(other.public_key(), ephemeral.public_key())
            .unwrap_err();
        assert_eq!(err, CryptoError::NoMatchingKey);

        assert!(holder
            .agree(holder.public_key(), ephemeral.public_key())
            .is_ok());
    }

    #[test]
    fn test_point_length_validation() {
        let err = EcPublicKey::from_point(EcCurve::Curve25519, &[0u8; 31]).unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidPoint {
                expected: 32,
                actual: 31
            }
        );
    }

    #[test]
    fn test_curve_name_roundtrip() {
        let curve = EcCurve::Curve25519;
        assert_eq!(EcCurve::from_name(curve.name()).unwrap(), curve);
        assert!(EcCurve::from_name("nistp521").is_err());
    }
}
