//! Shamir secret sharing over GF(2⁸).
//!
//! A recovery key is split into `n` shares with threshold `k`; any `k`
//! distinct shares reconstruct the key, fewer than `k` reveal nothing.
//! Share indices are the polynomial evaluation points and start at 1; the
//! dealer hands out indices sequentially, so share `i` belongs to part `i`
//! of a recovery configuration.

use crate::errors::{CryptoError, Result};
use sharks::{Share, Sharks};
use std::collections::HashSet;
use zeroize::Zeroizing;

/// One Shamir share of a split secret.
///
/// The byte form is `index` followed by the share data (same length as the
/// secret), which is exactly what gets sealed to a part's recipient.
#[derive(Clone)]
pub struct KeyShare {
    index: u8,
    data: Zeroizing<Vec<u8>>,
}

impl KeyShare {
    /// Construct from an index and raw share data.
    pub fn new(index: u8, data: Vec<u8>) -> Result<Self> {
        if index == 0 {
            return Err(CryptoError::InvalidShare("index cannot be 0".to_string()));
        }
        if data.is_empty() {
            return Err(CryptoError::InvalidShare("empty share data".to_string()));
        }
        Ok(Self {
            index,
            data: Zeroizing::new(data),
        })
    }

    /// Parse a share from its byte form (`index || data`).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(CryptoError::InvalidShare(format!(
                "expected at least 2 bytes, got {}",
                bytes.len()
            )));
        }
        Self::new(bytes[0], bytes[1..].to_vec())
    }

    /// Serialize to the byte form (`index || data`).
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(1 + self.data.len()));
        bytes.push(self.index);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// The share index (evaluation point), 1-based.
    pub fn index(&self) -> u8 {
        self.index
    }

    fn to_sharks_share(&self) -> Result<Share> {
        Share::try_from(self.to_bytes().as_slice())
            .map_err(|e| CryptoError::InvalidShare(e.to_string()))
    }
}

impl std::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyShare(index={}, {} bytes)", self.index, self.data.len())
    }
}

/// Split `secret` into `count` shares with the given `threshold`.
pub fn split_secret(secret: &[u8], count: u8, threshold: u8) -> Result<Vec<KeyShare>> {
    if secret.is_empty() {
        return Err(CryptoError::SplitFailed("empty secret".to_string()));
    }
    if threshold == 0 || threshold > count {
        return Err(CryptoError::SplitFailed(format!(
            "threshold {threshold} out of range for {count} shares"
        )));
    }

    let sharks = Sharks(threshold);
    let dealer = sharks.dealer(secret);
    let shares: Vec<Share> = dealer.take(count as usize).collect();

    if shares.len() != count as usize {
        return Err(CryptoError::SplitFailed(format!(
            "expected {count} shares, got {}",
            shares.len()
        )));
    }

    shares
        .iter()
        .map(|s| {
            let bytes: Vec<u8> = s.into();
            KeyShare::from_bytes(&bytes)
        })
        .collect()
}

/// Reconstruct a secret from at least `threshold` distinct shares.
pub fn combine_shares(shares: &[KeyShare], threshold: u8) -> Result<Zeroizing<Vec<u8>>> {
    if shares.len() < threshold as usize {
        return Err(CryptoError::CombineFailed(format!(
            "need {threshold} shares, have {}",
            shares.len()
        )));
    }

    let mut seen = HashSet::new();
    for share in shares {
        if !seen.insert(share.index) {
            return Err(CryptoError::CombineFailed(format!(
                "duplicate share index {}",
                share.index
            )));
        }
    }

    let sharks_shares: Vec<Share> = shares
        .iter()
        .map(|s| s.to_sharks_share())
        .collect::<Result<_>>()?;

    let sharks = Sharks(threshold);
    let secret = sharks
        .recover(&sharks_shares)
        .map_err(|e| CryptoError::CombineFailed(e.to_string()))?;

    Ok(Zeroizing::new(secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_combine_roundtrip() {
        let secret = [0xA5u8; 32];
        let shares = split_secret(&secret, 5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        let recovered = combine_shares(&shares[0..3], 3).unwrap();
        assert_eq!(&recovered[..], &secret[..]);
    }

    #[test]
    fn test_share_indices_are_sequential_from_one() {
        let shares = split_secret(&[1u8; 16], 4, 2).unwrap();
        let indices: Vec<u8> = shares.iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_any_threshold_subset_recovers() {
        let secret = b"recovery key material 32 bytes!!";
        let shares = split_secret(secret, 4, 2).unwrap();

        for i in 0..4 {
            for j in (i + 1)..4 {
                let subset = [shares[i].clone(), shares[j].clone()];
                let recovered = combine_shares(&subset, 2).unwrap();
                assert_eq!(&recovered[..], &secret[..], "subset ({i},{j})");
            }
        }
    }

    #[test]
    fn test_below_threshold_fails() {
        let shares = split_secret(&[9u8; 32], 3, 2).unwrap();
        let err = combine_shares(&shares[0..1], 2).unwrap_err();
        assert!(matches!(err, CryptoError::CombineFailed(_)));
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let shares = split_secret(&[9u8; 32], 3, 2).unwrap();
        let dup = [shares[0].clone(), shares[0].clone()];
        let err = combine_shares(&dup, 2).unwrap_err();
        assert!(matches!(err, CryptoError::CombineFailed(_)));
    }

    #[test]
    fn test_share_byte_roundtrip() {
        let shares = split_secret(&[3u8; 24], 2, 2).unwrap();
        for share in &shares {
            let bytes = share.to_bytes();
            let parsed = KeyShare::from_bytes(&bytes).unwrap();
            assert_eq!(parsed.index(), share.index());
            assert_eq!(parsed.to_bytes(), share.to_bytes());
        }
    }

    #[test]
    fn test_zero_index_rejected() {
        assert!(KeyShare::new(0, vec![1, 2, 3]).is_err());
        assert!(KeyShare::from_bytes(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        assert!(split_secret(&[1u8; 32], 3, 0).is_err());
        assert!(split_secret(&[1u8; 32], 3, 4).is_err());
    }

    #[test]
    fn test_one_of_one() {
        let secret = [0x42u8; 32];
        let shares = split_secret(&secret, 1, 1).unwrap();
        let recovered = combine_shares(&shares, 1).unwrap();
        assert_eq!(&recovered[..], &secret[..]);
    }
}
