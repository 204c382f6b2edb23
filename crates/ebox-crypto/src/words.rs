//! Proquint word encoding for challenge verification.
//!
//! A recovery challenge carries four pronounceable words derived from its
//! nonce. Requester and holder read the words to each other over a voice
//! channel; matching words tie the envelope the holder is about to answer
//! to the challenge the requester actually generated.
//!
//! Each word encodes 16 bits as consonant-vowel-consonant-vowel-consonant
//! (4+2+4+2+4 bits), so the four words cover the first 8 nonce bytes.

use crate::constants::CHALLENGE_WORD_COUNT;

const CONSONANTS: &[u8; 16] = b"bdfghjklmnprstvz";
const VOWELS: &[u8; 4] = b"aiou";

/// Encode one 16-bit value as a five-letter proquint word.
pub fn word16(v: u16) -> String {
    let c = |bits: u16| CONSONANTS[(bits & 0xf) as usize] as char;
    let o = |bits: u16| VOWELS[(bits & 0x3) as usize] as char;
    [c(v >> 12), o(v >> 10), c(v >> 6), o(v >> 4), c(v)]
        .into_iter()
        .collect()
}

/// Derive the four verification words for a challenge nonce.
///
/// # Panics
///
/// Panics if `nonce` is shorter than 8 bytes; challenge nonces are 16.
pub fn challenge_words(nonce: &[u8]) -> [String; CHALLENGE_WORD_COUNT] {
    assert!(nonce.len() >= 2 * CHALLENGE_WORD_COUNT, "nonce too short");
    std::array::from_fn(|i| {
        let v = u16::from_be_bytes([nonce[2 * i], nonce[2 * i + 1]]);
        word16(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word16_extremes() {
        assert_eq!(word16(0x0000), "babab");
        assert_eq!(word16(0xFFFF), "zuzuz");
    }

    #[test]
    fn test_words_are_deterministic() {
        let nonce = [0xAB; 16];
        assert_eq!(challenge_words(&nonce), challenge_words(&nonce));
    }

    #[test]
    fn test_different_nonces_differ() {
        let a = challenge_words(&[0x00; 16]);
        let b = challenge_words(&[0xFF; 16]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_word_shape() {
        for w in challenge_words(&[0x3C; 16]) {
            assert_eq!(w.len(), 5);
            let bytes = w.as_bytes();
            for i in [0, 2, 4] {
                assert!(CONSONANTS.contains(&bytes[i]));
            }
            for i in [1, 3] {
                assert!(VOWELS.contains(&bytes[i]));
            }
        }
    }
}
