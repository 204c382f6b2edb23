//! ECDH + AEAD envelopes addressed to a recipient public key.
//!
//! A [`SealedBox`] is the unit of encryption everywhere in the ebox model:
//! master keys and shares are sealed to token holders, challenges are sealed
//! to parts, and responses are sealed back to the requester's ephemeral key.
//!
//! Sealing needs only the recipient's public key. Unsealing needs the
//! private half, which normally lives on a hardware token, so it goes
//! through the [`KeyAgreement`] capability; the recovered plaintext is
//! retained inside the box in secret memory until the box is dropped.

use crate::codec::{Decoder, Encoder};
use crate::errors::{Error, Result};
use ebox_crypto::{
    aead_decrypt, aead_encrypt, generate_random_bytes, hkdf_derive_32, EcKeyPair, EcPublicKey,
    KeyAgreement, SecretBuf, AEAD_NONCE_SIZE, DOMAIN_SEALED_BOX_AAD, DOMAIN_SEALED_BOX_KDF,
};

/// Wire version of sealed boxes.
pub const SEALED_BOX_VERSION: u8 = 1;

/// KDF identifier: HKDF-SHA256.
pub const KDF_HKDF_SHA256: u8 = 1;

/// AEAD identifier: ChaCha20-Poly1305.
pub const AEAD_CHACHA20_POLY1305: u8 = 1;

/// Upper bound on sealed-box ciphertext length.
pub const MAX_CIPHERTEXT_LEN: usize = 1 << 24;

/// An encrypted envelope to a recipient EC public key.
pub struct SealedBox {
    recipient: EcPublicKey,
    ephemeral: EcPublicKey,
    nonce: [u8; AEAD_NONCE_SIZE],
    ciphertext: Vec<u8>,
    // Transient decrypt-time state; never serialized, never cloned.
    plaintext: Option<SecretBuf>,
}

impl SealedBox {
    /// Seal `plaintext` to `recipient`.
    ///
    /// Generates an ephemeral X25519 key pair, performs ECDH against the
    /// recipient key, derives the AEAD key with HKDF-SHA256 over the two
    /// public keys, and encrypts under a random 12-byte nonce. No external
    /// device is involved.
    pub fn seal(recipient: &EcPublicKey, plaintext: &[u8]) -> Result<Self> {
        if plaintext.len() + ebox_crypto::AEAD_TAG_SIZE > MAX_CIPHERTEXT_LEN {
            return Err(Error::InvalidArg(format!(
                "plaintext too large for a sealed box: {} bytes",
                plaintext.len()
            )));
        }

        let ephemeral_pair = EcKeyPair::generate()?;
        let shared = ephemeral_pair.diffie_hellman(recipient);
        let key = derive_box_key(&shared[..], ephemeral_pair.public_key(), recipient)?;
        let nonce: [u8; AEAD_NONCE_SIZE] = generate_random_bytes()?;
        let ciphertext = aead_encrypt(&key, &nonce, plaintext, DOMAIN_SEALED_BOX_AAD)?;

        Ok(Self {
            recipient: recipient.clone(),
            ephemeral: ephemeral_pair.public_key().clone(),
            nonce,
            ciphertext,
            plaintext: None,
        })
    }

    /// Unseal the box through a key-agreement provider, retaining the
    /// plaintext in secret memory.
    ///
    /// # Errors
    ///
    /// [`Error::NoKey`] when the provider holds no key for the box's
    /// recipient; [`Error::AuthFailed`] when the AEAD tag does not verify.
    pub fn unseal(&mut self, provider: &dyn KeyAgreement) -> Result<()> {
        let shared = provider.agree(&self.recipient, &self.ephemeral)?;
        let key = derive_box_key(&shared[..], &self.ephemeral, &self.recipient)?;
        let plaintext = aead_decrypt(&key, &self.nonce, &self.ciphertext, DOMAIN_SEALED_BOX_AAD)?;
        self.plaintext = Some(SecretBuf::from_slice(&plaintext));
        Ok(())
    }

    /// The recovered plaintext, if the box has been unsealed.
    pub fn plaintext(&self) -> Option<&SecretBuf> {
        self.plaintext.as_ref()
    }

    /// Take the recovered plaintext out of the box.
    pub fn take_plaintext(&mut self) -> Option<SecretBuf> {
        self.plaintext.take()
    }

    /// Whether the box currently holds its plaintext.
    pub fn is_unsealed(&self) -> bool {
        self.plaintext.is_some()
    }

    /// The recipient this box is addressed to.
    pub fn recipient(&self) -> &EcPublicKey {
        &self.recipient
    }

    /// The sealer's ephemeral public key.
    pub fn ephemeral(&self) -> &EcPublicKey {
        &self.ephemeral
    }

    /// The encrypted payload, tag included.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Serialize the sealed form. Plaintext state is never written.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_u8(SEALED_BOX_VERSION);
        enc.put_u8(KDF_HKDF_SHA256);
        enc.put_u8(AEAD_CHACHA20_POLY1305);
        enc.put_pubkey(&self.recipient)?;
        enc.put_pubkey(&self.ephemeral)?;
        enc.put_bytes(&self.nonce)?;
        enc.put_bytes(&self.ciphertext)
    }

    /// Serialize to a standalone byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes())
    }

    /// Parse a sealed box.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let version = dec.get_u8()?;
        if version != SEALED_BOX_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let kdf = dec.get_u8()?;
        if kdf != KDF_HKDF_SHA256 {
            return Err(Error::InvalidFormat(format!("unknown KDF id {kdf}")));
        }
        let aead = dec.get_u8()?;
        if aead != AEAD_CHACHA20_POLY1305 {
            return Err(Error::InvalidFormat(format!("unknown AEAD id {aead}")));
        }
        let recipient = dec.get_pubkey()?;
        let ephemeral = dec.get_pubkey()?;
        let nonce_bytes = dec.get_bytes()?;
        let nonce: [u8; AEAD_NONCE_SIZE] = nonce_bytes
            .try_into()
            .map_err(|_| Error::InvalidFormat(format!("nonce must be {AEAD_NONCE_SIZE} bytes")))?;
        let ciphertext = dec.get_bytes()?;
        if ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(Error::InvalidFormat("ciphertext exceeds 2^24 bytes".to_string()));
        }

        Ok(Self {
            recipient,
            ephemeral,
            nonce,
            ciphertext: ciphertext.to_vec(),
            plaintext: None,
        })
    }

    /// Parse from a standalone byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let sealed = Self::decode(&mut dec)?;
        if !dec.is_empty() {
            return Err(Error::InvalidFormat("trailing bytes after sealed box".to_string()));
        }
        Ok(sealed)
    }
}

impl Clone for SealedBox {
    /// Cloning yields the sealed form; unsealed plaintext is not carried
    /// over.
    fn clone(&self) -> Self {
        Self {
            recipient: self.recipient.clone(),
            ephemeral: self.ephemeral.clone(),
            nonce: self.nonce,
            ciphertext: self.ciphertext.clone(),
            plaintext: None,
        }
    }
}

impl std::fmt::Debug for SealedBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedBox")
            .field("recipient", &self.recipient)
            .field("ciphertext_len", &self.ciphertext.len())
            .field("unsealed", &self.is_unsealed())
            .finish()
    }
}

fn derive_box_key(
    shared: &[u8],
    ephemeral: &EcPublicKey,
    recipient: &EcPublicKey,
) -> Result<zeroize::Zeroizing<[u8; 32]>> {
    let mut info = Vec::with_capacity(DOMAIN_SEALED_BOX_KDF.len() + 64);
    info.extend_from_slice(DOMAIN_SEALED_BOX_KDF);
    info.extend_from_slice(ephemeral.point());
    info.extend_from_slice(recipient.point());
    Ok(hkdf_derive_32(shared, &info)?)
}
