//! Interactive challenge/response for k-of-n recovery.
//!
//! To recover a part remotely, the requester generates a [`Challenge`]
//! carrying a fresh ephemeral public key, a nonce, and four verification
//! words derived from that nonce, then seals it to the part's recipient.
//! The holder unseals the envelope on their token, reads the words back to
//! the requester over a voice channel, unseals the share box carried inside
//! the challenge, and seals the share to the requester's ephemeral key. The
//! requester matches the incoming response to the outstanding challenge by
//! its recipient key and stores the revealed share on the part.

use crate::codec::{Decoder, Encoder};
use crate::ebox::Ebox;
use crate::errors::{Error, Result};
use crate::sealedbox::SealedBox;
use crate::template::ConfigKind;
use ebox_crypto::{
    challenge_words, current_timestamp, generate_random_bytes, EcKeyPair, EcPublicKey,
    KeyAgreement, KeyShare, CHALLENGE_NONCE_SIZE, CHALLENGE_WORD_COUNT,
};
use tracing::debug;
use zeroize::Zeroizing;

/// Challenge wire version.
pub const CHALLENGE_VERSION: u8 = 1;

// Challenge TLV tags.
const CHAL_TAG_HOSTNAME: u8 = 1;
const CHAL_TAG_CTIME: u8 = 2;
const CHAL_TAG_DESCRIPTION: u8 = 3;
const CHAL_TAG_WORDS: u8 = 4;
const CHAL_TAG_NONCE: u8 = 5;
const CHAL_TAG_DESTKEY: u8 = 6;
const CHAL_TAG_KEYBOX: u8 = 7;

// Response payload TLV tags.
const RESP_TAG_ID: u8 = 1;
const RESP_TAG_KEYPIECE: u8 = 2;

/// What a challenge is asking the holder to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Reveal the part's share to complete a recovery.
    Recovery,
    /// Prove the part's box is intact and its holder reachable.
    VerifyAudit,
}

impl ChallengeKind {
    fn to_wire(self) -> u8 {
        match self {
            Self::Recovery => 1,
            Self::VerifyAudit => 2,
        }
    }

    fn from_wire(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Recovery),
            2 => Ok(Self::VerifyAudit),
            other => Err(Error::InvalidFormat(format!("unknown challenge type {other}"))),
        }
    }
}

/// Requester-side record of an outstanding challenge.
#[derive(Debug, Clone)]
pub(crate) struct ChallengeState {
    pub(crate) id: u8,
    pub(crate) ephemeral: EcKeyPair,
    pub(crate) words: [String; CHALLENGE_WORD_COUNT],
}

/// A recovery challenge, as sent to a part's holder.
#[derive(Debug, Clone)]
pub struct Challenge {
    id: u8,
    kind: ChallengeKind,
    description: String,
    hostname: String,
    created_at: u64,
    words: [String; CHALLENGE_WORD_COUNT],
    nonce: [u8; CHALLENGE_NONCE_SIZE],
    destkey: EcPublicKey,
    keybox: SealedBox,
}

impl Challenge {
    /// Challenge id; unique and dense from 1 within one configuration.
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn kind(&self) -> ChallengeKind {
        self.kind
    }

    /// Operator-facing description of why this challenge was generated.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Hostname of the requesting machine, as supplied by the requester.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Unix timestamp of challenge generation.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The four verification words to read over a voice channel.
    pub fn words(&self) -> &[String; CHALLENGE_WORD_COUNT] {
        &self.words
    }

    pub fn nonce(&self) -> &[u8; CHALLENGE_NONCE_SIZE] {
        &self.nonce
    }

    /// The requester's ephemeral public key; responses are sealed to it.
    pub fn destkey(&self) -> &EcPublicKey {
        &self.destkey
    }

    /// The part's sealed share box, carried so the holder can unseal it
    /// next to the envelope.
    pub fn keybox(&self) -> &SealedBox {
        &self.keybox
    }

    /// Serialize the challenge record.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_u8(CHALLENGE_VERSION);
        enc.put_u8(self.kind.to_wire());
        enc.put_u8(self.id);

        enc.put_field(CHAL_TAG_HOSTNAME, self.hostname.as_bytes())?;
        let mut ctime = Encoder::new();
        ctime.put_u64(self.created_at);
        enc.put_field(CHAL_TAG_CTIME, ctime.as_slice())?;
        enc.put_field(CHAL_TAG_DESCRIPTION, self.description.as_bytes())?;

        let mut words = Encoder::new();
        for word in &self.words {
            words.put_string(word)?;
        }
        enc.put_field(CHAL_TAG_WORDS, words.as_slice())?;

        enc.put_field(CHAL_TAG_NONCE, &self.nonce)?;

        let mut destkey = Encoder::new();
        destkey.put_pubkey(&self.destkey)?;
        enc.put_field(CHAL_TAG_DESTKEY, destkey.as_slice())?;

        enc.put_field(CHAL_TAG_KEYBOX, &self.keybox.to_bytes()?)?;
        enc.put_end();
        Ok(())
    }

    /// Serialize to a standalone byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes())
    }

    /// Parse a challenge record.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let version = dec.get_u8()?;
        if version != CHALLENGE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let kind = ChallengeKind::from_wire(dec.get_u8()?)?;
        let id = dec.get_u8()?;

        let mut hostname = String::new();
        let mut created_at = 0u64;
        let mut description = String::new();
        let mut words: Option<[String; CHALLENGE_WORD_COUNT]> = None;
        let mut nonce: Option<[u8; CHALLENGE_NONCE_SIZE]> = None;
        let mut destkey = None;
        let mut keybox = None;

        while let Some((tag, value)) = dec.next_field()? {
            match tag {
                CHAL_TAG_HOSTNAME => {
                    hostname = std::str::from_utf8(value)
                        .map_err(|_| Error::InvalidFormat("hostname is not UTF-8".to_string()))?
                        .to_string();
                }
                CHAL_TAG_CTIME => {
                    created_at = Decoder::new(value).get_u64()?;
                }
                CHAL_TAG_DESCRIPTION => {
                    description = std::str::from_utf8(value)
                        .map_err(|_| Error::InvalidFormat("description is not UTF-8".to_string()))?
                        .to_string();
                }
                CHAL_TAG_WORDS => {
                    let mut word_dec = Decoder::new(value);
                    let mut list = Vec::with_capacity(CHALLENGE_WORD_COUNT);
                    for _ in 0..CHALLENGE_WORD_COUNT {
                        list.push(word_dec.get_string()?);
                    }
                    words = Some(
                        list.try_into()
                            .expect("exactly CHALLENGE_WORD_COUNT words were read"),
                    );
                }
                CHAL_TAG_NONCE => {
                    nonce = Some(value.try_into().map_err(|_| {
                        Error::InvalidFormat(format!(
                            "challenge nonce must be {CHALLENGE_NONCE_SIZE} bytes"
                        ))
                    })?);
                }
                CHAL_TAG_DESTKEY => {
                    destkey = Some(Decoder::new(value).get_pubkey()?);
                }
                CHAL_TAG_KEYBOX => {
                    keybox = Some(SealedBox::from_bytes(value)?);
                }
                // Unknown tags are skipped for forward compatibility.
                _ => {}
            }
        }

        let nonce = nonce
            .ok_or_else(|| Error::InvalidFormat("challenge is missing its nonce".to_string()))?;
        let destkey = destkey.ok_or_else(|| {
            Error::InvalidFormat("challenge is missing its destination key".to_string())
        })?;
        let keybox = keybox
            .ok_or_else(|| Error::InvalidFormat("challenge is missing its keybox".to_string()))?;
        let words = words.unwrap_or_else(|| challenge_words(&nonce));

        Ok(Self {
            id,
            kind,
            description,
            hostname,
            created_at,
            words,
            nonce,
            destkey,
            keybox,
        })
    }

    /// Wrap the serialized challenge in a sealed box to the part's
    /// recipient, ready for transport.
    pub fn seal(&self) -> Result<SealedBox> {
        SealedBox::seal(self.keybox.recipient(), &self.to_bytes()?)
    }

    /// Parse a challenge out of an unsealed transport envelope.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the envelope has not been unsealed yet.
    pub fn from_sealed(envelope: &SealedBox) -> Result<Self> {
        let plaintext = envelope.plaintext().ok_or_else(|| {
            Error::InvalidState("challenge envelope has not been unsealed".to_string())
        })?;
        let mut dec = Decoder::new(plaintext.as_slice());
        let challenge = Self::decode(&mut dec)?;
        if !dec.is_empty() {
            return Err(Error::InvalidFormat(
                "trailing bytes after challenge".to_string(),
            ));
        }
        Ok(challenge)
    }

    /// Holder side: unseal the carried share box through `provider` and
    /// seal the share to the requester's ephemeral key.
    ///
    /// The returned box is the response, ready for transport back to the
    /// requesting machine.
    pub fn respond(&self, provider: &dyn KeyAgreement) -> Result<SealedBox> {
        let mut keybox = self.keybox.clone();
        keybox.unseal(provider)?;
        let share = keybox
            .take_plaintext()
            .expect("keybox was just unsealed");

        let mut payload = Encoder::new();
        payload.put_field(RESP_TAG_ID, &[self.id])?;
        payload.put_field(RESP_TAG_KEYPIECE, share.as_slice())?;
        payload.put_end();
        let payload = Zeroizing::new(payload.into_bytes());

        SealedBox::seal(&self.destkey, &payload)
    }
}

impl Ebox {
    /// Generate a recovery challenge for one part of a recovery
    /// configuration.
    ///
    /// The returned challenge is sealed for transport with
    /// [`Challenge::seal`]; the requester's ephemeral private key is kept on
    /// the part so the matching response can be opened later.
    pub fn gen_challenge(
        &mut self,
        config_idx: usize,
        part_idx: usize,
        description: &str,
        hostname: &str,
    ) -> Result<Challenge> {
        self.gen_challenge_kind(ChallengeKind::Recovery, config_idx, part_idx, description, hostname)
    }

    /// Generate a verify-audit challenge: same mechanics as a recovery
    /// challenge, but flagged so the holder knows no recovery is underway.
    pub fn gen_audit_challenge(
        &mut self,
        config_idx: usize,
        part_idx: usize,
        description: &str,
        hostname: &str,
    ) -> Result<Challenge> {
        self.gen_challenge_kind(
            ChallengeKind::VerifyAudit,
            config_idx,
            part_idx,
            description,
            hostname,
        )
    }

    fn gen_challenge_kind(
        &mut self,
        kind: ChallengeKind,
        config_idx: usize,
        part_idx: usize,
        description: &str,
        hostname: &str,
    ) -> Result<Challenge> {
        if description.len() > 255 {
            return Err(Error::InvalidArg("description too long".to_string()));
        }
        if hostname.len() > 255 {
            return Err(Error::InvalidArg("hostname too long".to_string()));
        }

        let config = self
            .config_mut(config_idx)
            .ok_or_else(|| Error::InvalidArg(format!("no configuration {config_idx}")))?;
        if config.kind() != ConfigKind::Recovery {
            return Err(Error::InvalidArg(
                "challenges apply to recovery configurations only".to_string(),
            ));
        }
        let part = config
            .part_mut(part_idx)
            .ok_or_else(|| Error::InvalidArg(format!("no part {part_idx}")))?;
        if part.is_fulfilled() {
            return Err(Error::Again);
        }

        let id = (part_idx + 1) as u8;
        let ephemeral = EcKeyPair::generate()?;
        let nonce: [u8; CHALLENGE_NONCE_SIZE] = generate_random_bytes()?;
        let words = challenge_words(&nonce);

        let challenge = Challenge {
            id,
            kind,
            description: description.to_string(),
            hostname: hostname.to_string(),
            created_at: current_timestamp(),
            words: words.clone(),
            nonce,
            destkey: ephemeral.public_key().clone(),
            keybox: part.sealed_box().clone(),
        };

        part.challenge = Some(ChallengeState {
            id,
            ephemeral,
            words,
        });

        debug!(config = config_idx, part = part_idx, "generated challenge");
        Ok(challenge)
    }

    /// The verification words of the outstanding challenge on a part, for
    /// the requester to compare over the voice channel.
    pub fn challenge_words(
        &self,
        config_idx: usize,
        part_idx: usize,
    ) -> Option<&[String; CHALLENGE_WORD_COUNT]> {
        self.configs()
            .get(config_idx)?
            .parts()
            .get(part_idx)?
            .challenge
            .as_ref()
            .map(|s| &s.words)
    }

    /// Process an incoming response to an outstanding challenge.
    ///
    /// The response is matched to its challenge by the recipient key of
    /// `respbox`; on success the revealed share is stored on the part and
    /// the part index is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] when no outstanding challenge matches;
    /// - [`Error::Again`] when the matched part is already fulfilled;
    /// - [`Error::AuthFailed`] when the response fails to decrypt or its id
    ///   does not match the outstanding challenge.
    pub fn process_response(&mut self, config_idx: usize, mut respbox: SealedBox) -> Result<usize> {
        let config = self
            .config_mut(config_idx)
            .ok_or_else(|| Error::InvalidArg(format!("no configuration {config_idx}")))?;

        let mut matched = None;
        for (idx, part) in config.parts().iter().enumerate() {
            if let Some(state) = &part.challenge {
                if state.ephemeral.public_key() == respbox.recipient() {
                    matched = Some((idx, state.id, state.ephemeral.clone()));
                    break;
                }
            }
        }
        let (part_idx, expected_id, ephemeral) = matched.ok_or_else(|| {
            Error::InvalidState("no outstanding challenge matches this response".to_string())
        })?;

        if config.parts()[part_idx].is_fulfilled() {
            return Err(Error::Again);
        }

        respbox.unseal(&ephemeral)?;
        let plaintext = respbox
            .take_plaintext()
            .expect("response box was just unsealed");

        let mut id = None;
        let mut keypiece = None;
        let mut dec = Decoder::new(plaintext.as_slice());
        while let Some((tag, value)) = dec.next_field()? {
            match tag {
                RESP_TAG_ID => {
                    if value.len() != 1 {
                        return Err(Error::InvalidFormat(
                            "response id must be 1 byte".to_string(),
                        ));
                    }
                    id = Some(value[0]);
                }
                RESP_TAG_KEYPIECE => keypiece = Some(value.to_vec()),
                _ => {}
            }
        }

        let id =
            id.ok_or_else(|| Error::InvalidFormat("response is missing its id".to_string()))?;
        if id != expected_id {
            // The box decrypted but answers a different challenge.
            return Err(Error::AuthFailed);
        }
        let keypiece = keypiece
            .ok_or_else(|| Error::InvalidFormat("response carries no share".to_string()))?;
        let share =
            KeyShare::from_bytes(&keypiece).map_err(|e| Error::InvalidFormat(e.to_string()))?;
        if usize::from(share.index()) != part_idx + 1 {
            return Err(Error::InvalidFormat(format!(
                "share index {} does not match part {}",
                share.index(),
                part_idx + 1
            )));
        }

        let part = config.part_mut(part_idx).expect("part index was matched");
        part.set_share(share);
        debug!(config = config_idx, part = part_idx, "challenge fulfilled");
        Ok(part_idx)
    }
}
