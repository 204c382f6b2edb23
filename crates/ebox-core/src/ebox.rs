//! Sealed key-escrow containers.
//!
//! An [`Ebox`] is a sealed instantiation of a template: the master key is
//! sealed directly to every primary part, while each recovery configuration
//! gets a fresh intermediate recovery key that encrypts the master key (and
//! optional token) and is Shamir-split into one sealed share per part.
//!
//! Unlock-time state — which boxes have been unsealed, which shares have
//! been revealed by challenge responses, the recovered key itself — is
//! transient: it is never serialized and is reset by `clone`.

use crate::challenge::ChallengeState;
use crate::codec::{Decoder, Encoder};
use crate::errors::{Error, Result};
use crate::sealedbox::SealedBox;
use crate::template::{ConfigKind, EboxTemplate, PartFields, TemplateConfig, TemplatePart};
use ebox_crypto::{
    aead_decrypt, aead_encrypt, combine_shares, generate_random_bytes, split_secret, KeyShare,
    SecretBuf, AEAD_NONCE_SIZE, DOMAIN_RECOVERY_AAD, RECOVERY_KEY_SIZE,
};
use tracing::debug;
use zeroize::Zeroizing;

/// Ebox wire magic.
pub const EBOX_MAGIC: [u8; 2] = [0xEB, 0x0C];

/// Ebox wire version.
pub const EBOX_VERSION: u8 = 2;

// Ebox part TLV tags. Tags 1-4 match the template part tags; 5 is the
// sealed box and 6 carries the slot id the template format keeps in 5.
const PART_TAG_BOX: u8 = 5;
const PART_TAG_SLOT: u8 = 6;

// Recovery payload plaintext TLV tags.
const RECOV_TAG_TOKEN: u8 = 1;
const RECOV_TAG_KEY: u8 = 2;

// Recovery payload plaintext is zero-padded to this boundary so the sealed
// length does not reveal the exact key length.
const PAYLOAD_PAD: usize = 8;

/// Sealed recovery payload: the master key and optional token encrypted
/// under a configuration's recovery key.
#[derive(Debug, Clone)]
pub struct RecoveryPayload {
    nonce: [u8; AEAD_NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl RecoveryPayload {
    pub fn nonce(&self) -> &[u8; AEAD_NONCE_SIZE] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }
}

/// One recipient slot of a sealed configuration.
#[derive(Debug)]
pub struct EboxPart {
    tpl: TemplatePart,
    sealed: SealedBox,
    share: Option<KeyShare>,
    pub(crate) challenge: Option<ChallengeState>,
}

impl EboxPart {
    /// Metadata describing this part's recipient.
    pub fn template_part(&self) -> &TemplatePart {
        &self.tpl
    }

    /// The sealed box for this part: the master key for a primary part, a
    /// recovery-key share for a recovery part.
    pub fn sealed_box(&self) -> &SealedBox {
        &self.sealed
    }

    /// Mutable access to the sealed box, for unsealing through an external
    /// key-agreement provider.
    pub fn sealed_box_mut(&mut self) -> &mut SealedBox {
        &mut self.sealed
    }

    /// Whether a recovery share has been revealed for this part.
    pub fn is_fulfilled(&self) -> bool {
        self.share.is_some()
    }

    pub(crate) fn set_share(&mut self, share: KeyShare) {
        self.share = Some(share);
    }
}

/// One sealed configuration of an ebox.
#[derive(Debug)]
pub struct EboxConfig {
    kind: ConfigKind,
    threshold: u8,
    payload: Option<RecoveryPayload>,
    parts: Vec<EboxPart>,
}

impl EboxConfig {
    pub fn kind(&self) -> ConfigKind {
        self.kind
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn parts(&self) -> &[EboxPart] {
        &self.parts
    }

    pub fn part_mut(&mut self, idx: usize) -> Option<&mut EboxPart> {
        self.parts.get_mut(idx)
    }

    /// Number of parts whose shares have been revealed.
    pub fn fulfilled_count(&self) -> usize {
        self.parts.iter().filter(|p| p.is_fulfilled()).count()
    }

    /// The sealed recovery payload of a recovery configuration.
    pub fn recovery_payload(&self) -> Option<&RecoveryPayload> {
        self.payload.as_ref()
    }

    fn clone_sealed(&self) -> Self {
        Self {
            kind: self.kind,
            threshold: self.threshold,
            payload: self.payload.clone(),
            parts: self
                .parts
                .iter()
                .map(|p| EboxPart {
                    tpl: p.tpl.clone(),
                    sealed: p.sealed.clone(),
                    share: None,
                    challenge: None,
                })
                .collect(),
        }
    }
}

/// A sealed key-escrow container.
pub struct Ebox {
    ciphertext_padding: u8,
    template: EboxTemplate,
    configs: Vec<EboxConfig>,
    key: Option<SecretBuf>,
    token: Option<SecretBuf>,
}

impl Ebox {
    /// Seal `key` (and an optional `token`) under the policy described by
    /// `tpl`.
    ///
    /// The template is deep-cloned into the ebox; later changes to `tpl` do
    /// not affect the sealed container.
    pub fn create(tpl: &EboxTemplate, key: &[u8], token: Option<&[u8]>) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::InvalidArg("key must not be empty".to_string()));
        }
        if tpl.configs().is_empty() {
            return Err(Error::InvalidArg(
                "template has no configurations".to_string(),
            ));
        }

        let (payload_plain, padding) = encode_recovery_plaintext(key, token)?;
        let mut configs = Vec::with_capacity(tpl.configs().len());

        for tcfg in tpl.configs() {
            configs.push(Self::seal_config(tcfg, key, &payload_plain[..])?);
        }

        debug!(configs = configs.len(), "sealed ebox");
        Ok(Self {
            ciphertext_padding: padding,
            template: tpl.clone(),
            configs,
            key: None,
            token: None,
        })
    }

    fn seal_config(
        tcfg: &TemplateConfig,
        key: &[u8],
        payload_plain: &[u8],
    ) -> Result<EboxConfig> {
        tcfg.validate()?;
        match tcfg.kind() {
            ConfigKind::Primary => {
                let tpart = &tcfg.parts()[0];
                let sealed = SealedBox::seal(tpart.pubkey(), key)?;
                Ok(EboxConfig {
                    kind: ConfigKind::Primary,
                    threshold: 1,
                    payload: None,
                    parts: vec![EboxPart {
                        tpl: tpart.clone(),
                        sealed,
                        share: None,
                        challenge: None,
                    }],
                })
            }
            ConfigKind::Recovery => {
                let n = tcfg.parts().len() as u8;
                let k = tcfg.threshold();

                let recovery_key: Zeroizing<[u8; RECOVERY_KEY_SIZE]> = Zeroizing::new(
                    generate_random_bytes()?,
                );
                let nonce: [u8; AEAD_NONCE_SIZE] = generate_random_bytes()?;
                let aad = recovery_aad(n, k);
                let ciphertext = aead_encrypt(&recovery_key, &nonce, payload_plain, &aad)?;

                let shares = split_secret(&recovery_key[..], n, k)?;
                let mut parts = Vec::with_capacity(tcfg.parts().len());
                for (tpart, share) in tcfg.parts().iter().zip(shares) {
                    let sealed = SealedBox::seal(tpart.pubkey(), &share.to_bytes())?;
                    parts.push(EboxPart {
                        tpl: tpart.clone(),
                        sealed,
                        share: None,
                        challenge: None,
                    });
                }

                Ok(EboxConfig {
                    kind: ConfigKind::Recovery,
                    threshold: k,
                    payload: Some(RecoveryPayload { nonce, ciphertext }),
                    parts,
                })
            }
        }
    }

    /// The template snapshot embedded at sealing time.
    pub fn template(&self) -> &EboxTemplate {
        &self.template
    }

    pub fn configs(&self) -> &[EboxConfig] {
        &self.configs
    }

    pub fn config_mut(&mut self, idx: usize) -> Option<&mut EboxConfig> {
        self.configs.get_mut(idx)
    }

    /// Zero-pad amount applied to the recovery payload plaintext.
    pub fn ciphertext_padding(&self) -> u8 {
        self.ciphertext_padding
    }

    /// Whether a master key has been recovered into this ebox.
    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    /// The recovered master key, after a successful unlock or recovery.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_ref().map(SecretBuf::as_slice)
    }

    /// The recovered token, if one was sealed and a recovery has completed.
    pub fn token(&self) -> Option<&[u8]> {
        self.token.as_ref().map(SecretBuf::as_slice)
    }

    /// Unlock through a primary configuration.
    ///
    /// At least one of the configuration's sealed boxes must already have
    /// been unsealed through an external key-agreement provider.
    pub fn unlock(&mut self, config_idx: usize) -> Result<()> {
        if self.key.is_some() {
            return Err(Error::Again);
        }
        let config = self
            .configs
            .get(config_idx)
            .ok_or_else(|| Error::InvalidArg(format!("no configuration {config_idx}")))?;
        if config.kind != ConfigKind::Primary {
            return Err(Error::InvalidArg(
                "unlock requires a primary configuration".to_string(),
            ));
        }

        for part in &config.parts {
            if let Some(plaintext) = part.sealed.plaintext() {
                if plaintext.is_empty() {
                    return Err(Error::InvalidArg("unsealed key is empty".to_string()));
                }
                self.key = Some(plaintext.clone());
                debug!(config = config_idx, "ebox unlocked via primary part");
                return Ok(());
            }
        }
        Err(Error::InvalidState(
            "no part of this primary configuration has been unsealed".to_string(),
        ))
    }

    /// Complete recovery through a recovery configuration.
    ///
    /// At least `threshold` parts must have been fulfilled with
    /// [`process_response`](Self::process_response). Candidate share subsets
    /// are tried in lexicographic part-index order, so the lowest-indexed
    /// `k` fulfilled parts decide the outcome whenever they authenticate;
    /// later subsets are consulted only when earlier ones fail to verify.
    pub fn recover(&mut self, config_idx: usize) -> Result<()> {
        if self.key.is_some() {
            return Err(Error::Again);
        }
        let config = self
            .configs
            .get(config_idx)
            .ok_or_else(|| Error::InvalidArg(format!("no configuration {config_idx}")))?;
        if config.kind != ConfigKind::Recovery {
            return Err(Error::InvalidArg(
                "recover requires a recovery configuration".to_string(),
            ));
        }
        let payload = config.payload.as_ref().ok_or_else(|| {
            Error::Corrupt("recovery configuration is missing its payload".to_string())
        })?;

        let k = usize::from(config.threshold);
        let fulfilled: Vec<usize> = config
            .parts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_fulfilled())
            .map(|(i, _)| i)
            .collect();
        if fulfilled.len() < k {
            return Err(Error::Insufficient {
                needed: k,
                have: fulfilled.len(),
            });
        }

        let aad = recovery_aad(config.parts.len() as u8, config.threshold);
        let mut recovered: Option<(SecretBuf, Option<SecretBuf>)> = None;

        for subset in Combinations::new(fulfilled.len(), k) {
            let shares: Vec<KeyShare> = subset
                .iter()
                .map(|&i| {
                    config.parts[fulfilled[i]]
                        .share
                        .clone()
                        .expect("fulfilled part has a share")
                })
                .collect();

            let recovery_key = match combine_shares(&shares, config.threshold) {
                Ok(rk) => rk,
                Err(_) => continue,
            };
            let rk_bytes: [u8; RECOVERY_KEY_SIZE] = match recovery_key[..].try_into() {
                Ok(arr) => arr,
                Err(_) => continue,
            };
            let rk_bytes = Zeroizing::new(rk_bytes);

            if let Ok(plaintext) =
                aead_decrypt(&rk_bytes, &payload.nonce, &payload.ciphertext, &aad)
            {
                recovered = Some(parse_recovery_plaintext(&plaintext[..])?);
                break;
            }
        }

        match recovered {
            Some((key, token)) => {
                self.key = Some(key);
                self.token = token;
                debug!(config = config_idx, "ebox recovered");
                Ok(())
            }
            None => Err(Error::Corrupt(
                "recovery payload failed to authenticate with the available shares".to_string(),
            )),
        }
    }

    /// Serialize the ebox in its sealed form.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_raw(&EBOX_MAGIC);
        enc.put_u8(EBOX_VERSION);
        enc.put_u8(self.ciphertext_padding);
        enc.put_u8(self.configs.len() as u8);

        for config in &self.configs {
            enc.put_u8(config.kind.to_wire());
            enc.put_u8(config.parts.len() as u8);
            enc.put_u8(config.threshold);
            if let Some(payload) = &config.payload {
                enc.put_bytes(&payload.nonce)?;
                enc.put_bytes(&payload.ciphertext)?;
            }
            for part in &config.parts {
                encode_ebox_part(part, enc)?;
            }
        }
        Ok(())
    }

    /// Serialize to a standalone byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes())
    }

    /// Parse a sealed ebox.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        dec.expect_magic(&EBOX_MAGIC)?;
        let version = dec.get_u8()?;
        if version != EBOX_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let padding = dec.get_u8()?;
        let nconfigs = dec.get_u8()? as usize;

        let mut configs = Vec::with_capacity(nconfigs);
        for _ in 0..nconfigs {
            let kind = ConfigKind::from_wire(dec.get_u8()?)?;
            let nparts = dec.get_u8()? as usize;
            let threshold = dec.get_u8()?;

            let payload = if kind == ConfigKind::Recovery {
                let nonce_bytes = dec.get_bytes()?;
                let nonce: [u8; AEAD_NONCE_SIZE] = nonce_bytes.try_into().map_err(|_| {
                    Error::InvalidFormat(format!("payload nonce must be {AEAD_NONCE_SIZE} bytes"))
                })?;
                let ciphertext = dec.get_bytes()?.to_vec();
                Some(RecoveryPayload { nonce, ciphertext })
            } else {
                None
            };

            let mut parts = Vec::with_capacity(nparts);
            for _ in 0..nparts {
                parts.push(decode_ebox_part(dec)?);
            }

            if kind == ConfigKind::Primary && (nparts != 1 || threshold != 1) {
                return Err(Error::InvalidFormat(
                    "primary configuration must hold exactly one part".to_string(),
                ));
            }
            if kind == ConfigKind::Recovery
                && (threshold == 0 || usize::from(threshold) > nparts)
            {
                return Err(Error::InvalidFormat(format!(
                    "threshold {threshold} out of range for {nparts} parts"
                )));
            }

            configs.push(EboxConfig {
                kind,
                threshold,
                payload,
                parts,
            });
        }

        let template = EboxTemplate::from_configs(
            configs
                .iter()
                .map(|c| {
                    TemplateConfig::from_raw(
                        c.kind,
                        c.threshold,
                        c.parts.iter().map(|p| p.tpl.clone()).collect(),
                    )
                })
                .collect(),
        );

        Ok(Self {
            ciphertext_padding: padding,
            template,
            configs,
            key: None,
            token: None,
        })
    }

    /// Parse from a standalone byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let ebox = Self::decode(&mut dec)?;
        if !dec.is_empty() {
            return Err(Error::InvalidFormat("trailing bytes after ebox".to_string()));
        }
        Ok(ebox)
    }
}

impl Clone for Ebox {
    /// Cloning yields the sealed form: unseal progress, revealed shares,
    /// outstanding challenges, and any recovered key are all reset.
    fn clone(&self) -> Self {
        Self {
            ciphertext_padding: self.ciphertext_padding,
            template: self.template.clone(),
            configs: self.configs.iter().map(EboxConfig::clone_sealed).collect(),
            key: None,
            token: None,
        }
    }
}

impl std::fmt::Debug for Ebox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ebox")
            .field("configs", &self.configs.len())
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

fn encode_ebox_part(part: &EboxPart, enc: &mut Encoder) -> Result<()> {
    let tpl = &part.tpl;

    let mut pk = Encoder::new();
    pk.put_pubkey(tpl.pubkey())?;
    enc.put_field(crate::template::PART_TAG_PUBKEY, pk.as_slice())?;

    if let Some(name) = tpl.name() {
        enc.put_field(crate::template::PART_TAG_NAME, name.as_bytes())?;
    }
    if let Some(cak) = tpl.card_auth_key() {
        let mut buf = Encoder::new();
        buf.put_pubkey(cak)?;
        enc.put_field(crate::template::PART_TAG_CAK, buf.as_slice())?;
    }
    if let Some(guid) = tpl.guid() {
        enc.put_field(crate::template::PART_TAG_GUID, guid.as_bytes())?;
    }
    enc.put_field(PART_TAG_BOX, &part.sealed.to_bytes()?)?;
    if let Some(slot) = tpl.slot_id() {
        enc.put_field(PART_TAG_SLOT, &[slot])?;
    }
    enc.put_end();
    Ok(())
}

fn decode_ebox_part(dec: &mut Decoder<'_>) -> Result<EboxPart> {
    let mut fields = PartFields::default();
    let mut sealed = None;

    while let Some((tag, value)) = dec.next_field()? {
        match tag {
            PART_TAG_BOX => sealed = Some(SealedBox::from_bytes(value)?),
            PART_TAG_SLOT => {
                if value.len() != 1 {
                    return Err(Error::InvalidFormat("slot id must be 1 byte".to_string()));
                }
                fields.slot_id = Some(value[0]);
            }
            other => TemplatePart::decode_field(&mut fields, other, value)?,
        }
    }

    let tpl = fields.into_part()?;
    let sealed =
        sealed.ok_or_else(|| Error::InvalidFormat("part is missing its sealed box".to_string()))?;
    Ok(EboxPart {
        tpl,
        sealed,
        share: None,
        challenge: None,
    })
}

fn recovery_aad(nparts: u8, threshold: u8) -> Vec<u8> {
    let mut aad = Vec::with_capacity(DOMAIN_RECOVERY_AAD.len() + 3);
    aad.extend_from_slice(DOMAIN_RECOVERY_AAD);
    aad.push(ConfigKind::Recovery.to_wire());
    aad.push(nparts);
    aad.push(threshold);
    aad
}

fn encode_recovery_plaintext(
    key: &[u8],
    token: Option<&[u8]>,
) -> Result<(Zeroizing<Vec<u8>>, u8)> {
    let mut enc = Encoder::new();
    if let Some(token) = token {
        enc.put_field(RECOV_TAG_TOKEN, token)?;
    }
    enc.put_field(RECOV_TAG_KEY, key)?;
    enc.put_end();

    let mut bytes = Zeroizing::new(enc.into_bytes());
    let padding = (PAYLOAD_PAD - bytes.len() % PAYLOAD_PAD) % PAYLOAD_PAD;
    bytes.extend(std::iter::repeat(0u8).take(padding));
    Ok((bytes, padding as u8))
}

fn parse_recovery_plaintext(plain: &[u8]) -> Result<(SecretBuf, Option<SecretBuf>)> {
    let mut dec = Decoder::new(plain);
    let mut key = None;
    let mut token = None;

    // Trailing zero padding reads as the END sentinel; everything after the
    // first END is ignored.
    while let Some((tag, value)) = dec
        .next_field()
        .map_err(|_| Error::Corrupt("malformed recovery payload".to_string()))?
    {
        match tag {
            RECOV_TAG_TOKEN => token = Some(SecretBuf::from_slice(value)),
            RECOV_TAG_KEY => key = Some(SecretBuf::from_slice(value)),
            _ => {}
        }
    }

    let key = key.ok_or_else(|| Error::Corrupt("recovery payload has no key".to_string()))?;
    if key.is_empty() {
        return Err(Error::Corrupt("recovery payload key is empty".to_string()));
    }
    Ok((key, token))
}

/// Lexicographic k-subset iterator over `0..m`.
struct Combinations {
    indices: Vec<usize>,
    m: usize,
    k: usize,
    done: bool,
}

impl Combinations {
    fn new(m: usize, k: usize) -> Self {
        Self {
            indices: (0..k).collect(),
            m,
            k,
            done: k > m || k == 0,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        let current = self.indices.clone();

        // Advance to the next combination, rightmost index first.
        let mut i = self.k;
        loop {
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
            if self.indices[i] < self.m - (self.k - i) {
                self.indices[i] += 1;
                for j in (i + 1)..self.k {
                    self.indices[j] = self.indices[j - 1] + 1;
                }
                break;
            }
        }
        Some(current)
    }
}
