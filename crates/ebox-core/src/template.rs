//! Recovery-policy templates.
//!
//! A template describes *who can unlock* without binding any secret: an
//! ordered list of configurations, each either primary (one token holder
//! unlocks alone) or recovery (k of n holders cooperate). Templates are
//! value types — cloning is deep, and the copy embedded in a sealed ebox is
//! an independent snapshot.

use crate::codec::{Decoder, Encoder};
use crate::errors::{Error, Result};
use ebox_crypto::EcPublicKey;
use uuid::Uuid;

/// Template wire magic.
pub const TEMPLATE_MAGIC: [u8; 2] = [0xEB, 0xDA];

/// Template wire version.
pub const TEMPLATE_VERSION: u8 = 1;

// Part TLV tags.
pub(crate) const PART_TAG_PUBKEY: u8 = 1;
pub(crate) const PART_TAG_NAME: u8 = 2;
pub(crate) const PART_TAG_CAK: u8 = 3;
pub(crate) const PART_TAG_GUID: u8 = 4;
pub(crate) const PART_TAG_SLOT: u8 = 5;

/// Whether a configuration unlocks alone or by threshold recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    /// Single-holder unlock: one part, threshold 1.
    Primary,
    /// k-of-n recovery via a Shamir-split recovery key.
    Recovery,
}

impl ConfigKind {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Primary => 1,
            Self::Recovery => 2,
        }
    }

    pub(crate) fn from_wire(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Primary),
            2 => Ok(Self::Recovery),
            other => Err(Error::InvalidFormat(format!("unknown config type {other}"))),
        }
    }
}

/// One recipient in a configuration.
///
/// Identified by the recipient's EC public key; the GUID, slot and name are
/// operator-facing metadata describing which token holds the private half.
/// Equality considers `(guid, slot_id, pubkey)` only.
#[derive(Debug, Clone)]
pub struct TemplatePart {
    pubkey: EcPublicKey,
    name: Option<String>,
    cak: Option<EcPublicKey>,
    guid: Option<Uuid>,
    slot_id: Option<u8>,
}

impl TemplatePart {
    /// Create a part addressed to `pubkey`.
    pub fn new(pubkey: EcPublicKey) -> Self {
        Self {
            pubkey,
            name: None,
            cak: None,
            guid: None,
            slot_id: None,
        }
    }

    /// Set the human-readable holder name (max 255 bytes).
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if name.len() > 255 {
            return Err(Error::InvalidArg(format!(
                "part name too long: {} bytes",
                name.len()
            )));
        }
        self.name = Some(name.to_string());
        Ok(())
    }

    /// Set the card-authentication public key of the holder's token.
    pub fn set_card_auth_key(&mut self, cak: EcPublicKey) {
        self.cak = Some(cak);
    }

    /// Set the token GUID.
    pub fn set_guid(&mut self, guid: Uuid) {
        self.guid = Some(guid);
    }

    /// Set the key slot on the token.
    pub fn set_slot_id(&mut self, slot: u8) {
        self.slot_id = Some(slot);
    }

    pub fn pubkey(&self) -> &EcPublicKey {
        &self.pubkey
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn card_auth_key(&self) -> Option<&EcPublicKey> {
        self.cak.as_ref()
    }

    pub fn guid(&self) -> Option<&Uuid> {
        self.guid.as_ref()
    }

    pub fn slot_id(&self) -> Option<u8> {
        self.slot_id
    }

    pub(crate) fn encode_fields(&self, enc: &mut Encoder) -> Result<()> {
        let mut pk = Encoder::new();
        pk.put_pubkey(&self.pubkey)?;
        enc.put_field(PART_TAG_PUBKEY, pk.as_slice())?;

        if let Some(name) = &self.name {
            enc.put_field(PART_TAG_NAME, name.as_bytes())?;
        }
        if let Some(cak) = &self.cak {
            let mut buf = Encoder::new();
            buf.put_pubkey(cak)?;
            enc.put_field(PART_TAG_CAK, buf.as_slice())?;
        }
        if let Some(guid) = &self.guid {
            enc.put_field(PART_TAG_GUID, guid.as_bytes())?;
        }
        if let Some(slot) = self.slot_id {
            enc.put_field(PART_TAG_SLOT, &[slot])?;
        }
        Ok(())
    }

    pub(crate) fn decode_field(builder: &mut PartFields, tag: u8, value: &[u8]) -> Result<()> {
        match tag {
            PART_TAG_PUBKEY => {
                builder.pubkey = Some(Decoder::new(value).get_pubkey()?);
            }
            PART_TAG_NAME => {
                let name = std::str::from_utf8(value)
                    .map_err(|_| Error::InvalidFormat("part name is not UTF-8".to_string()))?;
                builder.name = Some(name.to_string());
            }
            PART_TAG_CAK => {
                builder.cak = Some(Decoder::new(value).get_pubkey()?);
            }
            PART_TAG_GUID => {
                let bytes: [u8; 16] = value
                    .try_into()
                    .map_err(|_| Error::InvalidFormat("GUID must be 16 bytes".to_string()))?;
                builder.guid = Some(Uuid::from_bytes(bytes));
            }
            PART_TAG_SLOT => {
                if value.len() != 1 {
                    return Err(Error::InvalidFormat("slot id must be 1 byte".to_string()));
                }
                builder.slot_id = Some(value[0]);
            }
            // Unknown tags are skipped for forward compatibility.
            _ => {}
        }
        Ok(())
    }
}

/// Accumulates part fields during TLV decoding.
#[derive(Default)]
pub(crate) struct PartFields {
    pub(crate) pubkey: Option<EcPublicKey>,
    pub(crate) name: Option<String>,
    pub(crate) cak: Option<EcPublicKey>,
    pub(crate) guid: Option<Uuid>,
    pub(crate) slot_id: Option<u8>,
}

impl PartFields {
    pub(crate) fn into_part(self) -> Result<TemplatePart> {
        let pubkey = self
            .pubkey
            .ok_or_else(|| Error::InvalidFormat("part is missing its public key".to_string()))?;
        Ok(TemplatePart {
            pubkey,
            name: self.name,
            cak: self.cak,
            guid: self.guid,
            slot_id: self.slot_id,
        })
    }
}

impl PartialEq for TemplatePart {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid && self.slot_id == other.slot_id && self.pubkey == other.pubkey
    }
}

impl Eq for TemplatePart {}

/// One configuration: a part set plus unlock rule.
#[derive(Debug, Clone)]
pub struct TemplateConfig {
    kind: ConfigKind,
    threshold: u8,
    parts: Vec<TemplatePart>,
}

impl TemplateConfig {
    /// Allocate an empty configuration of the given kind.
    pub fn new(kind: ConfigKind) -> Self {
        Self {
            kind,
            threshold: 1,
            parts: Vec::new(),
        }
    }

    /// Append a part.
    ///
    /// A primary configuration takes exactly one part; any configuration is
    /// capped at 255.
    pub fn add_part(&mut self, part: TemplatePart) -> Result<()> {
        if self.kind == ConfigKind::Primary && !self.parts.is_empty() {
            return Err(Error::InvalidArg(
                "primary configuration takes exactly one part".to_string(),
            ));
        }
        if self.parts.len() >= 255 {
            return Err(Error::InvalidArg("too many parts (max 255)".to_string()));
        }
        self.parts.push(part);
        Ok(())
    }

    /// Set the recovery threshold `n` (recovery configurations only).
    pub fn set_threshold(&mut self, n: u8) -> Result<()> {
        if self.kind != ConfigKind::Recovery {
            return Err(Error::InvalidArg(
                "threshold applies to recovery configurations only".to_string(),
            ));
        }
        if n == 0 || usize::from(n) > self.parts.len() {
            return Err(Error::InvalidArg(format!(
                "threshold {n} out of range for {} parts",
                self.parts.len()
            )));
        }
        self.threshold = n;
        Ok(())
    }

    /// Assemble a configuration from already-validated pieces (wire decode).
    pub(crate) fn from_raw(kind: ConfigKind, threshold: u8, parts: Vec<TemplatePart>) -> Self {
        Self {
            kind,
            threshold,
            parts,
        }
    }

    pub fn kind(&self) -> ConfigKind {
        self.kind
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn parts(&self) -> &[TemplatePart] {
        &self.parts
    }

    /// Check the structural invariants for this configuration.
    pub(crate) fn validate(&self) -> Result<()> {
        match self.kind {
            ConfigKind::Primary => {
                if self.parts.len() != 1 || self.threshold != 1 {
                    return Err(Error::InvalidArg(
                        "primary configuration must hold exactly one part".to_string(),
                    ));
                }
            }
            ConfigKind::Recovery => {
                let n = self.parts.len();
                if n == 0 || n > 255 {
                    return Err(Error::InvalidArg(format!(
                        "recovery configuration has {n} parts, expected 1..=255"
                    )));
                }
                if self.threshold == 0 || usize::from(self.threshold) > n {
                    return Err(Error::InvalidArg(format!(
                        "threshold {} out of range for {n} parts",
                        self.threshold
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_u8(self.kind.to_wire());
        enc.put_u8(self.parts.len() as u8);
        enc.put_u8(self.threshold);
        for part in &self.parts {
            part.encode_fields(enc)?;
            enc.put_end();
        }
        Ok(())
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let kind = ConfigKind::from_wire(dec.get_u8()?)?;
        let nparts = dec.get_u8()? as usize;
        let threshold = dec.get_u8()?;

        let mut parts = Vec::with_capacity(nparts);
        for _ in 0..nparts {
            let mut fields = PartFields::default();
            while let Some((tag, value)) = dec.next_field()? {
                TemplatePart::decode_field(&mut fields, tag, value)?;
            }
            parts.push(fields.into_part()?);
        }

        let config = Self {
            kind,
            threshold,
            parts,
        };
        config.validate().map_err(|e| match e {
            Error::InvalidArg(msg) => Error::InvalidFormat(msg),
            other => other,
        })?;
        Ok(config)
    }
}

/// A complete recovery policy: an ordered list of configurations.
#[derive(Debug, Clone, Default)]
pub struct EboxTemplate {
    configs: Vec<TemplateConfig>,
}

impl EboxTemplate {
    /// Create an empty template.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a template from already-validated configurations (wire
    /// decode).
    pub(crate) fn from_configs(configs: Vec<TemplateConfig>) -> Self {
        Self { configs }
    }

    /// Append a configuration; it must already satisfy its invariants.
    pub fn add_config(&mut self, config: TemplateConfig) -> Result<()> {
        config.validate()?;
        if self.configs.len() >= 255 {
            return Err(Error::InvalidArg("too many configurations (max 255)".to_string()));
        }
        self.configs.push(config);
        Ok(())
    }

    pub fn configs(&self) -> &[TemplateConfig] {
        &self.configs
    }

    /// Serialize the template.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_raw(&TEMPLATE_MAGIC);
        enc.put_u8(TEMPLATE_VERSION);
        enc.put_u8(self.configs.len() as u8);
        for config in &self.configs {
            config.encode(enc)?;
        }
        Ok(())
    }

    /// Serialize to a standalone byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes())
    }

    /// Parse a template.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        dec.expect_magic(&TEMPLATE_MAGIC)?;
        let version = dec.get_u8()?;
        if version != TEMPLATE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let nconfigs = dec.get_u8()? as usize;
        let mut configs = Vec::with_capacity(nconfigs);
        for _ in 0..nconfigs {
            configs.push(TemplateConfig::decode(dec)?);
        }
        Ok(Self { configs })
    }

    /// Parse from a standalone byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let tpl = Self::decode(&mut dec)?;
        if !dec.is_empty() {
            return Err(Error::InvalidFormat("trailing bytes after template".to_string()));
        }
        Ok(tpl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebox_crypto::EcKeyPair;

    fn part(seed: u8) -> TemplatePart {
        TemplatePart::new(EcKeyPair::from_seed(&[seed; 32]).public_key().clone())
    }

    fn recovery_config(nparts: u8, threshold: u8) -> TemplateConfig {
        let mut config = TemplateConfig::new(ConfigKind::Recovery);
        for i in 0..nparts {
            config.add_part(part(i + 1)).unwrap();
        }
        config.set_threshold(threshold).unwrap();
        config
    }

    #[test]
    fn test_primary_takes_one_part() {
        let mut config = TemplateConfig::new(ConfigKind::Primary);
        config.add_part(part(1)).unwrap();
        assert!(matches!(
            config.add_part(part(2)),
            Err(Error::InvalidArg(_))
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_rejected_on_primary() {
        let mut config = TemplateConfig::new(ConfigKind::Primary);
        config.add_part(part(1)).unwrap();
        assert!(matches!(config.set_threshold(1), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn test_threshold_range_checked() {
        let mut config = TemplateConfig::new(ConfigKind::Recovery);
        config.add_part(part(1)).unwrap();
        config.add_part(part(2)).unwrap();

        assert!(matches!(config.set_threshold(0), Err(Error::InvalidArg(_))));
        assert!(matches!(config.set_threshold(3), Err(Error::InvalidArg(_))));
        config.set_threshold(2).unwrap();
        assert_eq!(config.threshold(), 2);
    }

    #[test]
    fn test_empty_recovery_config_rejected() {
        let config = TemplateConfig::new(ConfigKind::Recovery);
        let mut tpl = EboxTemplate::new();
        assert!(matches!(tpl.add_config(config), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn test_clone_is_deep() {
        let mut tpl = EboxTemplate::new();
        tpl.add_config(recovery_config(3, 2)).unwrap();

        let copy = tpl.clone();
        tpl.configs.clear();
        assert_eq!(copy.configs().len(), 1);
        assert_eq!(copy.configs()[0].parts().len(), 3);
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut p = part(1);
        p.set_name("alice").unwrap();
        p.set_guid(Uuid::from_bytes([0x42; 16]));
        p.set_slot_id(0x9d);
        p.set_card_auth_key(EcKeyPair::from_seed(&[9u8; 32]).public_key().clone());

        let mut config = TemplateConfig::new(ConfigKind::Primary);
        config.add_part(p).unwrap();

        let mut tpl = EboxTemplate::new();
        tpl.add_config(config).unwrap();
        tpl.add_config(recovery_config(3, 2)).unwrap();

        let bytes = tpl.to_bytes().unwrap();
        let parsed = EboxTemplate::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.configs().len(), 2);
        let p0 = &parsed.configs()[0].parts()[0];
        assert_eq!(p0.name(), Some("alice"));
        assert_eq!(p0.guid(), Some(&Uuid::from_bytes([0x42; 16])));
        assert_eq!(p0.slot_id(), Some(0x9d));
        assert!(p0.card_auth_key().is_some());
        assert_eq!(parsed.configs()[1].threshold(), 2);

        // Serialization is a bijection on well-formed objects.
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_unknown_part_tag_skipped() {
        let mut enc = Encoder::new();
        enc.put_raw(&TEMPLATE_MAGIC);
        enc.put_u8(TEMPLATE_VERSION);
        enc.put_u8(1); // one config
        enc.put_u8(1); // primary
        enc.put_u8(1); // one part
        enc.put_u8(1); // threshold

        let key = EcKeyPair::from_seed(&[1u8; 32]);
        let mut pk = Encoder::new();
        pk.put_pubkey(key.public_key()).unwrap();
        enc.put_field(PART_TAG_PUBKEY, pk.as_slice()).unwrap();
        enc.put_field(0xFE, b"tag from the future").unwrap();
        enc.put_end();

        let tpl = EboxTemplate::from_bytes(enc.as_slice()).unwrap();
        assert_eq!(tpl.configs()[0].parts()[0].pubkey(), key.public_key());
    }

    #[test]
    fn test_duplicate_tag_last_wins() {
        let mut enc = Encoder::new();
        enc.put_raw(&TEMPLATE_MAGIC);
        enc.put_u8(TEMPLATE_VERSION);
        enc.put_u8(1);
        enc.put_u8(1);
        enc.put_u8(1);
        enc.put_u8(1);

        let key = EcKeyPair::from_seed(&[1u8; 32]);
        let mut pk = Encoder::new();
        pk.put_pubkey(key.public_key()).unwrap();
        enc.put_field(PART_TAG_PUBKEY, pk.as_slice()).unwrap();
        enc.put_field(PART_TAG_NAME, b"first").unwrap();
        enc.put_field(PART_TAG_NAME, b"second").unwrap();
        enc.put_end();

        let tpl = EboxTemplate::from_bytes(enc.as_slice()).unwrap();
        assert_eq!(tpl.configs()[0].parts()[0].name(), Some("second"));
    }

    #[test]
    fn test_missing_pubkey_rejected() {
        let mut enc = Encoder::new();
        enc.put_raw(&TEMPLATE_MAGIC);
        enc.put_u8(TEMPLATE_VERSION);
        enc.put_u8(1);
        enc.put_u8(1);
        enc.put_u8(1);
        enc.put_u8(1);
        enc.put_field(PART_TAG_NAME, b"keyless").unwrap();
        enc.put_end();

        assert!(matches!(
            EboxTemplate::from_bytes(enc.as_slice()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_part_equality_ignores_name() {
        let mut a = part(1);
        a.set_name("alice").unwrap();
        let b = part(1);
        assert_eq!(a, b);

        let mut c = part(1);
        c.set_slot_id(1);
        assert_ne!(a, c);
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut tpl = EboxTemplate::new();
        tpl.add_config(recovery_config(2, 2)).unwrap();
        let mut bytes = tpl.to_bytes().unwrap();
        bytes[2] = 7;
        assert!(matches!(
            EboxTemplate::from_bytes(&bytes),
            Err(Error::UnsupportedVersion(7))
        ));
    }
}
