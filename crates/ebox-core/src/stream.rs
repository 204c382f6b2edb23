//! Chunked authenticated-encryption streams keyed through an ebox.
//!
//! A stream's header embeds a one-shot ebox holding the random session key;
//! whoever can unlock the ebox can decrypt the stream. Payload bytes are
//! framed into fixed-size chunks, each sealed with ChaCha20-Poly1305 using
//! the chunk sequence number as nonce and the SHA-256 digest of the header
//! as additional data, so chunks cannot be reordered, replayed, or moved
//! between streams. A short final chunk is allowed; an authenticated empty
//! chunk terminates the stream.
//!
//! Both directions run on the same pull model: `put` consumes caller bytes
//! (plaintext when encrypting, ciphertext when decrypting) and `get` drains
//! the produced bytes. Both report how much they moved; when the internal
//! output buffer is full, `put` consumes less than offered and the caller
//! must drain with `get` before retrying.

use crate::codec::{Decoder, Encoder};
use crate::ebox::Ebox;
use crate::errors::{Error, Result};
use crate::sealedbox::AEAD_CHACHA20_POLY1305;
use crate::template::EboxTemplate;
use ebox_crypto::{
    aead_decrypt, aead_encrypt, generate_random_bytes, AEAD_NONCE_SIZE, AEAD_TAG_SIZE,
    STREAM_KEY_SIZE,
};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

/// Stream header magic.
pub const STREAM_MAGIC: [u8; 4] = *b"ESTR";

/// Stream wire version.
pub const STREAM_VERSION: u8 = 1;

/// Default chunk size: 128 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 128 * 1024;

/// Upper bound on configurable chunk sizes.
pub const MAX_CHUNK_SIZE: u32 = 1 << 24;

// seq + plaintext_len + ciphertext length prefix.
const CHUNK_FRAME_LEN: usize = 12;

// Fixed part of the header: magic, version, AEAD id, chunk size, ebox length.
const HEADER_FIXED_LEN: usize = 4 + 1 + 1 + 4 + 4;

// Output buffering beyond this makes put() stop consuming.
const PENDING_CHUNKS: usize = 4;

/// Direction of an [`EboxStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Plaintext in, ciphertext out.
    Encrypt,
    /// Ciphertext in, plaintext out.
    Decrypt,
}

/// One sealed chunk of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    seq: u32,
    plaintext_len: u32,
    ciphertext: Vec<u8>,
}

impl StreamChunk {
    /// Sequence number; chunks are numbered densely from 0.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Plaintext length; 0 marks the stream terminator.
    pub fn plaintext_len(&self) -> u32 {
        self.plaintext_len
    }

    /// The sealed payload, tag included.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Serialize the chunk.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_u32(self.seq);
        enc.put_u32(self.plaintext_len);
        enc.put_bytes(&self.ciphertext)
    }

    /// Parse a chunk.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let seq = dec.get_u32()?;
        let plaintext_len = dec.get_u32()?;
        let ciphertext = dec.get_bytes()?.to_vec();
        Ok(Self {
            seq,
            plaintext_len,
            ciphertext,
        })
    }
}

/// A chunked authenticated-encryption stream.
pub struct EboxStream {
    mode: StreamMode,
    chunk_size: u32,
    ebox: Option<Ebox>,
    session_key: Option<Zeroizing<[u8; STREAM_KEY_SIZE]>>,
    header_digest: [u8; 32],
    next_seq: u32,
    pending_in: Vec<u8>,
    pending_out: Vec<u8>,
    // Header bytes awaiting drain do not count toward the output cap.
    out_base: usize,
    header_parsed: bool,
    closed: bool,
    finished: bool,
    // A decrypt failure is terminal; it is held here so already-verified
    // plaintext can still be drained before the error surfaces.
    failed: Option<Error>,
}

impl EboxStream {
    /// Start an encryption stream with the default chunk size.
    ///
    /// A random 32-byte session key is generated and sealed into a one-shot
    /// ebox under `tpl`; the serialized header (magic, version, AEAD id,
    /// chunk size, ebox) is the first output available from [`get`](Self::get).
    pub fn init_encrypt(tpl: &EboxTemplate) -> Result<Self> {
        Self::init_encrypt_with_chunk_size(tpl, DEFAULT_CHUNK_SIZE)
    }

    /// Start an encryption stream with an explicit chunk size.
    pub fn init_encrypt_with_chunk_size(tpl: &EboxTemplate, chunk_size: u32) -> Result<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidArg(format!("chunk size {chunk_size} out of range")));
        }

        let session_key: Zeroizing<[u8; STREAM_KEY_SIZE]> =
            Zeroizing::new(generate_random_bytes()?);
        let ebox = Ebox::create(tpl, &session_key[..], None)?;
        let header = encode_header(chunk_size, &ebox)?;
        let header_digest = Sha256::digest(&header).into();
        let out_base = header.len();

        debug!(chunk_size, "initialized encrypt stream");
        Ok(Self {
            mode: StreamMode::Encrypt,
            chunk_size,
            ebox: Some(ebox),
            session_key: Some(session_key),
            header_digest,
            next_seq: 0,
            pending_in: Vec::new(),
            pending_out: header,
            out_base,
            header_parsed: true,
            closed: false,
            finished: false,
            failed: None,
        })
    }

    /// Start a decryption stream.
    ///
    /// Feed ciphertext with [`put`](Self::put); once the header has been
    /// consumed, [`ebox_mut`](Self::ebox_mut) exposes the embedded ebox so
    /// the caller can unlock or recover the session key. Chunks are only
    /// decrypted after the ebox is unlocked.
    pub fn init_decrypt() -> Self {
        Self {
            mode: StreamMode::Decrypt,
            chunk_size: 0,
            ebox: None,
            session_key: None,
            header_digest: [0u8; 32],
            next_seq: 0,
            pending_in: Vec::new(),
            pending_out: Vec::new(),
            out_base: 0,
            header_parsed: false,
            closed: false,
            finished: false,
            failed: None,
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Chunk size; 0 on a decrypt stream until the header has been parsed.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// The embedded ebox, once known.
    pub fn ebox(&self) -> Option<&Ebox> {
        self.ebox.as_ref()
    }

    /// Mutable access to the embedded ebox, for unlocking a decrypt stream.
    pub fn ebox_mut(&mut self) -> Option<&mut Ebox> {
        self.ebox.as_mut()
    }

    /// Whether the stream has seen its end: `close` on an encrypt stream,
    /// the verified terminator chunk on a decrypt stream.
    pub fn is_finished(&self) -> bool {
        match self.mode {
            StreamMode::Encrypt => self.closed,
            StreamMode::Decrypt => self.finished,
        }
    }

    /// Feed input bytes from a list of slices, in order.
    ///
    /// Returns the number of bytes consumed, which is less than the total
    /// offered when the internal output buffer needs draining.
    pub fn put(&mut self, vecs: &[&[u8]]) -> Result<usize> {
        match self.mode {
            StreamMode::Encrypt => self.put_plaintext(vecs),
            StreamMode::Decrypt => self.put_ciphertext(vecs),
        }
    }

    /// Drain produced bytes into a list of slices, in order.
    ///
    /// Returns the number of bytes written. On a decrypt stream, plaintext
    /// verified before a failure remains available; the error surfaces once
    /// the buffered output has been drained.
    pub fn get(&mut self, vecs: &mut [&mut [u8]]) -> Result<usize> {
        if self.mode == StreamMode::Decrypt && self.pending_out.is_empty() {
            if let Err(err) = self.process_checked() {
                // Verified plaintext produced in the same pass still drains
                // first; the latched failure resurfaces afterwards.
                if self.pending_out.is_empty() {
                    return Err(err);
                }
            }
        }
        let mut copied = 0;
        for vec in vecs.iter_mut() {
            if copied == self.pending_out.len() {
                break;
            }
            let take = vec.len().min(self.pending_out.len() - copied);
            vec[..take].copy_from_slice(&self.pending_out[copied..copied + take]);
            copied += take;
        }
        self.pending_out.drain(..copied);
        Ok(copied)
    }

    /// Finish the stream.
    ///
    /// Encrypting: seals the short final chunk, if any, plus the
    /// terminator; the caller drains them with [`get`](Self::get).
    /// Decrypting: verifies that the terminator chunk was seen, reporting
    /// truncation as [`Error::Corrupt`].
    pub fn close(&mut self) -> Result<()> {
        match self.mode {
            StreamMode::Encrypt => {
                if self.closed {
                    return Err(Error::InvalidState("stream already closed".to_string()));
                }
                if !self.pending_in.is_empty() {
                    let plain: Vec<u8> = std::mem::take(&mut self.pending_in);
                    self.seal_chunk(&plain)?;
                }
                self.seal_chunk(&[])?;
                self.closed = true;
                debug!(chunks = self.next_seq, "closed encrypt stream");
                Ok(())
            }
            StreamMode::Decrypt => {
                self.process_checked()?;
                if !self.finished {
                    return Err(Error::Corrupt(
                        "stream truncated before its terminator".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    // -- encrypt side --------------------------------------------------

    fn put_plaintext(&mut self, vecs: &[&[u8]]) -> Result<usize> {
        if self.closed {
            return Err(Error::InvalidState("stream already closed".to_string()));
        }
        let chunk = self.chunk_size as usize;
        let mut consumed = 0;

        'vecs: for vec in vecs {
            let mut off = 0;
            while off < vec.len() {
                if self.pending_in.len() >= chunk && !self.flush_full_chunk()? {
                    break 'vecs;
                }
                let room = chunk - self.pending_in.len();
                let take = room.min(vec.len() - off);
                self.pending_in.extend_from_slice(&vec[off..off + take]);
                off += take;
                consumed += take;
            }
        }
        if self.pending_in.len() >= chunk {
            self.flush_full_chunk()?;
        }
        Ok(consumed)
    }

    /// Seal one full chunk if the output buffer has room for it.
    fn flush_full_chunk(&mut self) -> Result<bool> {
        if self.pending_out.len() >= self.out_limit() {
            return Ok(false);
        }
        let n = self.chunk_size as usize;
        let plain: Vec<u8> = self.pending_in.drain(..n).collect();
        self.seal_chunk(&plain)?;
        Ok(true)
    }

    fn seal_chunk(&mut self, plaintext: &[u8]) -> Result<()> {
        let key = self
            .session_key
            .as_ref()
            .ok_or_else(|| Error::InvalidState("stream has no session key".to_string()))?;
        let nonce = nonce_for_seq(self.next_seq);
        let ciphertext = aead_encrypt(key, &nonce, plaintext, &self.header_digest)?;

        let chunk = StreamChunk {
            seq: self.next_seq,
            plaintext_len: plaintext.len() as u32,
            ciphertext,
        };
        let mut enc = Encoder::new();
        chunk.encode(&mut enc)?;
        self.pending_out.extend_from_slice(enc.as_slice());

        self.next_seq = self
            .next_seq
            .checked_add(1)
            .ok_or_else(|| Error::InvalidState("chunk sequence overflow".to_string()))?;
        Ok(())
    }

    // -- decrypt side --------------------------------------------------

    fn put_ciphertext(&mut self, vecs: &[&[u8]]) -> Result<usize> {
        let mut consumed = 0;
        for vec in vecs {
            let mut off = 0;
            while off < vec.len() {
                if self.pending_in.len() >= self.in_limit() {
                    self.process_checked()?;
                    if self.pending_in.len() >= self.in_limit() {
                        return Ok(consumed);
                    }
                }
                let take = (self.in_limit() - self.pending_in.len()).min(vec.len() - off);
                self.pending_in.extend_from_slice(&vec[off..off + take]);
                off += take;
                consumed += take;
            }
        }
        self.process_checked()?;
        Ok(consumed)
    }

    /// Run the decrypt pipeline, latching any failure as terminal.
    fn process_checked(&mut self) -> Result<()> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        match self.process_pending() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.failed = Some(err.clone());
                Err(err)
            }
        }
    }

    fn process_pending(&mut self) -> Result<()> {
        if self.mode != StreamMode::Decrypt {
            return Ok(());
        }
        if !self.header_parsed && !self.try_parse_header()? {
            return Ok(());
        }

        loop {
            if self.finished {
                if self.pending_in.is_empty() {
                    return Ok(());
                }
                return Err(Error::Corrupt(
                    "data after the stream terminator".to_string(),
                ));
            }
            if self.pending_out.len() >= self.out_limit() {
                return Ok(());
            }
            if self.pending_in.len() < CHUNK_FRAME_LEN {
                return Ok(());
            }

            let mut peek = Decoder::new(&self.pending_in);
            let _seq = peek.get_u32()?;
            let plaintext_len = peek.get_u32()?;
            let ciphertext_len = peek.get_u32()? as usize;

            if plaintext_len > self.chunk_size {
                return Err(Error::Corrupt(format!(
                    "chunk claims {plaintext_len} plaintext bytes, chunk size is {}",
                    self.chunk_size
                )));
            }
            if ciphertext_len != plaintext_len as usize + AEAD_TAG_SIZE {
                return Err(Error::Corrupt(
                    "chunk ciphertext length does not match its plaintext length".to_string(),
                ));
            }
            let frame_len = CHUNK_FRAME_LEN + ciphertext_len;
            if self.pending_in.len() < frame_len {
                // Wait for the rest of the chunk.
                return Ok(());
            }

            // A full chunk is buffered; it can only be opened once the
            // embedded ebox has been unlocked.
            if self.session_key.is_none() {
                match self.ebox.as_ref().and_then(Ebox::key) {
                    Some(key) => {
                        let key: [u8; STREAM_KEY_SIZE] = key.try_into().map_err(|_| {
                            Error::InvalidState(format!(
                                "stream session key must be {STREAM_KEY_SIZE} bytes"
                            ))
                        })?;
                        self.session_key = Some(Zeroizing::new(key));
                    }
                    None => return Ok(()),
                }
            }

            let chunk = StreamChunk::decode(&mut Decoder::new(&self.pending_in[..frame_len]))?;
            if chunk.seq != self.next_seq {
                return Err(Error::Corrupt(format!(
                    "chunk {} out of order, expected {}",
                    chunk.seq, self.next_seq
                )));
            }

            let key = self.session_key.as_ref().expect("session key just set");
            let nonce = nonce_for_seq(chunk.seq);
            let plain = aead_decrypt(key, &nonce, &chunk.ciphertext, &self.header_digest)
                .map_err(|_| Error::Corrupt(format!("chunk {} failed to authenticate", chunk.seq)))?;
            if plain.len() != chunk.plaintext_len as usize {
                return Err(Error::Corrupt(
                    "chunk plaintext length mismatch".to_string(),
                ));
            }

            self.pending_in.drain(..frame_len);
            self.next_seq += 1;
            if chunk.plaintext_len == 0 {
                self.finished = true;
                debug!(chunks = self.next_seq, "decrypt stream finished");
            } else {
                self.pending_out.extend_from_slice(&plain);
            }
        }
    }

    fn try_parse_header(&mut self) -> Result<bool> {
        if self.pending_in.len() < HEADER_FIXED_LEN {
            return Ok(false);
        }
        if self.pending_in[..4] != STREAM_MAGIC {
            return Err(Error::InvalidFormat("bad stream magic".to_string()));
        }
        let version = self.pending_in[4];
        if version != STREAM_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let aead = self.pending_in[5];
        if aead != AEAD_CHACHA20_POLY1305 {
            return Err(Error::InvalidFormat(format!("unknown AEAD id {aead}")));
        }
        let chunk_size = u32::from_be_bytes(self.pending_in[6..10].try_into().unwrap());
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidFormat(format!(
                "chunk size {chunk_size} out of range"
            )));
        }
        let ebox_len = u32::from_be_bytes(self.pending_in[10..14].try_into().unwrap()) as usize;
        if ebox_len > MAX_CHUNK_SIZE as usize {
            return Err(Error::InvalidFormat("oversized embedded ebox".to_string()));
        }
        let header_len = HEADER_FIXED_LEN + ebox_len;
        if self.pending_in.len() < header_len {
            return Ok(false);
        }

        let ebox = Ebox::from_bytes(&self.pending_in[HEADER_FIXED_LEN..header_len])?;
        self.header_digest = Sha256::digest(&self.pending_in[..header_len]).into();
        self.chunk_size = chunk_size;
        self.ebox = Some(ebox);
        self.pending_in.drain(..header_len);
        self.header_parsed = true;
        debug!(chunk_size, "parsed stream header");
        Ok(true)
    }

    fn out_limit(&self) -> usize {
        self.out_base + PENDING_CHUNKS * (self.chunk_size as usize + CHUNK_FRAME_LEN + AEAD_TAG_SIZE)
    }

    fn in_limit(&self) -> usize {
        // Before the header is parsed the chunk size is unknown; allow
        // enough for any header plus one maximal chunk frame.
        let chunk = if self.header_parsed {
            self.chunk_size as usize
        } else {
            MAX_CHUNK_SIZE as usize
        };
        2 * (chunk + CHUNK_FRAME_LEN + AEAD_TAG_SIZE) + HEADER_FIXED_LEN
    }
}

impl std::fmt::Debug for EboxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EboxStream")
            .field("mode", &self.mode)
            .field("chunk_size", &self.chunk_size)
            .field("next_seq", &self.next_seq)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn nonce_for_seq(seq: u32) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[AEAD_NONCE_SIZE - 4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

fn encode_header(chunk_size: u32, ebox: &Ebox) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.put_raw(&STREAM_MAGIC);
    enc.put_u8(STREAM_VERSION);
    enc.put_u8(AEAD_CHACHA20_POLY1305);
    enc.put_u32(chunk_size);
    enc.put_bytes(&ebox.to_bytes()?)?;
    Ok(enc.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{ConfigKind, TemplateConfig, TemplatePart};
    use ebox_crypto::EcKeyPair;

    fn primary_template(holder: &EcKeyPair) -> EboxTemplate {
        let mut config = TemplateConfig::new(ConfigKind::Primary);
        config
            .add_part(TemplatePart::new(holder.public_key().clone()))
            .unwrap();
        let mut tpl = EboxTemplate::new();
        tpl.add_config(config).unwrap();
        tpl
    }

    fn drain(stream: &mut EboxStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.get(&mut [&mut buf[..]]).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_nonce_embeds_sequence() {
        assert_eq!(nonce_for_seq(0), [0u8; 12]);
        let nonce = nonce_for_seq(0x01020304);
        assert_eq!(&nonce[8..], &[1, 2, 3, 4]);
        assert_eq!(&nonce[..8], &[0u8; 8]);
    }

    #[test]
    fn test_chunk_wire_roundtrip() {
        let chunk = StreamChunk {
            seq: 7,
            plaintext_len: 5,
            ciphertext: vec![1, 2, 3, 4, 5, 6],
        };
        let mut enc = Encoder::new();
        chunk.encode(&mut enc).unwrap();
        let parsed = StreamChunk::decode(&mut Decoder::new(enc.as_slice())).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        let holder = EcKeyPair::from_seed(&[1u8; 32]);
        let tpl = primary_template(&holder);
        assert!(matches!(
            EboxStream::init_encrypt_with_chunk_size(&tpl, 0),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            EboxStream::init_encrypt_with_chunk_size(&tpl, MAX_CHUNK_SIZE + 1),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn test_encrypt_decrypt_small_roundtrip() {
        let holder = EcKeyPair::from_seed(&[2u8; 32]);
        let tpl = primary_template(&holder);

        let mut enc = EboxStream::init_encrypt_with_chunk_size(&tpl, 16).unwrap();
        let consumed = enc.put(&[b"hello ", b"stream ", b"container"]).unwrap();
        assert_eq!(consumed, 22);
        enc.close().unwrap();
        let ciphertext = drain(&mut enc);

        let mut dec = EboxStream::init_decrypt();
        let consumed = dec.put(&[&ciphertext]).unwrap();
        assert_eq!(consumed, ciphertext.len());

        // Unlock the embedded ebox with the holder key.
        let ebox = dec.ebox_mut().unwrap();
        ebox.config_mut(0)
            .unwrap()
            .part_mut(0)
            .unwrap()
            .sealed_box_mut()
            .unseal(&holder)
            .unwrap();
        ebox.unlock(0).unwrap();

        let plain = drain(&mut dec);
        dec.close().unwrap();
        assert_eq!(plain, b"hello stream container");
        assert!(dec.is_finished());
    }

    #[test]
    fn test_decrypt_without_unlock_produces_nothing() {
        let holder = EcKeyPair::from_seed(&[3u8; 32]);
        let tpl = primary_template(&holder);

        let mut enc = EboxStream::init_encrypt_with_chunk_size(&tpl, 16).unwrap();
        enc.put(&[b"sixteen byte msg"]).unwrap();
        enc.close().unwrap();
        let ciphertext = drain(&mut enc);

        let mut dec = EboxStream::init_decrypt();
        dec.put(&[&ciphertext]).unwrap();
        assert!(dec.ebox().is_some());
        assert_eq!(drain(&mut dec), b"");
        assert!(!dec.is_finished());
    }

    #[test]
    fn test_put_after_close_rejected() {
        let holder = EcKeyPair::from_seed(&[4u8; 32]);
        let tpl = primary_template(&holder);
        let mut enc = EboxStream::init_encrypt(&tpl).unwrap();
        enc.close().unwrap();
        assert!(matches!(
            enc.put(&[b"late"]),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(enc.close(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_backpressure_limits_consumption() {
        let holder = EcKeyPair::from_seed(&[5u8; 32]);
        let tpl = primary_template(&holder);
        let mut enc = EboxStream::init_encrypt_with_chunk_size(&tpl, 8).unwrap();

        // Without draining, put() eventually refuses further input.
        let payload = vec![0x77u8; 1 << 16];
        let consumed = enc.put(&[&payload]).unwrap();
        assert!(consumed < payload.len());

        // Draining makes room again.
        let _ = drain(&mut enc);
        let more = enc.put(&[&payload[consumed..]]).unwrap();
        assert!(more > 0);
    }
}
