//! Length-tag-value codec over growable byte buffers.
//!
//! Every ebox wire object is built from the same small set of primitives:
//! big-endian integers, `u32`-length-prefixed byte strings, `u8`-length
//! UTF-8 strings, and EC public keys (curve name string + point bytes).
//! Within an object, optional fields are emitted as `(tag:u8, len:u32,
//! value)` triples terminated by the sentinel tag `END = 0`. Decoders skip
//! unknown tags, keeping old parsers compatible with extended producers;
//! when a tag repeats, the last value wins.

use crate::errors::{Error, Result};
use ebox_crypto::{EcCurve, EcPublicKey};

/// Sentinel tag terminating a TLV field list.
pub const TAG_END: u8 = 0;

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Append-only encoder over a growable byte buffer.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the encoder, returning the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// View the bytes encoded so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Append raw bytes with no framing.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a `u32`-length-prefixed byte string.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| Error::InvalidArg("byte string exceeds u32 length".to_string()))?;
        self.put_u32(len);
        self.put_raw(bytes);
        Ok(())
    }

    /// Append a `u8`-length-prefixed UTF-8 string (max 255 bytes).
    pub fn put_string(&mut self, s: &str) -> Result<()> {
        let len = u8::try_from(s.len())
            .map_err(|_| Error::InvalidArg(format!("string too long: {} bytes", s.len())))?;
        self.put_u8(len);
        self.put_raw(s.as_bytes());
        Ok(())
    }

    /// Append an EC public key: curve name string followed by the point.
    pub fn put_pubkey(&mut self, key: &EcPublicKey) -> Result<()> {
        self.put_string(key.curve().name())?;
        self.put_bytes(key.point())
    }

    /// Append one TLV field.
    pub fn put_field(&mut self, tag: u8, value: &[u8]) -> Result<()> {
        if tag == TAG_END {
            return Err(Error::InvalidArg("field tag 0 is reserved".to_string()));
        }
        let len = u32::try_from(value.len())
            .map_err(|_| Error::InvalidArg("field value exceeds u32 length".to_string()))?;
        self.put_u8(tag);
        self.put_u32(len);
        self.put_raw(value);
        Ok(())
    }

    /// Terminate a TLV field list.
    pub fn put_end(&mut self) {
        self.put_u8(TAG_END);
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Cursor-based decoder over a byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Decode from the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::InvalidFormat(format!(
                "truncated input: wanted {len} bytes, {} remain",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Read a `u32`-length-prefixed byte string, borrowing from the input.
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// Read a `u8`-length-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| Error::InvalidFormat("string is not valid UTF-8".to_string()))
    }

    /// Read an EC public key.
    pub fn get_pubkey(&mut self) -> Result<EcPublicKey> {
        let name = self.get_string()?;
        let curve = EcCurve::from_name(&name)
            .map_err(|_| Error::InvalidFormat(format!("unknown curve {name:?}")))?;
        let point = self.get_bytes()?;
        EcPublicKey::from_point(curve, point)
            .map_err(|e| Error::InvalidFormat(e.to_string()))
    }

    /// Expect `magic` at the cursor.
    pub fn expect_magic(&mut self, magic: &[u8]) -> Result<()> {
        let got = self.take(magic.len())?;
        if got != magic {
            return Err(Error::InvalidFormat("bad magic".to_string()));
        }
        Ok(())
    }

    /// Read the next TLV field, or `None` at the `END` sentinel.
    ///
    /// Callers match on the tag and skip values they do not recognize.
    pub fn next_field(&mut self) -> Result<Option<(u8, &'a [u8])>> {
        let tag = self.get_u8()?;
        if tag == TAG_END {
            return Ok(None);
        }
        let len = self.get_u32()? as usize;
        let value = self.take(len)?;
        Ok(Some((tag, value)))
    }
}
