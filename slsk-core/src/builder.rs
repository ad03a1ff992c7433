//! Fluent builder for outgoing messages.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::code::CodeFamily;
use crate::reader::MessageError;

/// Builds a framed message: 4 bytes LE length, code, payload.
///
/// Writes only ever append. [`MessageBuilder::compress`] is the single
/// exception: it replaces the payload written so far with its zlib form.
#[derive(Debug, Default, Clone)]
pub struct MessageBuilder {
    code: Vec<u8>,
    payload: Vec<u8>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the message code using the width of its family.
    pub fn write_code<C: CodeFamily>(mut self, code: C) -> Self {
        let raw: u32 = code.into();
        self.code = raw.to_le_bytes()[..C::WIDTH].to_vec();
        self
    }

    pub fn write_byte(mut self, value: u8) -> Self {
        self.payload.push(value);
        self
    }

    pub fn write_bool(self, value: bool) -> Self {
        self.write_byte(u8::from(value))
    }

    pub fn write_integer(mut self, value: i32) -> Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_long(mut self, value: i64) -> Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a string as 4 bytes LE length + UTF-8 bytes.
    pub fn write_string(mut self, value: &str) -> Self {
        self.payload
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.payload.extend_from_slice(value.as_bytes());
        self
    }

    pub fn write_bytes(mut self, raw: &[u8]) -> Self {
        self.payload.extend_from_slice(raw);
        self
    }

    /// Apply `f` to the builder; keeps loops and conditionals inside a fluent chain.
    pub fn with(self, f: impl FnOnce(Self) -> Self) -> Self {
        f(self)
    }

    /// Zlib-compress the payload written so far. The code stays uncompressed.
    pub fn compress(mut self) -> Result<Self, MessageError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.payload)
            .map_err(|e| MessageError::Compression(e.to_string()))?;
        self.payload = encoder
            .finish()
            .map_err(|e| MessageError::Compression(e.to_string()))?;
        Ok(self)
    }

    /// Produce the framed message.
    pub fn build(self) -> Vec<u8> {
        let len = (self.code.len() + self.payload.len()) as u32;
        let mut out = Vec::with_capacity(4 + len as usize);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.payload);
        out
    }
}
