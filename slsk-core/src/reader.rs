//! Cursor-based message reader and the errors raised while decoding.

use bytes::Bytes;
use flate2::{Decompress, FlushDecompress, Status};

use crate::code::CodeFamily;

const LEN_SIZE: usize = 4;

/// Upper bound on the size of a decompressed payload (64 MiB).
pub const MAX_DECOMPRESSED_LEN: usize = 64 * 1024 * 1024;

/// Error reading fields out of a message buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("{needed} bytes required but only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },
    #[error("seek to {position} is outside the buffer (length {length})")]
    SeekOutOfRange { position: usize, length: usize },
    #[error("declared length {declared} does not fit the {available} bytes available")]
    InvalidLength { declared: usize, available: usize },
    #[error("negative length prefix {0}")]
    NegativeLength(i32),
    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: i64 },
}

/// Error decoding or encoding a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] ReadError),
    #[error("message compression failed: {0}")]
    Compression(String),
    #[error("message code mismatch creating {message} (expected: {expected}, received: {actual})")]
    CodeMismatch {
        message: &'static str,
        expected: u32,
        actual: u32,
    },
}

/// Reads typed fields from a received message.
///
/// The buffer holds the message body (code and payload) with the length
/// prefix already validated and stripped; bytes beyond the declared length
/// are never visible. The reader is owned by a single decode operation.
#[derive(Debug, Clone)]
pub struct MessageReader {
    buffer: Bytes,
    position: usize,
    decompressed: bool,
}

impl MessageReader {
    /// Create a reader over a framed message: 4 bytes LE length + body.
    pub fn new(message: impl Into<Bytes>) -> Result<Self, MessageError> {
        let message = message.into();
        if message.len() < LEN_SIZE {
            return Err(ReadError::Truncated {
                needed: LEN_SIZE,
                remaining: message.len(),
            }
            .into());
        }
        let declared = i32::from_le_bytes([message[0], message[1], message[2], message[3]]);
        let declared = usize::try_from(declared).map_err(|_| ReadError::NegativeLength(declared))?;
        let available = message.len() - LEN_SIZE;
        if declared > available {
            return Err(ReadError::InvalidLength {
                declared,
                available,
            }
            .into());
        }
        Ok(Self::from_payload(message.slice(LEN_SIZE..LEN_SIZE + declared), 0))
    }

    /// Create a reader over an unframed payload, starting at `position`.
    /// Positions past the end are clamped to the end.
    pub fn from_payload(payload: Bytes, position: usize) -> Self {
        let position = position.min(payload.len());
        Self {
            buffer: payload,
            position,
            decompressed: false,
        }
    }

    /// Current read position within the current buffer.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Length of the current buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes left between the position and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// The current buffer, shared rather than copied.
    pub fn buffer(&self) -> Bytes {
        self.buffer.clone()
    }

    pub fn seek(&mut self, position: usize) -> Result<(), MessageError> {
        if position > self.buffer.len() {
            return Err(ReadError::SeekOutOfRange {
                position,
                length: self.buffer.len(),
            }
            .into());
        }
        self.position = position;
        Ok(())
    }

    fn take(&mut self, needed: usize) -> Result<&[u8], MessageError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(ReadError::Truncated { needed, remaining }.into());
        }
        let start = self.position;
        self.position += needed;
        Ok(&self.buffer[start..self.position])
    }

    /// Read a code of the width used by family `C`, returned as a raw value.
    pub fn read_code<C: CodeFamily>(&mut self) -> Result<u32, MessageError> {
        let raw = self.take(C::WIDTH)?;
        let mut bytes = [0u8; 4];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read the code and fail with [`MessageError::CodeMismatch`] unless it is `expected`.
    pub fn expect_code<C: CodeFamily>(
        &mut self,
        expected: C,
        message: &'static str,
    ) -> Result<(), MessageError> {
        let actual = self.read_code::<C>()?;
        let expected: u32 = expected.into();
        if actual != expected {
            return Err(MessageError::CodeMismatch {
                message,
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, MessageError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_integer(&mut self) -> Result<i32, MessageError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_long(&mut self) -> Result<i64, MessageError> {
        let b = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(i64::from_le_bytes(bytes))
    }

    /// Read a length-prefixed string. Invalid UTF-8 is decoded as ISO-8859-1.
    /// A failed read leaves the position where it was.
    pub fn read_string(&mut self) -> Result<String, MessageError> {
        let start = self.position;
        let raw = match self.read_string_bytes() {
            Ok(raw) => raw,
            Err(e) => {
                self.position = start;
                return Err(e);
            }
        };
        Ok(match std::str::from_utf8(&raw) {
            Ok(s) => s.to_owned(),
            Err(_) => raw.iter().map(|&b| char::from(b)).collect(),
        })
    }

    fn read_string_bytes(&mut self) -> Result<Bytes, MessageError> {
        let len = self.read_integer()?;
        let len = usize::try_from(len).map_err(|_| ReadError::NegativeLength(len))?;
        self.read_bytes(len)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, MessageError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(ReadError::Truncated {
                needed: len,
                remaining,
            }
            .into());
        }
        let start = self.position;
        self.position += len;
        Ok(self.buffer.slice(start..self.position))
    }

    /// Replace the unread remainder of the buffer with its zlib-inflated form.
    /// Position is reset to the start of the inflated bytes.
    pub fn decompress(&mut self) -> Result<(), MessageError> {
        if self.decompressed {
            return Err(MessageError::Compression(
                "payload has already been decompressed".into(),
            ));
        }
        let inflated = inflate(&self.buffer[self.position..])?;
        self.buffer = Bytes::from(inflated);
        self.position = 0;
        self.decompressed = true;
        Ok(())
    }
}

fn inflate(input: &[u8]) -> Result<Vec<u8>, MessageError> {
    let mut inflater = Decompress::new(true);
    let mut out = Vec::with_capacity(input.len().saturating_mul(4).clamp(64, MAX_DECOMPRESSED_LEN));
    loop {
        if out.len() == out.capacity() {
            if out.len() >= MAX_DECOMPRESSED_LEN {
                return Err(MessageError::Compression(format!(
                    "decompressed payload exceeds {MAX_DECOMPRESSED_LEN} bytes"
                )));
            }
            let grow = out.len().min(MAX_DECOMPRESSED_LEN - out.len());
            out.reserve(grow.max(64));
        }
        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();
        let status = inflater
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| MessageError::Compression(e.to_string()))?;
        match status {
            Status::StreamEnd if out.len() > MAX_DECOMPRESSED_LEN => {
                return Err(MessageError::Compression(format!(
                    "decompressed payload exceeds {MAX_DECOMPRESSED_LEN} bytes"
                )));
            }
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                let stalled = inflater.total_in() as usize == consumed
                    && inflater.total_out() == produced
                    && out.len() < out.capacity();
                if stalled {
                    return Err(MessageError::Compression(
                        "compressed stream is truncated".into(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MessageBuilder;
    use crate::code::{DistributedCode, PeerCode};

    fn sample() -> Vec<u8> {
        MessageBuilder::new()
            .write_code(PeerCode::QueueDownload)
            .write_byte(7)
            .write_integer(-2)
            .write_long(i64::MAX)
            .write_string("héllo")
            .build()
    }

    #[test]
    fn reads_fields_in_order() {
        let mut r = MessageReader::new(sample()).unwrap();
        assert_eq!(r.read_code::<PeerCode>().unwrap(), 43);
        assert_eq!(r.read_byte().unwrap(), 7);
        assert_eq!(r.read_integer().unwrap(), -2);
        assert_eq!(r.read_long().unwrap(), i64::MAX);
        assert_eq!(r.read_string().unwrap(), "héllo");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn integer_with_two_bytes_left_fails() {
        let bytes = vec![2, 0, 0, 0, 1, 2];
        let mut r = MessageReader::new(bytes).unwrap();
        assert_eq!(
            r.read_integer(),
            Err(MessageError::Malformed(ReadError::Truncated {
                needed: 4,
                remaining: 2
            }))
        );
        // failed reads do not advance
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn bytes_past_declared_length_are_invisible() {
        let mut bytes = sample();
        let declared = bytes.len();
        bytes.extend_from_slice(&[0xff; 16]);
        let r = MessageReader::new(bytes).unwrap();
        assert_eq!(r.len(), declared - 4);
    }

    #[test]
    fn declared_length_larger_than_buffer_fails() {
        let bytes = vec![10, 0, 0, 0, 1, 2];
        assert!(matches!(
            MessageReader::new(bytes),
            Err(MessageError::Malformed(ReadError::InvalidLength {
                declared: 10,
                available: 2
            }))
        ));
    }

    #[test]
    fn negative_string_length_fails() {
        let bytes = MessageBuilder::new().write_integer(-5).build();
        let mut r = MessageReader::new(bytes).unwrap();
        assert!(matches!(
            r.read_string(),
            Err(MessageError::Malformed(ReadError::NegativeLength(-5)))
        ));
    }

    #[test]
    fn seek_bounds_are_inclusive_of_length() {
        let mut r = MessageReader::new(sample()).unwrap();
        let len = r.len();
        assert!(r.seek(len).is_ok());
        assert_eq!(r.remaining(), 0);
        assert!(matches!(
            r.seek(len + 1),
            Err(MessageError::Malformed(ReadError::SeekOutOfRange { .. }))
        ));
        r.seek(0).unwrap();
        assert_eq!(r.read_code::<PeerCode>().unwrap(), 43);
    }

    #[test]
    fn one_byte_codes() {
        let bytes = MessageBuilder::new()
            .write_code(DistributedCode::SearchRequest)
            .write_integer(1)
            .build();
        let mut r = MessageReader::new(bytes).unwrap();
        assert_eq!(r.read_code::<DistributedCode>().unwrap(), 3);
        assert_eq!(r.read_integer().unwrap(), 1);
    }

    #[test]
    fn latin1_fallback_for_invalid_utf8() {
        let bytes = MessageBuilder::new().write_bytes(&[2, 0, 0, 0, 0xe9, 0x41]).build();
        let mut r = MessageReader::new(bytes).unwrap();
        assert_eq!(r.read_string().unwrap(), "éA");
    }

    #[test]
    fn decompress_replaces_remaining_payload() {
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_string("alice")
            .write_integer(99)
            .compress()
            .unwrap()
            .build();
        let mut r = MessageReader::new(bytes).unwrap();
        r.read_code::<PeerCode>().unwrap();
        r.decompress().unwrap();
        assert_eq!(r.position(), 0);
        assert_eq!(r.read_string().unwrap(), "alice");
        assert_eq!(r.read_integer().unwrap(), 99);
        assert!(matches!(r.decompress(), Err(MessageError::Compression(_))));
    }

    #[test]
    fn truncated_compressed_stream_fails() {
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_string(&"x".repeat(500))
            .compress()
            .unwrap()
            .build();
        let mut body = bytes[4..bytes.len() - 6].to_vec();
        let mut framed = (body.len() as i32).to_le_bytes().to_vec();
        framed.append(&mut body);
        let mut r = MessageReader::new(framed).unwrap();
        r.read_code::<PeerCode>().unwrap();
        assert!(matches!(r.decompress(), Err(MessageError::Compression(_))));
    }

    #[test]
    fn oversized_decompressed_payload_fails() {
        let zeros = vec![0u8; MAX_DECOMPRESSED_LEN + 1];
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_bytes(&zeros)
            .compress()
            .unwrap()
            .build();
        // the compressed frame is tiny compared to what it inflates to
        assert!(bytes.len() < 1024 * 1024);
        let mut r = MessageReader::new(bytes).unwrap();
        r.read_code::<PeerCode>().unwrap();
        let err = r.decompress().unwrap_err();
        assert!(matches!(&err, MessageError::Compression(reason) if reason.contains("exceeds")));
    }

    #[test]
    fn garbage_compressed_stream_fails() {
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8])
            .build();
        let mut r = MessageReader::new(bytes).unwrap();
        r.read_code::<PeerCode>().unwrap();
        assert!(matches!(r.decompress(), Err(MessageError::Compression(_))));
    }
}
