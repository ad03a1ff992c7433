//! Peer search responses, in full and slim (file list deferred) form.
//!
//! Decompressed payload layout:
//!
//! ```text
//! username | token | file count | files...
//! free upload slots (1) | upload speed (4) | queue length (8) | reserved (4)
//! ```
//!
//! The trailer is located by its offset from the end of the payload so that it
//! can be read before the variable-length file list.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::builder::MessageBuilder;
use crate::code::PeerCode;
use crate::protocol::file::{read_files, write_files, File};
use crate::protocol::WireMessage;
use crate::reader::{MessageError, MessageReader, ReadError};

/// Distance of the trailer from the end of the decompressed payload.
pub const TRAILER_OFFSET_FROM_END: usize = 17;

/// Bytes following the queue length; skipped, never interpreted.
const TRAILER_RESERVED: [u8; 4] = [0; 4];

/// A search response with its file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub username: String,
    pub token: i32,
    pub free_upload_slots: u8,
    pub upload_speed: i32,
    pub queue_length: i64,
    pub files: Vec<File>,
}

impl SearchResponse {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Replace the file list, keeping the peer-level fields. Used after file filtering.
    pub fn with_files(self, files: Vec<File>) -> Self {
        Self { files, ..self }
    }
}

impl WireMessage for SearchResponse {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_string(&self.username)
            .write_integer(self.token)
            .with(|b| write_files(b, &self.files))
            .write_byte(self.free_upload_slots)
            .write_integer(self.upload_speed)
            .write_long(self.queue_length)
            .write_bytes(&TRAILER_RESERVED)
            .compress()?
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        SearchResponseSlim::from_bytes(bytes)?.into_response()
    }
}

/// A search response parsed far enough to be filtered. The file list stays in
/// the (immutable, shared) payload until [`SearchResponseSlim::files`] is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponseSlim {
    pub username: String,
    pub token: i32,
    pub file_count: i32,
    pub free_upload_slots: u8,
    pub upload_speed: i32,
    pub queue_length: i64,
    payload: Bytes,
    files_offset: usize,
}

impl SearchResponseSlim {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::SearchResponse, "Peer Search Response")?;
        reader.decompress()?;

        let username = reader.read_string()?;
        let token = reader.read_integer()?;
        let file_count = reader.read_integer()?;
        let files_offset = reader.position();

        let trailer = reader
            .len()
            .checked_sub(TRAILER_OFFSET_FROM_END)
            .filter(|&trailer| trailer >= files_offset)
            .ok_or(ReadError::Truncated {
                needed: TRAILER_OFFSET_FROM_END,
                remaining: reader.remaining(),
            })?;
        reader.seek(trailer)?;
        let free_upload_slots = reader.read_byte()?;
        let upload_speed = reader.read_integer()?;
        let queue_length = reader.read_long()?;

        Ok(Self {
            username,
            token,
            file_count,
            free_upload_slots,
            upload_speed,
            queue_length,
            payload: reader.buffer(),
            files_offset,
        })
    }

    /// Parse the deferred file list. Each call reads from a fresh cursor.
    pub fn files(&self) -> Result<Vec<File>, MessageError> {
        let end = self.payload.len() - TRAILER_OFFSET_FROM_END;
        let mut reader = MessageReader::from_payload(self.payload.slice(..end), self.files_offset);
        read_files(&mut reader, self.file_count)
    }

    /// Materialize the files and produce the full response.
    pub fn into_response(self) -> Result<SearchResponse, MessageError> {
        let files = self.files()?;
        Ok(SearchResponse {
            username: self.username,
            token: self.token,
            free_upload_slots: self.free_upload_slots,
            upload_speed: self.upload_speed,
            queue_length: self.queue_length,
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::file::FileAttributeType;
    use crate::protocol::test_support::assert_round_trip;

    fn response(files: Vec<File>) -> SearchResponse {
        SearchResponse {
            username: "alice".into(),
            token: 1234,
            free_upload_slots: 3,
            upload_speed: 1_500_000,
            queue_length: 42,
            files,
        }
    }

    fn many_files(n: usize) -> Vec<File> {
        (0..n)
            .map(|i| {
                File::new(format!("@@music\\album\\{i:04}.mp3"), 1000 + i as i64)
                    .with_attribute(FileAttributeType::BIT_RATE, 320)
            })
            .collect()
    }

    #[test]
    fn round_trip() {
        assert_round_trip(response(Vec::new()));
        assert_round_trip(response(many_files(3)));
    }

    #[test]
    fn trailer_recovered_regardless_of_file_list_length() {
        for n in [0, 1, 7, 250] {
            let bytes = response(many_files(n)).to_bytes().unwrap();
            let slim = SearchResponseSlim::from_bytes(bytes).unwrap();
            assert_eq!(slim.free_upload_slots, 3);
            assert_eq!(slim.upload_speed, 1_500_000);
            assert_eq!(slim.queue_length, 42);
            assert_eq!(slim.file_count, n as i32);
            assert_eq!(slim.files().unwrap().len(), n);
        }
    }

    #[test]
    fn trailer_read_from_hand_built_payload() {
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_string("bob")
            .write_integer(9)
            .write_integer(0)
            .write_byte(0)
            .write_integer(77)
            .write_long(-5)
            .write_bytes(&[0xaa; 4])
            .compress()
            .unwrap()
            .build();
        let slim = SearchResponseSlim::from_bytes(bytes).unwrap();
        assert_eq!(slim.username, "bob");
        assert_eq!(slim.token, 9);
        assert_eq!(slim.free_upload_slots, 0);
        assert_eq!(slim.upload_speed, 77);
        assert_eq!(slim.queue_length, -5);
        assert!(slim.files().unwrap().is_empty());
    }

    #[test]
    fn payload_too_short_for_trailer_fails() {
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_string("bob")
            .write_integer(9)
            .write_integer(0)
            .write_byte(1)
            .compress()
            .unwrap()
            .build();
        assert!(matches!(
            SearchResponseSlim::from_bytes(bytes),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn overstated_file_count_fails_on_materialize() {
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_string("bob")
            .write_integer(9)
            .write_integer(1000)
            .write_byte(1)
            .write_integer(1)
            .write_long(0)
            .write_bytes(&TRAILER_RESERVED)
            .compress()
            .unwrap()
            .build();
        let slim = SearchResponseSlim::from_bytes(bytes).unwrap();
        assert!(slim.files().is_err());
    }

    #[test]
    fn uncompressed_payload_is_a_compression_error() {
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_string("bob")
            .build();
        assert!(matches!(
            SearchResponseSlim::from_bytes(bytes),
            Err(MessageError::Compression(_))
        ));
    }

    #[test]
    fn wrong_code_fails_before_decompressing() {
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::BrowseResponse)
            .write_bytes(b"not zlib")
            .build();
        assert!(matches!(
            SearchResponseSlim::from_bytes(bytes),
            Err(MessageError::CodeMismatch {
                expected: 9,
                actual: 5,
                ..
            })
        ));
    }
}
