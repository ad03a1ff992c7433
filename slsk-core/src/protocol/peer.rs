//! Messages exchanged over peer message connections (4-byte codes).

use bytes::Bytes;

use crate::builder::MessageBuilder;
use crate::code::PeerCode;
use crate::protocol::file::Directory;
use crate::protocol::WireMessage;
use crate::reader::{MessageError, MessageReader};
use crate::transfer::TransferDirection;

/// A request to queue a file for download from the receiving peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueDownloadRequest {
    pub filename: String,
}

impl EnqueueDownloadRequest {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }
}

impl WireMessage for EnqueueDownloadRequest {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::QueueDownload)
            .write_string(&self.filename)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::QueueDownload, "Peer Queue Download")?;
        let filename = reader.read_string()?;
        Ok(Self { filename })
    }
}

/// Direction of a [`TransferRequest`]. Only uploads carry a size on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRequestKind {
    Download,
    Upload { size: i64 },
}

/// Announces a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub token: i32,
    pub filename: String,
    pub kind: TransferRequestKind,
}

impl TransferRequest {
    pub fn download(token: i32, filename: impl Into<String>) -> Self {
        Self {
            token,
            filename: filename.into(),
            kind: TransferRequestKind::Download,
        }
    }

    pub fn upload(token: i32, filename: impl Into<String>, size: i64) -> Self {
        Self {
            token,
            filename: filename.into(),
            kind: TransferRequestKind::Upload { size },
        }
    }

    pub fn direction(&self) -> TransferDirection {
        match self.kind {
            TransferRequestKind::Download => TransferDirection::Download,
            TransferRequestKind::Upload { .. } => TransferDirection::Upload,
        }
    }

    pub fn size(&self) -> Option<i64> {
        match self.kind {
            TransferRequestKind::Download => None,
            TransferRequestKind::Upload { size } => Some(size),
        }
    }
}

impl WireMessage for TransferRequest {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::TransferRequest)
            .write_integer(self.direction().to_wire())
            .write_integer(self.token)
            .write_string(&self.filename)
            .with(|b| match self.kind {
                TransferRequestKind::Upload { size } => b.write_long(size),
                TransferRequestKind::Download => b,
            })
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::TransferRequest, "Peer Transfer Request")?;
        let direction = TransferDirection::from_wire(reader.read_integer()?)?;
        let token = reader.read_integer()?;
        let filename = reader.read_string()?;
        let kind = match direction {
            TransferDirection::Upload => TransferRequestKind::Upload {
                size: reader.read_long()?,
            },
            TransferDirection::Download => TransferRequestKind::Download,
        };
        Ok(Self {
            token,
            filename,
            kind,
        })
    }
}

/// Answer to a [`TransferRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResponse {
    /// The size is sent only when answering a download request.
    Allowed { token: i32, size: Option<i64> },
    Refused { token: i32, reason: String },
}

impl TransferResponse {
    pub fn allowed(token: i32, size: Option<i64>) -> Self {
        Self::Allowed { token, size }
    }

    pub fn refused(token: i32, reason: impl Into<String>) -> Self {
        Self::Refused {
            token,
            reason: reason.into(),
        }
    }

    pub fn token(&self) -> i32 {
        match self {
            Self::Allowed { token, .. } | Self::Refused { token, .. } => *token,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Refused { reason, .. } => Some(reason),
            Self::Allowed { .. } => None,
        }
    }
}

impl WireMessage for TransferResponse {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::TransferResponse)
            .write_integer(self.token())
            .write_bool(self.is_allowed())
            .with(|b| match self {
                Self::Allowed { size: Some(size), .. } => b.write_long(*size),
                Self::Allowed { size: None, .. } => b,
                Self::Refused { reason, .. } => b.write_string(reason),
            })
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::TransferResponse, "Peer Transfer Response")?;
        let token = reader.read_integer()?;
        if !reader.read_bool()? {
            let reason = reader.read_string()?;
            return Ok(Self::Refused { token, reason });
        }
        let size = if reader.remaining() > 0 {
            Some(reader.read_long()?)
        } else {
            None
        };
        Ok(Self::Allowed { token, size })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceInQueueRequest {
    pub filename: String,
}

impl PlaceInQueueRequest {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }
}

impl WireMessage for PlaceInQueueRequest {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::PlaceInQueueRequest)
            .write_string(&self.filename)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::PlaceInQueueRequest, "Peer Place In Queue Request")?;
        let filename = reader.read_string()?;
        Ok(Self { filename })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceInQueueResponse {
    pub filename: String,
    pub place_in_queue: i32,
}

impl WireMessage for PlaceInQueueResponse {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::PlaceInQueueResponse)
            .write_string(&self.filename)
            .write_integer(self.place_in_queue)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::PlaceInQueueResponse, "Peer Place In Queue Response")?;
        let filename = reader.read_string()?;
        let place_in_queue = reader.read_integer()?;
        Ok(Self {
            filename,
            place_in_queue,
        })
    }
}

/// Sent by an uploader whose transfer of `filename` failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailed {
    pub filename: String,
}

impl WireMessage for UploadFailed {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::UploadFailed)
            .write_string(&self.filename)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::UploadFailed, "Peer Upload Failed")?;
        let filename = reader.read_string()?;
        Ok(Self { filename })
    }
}

/// Sent by a peer refusing to queue `filename`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDenied {
    pub filename: String,
    pub message: String,
}

impl WireMessage for UploadDenied {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::UploadDenied)
            .write_string(&self.filename)
            .write_string(&self.message)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::UploadDenied, "Peer Upload Denied")?;
        let filename = reader.read_string()?;
        let message = reader.read_string()?;
        Ok(Self { filename, message })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrowseRequest;

impl WireMessage for BrowseRequest {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::BrowseRequest)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::BrowseRequest, "Peer Browse Request")?;
        Ok(Self)
    }
}

/// A peer's full share listing. The payload is compressed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrowseResponse {
    pub directories: Vec<Directory>,
}

impl WireMessage for BrowseResponse {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(PeerCode::BrowseResponse)
            .write_integer(self.directories.len() as i32)
            .with(|b| self.directories.iter().fold(b, |b, d| d.write(b)))
            .compress()?
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(PeerCode::BrowseResponse, "Peer Browse Response")?;
        reader.decompress()?;
        let count = reader.read_integer()?;
        let mut directories = Vec::new();
        for _ in 0..count.max(0) {
            directories.push(Directory::read(&mut reader)?);
        }
        Ok(Self { directories })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::file::{File, FileAttributeType};
    use crate::protocol::test_support::assert_round_trip;
    use crate::reader::ReadError;

    #[test]
    fn enqueue_download_round_trip() {
        assert_round_trip(EnqueueDownloadRequest::new("@@share\\music\\a.mp3"));
        assert_round_trip(EnqueueDownloadRequest::new(""));
    }

    #[test]
    fn enqueue_download_wire_layout() {
        let bytes = EnqueueDownloadRequest::new("ab").to_bytes().unwrap();
        assert_eq!(bytes, vec![10, 0, 0, 0, 43, 0, 0, 0, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn code_mismatch_reports_both_codes() {
        let bytes = UploadFailed {
            filename: "a".into(),
        }
        .to_bytes()
        .unwrap();
        let err = EnqueueDownloadRequest::from_bytes(bytes).unwrap_err();
        assert_eq!(
            err,
            MessageError::CodeMismatch {
                message: "Peer Queue Download",
                expected: 43,
                actual: 46
            }
        );
        assert!(err.to_string().contains("expected: 43, received: 46"));
    }

    #[test]
    fn truncated_enqueue_download_fails() {
        let bytes = EnqueueDownloadRequest::new("abcdef").to_bytes().unwrap();
        let mut short = bytes[..bytes.len() - 2].to_vec();
        short[0] -= 2;
        assert!(matches!(
            EnqueueDownloadRequest::from_bytes(short),
            Err(MessageError::Malformed(ReadError::Truncated { .. }))
        ));
    }

    #[test]
    fn transfer_request_round_trip() {
        assert_round_trip(TransferRequest::download(i32::MAX, "a.mp3"));
        assert_round_trip(TransferRequest::upload(-1, "b.flac", i64::MAX));
    }

    #[test]
    fn transfer_request_size_only_on_uploads() {
        let download = TransferRequest::download(1, "a");
        assert_eq!(download.direction(), TransferDirection::Download);
        assert_eq!(download.size(), None);
        let upload = TransferRequest::upload(2, "a", 0);
        assert_eq!(upload.direction(), TransferDirection::Upload);
        assert_eq!(upload.size(), Some(0));
        assert_round_trip(upload);

        let bytes = TransferRequest::download(1, "ab").to_bytes().unwrap();
        assert_eq!(bytes.len(), 4 + 4 + 4 + 4 + 4 + 2);
    }

    #[test]
    fn transfer_request_rejects_unknown_direction() {
        let bytes = MessageBuilder::new()
            .write_code(PeerCode::TransferRequest)
            .write_integer(7)
            .write_integer(1)
            .write_string("a")
            .build();
        assert!(matches!(
            TransferRequest::from_bytes(bytes),
            Err(MessageError::Malformed(ReadError::InvalidValue { value: 7, .. }))
        ));
    }

    #[test]
    fn transfer_response_round_trip() {
        assert_round_trip(TransferResponse::allowed(5, Some(1024)));
        assert_round_trip(TransferResponse::allowed(5, None));
        assert_round_trip(TransferResponse::refused(6, "Queued"));
        assert_round_trip(TransferResponse::refused(7, ""));
    }

    #[test]
    fn transfer_response_accessors() {
        let allowed = TransferResponse::allowed(5, Some(1));
        assert!(allowed.is_allowed());
        assert_eq!(allowed.token(), 5);
        assert_eq!(allowed.reason(), None);

        let refused = TransferResponse::refused(6, "Cancelled");
        assert!(!refused.is_allowed());
        assert_eq!(refused.token(), 6);
        assert_eq!(refused.reason(), Some("Cancelled"));
        assert!(matches!(
            TransferResponse::from_bytes(refused.to_bytes().unwrap()),
            Ok(TransferResponse::Refused { token: 6, .. })
        ));
    }

    #[test]
    fn place_in_queue_round_trip() {
        assert_round_trip(PlaceInQueueRequest::new("a"));
        assert_round_trip(PlaceInQueueResponse {
            filename: "a".into(),
            place_in_queue: 3,
        });
    }

    #[test]
    fn failure_messages_round_trip() {
        assert_round_trip(UploadFailed {
            filename: "x".into(),
        });
        assert_round_trip(UploadDenied {
            filename: "x".into(),
            message: "File not shared.".into(),
        });
    }

    #[test]
    fn browse_round_trip() {
        assert_round_trip(BrowseRequest);
        assert_round_trip(BrowseResponse::default());
        assert_round_trip(BrowseResponse {
            directories: vec![
                Directory::new("@@a\\music", vec![
                    File::new("@@a\\music\\1.mp3", 100)
                        .with_attribute(FileAttributeType::BIT_RATE, 192),
                    File::new("@@a\\music\\2.mp3", 200),
                ]),
                Directory::new("@@a\\empty", Vec::new()),
            ],
        });
    }
}
