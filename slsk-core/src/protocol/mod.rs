//! Message catalog: one closed type per protocol message.
//!
//! Every entry writes its own code first on encode, and on decode checks the
//! leading code before reading any field.

use bytes::Bytes;

use crate::reader::MessageError;

pub mod distributed;
pub mod file;
pub mod init;
pub mod peer;
pub mod search_response;
pub mod server;

pub use distributed::DistributedSearchRequest;
pub use file::{Directory, File, FileAttribute, FileAttributeType};
pub use init::{PeerInit, PierceFirewall};
pub use peer::{
    BrowseRequest, BrowseResponse, EnqueueDownloadRequest, PlaceInQueueRequest,
    PlaceInQueueResponse, TransferRequest, TransferRequestKind, TransferResponse, UploadDenied,
    UploadFailed,
};
pub use search_response::{SearchResponse, SearchResponseSlim};
pub use server::{FileSearchRequest, UserSearchRequest};

/// Encode/decode entry points shared by every catalog entry.
pub trait WireMessage: Sized {
    /// Build the framed message bytes.
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError>;

    /// Parse a framed message, failing fast on a code mismatch.
    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError>;
}
