//! Messages relayed over distributed connections (1-byte codes).

use bytes::Bytes;

use crate::builder::MessageBuilder;
use crate::code::DistributedCode;
use crate::protocol::WireMessage;
use crate::reader::{MessageError, MessageReader};

/// A search propagated down the distributed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSearchRequest {
    /// Leading field of unknown purpose; carried through unchanged.
    pub unknown: i32,
    pub username: String,
    pub token: i32,
    pub query: String,
}

impl WireMessage for DistributedSearchRequest {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(DistributedCode::SearchRequest)
            .write_integer(self.unknown)
            .write_string(&self.username)
            .write_integer(self.token)
            .write_string(&self.query)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(DistributedCode::SearchRequest, "Distributed Search Request")?;
        let unknown = reader.read_integer()?;
        let username = reader.read_string()?;
        let token = reader.read_integer()?;
        let query = reader.read_string()?;
        Ok(Self {
            unknown,
            username,
            token,
            query,
        })
    }
}
