//! First message on a newly opened peer connection (1-byte codes).

use bytes::Bytes;

use crate::builder::MessageBuilder;
use crate::code::InitializationCode;
use crate::protocol::WireMessage;
use crate::reader::{MessageError, MessageReader};

/// Connection type for peer message connections.
pub const CONNECTION_TYPE_PEER: &str = "P";
/// Connection type for file transfer connections.
pub const CONNECTION_TYPE_TRANSFER: &str = "F";
/// Connection type for distributed connections.
pub const CONNECTION_TYPE_DISTRIBUTED: &str = "D";

/// Identifies the connecting user and what the connection is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInit {
    pub username: String,
    pub connection_type: String,
    pub token: i32,
}

impl WireMessage for PeerInit {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(InitializationCode::PeerInit)
            .write_string(&self.username)
            .write_string(&self.connection_type)
            .write_integer(self.token)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(InitializationCode::PeerInit, "Peer Init")?;
        let username = reader.read_string()?;
        let connection_type = reader.read_string()?;
        let token = reader.read_integer()?;
        Ok(Self {
            username,
            connection_type,
            token,
        })
    }
}

/// Sent in answer to an indirect connection request, echoing its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PierceFirewall {
    pub token: i32,
}

impl WireMessage for PierceFirewall {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(InitializationCode::PierceFirewall)
            .write_integer(self.token)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(InitializationCode::PierceFirewall, "Pierce Firewall")?;
        let token = reader.read_integer()?;
        Ok(Self { token })
    }
}
