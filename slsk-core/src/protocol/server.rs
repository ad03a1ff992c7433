//! Search requests sent to the server (4-byte codes).

use bytes::Bytes;

use crate::builder::MessageBuilder;
use crate::code::ServerCode;
use crate::protocol::WireMessage;
use crate::reader::{MessageError, MessageReader};

/// Network-wide search, relayed to peers by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSearchRequest {
    pub token: i32,
    pub search_text: String,
}

impl WireMessage for FileSearchRequest {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(ServerCode::FileSearch)
            .write_integer(self.token)
            .write_string(&self.search_text)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(ServerCode::FileSearch, "Server File Search")?;
        let token = reader.read_integer()?;
        let search_text = reader.read_string()?;
        Ok(Self { token, search_text })
    }
}

/// Search limited to the shares of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSearchRequest {
    pub username: String,
    pub token: i32,
    pub search_text: String,
}

impl WireMessage for UserSearchRequest {
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(MessageBuilder::new()
            .write_code(ServerCode::UserSearch)
            .write_string(&self.username)
            .write_integer(self.token)
            .write_string(&self.search_text)
            .build())
    }

    fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, MessageError> {
        let mut reader = MessageReader::new(bytes)?;
        reader.expect_code(ServerCode::UserSearch, "Server User Search")?;
        let username = reader.read_string()?;
        let token = reader.read_integer()?;
        let search_text = reader.read_string()?;
        Ok(Self {
            username,
            token,
            search_text,
        })
    }
}
