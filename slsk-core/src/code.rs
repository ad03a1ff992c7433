//! Message codes. Each family has its own code width on the wire.

/// A family of message codes sharing one code width.
pub trait CodeFamily: Copy + std::fmt::Debug + Into<u32> {
    /// Width of the code field in bytes.
    const WIDTH: usize;
}

macro_rules! message_codes {
    (
        $(#[$meta:meta])*
        $name:ident, width = $width:literal {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl From<$name> for u32 {
            fn from(code: $name) -> u32 {
                code as u32
            }
        }

        impl TryFrom<u32> for $name {
            type Error = u32;

            fn try_from(raw: u32) -> Result<Self, u32> {
                match raw {
                    $($value => Ok($name::$variant),)+
                    other => Err(other),
                }
            }
        }

        impl CodeFamily for $name {
            const WIDTH: usize = $width;
        }
    };
}

message_codes! {
    /// Codes for messages exchanged with the server.
    ServerCode, width = 4 {
        Login = 1,
        SetListenPort = 2,
        GetPeerAddress = 3,
        ConnectToPeer = 18,
        FileSearch = 26,
        UserSearch = 42,
        RoomSearch = 120,
    }
}

message_codes! {
    /// Codes for messages exchanged over peer message connections.
    PeerCode, width = 4 {
        BrowseRequest = 4,
        BrowseResponse = 5,
        SearchRequest = 8,
        SearchResponse = 9,
        InfoRequest = 15,
        InfoResponse = 16,
        FolderContentsRequest = 36,
        FolderContentsResponse = 37,
        TransferRequest = 40,
        TransferResponse = 41,
        QueueDownload = 43,
        PlaceInQueueResponse = 44,
        UploadFailed = 46,
        UploadDenied = 50,
        PlaceInQueueRequest = 51,
    }
}

message_codes! {
    /// Codes for messages relayed over distributed connections.
    DistributedCode, width = 1 {
        Ping = 0,
        SearchRequest = 3,
        BranchLevel = 4,
        BranchRoot = 5,
        ChildDepth = 7,
        EmbeddedMessage = 93,
    }
}

message_codes! {
    /// Codes for the first message sent on a freshly opened peer connection.
    InitializationCode, width = 1 {
        PierceFirewall = 0,
        PeerInit = 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_convert_both_ways() {
        assert_eq!(u32::from(PeerCode::QueueDownload), 43);
        assert_eq!(PeerCode::try_from(9), Ok(PeerCode::SearchResponse));
        assert_eq!(DistributedCode::try_from(93), Ok(DistributedCode::EmbeddedMessage));
        assert_eq!(ServerCode::try_from(26), Ok(ServerCode::FileSearch));
    }

    #[test]
    fn unknown_code_is_returned_as_error() {
        assert_eq!(PeerCode::try_from(9999), Err(9999));
        assert_eq!(InitializationCode::try_from(2), Err(2));
    }

    #[test]
    fn widths_differ_by_family() {
        assert_eq!(ServerCode::WIDTH, 4);
        assert_eq!(PeerCode::WIDTH, 4);
        assert_eq!(DistributedCode::WIDTH, 1);
        assert_eq!(InitializationCode::WIDTH, 1);
    }
}
