//! Soulseek client core.
//! Host-driven: no I/O; host passes received bytes in and writes returned actions out.

pub mod builder;
pub mod client;
pub mod code;
pub mod protocol;
pub mod reader;
pub mod search;
pub mod tracker;
pub mod transfer;
pub mod wire;

pub use builder::MessageBuilder;
pub use client::{Client, OutboundAction, SearchError};
pub use code::{CodeFamily, DistributedCode, InitializationCode, PeerCode, ServerCode};
pub use protocol::{SearchResponse, SearchResponseSlim, WireMessage};
pub use reader::{MessageError, MessageReader, ReadError};
pub use search::{SearchEvent, SearchOptions, SearchSession, SearchState};
pub use tracker::{TrackedTransfer, TransferKey, TransferTracker};
pub use transfer::{Transfer, TransferDirection, TransferEvent, TransferState};
pub use wire::{decode_frame, FrameCodec, FrameDecodeError, MAX_FRAME_LEN};
