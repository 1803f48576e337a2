//! Chatdrop Core - Chunked file transfer over a single data channel
//!
//! This crate provides the building blocks shared by every chatdrop peer:
//! the wire envelope, the per-file transfer state machines, the routing
//! registry and the data channel abstraction.

pub mod channel;
pub mod error;
pub mod notify;
pub mod proto;
pub mod registry;
pub mod transfer;
pub mod types;

pub use channel::{ChannelEvent, ChannelState, ConnectOptions, DataChannel, SessionDescription};
pub use error::{Error, Result};
pub use notify::{Subscribers, Subscription, SubscriptionId};
pub use registry::TransferRegistry;
pub use transfer::{
    progress, Artifact, ReceiverTransfer, SenderTransfer, Transfer, TransferEvent, TransferState,
    TransferView,
};
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default chunk size: 512 KB
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Tag attached to signaling notifications produced by the text chat
pub const PROTOCOL_TAG: &str = "text-chat";
