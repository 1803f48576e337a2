//! Error types for chatdrop

use crate::types::TransferId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Protocol violation on transfer {id}: declared {declared} bytes, received {received}")]
    ProtocolViolation {
        id: TransferId,
        declared: u64,
        received: u64,
    },

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(TransferId),

    #[error("Transfer already registered: {0}")]
    DuplicateTransfer(TransferId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u32 },

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Envelope has no payload")]
    EmptyPayload,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
