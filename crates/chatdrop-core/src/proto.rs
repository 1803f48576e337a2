//! Protocol buffer message definitions
//!
//! Every message on the data channel is an [`Envelope`] carrying exactly one
//! of three payloads. The messages are defined by hand so no protoc is
//! needed at build time.

use crate::{Error, Result, TextEntry, TransferId, PROTOCOL_VERSION};
use bytes::Bytes;
use prost::Message;
use std::fmt;

/// Message envelope wrapping all channel messages
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// The actual message payload
    #[prost(oneof = "Payload", tags = "10, 20, 21")]
    pub payload: Option<Payload>,
}

/// Payload variants for the envelope
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "10")]
    ChatMessage(ChatMessage),
    #[prost(message, tag = "20")]
    FileNew(FileNew),
    #[prost(message, tag = "21")]
    FileChunk(FileChunk),
}

// Chat messages

#[derive(Clone, PartialEq, Message)]
pub struct ChatMessage {
    #[prost(string, tag = "1")]
    pub nick: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(uint64, tag = "3")]
    pub date: u64,
}

// Transfer messages

#[derive(Clone, PartialEq, Message)]
pub struct FileNew {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub filename: String,
    #[prost(uint64, tag = "3")]
    pub size: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct FileChunk {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub chunk: Bytes,
}

/// The type tag of a channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ChatMessage,
    FileNew,
    FileChunk,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ChatMessage => "chat:message",
            MessageKind::FileNew => "file:new",
            MessageKind::FileChunk => "file:chunk",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Payload {
    /// Type tag of this payload
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::ChatMessage(_) => MessageKind::ChatMessage,
            Payload::FileNew(_) => MessageKind::FileNew,
            Payload::FileChunk(_) => MessageKind::FileChunk,
        }
    }
}

// Helper implementations

impl Envelope {
    /// Create a new envelope with the current protocol version
    pub fn new(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            payload: Some(payload),
        }
    }

    /// Type tag of the carried payload, if any
    pub fn kind(&self) -> Option<MessageKind> {
        self.payload.as_ref().map(Payload::kind)
    }

    /// Encode the envelope to bytes
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    /// Decode an envelope from bytes, checking version compatibility
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let envelope = Self::decode(buf)?;

        if envelope.version != PROTOCOL_VERSION as u32 {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }

        Ok(envelope)
    }

    /// Take the payload out, failing on an empty envelope
    pub fn into_payload(self) -> Result<Payload> {
        self.payload.ok_or(Error::EmptyPayload)
    }
}

impl From<&TextEntry> for ChatMessage {
    fn from(entry: &TextEntry) -> Self {
        Self {
            nick: entry.nick.clone(),
            message: entry.message.clone(),
            date: entry.date,
        }
    }
}

impl From<ChatMessage> for TextEntry {
    fn from(msg: ChatMessage) -> Self {
        Self {
            nick: msg.nick,
            message: msg.message,
            date: msg.date,
        }
    }
}

/// Helper functions to create the three message types

pub fn chat_message(entry: &TextEntry) -> Envelope {
    Envelope::new(Payload::ChatMessage(entry.into()))
}

pub fn file_new(id: &TransferId, filename: &str, size: u64) -> Envelope {
    Envelope::new(Payload::FileNew(FileNew {
        id: id.as_str().to_string(),
        filename: filename.to_string(),
        size,
    }))
}

pub fn file_chunk(id: &TransferId, chunk: Bytes) -> Envelope {
    Envelope::new(Payload::FileChunk(FileChunk {
        id: id.as_str().to_string(),
        chunk,
    }))
}
