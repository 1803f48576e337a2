//! Data channel abstraction
//!
//! The chat layer talks to the peer through one [`DataChannel`]. The real
//! transport (and its offer/answer signaling) lives outside this crate; the
//! trait lets the chat layer run against a mock in tests and against an
//! in-memory loopback pair in the CLI.
//!
//! Channels report back through [`ChannelEvent`]s, which the owner of the
//! channel feeds into the chat log one at a time.

use crate::{Error, Result};
use bytes::Bytes;
use std::fmt;

/// Connection state of a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Nothing has happened yet
    New,
    /// Offer/answer exchange in progress
    Connecting,
    /// Messages can be sent
    Open,
    /// Closed by either side; terminal
    Closed,
}

/// Media requested when initiating a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub audio: bool,
    pub video: bool,
}

impl ConnectOptions {
    /// Data channel only, no media tracks
    pub fn text_only() -> Self {
        Self::default()
    }
}

/// An opaque session description (offer or answer) produced by a channel
#[derive(Clone, PartialEq, Eq)]
pub struct SessionDescription(String);

impl SessionDescription {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self(sdp.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionDescription({} bytes)", self.0.len())
    }
}

/// Notifications produced by a data channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// An encoded envelope arrived from the peer
    Message(Bytes),
    /// The channel is open and can send
    Ready,
    /// The channel closed
    Closed,
    /// A local offer is ready to be signaled to the peer
    OfferReady(SessionDescription),
    /// A local answer is ready to be signaled to the peer
    AnswerReady(SessionDescription),
}

/// Transport trait for the peer data channel
///
/// Ordering contract: messages passed to `send` are delivered to the peer in
/// order, at most once. The chat layer does no reordering of its own.
#[allow(async_fn_in_trait)]
pub trait DataChannel: Send {
    /// Current connection state
    fn state(&self) -> ChannelState;

    /// Start connecting; the offer is reported as `ChannelEvent::OfferReady`
    async fn initiate(&mut self, options: ConnectOptions) -> Result<()>;

    /// Accept a remote offer; the answer is reported as `ChannelEvent::AnswerReady`
    async fn answer(&mut self, offer: SessionDescription) -> Result<()>;

    /// Complete the handshake with the remote answer
    async fn establish(&mut self, answer: SessionDescription) -> Result<()>;

    /// Send one encoded message
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Close the channel
    async fn close(&mut self) -> Result<()>;
}

pub mod mock {
    //! Mock channel for testing

    use super::*;
    use crate::proto::Envelope;

    /// A mock channel that records everything and never emits events itself
    #[derive(Debug)]
    pub struct MockChannel {
        state: ChannelState,
        sent: Vec<Bytes>,
        initiations: Vec<ConnectOptions>,
        answered: Vec<SessionDescription>,
        established: Vec<SessionDescription>,
    }

    impl MockChannel {
        /// Create a mock channel in the `New` state
        pub fn new() -> Self {
            Self {
                state: ChannelState::New,
                sent: Vec::new(),
                initiations: Vec::new(),
                answered: Vec::new(),
                established: Vec::new(),
            }
        }

        /// Create a mock channel that is already open
        pub fn open() -> Self {
            let mut channel = Self::new();
            channel.state = ChannelState::Open;
            channel
        }

        pub fn set_state(&mut self, state: ChannelState) {
            self.state = state;
        }

        /// Get all sent messages
        pub fn sent(&self) -> &[Bytes] {
            &self.sent
        }

        /// Decode all sent messages
        pub fn sent_envelopes(&self) -> Vec<Envelope> {
            self.sent
                .iter()
                .map(|data| Envelope::from_bytes(data).expect("mock only records valid envelopes"))
                .collect()
        }

        pub fn initiations(&self) -> &[ConnectOptions] {
            &self.initiations
        }

        pub fn answered(&self) -> &[SessionDescription] {
            &self.answered
        }

        pub fn established(&self) -> &[SessionDescription] {
            &self.established
        }
    }

    impl Default for MockChannel {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DataChannel for MockChannel {
        fn state(&self) -> ChannelState {
            self.state
        }

        async fn initiate(&mut self, options: ConnectOptions) -> Result<()> {
            self.initiations.push(options);
            if self.state == ChannelState::New {
                self.state = ChannelState::Connecting;
            }
            Ok(())
        }

        async fn answer(&mut self, offer: SessionDescription) -> Result<()> {
            self.answered.push(offer);
            self.state = ChannelState::Connecting;
            Ok(())
        }

        async fn establish(&mut self, answer: SessionDescription) -> Result<()> {
            self.established.push(answer);
            Ok(())
        }

        async fn send(&mut self, data: Bytes) -> Result<()> {
            if self.state != ChannelState::Open {
                return Err(Error::SendFailed("not open".to_string()));
            }
            self.sent.push(data);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.state = ChannelState::Closed;
            Ok(())
        }
    }
}

pub mod memory {
    //! In-process loopback channel pair
    //!
    //! Each endpoint pushes its own notifications (offer, answer, ready,
    //! closed) onto its local event queue and delivers sent messages onto the
    //! peer's queue. Signaling is simulated: the offer and answer are plain
    //! strings the application relays between the two endpoints.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

    /// One side of a loopback pair
    #[derive(Debug)]
    pub struct MemoryChannel {
        name: String,
        state: ChannelState,
        closed: Arc<AtomicBool>,
        local: UnboundedSender<ChannelEvent>,
        remote: UnboundedSender<ChannelEvent>,
    }

    /// A channel together with the queue its events arrive on
    #[derive(Debug)]
    pub struct MemoryEndpoint {
        pub channel: MemoryChannel,
        pub events: UnboundedReceiver<ChannelEvent>,
    }

    impl MemoryChannel {
        /// Create two connected endpoints
        pub fn pair(a: &str, b: &str) -> (MemoryEndpoint, MemoryEndpoint) {
            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));

            let a = MemoryEndpoint {
                channel: MemoryChannel {
                    name: a.to_string(),
                    state: ChannelState::New,
                    closed: closed.clone(),
                    local: a_tx.clone(),
                    remote: b_tx.clone(),
                },
                events: a_rx,
            };
            let b = MemoryEndpoint {
                channel: MemoryChannel {
                    name: b.to_string(),
                    state: ChannelState::New,
                    closed,
                    local: b_tx,
                    remote: a_tx,
                },
                events: b_rx,
            };
            (a, b)
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        fn notify(&self, event: ChannelEvent) -> Result<()> {
            self.local
                .send(event)
                .map_err(|_| Error::Channel(format!("{}: event queue dropped", self.name)))
        }
    }

    impl DataChannel for MemoryChannel {
        fn state(&self) -> ChannelState {
            if self.closed.load(Ordering::SeqCst) {
                ChannelState::Closed
            } else {
                self.state
            }
        }

        async fn initiate(&mut self, options: ConnectOptions) -> Result<()> {
            if self.state() != ChannelState::New {
                return Err(Error::Channel(format!(
                    "{}: cannot initiate from {:?}",
                    self.name,
                    self.state()
                )));
            }
            tracing::debug!("{}: initiating (audio={}, video={})", self.name, options.audio, options.video);
            self.state = ChannelState::Connecting;
            self.notify(ChannelEvent::OfferReady(SessionDescription::new(format!(
                "memory-offer:{}",
                self.name
            ))))
        }

        async fn answer(&mut self, offer: SessionDescription) -> Result<()> {
            if self.state() != ChannelState::New {
                return Err(Error::Channel(format!(
                    "{}: cannot answer from {:?}",
                    self.name,
                    self.state()
                )));
            }
            tracing::debug!("{}: answering {}", self.name, offer.as_str());
            self.state = ChannelState::Open;
            self.notify(ChannelEvent::AnswerReady(SessionDescription::new(format!(
                "memory-answer:{}",
                self.name
            ))))?;
            self.notify(ChannelEvent::Ready)
        }

        async fn establish(&mut self, answer: SessionDescription) -> Result<()> {
            if self.state() != ChannelState::Connecting {
                return Err(Error::Channel(format!(
                    "{}: cannot establish from {:?}",
                    self.name,
                    self.state()
                )));
            }
            tracing::debug!("{}: established with {}", self.name, answer.as_str());
            self.state = ChannelState::Open;
            self.notify(ChannelEvent::Ready)
        }

        async fn send(&mut self, data: Bytes) -> Result<()> {
            if self.state() != ChannelState::Open {
                return Err(Error::SendFailed(format!("{}: not open", self.name)));
            }
            self.remote
                .send(ChannelEvent::Message(data))
                .map_err(|_| Error::SendFailed(format!("{}: peer gone", self.name)))
        }

        async fn close(&mut self) -> Result<()> {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.state = ChannelState::Closed;
            // Either queue may already be gone during shutdown
            let _ = self.local.send(ChannelEvent::Closed);
            let _ = self.remote.send(ChannelEvent::Closed);
            Ok(())
        }
    }
}
