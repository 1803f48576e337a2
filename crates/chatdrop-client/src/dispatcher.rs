//! Message dispatcher
//!
//! Multiplexes outgoing chat text and file transfers onto the data channel
//! and demultiplexes incoming envelopes into routing decisions for the
//! chat log. Sends issued before the channel is open are deferred until it
//! signals readiness.

use bytes::Bytes;
use chatdrop_core::proto::{self, Envelope, Payload};
use chatdrop_core::{
    Artifact, ChannelState, ConnectOptions, DataChannel, EntryId, Error, PeerId, Result,
    SenderTransfer, SessionDescription, Subscribers, Subscription, TextEntry, Transfer,
    TransferEvent, TransferId, PROTOCOL_TAG,
};
use std::collections::VecDeque;

/// Notifications produced toward the application / UI layer
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Relay this offer to the peer over the signaling path
    SendOffer {
        peer: PeerId,
        protocol: &'static str,
        offer: SessionDescription,
    },
    /// Relay this answer to the peer over the signaling path
    SendAnswer {
        peer: PeerId,
        protocol: &'static str,
        answer: SessionDescription,
    },
    /// A new entry was appended to the log
    EntryAdded(EntryId),
    /// A chunk was sent or received
    TransferProgress {
        id: TransferId,
        len: usize,
        progress: u8,
    },
    /// A transfer reached its declared size
    TransferComplete { id: TransferId, artifact: Artifact },
    /// The channel closed and the log was emptied
    Cleared,
}

/// What an incoming envelope asks the chat log to do
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `chat:message`: append a text entry
    Text(TextEntry),
    /// `file:new`: create and register a receiving transfer
    Announce {
        id: TransferId,
        filename: String,
        size: u64,
    },
    /// `file:chunk`: route a chunk to a registered transfer
    Chunk { id: TransferId, chunk: Bytes },
}

pub struct Dispatcher<C: DataChannel> {
    channel: C,
    peer: PeerId,
    deferred: VecDeque<Envelope>,
    events: Subscribers<ChatEvent>,
}

impl<C: DataChannel> Dispatcher<C> {
    pub fn new(channel: C, peer: PeerId) -> Self {
        Self {
            channel,
            peer,
            deferred: VecDeque::new(),
            events: Subscribers::new(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Number of sends waiting for the channel to become ready
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn subscribe(&mut self) -> Subscription<ChatEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&mut self, event: ChatEvent) {
        self.events.emit(event);
    }

    /// True when an envelope sent now goes straight onto the wire
    pub fn is_ready(&self) -> bool {
        self.channel.state() == ChannelState::Open && self.deferred.is_empty()
    }

    /// Fail early when nothing can be sent on this channel any more
    pub fn check_sendable(&self) -> Result<()> {
        if self.channel.state() == ChannelState::Closed {
            return Err(Error::SendFailed("channel closed".to_string()));
        }
        Ok(())
    }

    /// Send an envelope now, or defer it until the channel is ready
    ///
    /// A channel that has not started connecting is asked to initiate a
    /// text-only connection. Envelopes deferred earlier always go out
    /// first, even when the channel reports Open before its Ready event.
    pub async fn send(&mut self, envelope: Envelope) -> Result<()> {
        match self.channel.state() {
            ChannelState::Open => {
                if !self.deferred.is_empty() {
                    self.flush_deferred().await;
                }
                self.transmit(&envelope).await
            }
            ChannelState::Closed => Err(Error::SendFailed("channel closed".to_string())),
            state => {
                tracing::debug!(
                    "Channel {:?}, deferring {}",
                    state,
                    envelope.kind().map(|k| k.as_str()).unwrap_or("empty envelope")
                );
                self.deferred.push_back(envelope);
                if state == ChannelState::New {
                    tracing::info!("Initiating connection to {}", self.peer);
                    self.channel.initiate(ConnectOptions::text_only()).await?;
                }
                Ok(())
            }
        }
    }

    async fn transmit(&mut self, envelope: &Envelope) -> Result<()> {
        self.channel.send(envelope.to_bytes()).await
    }

    /// Retry every deferred send once, in order; returns how many went out
    pub async fn flush_deferred(&mut self) -> usize {
        let pending = std::mem::take(&mut self.deferred);
        if !pending.is_empty() {
            tracing::debug!("Channel ready, sending {} deferred message(s)", pending.len());
        }

        let mut sent = 0;
        for envelope in pending {
            match self.transmit(&envelope).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Dropping deferred message: {}", e),
            }
        }
        sent
    }

    /// Send the `file:new` announcement for a sender transfer
    pub async fn announce(&mut self, transfer: &SenderTransfer) -> Result<()> {
        tracing::info!(
            "Announcing {} ({} bytes) as transfer {}",
            transfer.filename(),
            transfer.declared_size(),
            transfer.id()
        );
        self.send(proto::file_new(
            transfer.id(),
            transfer.filename(),
            transfer.declared_size(),
        ))
        .await
    }

    /// Stream an announced sender transfer chunk by chunk
    ///
    /// Only runs on a ready channel, so every chunk read goes straight out
    /// and at most one chunk is held at a time. The transfer is subscribed
    /// before `start()` and unsubscribed once it completes or fails.
    pub async fn stream(&mut self, transfer: &mut SenderTransfer) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::InvalidState(format!(
                "channel not ready to stream transfer {}",
                transfer.id()
            )));
        }

        let mut subscription = transfer.subscribe();
        let result = self.pump(transfer, &mut subscription).await;
        transfer.unsubscribe(subscription.id());
        result
    }

    async fn pump(
        &mut self,
        transfer: &mut SenderTransfer,
        subscription: &mut Subscription<TransferEvent>,
    ) -> Result<()> {
        transfer.start().await?;
        loop {
            for event in subscription.drain() {
                self.forward(event).await?;
            }
            if !transfer.has_scheduled_read() {
                return Ok(());
            }
            transfer.read_next().await?;
        }
    }

    async fn forward(&mut self, event: TransferEvent) -> Result<()> {
        match event {
            TransferEvent::Chunk { id, data, progress } => {
                let len = data.len();
                self.send(proto::file_chunk(&id, data)).await?;
                self.emit(ChatEvent::TransferProgress { id, len, progress });
            }
            TransferEvent::Complete { id, artifact } => {
                self.emit(ChatEvent::TransferComplete { id, artifact });
            }
        }
        Ok(())
    }

    /// Decode an incoming message into a routing decision
    pub fn route(&self, data: &[u8]) -> Result<Inbound> {
        let payload = Envelope::from_bytes(data)?.into_payload()?;
        tracing::trace!("Received {}", payload.kind());

        Ok(match payload {
            Payload::ChatMessage(msg) => Inbound::Text(msg.into()),
            Payload::FileNew(announce) => Inbound::Announce {
                id: wire_id(announce.id)?,
                filename: announce.filename,
                size: announce.size,
            },
            Payload::FileChunk(chunk) => Inbound::Chunk {
                id: wire_id(chunk.id)?,
                chunk: chunk.chunk,
            },
        })
    }

    pub async fn initiate(&mut self) -> Result<()> {
        self.channel.initiate(ConnectOptions::text_only()).await
    }

    pub async fn answer(&mut self, offer: SessionDescription) -> Result<()> {
        self.channel.answer(offer).await
    }

    pub async fn establish(&mut self, answer: SessionDescription) -> Result<()> {
        self.channel.establish(answer).await
    }

    pub(crate) fn offer_ready(&mut self, offer: SessionDescription) {
        let peer = self.peer.clone();
        self.emit(ChatEvent::SendOffer {
            peer,
            protocol: PROTOCOL_TAG,
            offer,
        });
    }

    pub(crate) fn answer_ready(&mut self, answer: SessionDescription) {
        let peer = self.peer.clone();
        self.emit(ChatEvent::SendAnswer {
            peer,
            protocol: PROTOCOL_TAG,
            answer,
        });
    }

    /// Forget all deferred sends
    pub(crate) fn reset(&mut self) {
        self.deferred.clear();
    }
}

/// Transfer ids on the wire must be non-empty
fn wire_id(id: String) -> Result<TransferId> {
    if id.is_empty() {
        return Err(Error::Malformed("empty transfer id".to_string()));
    }
    Ok(TransferId::new(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatdrop_core::channel::mock::MockChannel;
    use chatdrop_core::proto::MessageKind;
    use chatdrop_core::TransferState;

    fn kinds(channel: &MockChannel) -> Vec<MessageKind> {
        channel
            .sent_envelopes()
            .iter()
            .filter_map(|e| e.kind())
            .collect()
    }

    #[tokio::test]
    async fn test_send_when_open() {
        let mut dispatcher = Dispatcher::new(MockChannel::open(), PeerId::new("bob"));
        let entry = TextEntry::new("alice", "hi");

        dispatcher.send(proto::chat_message(&entry)).await.unwrap();

        assert_eq!(kinds(dispatcher.channel()), vec![MessageKind::ChatMessage]);
        assert_eq!(dispatcher.deferred_len(), 0);
    }

    #[tokio::test]
    async fn test_deferred_send_fires_once_after_ready() {
        let mut dispatcher = Dispatcher::new(MockChannel::new(), PeerId::new("bob"));
        let entry = TextEntry::new("alice", "hi");

        dispatcher.send(proto::chat_message(&entry)).await.unwrap();
        assert!(dispatcher.channel().sent().is_empty());
        assert_eq!(dispatcher.deferred_len(), 1);
        assert_eq!(
            dispatcher.channel().initiations(),
            &[ConnectOptions::text_only()]
        );

        dispatcher.channel_mut().set_state(ChannelState::Open);
        assert_eq!(dispatcher.flush_deferred().await, 1);
        assert_eq!(dispatcher.flush_deferred().await, 0);
        assert_eq!(dispatcher.channel().sent().len(), 1);
    }

    #[tokio::test]
    async fn test_connecting_channel_is_not_reinitiated() {
        let mut channel = MockChannel::new();
        channel.set_state(ChannelState::Connecting);
        let mut dispatcher = Dispatcher::new(channel, PeerId::new("bob"));

        let entry = TextEntry::new("alice", "one");
        dispatcher.send(proto::chat_message(&entry)).await.unwrap();
        dispatcher.send(proto::chat_message(&entry)).await.unwrap();

        assert!(dispatcher.channel().initiations().is_empty());
        assert_eq!(dispatcher.deferred_len(), 2);
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_fails() {
        let mut channel = MockChannel::new();
        channel.set_state(ChannelState::Closed);
        let mut dispatcher = Dispatcher::new(channel, PeerId::new("bob"));

        let entry = TextEntry::new("alice", "late");
        let err = dispatcher.send(proto::chat_message(&entry)).await.unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));
        assert_eq!(dispatcher.deferred_len(), 0);
    }

    #[tokio::test]
    async fn test_stream_announces_then_chunks() {
        let mut dispatcher = Dispatcher::new(MockChannel::open(), PeerId::new("bob"));
        let mut events = dispatcher.subscribe();
        let mut transfer =
            SenderTransfer::from_bytes("hello.txt", Bytes::from_static(b"hello world"), 4);

        dispatcher.announce(&transfer).await.unwrap();
        dispatcher.stream(&mut transfer).await.unwrap();

        let sent = dispatcher.channel().sent_envelopes();
        assert_eq!(sent.len(), 4);
        match sent[0].payload.as_ref() {
            Some(Payload::FileNew(announce)) => {
                assert_eq!(announce.id, transfer.id().as_str());
                assert_eq!(announce.filename, "hello.txt");
                assert_eq!(announce.size, 11);
            }
            _ => panic!("Expected FileNew first"),
        }
        let mut body = Vec::new();
        for envelope in &sent[1..] {
            match envelope.payload.as_ref() {
                Some(Payload::FileChunk(chunk)) => body.extend_from_slice(&chunk.chunk),
                _ => panic!("Expected FileChunk"),
            }
        }
        assert_eq!(body, b"hello world");

        let progress: Vec<u8> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ChatEvent::TransferProgress { progress, .. } => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![36, 72, 100]);
        assert!(transfer.is_complete());
    }

    #[tokio::test]
    async fn test_stream_waits_for_ready_channel() {
        let mut dispatcher = Dispatcher::new(MockChannel::new(), PeerId::new("bob"));
        let mut transfer = SenderTransfer::from_bytes("f", Bytes::from(vec![7u8; 40]), 4);

        dispatcher.announce(&transfer).await.unwrap();
        let err = dispatcher.stream(&mut transfer).await.unwrap_err();

        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(transfer.state(), TransferState::Idle);
        assert_eq!(transfer.progress(), 0);
        assert_eq!(dispatcher.deferred_len(), 1);

        // Open but with the announcement still queued is not ready either
        dispatcher.channel_mut().set_state(ChannelState::Open);
        assert!(!dispatcher.is_ready());
        dispatcher.flush_deferred().await;
        dispatcher.stream(&mut transfer).await.unwrap();
        assert_eq!(dispatcher.channel().sent().len(), 11);
        assert!(transfer.is_complete());
    }

    #[tokio::test]
    async fn test_open_before_ready_keeps_send_order() {
        let mut dispatcher = Dispatcher::new(MockChannel::new(), PeerId::new("bob"));
        dispatcher
            .send(proto::chat_message(&TextEntry::new("alice", "first")))
            .await
            .unwrap();

        // Channel is open but its Ready event has not been handled yet
        dispatcher.channel_mut().set_state(ChannelState::Open);
        dispatcher
            .send(proto::chat_message(&TextEntry::new("alice", "second")))
            .await
            .unwrap();
        assert_eq!(dispatcher.flush_deferred().await, 0);

        let order: Vec<String> = dispatcher
            .channel()
            .sent_envelopes()
            .into_iter()
            .filter_map(|e| match e.payload {
                Some(Payload::ChatMessage(msg)) => Some(msg.message),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[test]
    fn test_route_rejects_empty_transfer_id() {
        let dispatcher = Dispatcher::new(MockChannel::open(), PeerId::new("bob"));
        let empty = TransferId::new("");

        let err = dispatcher
            .route(&proto::file_new(&empty, "a.bin", 3).to_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));

        let err = dispatcher
            .route(&proto::file_chunk(&empty, Bytes::from_static(b"x")).to_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_route_decodes_each_kind() {
        let dispatcher = Dispatcher::new(MockChannel::open(), PeerId::new("bob"));
        let id = TransferId::new("t1");

        let entry = TextEntry::new("bob", "yo");
        assert_eq!(
            dispatcher.route(&proto::chat_message(&entry).to_bytes()).unwrap(),
            Inbound::Text(entry)
        );
        assert_eq!(
            dispatcher
                .route(&proto::file_new(&id, "a.bin", 3).to_bytes())
                .unwrap(),
            Inbound::Announce {
                id: id.clone(),
                filename: "a.bin".to_string(),
                size: 3
            }
        );
        assert_eq!(
            dispatcher
                .route(&proto::file_chunk(&id, Bytes::from_static(b"abc")).to_bytes())
                .unwrap(),
            Inbound::Chunk {
                id,
                chunk: Bytes::from_static(b"abc")
            }
        );
    }

    #[test]
    fn test_route_rejects_garbage() {
        let dispatcher = Dispatcher::new(MockChannel::open(), PeerId::new("bob"));
        assert!(dispatcher.route(&[0xff, 0xff, 0xff]).is_err());
    }

    #[tokio::test]
    async fn test_signaling_is_tagged() {
        let mut dispatcher = Dispatcher::new(MockChannel::new(), PeerId::new("bob"));
        let mut events = dispatcher.subscribe();

        dispatcher.offer_ready(SessionDescription::new("offer-sdp"));
        dispatcher.answer_ready(SessionDescription::new("answer-sdp"));

        let events = events.drain();
        assert!(matches!(
            &events[0],
            ChatEvent::SendOffer { peer, protocol, offer }
                if peer.as_str() == "bob" && *protocol == "text-chat" && offer.as_str() == "offer-sdp"
        ));
        assert!(matches!(
            &events[1],
            ChatEvent::SendAnswer { protocol, answer, .. }
                if *protocol == "text-chat" && answer.as_str() == "answer-sdp"
        ));
    }
}
