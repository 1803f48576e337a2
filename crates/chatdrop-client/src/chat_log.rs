//! Chat log
//!
//! The ordered list of everything exchanged with one peer: text messages,
//! outgoing transfers and incoming transfers. The log owns the dispatcher
//! (and through it the channel) plus the registry that routes inbound
//! chunks to their transfers.

use crate::dispatcher::{ChatEvent, Dispatcher, Inbound};
use bytes::Bytes;
use chatdrop_core::{
    proto, ChannelEvent, DataChannel, EntryId, Error, PeerId, ReceiverTransfer, Result,
    SenderTransfer, SessionDescription, Subscription, TextEntry, Transfer, TransferEvent,
    TransferId, TransferRegistry, TransferView, CHUNK_SIZE,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

/// One entry of the log
#[derive(Debug)]
pub enum Entry {
    Text(TextEntry),
    Outgoing(SenderTransfer),
    Incoming(ReceiverTransfer),
}

impl Entry {
    /// The transfer behind this entry, if it is one
    pub fn as_transfer(&self) -> Option<&dyn Transfer> {
        match self {
            Entry::Text(_) => None,
            Entry::Outgoing(t) => Some(t as &dyn Transfer),
            Entry::Incoming(t) => Some(t as &dyn Transfer),
        }
    }

    pub fn as_text(&self) -> Option<&TextEntry> {
        match self {
            Entry::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// An entry together with its identity in the log
#[derive(Debug)]
pub struct LogEntry {
    pub id: EntryId,
    pub entry: Entry,
}

/// Builder for [`ChatLog`]; the channel and peer identity are mandatory
pub struct ChatLogBuilder<C: DataChannel> {
    channel: Option<C>,
    peer: Option<PeerId>,
    local_user: Option<String>,
    chunk_size: usize,
}

impl<C: DataChannel> ChatLogBuilder<C> {
    pub fn channel(mut self, channel: C) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Nick used as the author of locally written messages
    pub fn local_user(mut self, nick: impl Into<String>) -> Self {
        self.local_user = Some(nick.into());
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Validate the collaborators and build the log
    pub fn build(self) -> Result<ChatLog<C>> {
        let channel = self
            .channel
            .ok_or_else(|| Error::Configuration("a data channel is required".to_string()))?;
        let peer = self
            .peer
            .filter(|p| !p.as_str().trim().is_empty())
            .ok_or_else(|| Error::Configuration("a peer identity is required".to_string()))?;
        let local_user = self
            .local_user
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| Error::Configuration("a local user nick is required".to_string()))?;
        if self.chunk_size == 0 {
            return Err(Error::Configuration("chunk size must be positive".to_string()));
        }

        Ok(ChatLog {
            local_user,
            chunk_size: self.chunk_size,
            entries: Vec::new(),
            next_id: 0,
            registry: TransferRegistry::new(),
            watchers: HashMap::new(),
            parked: VecDeque::new(),
            dispatcher: Dispatcher::new(channel, peer),
        })
    }
}

pub struct ChatLog<C: DataChannel> {
    local_user: String,
    chunk_size: usize,
    entries: Vec<LogEntry>,
    next_id: u64,
    registry: TransferRegistry,
    /// Our subscriptions to incoming transfers that have not completed yet
    watchers: HashMap<TransferId, Subscription<TransferEvent>>,
    /// Outgoing transfers announced before the channel was ready to stream
    parked: VecDeque<EntryId>,
    dispatcher: Dispatcher<C>,
}

impl<C: DataChannel> ChatLog<C> {
    pub fn builder() -> ChatLogBuilder<C> {
        ChatLogBuilder {
            channel: None,
            peer: None,
            local_user: None,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn peer(&self) -> &PeerId {
        self.dispatcher.peer()
    }

    pub fn channel(&self) -> &C {
        self.dispatcher.channel()
    }

    pub fn channel_mut(&mut self) -> &mut C {
        self.dispatcher.channel_mut()
    }

    /// Subscribe to log and transfer notifications
    pub fn subscribe(&mut self) -> Subscription<ChatEvent> {
        self.dispatcher.subscribe()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&LogEntry> {
        self.position(id).map(|idx| &self.entries[idx])
    }

    /// Find a transfer of either direction by its id
    pub fn find_transfer(&self, id: &TransferId) -> Option<&dyn Transfer> {
        self.entries
            .iter()
            .filter_map(|e| e.entry.as_transfer())
            .find(|t| t.id() == id)
    }

    /// Presentation projections of every transfer in log order
    pub fn views(&self) -> Vec<TransferView> {
        self.entries
            .iter()
            .filter_map(|e| e.entry.as_transfer())
            .map(|t| t.view())
            .collect()
    }

    /// Number of incoming transfers still waiting for chunks
    pub fn active_incoming(&self) -> usize {
        self.registry.len()
    }

    fn position(&self, id: EntryId) -> Option<usize> {
        // Ids are handed out in increasing order, so the log is sorted by id
        self.entries.binary_search_by_key(&id, |e| e.id).ok()
    }

    fn push(&mut self, entry: Entry) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.push(LogEntry { id, entry });
        self.dispatcher.emit(ChatEvent::EntryAdded(id));
        id
    }

    /// Write a message as the local user and send it
    ///
    /// Nothing is added to the log when the channel is already closed.
    pub async fn send_text(&mut self, message: impl Into<String>) -> Result<EntryId> {
        self.dispatcher.check_sendable()?;
        let entry = TextEntry::new(self.local_user.clone(), message);
        let envelope = proto::chat_message(&entry);
        let id = self.push(Entry::Text(entry));
        self.dispatcher.send(envelope).await?;
        Ok(id)
    }

    /// Share a local file
    pub async fn send_file(&mut self, path: impl AsRef<Path>) -> Result<EntryId> {
        let transfer = SenderTransfer::open(path, self.chunk_size).await?;
        self.send_transfer(transfer).await
    }

    /// Share an in-memory buffer under `filename`
    pub async fn send_bytes(&mut self, filename: impl Into<String>, data: Bytes) -> Result<EntryId> {
        let transfer = SenderTransfer::from_bytes(filename, data, self.chunk_size);
        self.send_transfer(transfer).await
    }

    /// Announce a sender transfer, append it and stream its chunks
    ///
    /// When the channel is not ready yet the announcement is deferred and
    /// the transfer stays idle until the channel signals readiness.
    pub async fn send_transfer(&mut self, transfer: SenderTransfer) -> Result<EntryId> {
        self.dispatcher.check_sendable()?;
        self.dispatcher.announce(&transfer).await?;
        let ready = self.dispatcher.is_ready();
        let id = self.push(Entry::Outgoing(transfer));

        if ready {
            // Earlier parked transfers go first
            self.resume_parked().await;
            self.stream_entry(id).await?;
        } else {
            tracing::debug!("Channel not ready, parking transfer in entry {}", id);
            self.parked.push_back(id);
        }
        Ok(id)
    }

    async fn stream_entry(&mut self, id: EntryId) -> Result<()> {
        let Some(idx) = self.position(id) else {
            return Ok(());
        };
        if let Entry::Outgoing(transfer) = &mut self.entries[idx].entry {
            self.dispatcher.stream(transfer).await?;
        }
        Ok(())
    }

    /// Stream parked transfers, oldest first, while the channel stays ready
    async fn resume_parked(&mut self) {
        while self.dispatcher.is_ready() {
            let Some(id) = self.parked.pop_front() else {
                break;
            };
            if let Err(e) = self.stream_entry(id).await {
                tracing::warn!("Transfer in entry {} failed: {}", id, e);
            }
        }
    }

    /// Process one notification from the channel
    pub async fn handle_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Message(data) => self.receive(&data),
            ChannelEvent::Ready => {
                self.dispatcher.flush_deferred().await;
                self.resume_parked().await;
                Ok(())
            }
            ChannelEvent::Closed => {
                self.clear();
                Ok(())
            }
            ChannelEvent::OfferReady(offer) => {
                self.dispatcher.offer_ready(offer);
                Ok(())
            }
            ChannelEvent::AnswerReady(answer) => {
                self.dispatcher.answer_ready(answer);
                Ok(())
            }
        }
    }

    /// Apply one encoded envelope received from the peer
    ///
    /// Errors are local to the message: a chunk for an unknown transfer or an
    /// oversized transfer never affects other entries.
    pub fn receive(&mut self, data: &[u8]) -> Result<()> {
        match self.dispatcher.route(data)? {
            Inbound::Text(entry) => {
                tracing::debug!("Message from {}", entry.nick);
                self.push(Entry::Text(entry));
                Ok(())
            }
            Inbound::Announce { id, filename, size } => self.announce(id, filename, size),
            Inbound::Chunk { id, chunk } => self.route_chunk(&id, chunk),
        }
    }

    fn announce(&mut self, id: TransferId, filename: String, size: u64) -> Result<()> {
        if self.registry.contains(&id) {
            return Err(Error::DuplicateTransfer(id));
        }
        tracing::info!("Incoming {} ({} bytes) as transfer {}", filename, size, id);

        let mut transfer = ReceiverTransfer::new(id.clone(), filename, size);
        let watcher = transfer.subscribe();
        let entry = self.push(Entry::Incoming(transfer));
        self.registry.register(id.clone(), entry)?;
        self.watchers.insert(id.clone(), watcher);

        if size == 0 {
            self.route_chunk(&id, Bytes::new())?;
        }
        Ok(())
    }

    fn route_chunk(&mut self, id: &TransferId, chunk: Bytes) -> Result<()> {
        let entry = self.registry.lookup(id)?;
        let idx = self.position(entry).ok_or_else(|| Error::UnknownTransfer(id.clone()))?;

        let result = match &mut self.entries[idx].entry {
            Entry::Incoming(transfer) => transfer.append(chunk),
            _ => Err(Error::UnknownTransfer(id.clone())),
        };
        self.relay(id);

        // A broken transfer never emits again; stop watching it
        if let Err(Error::ProtocolViolation { .. }) = &result {
            if let Some(watcher) = self.watchers.remove(id) {
                if let Entry::Incoming(transfer) = &mut self.entries[idx].entry {
                    transfer.unsubscribe(watcher.id());
                }
            }
        }
        result
    }

    /// Forward a receiving transfer's notifications to log subscribers
    fn relay(&mut self, id: &TransferId) {
        let Some(watcher) = self.watchers.get_mut(id) else {
            return;
        };

        let mut finished = false;
        for event in watcher.drain() {
            match event {
                TransferEvent::Chunk { id, data, progress } => {
                    self.dispatcher.emit(ChatEvent::TransferProgress {
                        id,
                        len: data.len(),
                        progress,
                    });
                }
                TransferEvent::Complete { id, artifact } => {
                    finished = true;
                    self.dispatcher.emit(ChatEvent::TransferComplete { id, artifact });
                }
            }
        }

        if finished {
            if let Some(watcher) = self.watchers.remove(id) {
                if let Ok(entry) = self.registry.lookup(id) {
                    if let Some(idx) = self.position(entry) {
                        if let Entry::Incoming(transfer) = &mut self.entries[idx].entry {
                            transfer.unsubscribe(watcher.id());
                        }
                    }
                }
            }
            self.registry.remove(id);
        }
    }

    /// Start connecting to the peer
    pub async fn initiate(&mut self) -> Result<()> {
        self.dispatcher.initiate().await
    }

    /// Answer the peer's offer
    pub async fn answer(&mut self, offer: SessionDescription) -> Result<()> {
        self.dispatcher.answer(offer).await
    }

    /// Finish the handshake with the peer's answer
    pub async fn establish(&mut self, answer: SessionDescription) -> Result<()> {
        self.dispatcher.establish(answer).await
    }

    /// Discard every entry; called when the channel closes
    pub fn clear(&mut self) {
        tracing::info!("Channel closed, clearing {} entries", self.entries.len());
        self.entries.clear();
        self.registry.clear();
        self.watchers.clear();
        self.parked.clear();
        self.dispatcher.reset();
        self.dispatcher.emit(ChatEvent::Cleared);
    }
}
