//! File chunking and reassembly
//!
//! A [`SenderTransfer`] reads its source one window at a time and emits each
//! window as a chunk. A [`ReceiverTransfer`] buffers incoming chunks in
//! receipt order and assembles the artifact once the declared size is
//! reached. Both report through typed [`TransferEvent`] streams.

use crate::notify::{Subscribers, Subscription, SubscriptionId};
use crate::{Error, Result, Role, TransferId};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Integer progress percentage: `floor(cursor * 100 / size)`
///
/// The cursor is clamped to `size`, so the result is always in `0..=100`.
/// A zero-byte transfer has nothing left to do and reports 100.
pub fn progress(cursor: u64, size: u64) -> u8 {
    if size == 0 {
        return 100;
    }
    let done = cursor.min(size) as u128;
    (done * 100 / size as u128) as u8
}

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    /// Created, nothing read or received yet
    Idle,
    /// Chunks are flowing
    Active,
    /// Cursor reached the declared size; terminal
    Complete,
    /// A protocol violation or read failure; terminal, never reused
    Broken,
}

/// The terminal product of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// The sender's source file on disk
    File(PathBuf),
    /// Bytes held in memory (an in-memory source, or a reassembled download)
    Memory(Bytes),
}

impl Artifact {
    /// Size of the artifact in bytes
    pub async fn size(&self) -> Result<u64> {
        match self {
            Artifact::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            Artifact::Memory(data) => Ok(data.len() as u64),
        }
    }

    /// Load the artifact contents
    pub async fn read(&self) -> Result<Bytes> {
        match self {
            Artifact::File(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
            Artifact::Memory(data) => Ok(data.clone()),
        }
    }

    /// BLAKE3 hash of the contents, hex encoded
    pub async fn content_hash(&self) -> Result<String> {
        let data = self.read().await?;
        Ok(hex::encode(blake3::hash(&data).as_bytes()))
    }

    /// Write the artifact into `dir` under the final component of `filename`
    pub async fn write_to(&self, dir: &Path, filename: &str) -> Result<PathBuf> {
        // Remote peers choose the filename; never let it escape `dir`
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download");
        tokio::fs::create_dir_all(dir).await?;
        let target = dir.join(name);
        let data = self.read().await?;
        tokio::fs::write(&target, &data).await?;
        Ok(target)
    }

    /// Locator handed to the presentation layer
    pub fn url(&self, id: &TransferId, filename: &str) -> String {
        match self {
            Artifact::File(path) => format!("file://{}", path.display()),
            Artifact::Memory(_) => format!("memory://{}/{}", id, filename),
        }
    }
}

/// Notifications emitted by a transfer
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A chunk was produced (sender) or appended (receiver)
    Chunk {
        id: TransferId,
        data: Bytes,
        progress: u8,
    },
    /// The cursor reached the declared size
    Complete { id: TransferId, artifact: Artifact },
}

/// Presentation projection of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferView {
    pub id: TransferId,
    pub filename: String,
    pub progress: u8,
    /// Present only once the transfer is complete
    pub url: Option<String>,
}

/// State shared by both transfer roles
#[derive(Debug)]
pub struct TransferMeta {
    id: TransferId,
    filename: String,
    size: u64,
    cursor: u64,
    state: TransferState,
    artifact: Option<Artifact>,
}

impl TransferMeta {
    fn new(id: TransferId, filename: String, size: u64) -> Self {
        Self {
            id,
            filename,
            size,
            cursor: 0,
            state: TransferState::Idle,
            artifact: None,
        }
    }
}

/// Read-only surface common to sender and receiver transfers
pub trait Transfer {
    fn meta(&self) -> &TransferMeta;

    fn role(&self) -> Role;

    fn id(&self) -> &TransferId {
        &self.meta().id
    }

    fn filename(&self) -> &str {
        &self.meta().filename
    }

    fn declared_size(&self) -> u64 {
        self.meta().size
    }

    /// Bytes processed so far
    fn cursor(&self) -> u64 {
        self.meta().cursor
    }

    fn state(&self) -> TransferState {
        self.meta().state
    }

    fn artifact(&self) -> Option<&Artifact> {
        self.meta().artifact.as_ref()
    }

    fn progress(&self) -> u8 {
        progress(self.cursor(), self.declared_size())
    }

    fn is_complete(&self) -> bool {
        self.state() == TransferState::Complete
    }

    fn view(&self) -> TransferView {
        let progress = self.progress();
        let url = match self.artifact() {
            Some(artifact) if progress == 100 => Some(artifact.url(self.id(), self.filename())),
            _ => None,
        };
        TransferView {
            id: self.id().clone(),
            filename: self.filename().to_string(),
            progress,
            url,
        }
    }
}

#[derive(Debug)]
enum Source {
    File {
        path: PathBuf,
        handle: Option<tokio::fs::File>,
    },
    Memory(Bytes),
}

/// Outgoing transfer: emits its source as a sequence of chunks
///
/// Reads are strictly one at a time. After `start()` produces the first
/// chunk, each further chunk is produced by `read_next()` only while
/// `has_scheduled_read()` is true, so at most one chunk buffer is in flight.
#[derive(Debug)]
pub struct SenderTransfer {
    meta: TransferMeta,
    chunk_size: usize,
    source: Source,
    read_scheduled: bool,
    subscribers: Subscribers<TransferEvent>,
}

impl SenderTransfer {
    /// Prepare a transfer of the file at `path`
    pub async fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self::with_source(
            filename,
            metadata.len(),
            Source::File {
                path: path.to_path_buf(),
                handle: None,
            },
            chunk_size,
        ))
    }

    /// Prepare a transfer of an in-memory buffer
    pub fn from_bytes(filename: impl Into<String>, data: Bytes, chunk_size: usize) -> Self {
        let size = data.len() as u64;
        Self::with_source(filename.into(), size, Source::Memory(data), chunk_size)
    }

    fn with_source(filename: String, size: u64, source: Source, chunk_size: usize) -> Self {
        Self {
            meta: TransferMeta::new(TransferId::generate(), filename, size),
            chunk_size: chunk_size.max(1),
            source,
            read_scheduled: false,
            subscribers: Subscribers::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn subscribe(&mut self) -> Subscription<TransferEvent> {
        self.subscribers.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// True while another chunk is waiting to be read
    pub fn has_scheduled_read(&self) -> bool {
        self.read_scheduled
    }

    /// Begin reading the source and produce the first chunk
    pub async fn start(&mut self) -> Result<()> {
        if self.meta.state != TransferState::Idle {
            return Err(Error::InvalidState(format!(
                "transfer {} already started",
                self.meta.id
            )));
        }
        self.meta.state = TransferState::Active;

        if let Source::File { path, handle } = &mut self.source {
            match tokio::fs::File::open(&*path).await {
                Ok(file) => *handle = Some(file),
                Err(e) => {
                    self.meta.state = TransferState::Broken;
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(
            "Starting transfer {} of {} ({} bytes, {} byte chunks)",
            self.meta.id,
            self.meta.filename,
            self.meta.size,
            self.chunk_size
        );

        self.produce_chunk().await
    }

    /// Perform the scheduled read
    pub async fn read_next(&mut self) -> Result<()> {
        if !self.read_scheduled {
            return Err(Error::InvalidState(format!(
                "transfer {} has no read scheduled",
                self.meta.id
            )));
        }
        self.produce_chunk().await
    }

    async fn produce_chunk(&mut self) -> Result<()> {
        self.read_scheduled = false;

        let remaining = self.meta.size - self.meta.cursor;
        if remaining == 0 {
            self.finish();
            return Ok(());
        }

        let window = remaining.min(self.chunk_size as u64) as usize;
        let data = match self.read_window(window).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Read failed for transfer {}: {}", self.meta.id, e);
                self.meta.state = TransferState::Broken;
                if let Source::File { handle, .. } = &mut self.source {
                    *handle = None;
                }
                return Err(e);
            }
        };

        self.meta.cursor += data.len() as u64;
        let progress = self.progress();
        tracing::trace!(
            "Transfer {} produced {} bytes ({}%)",
            self.meta.id,
            data.len(),
            progress
        );
        self.subscribers.emit(TransferEvent::Chunk {
            id: self.meta.id.clone(),
            data,
            progress,
        });

        if self.meta.cursor < self.meta.size {
            self.read_scheduled = true;
        } else {
            self.finish();
        }

        Ok(())
    }

    async fn read_window(&mut self, len: usize) -> Result<Bytes> {
        let offset = self.meta.cursor;
        match &mut self.source {
            Source::Memory(data) => {
                let start = offset as usize;
                Ok(data.slice(start..start + len))
            }
            Source::File { handle, .. } => {
                let file = handle
                    .as_mut()
                    .ok_or_else(|| Error::InvalidState("source file is not open".to_string()))?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = BytesMut::zeroed(len);
                file.read_exact(&mut buf).await?;
                Ok(buf.freeze())
            }
        }
    }

    fn finish(&mut self) {
        let artifact = match &mut self.source {
            Source::File { path, handle } => {
                *handle = None;
                Artifact::File(path.clone())
            }
            Source::Memory(data) => Artifact::Memory(data.clone()),
        };

        self.meta.state = TransferState::Complete;
        self.meta.artifact = Some(artifact.clone());

        tracing::info!(
            "Sent {} ({} bytes) as transfer {}",
            self.meta.filename,
            self.meta.size,
            self.meta.id
        );

        self.subscribers.emit(TransferEvent::Complete {
            id: self.meta.id.clone(),
            artifact,
        });
    }
}

impl Transfer for SenderTransfer {
    fn meta(&self) -> &TransferMeta {
        &self.meta
    }

    fn role(&self) -> Role {
        Role::Sender
    }
}

/// Incoming transfer: accumulates chunks until the declared size is reached
#[derive(Debug)]
pub struct ReceiverTransfer {
    meta: TransferMeta,
    chunks: Vec<Bytes>,
    subscribers: Subscribers<TransferEvent>,
}

impl ReceiverTransfer {
    /// Create a receiver for an announced transfer
    pub fn new(id: TransferId, filename: impl Into<String>, size: u64) -> Self {
        Self {
            meta: TransferMeta::new(id, filename.into(), size),
            chunks: Vec::new(),
            subscribers: Subscribers::new(),
        }
    }

    pub fn subscribe(&mut self) -> Subscription<TransferEvent> {
        self.subscribers.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Number of live subscriptions to this transfer
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Number of chunks currently buffered
    pub fn buffered_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Append the next chunk in send order
    ///
    /// The chunk notification for this call is emitted before the size check,
    /// so an oversized stream is reported on the append that crosses the
    /// declared size. That error leaves the transfer `Broken`.
    pub fn append(&mut self, chunk: Bytes) -> Result<()> {
        match self.meta.state {
            TransferState::Complete | TransferState::Broken => {
                return Err(self.violation(self.meta.cursor + chunk.len() as u64));
            }
            TransferState::Idle => self.meta.state = TransferState::Active,
            TransferState::Active => {}
        }

        self.meta.cursor += chunk.len() as u64;
        self.chunks.push(chunk.clone());

        let progress = self.progress();
        tracing::trace!(
            "Transfer {} received {} bytes ({}%)",
            self.meta.id,
            chunk.len(),
            progress
        );
        self.subscribers.emit(TransferEvent::Chunk {
            id: self.meta.id.clone(),
            data: chunk,
            progress,
        });

        if self.meta.cursor > self.meta.size {
            tracing::warn!(
                "Transfer {} exceeded declared size: {} > {}",
                self.meta.id,
                self.meta.cursor,
                self.meta.size
            );
            self.meta.state = TransferState::Broken;
            self.chunks = Vec::new();
            return Err(self.violation(self.meta.cursor));
        }

        if self.meta.cursor == self.meta.size {
            self.assemble();
        }

        Ok(())
    }

    fn assemble(&mut self) {
        let mut buf = BytesMut::with_capacity(self.meta.size as usize);
        for chunk in std::mem::take(&mut self.chunks) {
            buf.extend_from_slice(&chunk);
        }
        let artifact = Artifact::Memory(buf.freeze());

        self.meta.state = TransferState::Complete;
        self.meta.artifact = Some(artifact.clone());

        tracing::info!(
            "Received {} ({} bytes) as transfer {}",
            self.meta.filename,
            self.meta.size,
            self.meta.id
        );

        self.subscribers.emit(TransferEvent::Complete {
            id: self.meta.id.clone(),
            artifact,
        });
    }

    fn violation(&self, received: u64) -> Error {
        Error::ProtocolViolation {
            id: self.meta.id.clone(),
            declared: self.meta.size,
            received,
        }
    }
}

impl Transfer for ReceiverTransfer {
    fn meta(&self) -> &TransferMeta {
        &self.meta
    }

    fn role(&self) -> Role {
        Role::Receiver
    }
}
