//! Integration tests for the chatdrop client
//!
//! Two chat logs talk over a connected pair of in-memory channels, so the
//! whole flow (handshake, deferred messages, chunked transfers, close) runs
//! without a real peer connection.

use bytes::Bytes;
use chatdrop_client::{ChatEvent, ChatLog};
use chatdrop_core::channel::memory::{MemoryChannel, MemoryEndpoint};
use chatdrop_core::{
    proto, Artifact, ChannelEvent, ChannelState, DataChannel, Error, PeerId, Subscription,
    TransferId, TransferState,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

struct Side {
    log: ChatLog<MemoryChannel>,
    queue: UnboundedReceiver<ChannelEvent>,
    events: Subscription<ChatEvent>,
    seen: Vec<ChatEvent>,
}

fn side(endpoint: MemoryEndpoint, nick: &str, peer: &str, chunk_size: usize) -> Side {
    let MemoryEndpoint { channel, events } = endpoint;
    let mut log = ChatLog::builder()
        .channel(channel)
        .peer(PeerId::new(peer))
        .local_user(nick)
        .chunk_size(chunk_size)
        .build()
        .unwrap();
    let subscription = log.subscribe();
    Side {
        log,
        queue: events,
        events: subscription,
        seen: Vec::new(),
    }
}

fn pair(chunk_size: usize) -> (Side, Side) {
    let (a, b) = MemoryChannel::pair("alice", "bob");
    (
        side(a, "alice", "bob", chunk_size),
        side(b, "bob", "alice", chunk_size),
    )
}

/// Deliver `me`'s queued channel events and relay its signaling to `other`
async fn pump(me: &mut Side, other: &mut Side) -> bool {
    let mut progressed = false;
    while let Ok(event) = me.queue.try_recv() {
        progressed = true;
        me.log.handle_event(event).await.unwrap();
    }
    for event in me.events.drain() {
        progressed = true;
        match &event {
            ChatEvent::SendOffer { offer, .. } => {
                other.log.answer(offer.clone()).await.unwrap();
            }
            ChatEvent::SendAnswer { answer, .. } => {
                other.log.establish(answer.clone()).await.unwrap();
            }
            _ => {}
        }
        me.seen.push(event);
    }
    progressed
}

async fn settle(alice: &mut Side, bob: &mut Side) {
    loop {
        let mut progressed = pump(alice, bob).await;
        progressed |= pump(bob, alice).await;
        if !progressed {
            return;
        }
    }
}

fn receiver_progress(side: &Side) -> Vec<u8> {
    side.seen
        .iter()
        .filter_map(|e| match e {
            ChatEvent::TransferProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect()
}

fn completed(side: &Side) -> Vec<(TransferId, Artifact)> {
    side.seen
        .iter()
        .filter_map(|e| match e {
            ChatEvent::TransferComplete { id, artifact } => Some((id.clone(), artifact.clone())),
            _ => None,
        })
        .collect()
}

/// A message written before the channel exists opens it and arrives once
#[tokio::test]
async fn test_deferred_message_triggers_handshake() {
    let (mut alice, mut bob) = pair(chatdrop_core::CHUNK_SIZE);

    alice.log.send_text("hello bob").await.unwrap();
    assert_eq!(alice.log.channel().state(), ChannelState::Connecting);

    settle(&mut alice, &mut bob).await;

    assert_eq!(alice.log.channel().state(), ChannelState::Open);
    assert_eq!(bob.log.channel().state(), ChannelState::Open);
    assert!(alice
        .seen
        .iter()
        .any(|e| matches!(e, ChatEvent::SendOffer { peer, protocol, .. }
            if peer.as_str() == "bob" && *protocol == "text-chat")));

    assert_eq!(bob.log.len(), 1);
    let text = bob.log.entries()[0].entry.as_text().unwrap();
    assert_eq!(text.nick, "alice");
    assert_eq!(text.message, "hello bob");
}

/// Full flow: handshake, a 1.5 MB file in 512 KiB chunks, identical bytes out
#[tokio::test]
async fn test_file_transfer_over_loopback() {
    let temp_dir = TempDir::new().unwrap();
    let content: Vec<u8> = (0..1_500_000u32).map(|i| (i % 251) as u8).collect();
    let source = temp_dir.path().join("holiday.bin");
    std::fs::write(&source, &content).unwrap();

    let (mut alice, mut bob) = pair(512 * 1024);
    alice.log.send_text("sending the photos").await.unwrap();
    settle(&mut alice, &mut bob).await;

    let entry = alice.log.send_file(&source).await.unwrap();
    settle(&mut alice, &mut bob).await;

    // Sender side finished and points at the local file
    let sent = alice.log.get(entry).unwrap().entry.as_transfer().unwrap();
    assert!(sent.is_complete());
    assert_eq!(sent.declared_size(), 1_500_000);

    // Receiver saw 34/69/100 and exactly one completion
    assert_eq!(receiver_progress(&bob), vec![34, 69, 100]);
    let done = completed(&bob);
    assert_eq!(done.len(), 1);
    let (id, artifact) = &done[0];
    assert_eq!(id, sent.id());
    assert_eq!(artifact.read().await.unwrap(), Bytes::from(content.clone()));
    assert_eq!(
        artifact.content_hash().await.unwrap(),
        sent.artifact().unwrap().content_hash().await.unwrap()
    );
    assert_eq!(bob.log.active_incoming(), 0);

    // The reassembled file lands in the download directory
    let downloads = temp_dir.path().join("downloads");
    let written = artifact.write_to(&downloads, "holiday.bin").await.unwrap();
    assert_eq!(std::fs::read(written).unwrap(), content);

    let views = bob.log.views();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].filename, "holiday.bin");
    assert_eq!(views[0].progress, 100);
    assert!(views[0].url.is_some());
}

#[tokio::test]
async fn test_transfers_in_both_directions() {
    let (mut alice, mut bob) = pair(4);
    alice.log.send_text("hi").await.unwrap();
    settle(&mut alice, &mut bob).await;

    alice
        .log
        .send_bytes("a.txt", Bytes::from_static(b"from alice"))
        .await
        .unwrap();
    bob.log
        .send_bytes("b.txt", Bytes::from_static(b"from bob"))
        .await
        .unwrap();
    settle(&mut alice, &mut bob).await;

    // Completions cover our own outgoing transfer as well as the incoming one
    let from_alice = Artifact::Memory(Bytes::from_static(b"from alice"));
    let from_bob = Artifact::Memory(Bytes::from_static(b"from bob"));
    assert_eq!(completed(&bob).len(), 2);
    assert_eq!(completed(&alice).len(), 2);
    assert!(completed(&bob).iter().any(|(_, a)| *a == from_alice));
    assert!(completed(&alice).iter().any(|(_, a)| *a == from_bob));
    assert_eq!(bob.log.active_incoming(), 0);

    // Each log holds: greeting, own outgoing, peer's incoming
    assert_eq!(alice.log.len(), 3);
    assert_eq!(bob.log.len(), 3);
}

#[tokio::test]
async fn test_unknown_chunk_does_not_disturb_log() {
    let (mut alice, mut bob) = pair(4);
    alice.log.send_text("hi").await.unwrap();
    settle(&mut alice, &mut bob).await;

    let before = bob.log.len();
    let ghost = TransferId::new("ghost");
    let err = bob
        .log
        .receive(&proto::file_chunk(&ghost, Bytes::from_static(b"boo")).to_bytes())
        .unwrap_err();

    assert!(matches!(err, Error::UnknownTransfer(id) if id == ghost));
    assert_eq!(bob.log.len(), before);
}

#[tokio::test]
async fn test_oversized_stream_breaks_only_that_transfer() {
    let (mut alice, mut bob) = pair(4);
    alice.log.send_text("hi").await.unwrap();
    settle(&mut alice, &mut bob).await;

    let liar = TransferId::new("liar");
    bob.log
        .receive(&proto::file_new(&liar, "short.txt", 3).to_bytes())
        .unwrap();
    let err = bob
        .log
        .receive(&proto::file_chunk(&liar, Bytes::from_static(b"toolong")).to_bytes())
        .unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation { .. }));
    assert_eq!(
        bob.log.find_transfer(&liar).unwrap().state(),
        TransferState::Broken
    );

    // A real transfer from alice is unaffected
    alice
        .log
        .send_bytes("ok.txt", Bytes::from_static(b"fine"))
        .await
        .unwrap();
    settle(&mut alice, &mut bob).await;
    assert_eq!(completed(&bob).len(), 1);
}

#[tokio::test]
async fn test_close_clears_both_logs() {
    let (mut alice, mut bob) = pair(4);
    alice.log.send_text("hi").await.unwrap();
    settle(&mut alice, &mut bob).await;
    assert!(!bob.log.is_empty());

    alice.log.channel_mut().close().await.unwrap();
    settle(&mut alice, &mut bob).await;

    assert!(alice.log.is_empty());
    assert!(bob.log.is_empty());
    assert!(matches!(alice.seen.last(), Some(ChatEvent::Cleared)));
    assert!(matches!(bob.seen.last(), Some(ChatEvent::Cleared)));

    // Sending on a closed channel fails instead of queueing
    let err = alice.log.send_text("anyone?").await.unwrap_err();
    assert!(matches!(err, Error::SendFailed(_)));
}

/// A file shared before the handshake streams once the channel is ready
#[tokio::test]
async fn test_file_sent_before_handshake() {
    let (mut alice, mut bob) = pair(4);

    alice
        .log
        .send_bytes("early.txt", Bytes::from_static(b"sent before open"))
        .await
        .unwrap();
    assert!(completed(&alice).is_empty());

    settle(&mut alice, &mut bob).await;

    let done = completed(&bob);
    assert_eq!(done.len(), 1);
    assert_eq!(
        done[0].1,
        Artifact::Memory(Bytes::from_static(b"sent before open"))
    );
    assert_eq!(completed(&alice).len(), 1);
}
