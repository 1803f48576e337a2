//! Typed notification streams
//!
//! Components that produce events own a [`Subscribers`] list. Consumers call
//! `subscribe()` to get a [`Subscription`] (an id plus an unbounded
//! receiver) and hand the id back to `unsubscribe()` when they are done.

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Handle identifying one subscription on one producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A live subscription to a producer's events
#[derive(Debug)]
pub struct Subscription<E> {
    id: SubscriptionId,
    rx: UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Take the next event without waiting
    pub fn try_next(&mut self) -> Option<E> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drain every event emitted so far
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Some(event) = self.try_next() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event; `None` once the producer is gone or unsubscribed us
    pub async fn next(&mut self) -> Option<E> {
        self.rx.recv().await
    }
}

/// The set of subscribers attached to one producer
#[derive(Debug)]
pub struct Subscribers<E> {
    next_id: u64,
    senders: Vec<(SubscriptionId, UnboundedSender<E>)>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            senders: Vec::new(),
        }
    }
}

impl<E: Clone> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber
    pub fn subscribe(&mut self) -> Subscription<E> {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push((id, tx));
        Subscription { id, rx }
    }

    /// Detach a subscriber; returns false if it was not attached
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.senders.len();
        self.senders.retain(|(sid, _)| *sid != id);
        self.senders.len() != before
    }

    /// Deliver an event to every subscriber, pruning dropped receivers
    pub fn emit(&mut self, event: E) {
        self.senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_every_subscriber() {
        let mut subs = Subscribers::new();
        let mut a = subs.subscribe();
        let mut b = subs.subscribe();

        subs.emit(1u32);
        subs.emit(2u32);

        assert_eq!(a.drain(), vec![1, 2]);
        assert_eq!(b.drain(), vec![1, 2]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut subs = Subscribers::new();
        let mut a = subs.subscribe();

        subs.emit("first");
        assert!(subs.unsubscribe(a.id()));
        assert!(!subs.unsubscribe(a.id()));
        subs.emit("second");

        assert_eq!(a.drain(), vec!["first"]);
        assert!(subs.is_empty());
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let mut subs = Subscribers::new();
        let sub = subs.subscribe();
        drop(sub);
        subs.emit(0u8);
        assert_eq!(subs.len(), 0);
    }
}
