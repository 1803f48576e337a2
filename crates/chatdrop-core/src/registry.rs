//! Routing table for inbound chunk messages
//!
//! Maps a transfer id to the log entry that owns the receiving transfer.
//! Every `file:chunk` is resolved here before it reaches a transfer.

use crate::{EntryId, Error, Result, TransferId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct TransferRegistry {
    routes: HashMap<TransferId, EntryId>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer; an id can only be registered once
    pub fn register(&mut self, id: TransferId, entry: EntryId) -> Result<()> {
        if self.routes.contains_key(&id) {
            return Err(Error::DuplicateTransfer(id));
        }
        self.routes.insert(id, entry);
        Ok(())
    }

    /// Resolve the entry owning `id`
    pub fn lookup(&self, id: &TransferId) -> Result<EntryId> {
        self.routes
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownTransfer(id.clone()))
    }

    pub fn remove(&mut self, id: &TransferId) -> Option<EntryId> {
        self.routes.remove(id)
    }

    pub fn contains(&self, id: &TransferId) -> bool {
        self.routes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}
