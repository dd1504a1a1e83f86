//! PendingSendQueue: optimistic sends awaiting their broadcast, in send order.

use std::collections::VecDeque;

use crate::models::{Message, Nonce};

/// Where an optimistic send stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The create call is in flight or succeeded; waiting for the broadcast.
    Sending,
    /// The create call failed. Stays visible until retried or discarded by the user.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub nonce: Nonce,
    pub message: Message,
    pub status: DeliveryStatus,
}

impl PendingSend {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, DeliveryStatus::Failed { .. })
    }
}

/// FIFO of locally created messages awaiting their broadcast, keyed by nonce.
///
/// Entries leave the queue only when a matching broadcast resolves them or
/// when the user discards a failed entry.
#[derive(Debug, Default)]
pub struct PendingSendQueue {
    entries: VecDeque<PendingSend>,
}

impl PendingSendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new entry behind any still-unresolved ones.
    pub fn push(&mut self, nonce: Nonce, message: Message) {
        self.entries.push_back(PendingSend {
            nonce,
            message,
            status: DeliveryStatus::Sending,
        });
    }

    pub fn get(&self, nonce: &Nonce) -> Option<&PendingSend> {
        self.entries.iter().find(|e| &e.nonce == nonce)
    }

    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.get(nonce).is_some()
    }

    /// Remove the entry matched by an authoritative broadcast.
    pub fn resolve(&mut self, nonce: &Nonce) -> Option<PendingSend> {
        let idx = self.entries.iter().position(|e| &e.nonce == nonce)?;
        self.entries.remove(idx)
    }

    /// Returns false if no entry has this nonce (already resolved).
    pub fn mark_failed(&mut self, nonce: &Nonce, reason: impl Into<String>) -> bool {
        match self.entries.iter_mut().find(|e| &e.nonce == nonce) {
            Some(entry) => {
                entry.status = DeliveryStatus::Failed {
                    reason: reason.into(),
                };
                true
            }
            None => false,
        }
    }

    /// Put a failed entry back into `Sending` for a retry. Returns the message to resend.
    pub fn mark_retrying(&mut self, nonce: &Nonce) -> Option<&Message> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| &e.nonce == nonce && e.is_failed())?;
        entry.status = DeliveryStatus::Sending;
        Some(&entry.message)
    }

    /// Remove a failed entry at the user's request. Entries still sending are kept.
    pub fn discard_failed(&mut self, nonce: &Nonce) -> Option<PendingSend> {
        let idx = self
            .entries
            .iter()
            .position(|e| &e.nonce == nonce && e.is_failed())?;
        self.entries.remove(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingSend> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
