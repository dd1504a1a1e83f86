//! MessageStore: the ordered, deduplicated log of one channel.
//!
//! The log is ascending by arrival. Older pages are merged at the front,
//! live messages appended at the back. Once a message has an id it appears
//! at most once. The pagination cursor is the oldest loaded id.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::models::{ChannelId, Message, MessageId, Nonce};
use crate::pending::PendingSendQueue;

/// Result of a pagination request.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOlder {
    /// `added` messages were merged at the front (duplicates excluded).
    Loaded { added: usize },
    /// No older history exists.
    Exhausted,
}

/// Answer to "which older page comes next?".
#[derive(Debug, Clone, PartialEq)]
pub enum OlderRequest {
    /// Fetch the page before this id.
    Before(MessageId),
    /// An empty page was already seen; issue nothing.
    Exhausted,
    /// Nothing loaded to page back from.
    NoCursor,
}

/// What `on_incoming_message` did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    OtherChannel,
    Duplicate,
    /// Server messages always carry an id; one without is dropped.
    MissingId,
    /// Replaced the pending entry with this nonce.
    Reconciled(Nonce),
    Appended,
}

impl Incoming {
    /// Whether the visible timeline changed.
    pub fn changed(&self) -> bool {
        matches!(self, Self::Reconciled(_) | Self::Appended)
    }
}

#[derive(Debug)]
pub struct MessageStore {
    channel_id: ChannelId,
    page_size: u32,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    exhausted: bool,
}

impl MessageStore {
    pub fn new(channel_id: ChannelId, page_size: u32) -> Self {
        Self {
            channel_id,
            page_size,
            messages: Vec::new(),
            ids: HashSet::new(),
            exhausted: false,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Id of the oldest loaded message: the key for the next older page.
    pub fn oldest_loaded_id(&self) -> Option<&MessageId> {
        self.messages.iter().find_map(|m| m.id.as_ref())
    }

    /// Replace the log with an initial page. An empty page means the channel has no history.
    pub fn apply_initial(&mut self, page: Vec<Message>) {
        self.messages.clear();
        self.ids.clear();
        self.exhausted = page.is_empty();
        for msg in page {
            if self.accepts(&msg) {
                self.insert_id(&msg);
                self.messages.push(msg);
            }
        }
        debug!(channel = %self.channel_id, loaded = self.messages.len(), "initial page applied");
    }

    /// What the next pagination step should do.
    ///
    /// Only an empty page marks history exhausted. A log with nothing loaded
    /// yet (say, after a failed initial load) has no cursor but may still have
    /// history behind it.
    pub fn next_older(&self) -> OlderRequest {
        if self.exhausted {
            return OlderRequest::Exhausted;
        }
        match self.oldest_loaded_id() {
            Some(id) => OlderRequest::Before(id.clone()),
            None => OlderRequest::NoCursor,
        }
    }

    /// Merge an older page at the front. Duplicate ids are skipped, so retries are idempotent.
    pub fn merge_older(&mut self, page: Vec<Message>) -> LoadOlder {
        if page.is_empty() {
            if !self.exhausted {
                debug!(channel = %self.channel_id, "history exhausted");
            }
            self.exhausted = true;
            return LoadOlder::Exhausted;
        }

        let mut fresh = Vec::with_capacity(page.len());
        for msg in page {
            if self.accepts(&msg) {
                self.insert_id(&msg);
                fresh.push(msg);
            }
        }
        let added = fresh.len();
        self.messages.splice(0..0, fresh);
        debug!(channel = %self.channel_id, added, "merged older page");
        LoadOlder::Loaded { added }
    }

    /// Apply one live message from the push connection.
    ///
    /// A message whose nonce matches a pending send takes that entry's place
    /// at the end of the log; the pending entry is removed.
    pub fn on_incoming_message(&mut self, msg: Message, pending: &mut PendingSendQueue) -> Incoming {
        if msg.channel_id != self.channel_id {
            return Incoming::OtherChannel;
        }
        let Some(id) = msg.id.clone() else {
            warn!(channel = %self.channel_id, "ignoring live message without an id");
            return Incoming::MissingId;
        };

        if self.ids.contains(&id) {
            // Already shown; still make sure no pending twin lingers.
            if let Some(nonce) = &msg.nonce {
                pending.resolve(nonce);
            }
            return Incoming::Duplicate;
        }

        let resolved = msg
            .nonce
            .as_ref()
            .and_then(|nonce| pending.resolve(nonce))
            .map(|entry| entry.nonce);

        let mut msg = msg;
        msg.pending = false;
        msg.nonce = None;
        self.ids.insert(id);
        self.messages.push(msg);

        match resolved {
            Some(nonce) => {
                debug!(channel = %self.channel_id, nonce = %nonce, "pending send reconciled");
                Incoming::Reconciled(nonce)
            }
            None => Incoming::Appended,
        }
    }

    fn accepts(&self, msg: &Message) -> bool {
        if msg.channel_id != self.channel_id {
            warn!(channel = %self.channel_id, other = %msg.channel_id, "dropping message for another channel");
            return false;
        }
        match &msg.id {
            Some(id) => !self.ids.contains(id),
            None => false,
        }
    }

    fn insert_id(&mut self, msg: &Message) {
        if let Some(id) = &msg.id {
            self.ids.insert(id.clone());
        }
    }
}
