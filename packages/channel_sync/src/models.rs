use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned message identity. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Returns `None` for the empty string, which the server uses for "not yet assigned".
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() { None } else { Some(Self(id)) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Client-generated token correlating an optimistic send with its broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    /// Fresh random nonce. Collisions are not defended against.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Denormalized author data carried on every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Identity of the local user, supplied by the caller on every send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorContext {
    pub author_id: String,
    pub snapshot: AuthorSnapshot,
}

impl AuthorContext {
    pub fn new(author_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            author_id: author_id.into(),
            snapshot: AuthorSnapshot {
                name: name.into(),
                avatar: None,
            },
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.snapshot.avatar = Some(avatar.into());
        self
    }
}

/// A chat message, either authoritative (has an `id`) or a local pending copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub channel_id: ChannelId,
    pub author_id: String,
    pub author: AuthorSnapshot,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Opaque to the sync core; carried through unchanged.
    pub embeds: Vec<serde_json::Value>,
    pub nonce: Option<Nonce>,
    pub pending: bool,
}

impl Message {
    /// Build the local copy shown before the server has confirmed the send.
    pub fn pending(
        channel_id: ChannelId,
        author: &AuthorContext,
        content: String,
        nonce: Nonce,
    ) -> Self {
        Self {
            id: None,
            channel_id,
            author_id: author.author_id.clone(),
            author: author.snapshot.clone(),
            content,
            created_at: Utc::now(),
            embeds: Vec::new(),
            nonce: Some(nonce),
            pending: true,
        }
    }
}

/// Canonical timestamp encoding used on the wire: RFC 3339, UTC, millisecond precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn empty_message_id_is_unassigned() {
        assert!(MessageId::new("").is_none());
        assert_eq!(MessageId::new("m1").unwrap().as_str(), "m1");
    }

    #[test]
    fn nonces_are_distinct() {
        let a = Nonce::generate();
        let b = Nonce::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn pending_message_has_no_id() {
        let author = AuthorContext::new("u-1", "alice").with_avatar("a.png");
        let msg = Message::pending("general".into(), &author, "hi".into(), Nonce::new("n1"));
        assert!(msg.id.is_none());
        assert!(msg.pending);
        assert_eq!(msg.nonce, Some(Nonce::new("n1")));
        assert_eq!(msg.author.avatar.as_deref(), Some("a.png"));
    }

    #[test]
    fn timestamp_format_is_fixed_width_utc() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn timestamp_parse_normalizes_offset() {
        let ts = parse_timestamp("2024-01-02T05:04:05.250+02:00").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-02T03:04:05.250Z");
        assert!(parse_timestamp("yesterday").is_err());
    }
}
