//! Wire formats: push-channel envelopes and RPC bodies.
//!
//! Everything that crosses the server boundary is decoded here into the
//! validated types in [`crate::models`]. Field names are camelCase and
//! timestamps are canonical RFC 3339 strings.

use serde::{Deserialize, Serialize};

use crate::error::MalformedEvent;
use crate::models::{
    AuthorSnapshot, ChannelId, Message, MessageId, Nonce, format_timestamp, parse_timestamp,
};

/// Envelope type carrying a persisted message.
pub const MESSAGE_EVENT: &str = "message";

/// `{ type, data }` wrapper around every push frame, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: impl Into<String>, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.into(),
            data: serde_json::to_value(data)?,
        })
    }
}

/// A decoded inbound push event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Message(Message),
}

/// Decode one inbound text frame.
///
/// Returns `Ok(None)` for well-formed envelopes of an unrecognized type.
pub fn decode_frame(text: &str) -> Result<Option<ServerEvent>, MalformedEvent> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| MalformedEvent::InvalidJson(e.to_string()))?;

    match envelope.kind.as_str() {
        MESSAGE_EVENT => {
            let wire: WireMessage = serde_json::from_value(envelope.data).map_err(|e| {
                MalformedEvent::InvalidPayload {
                    kind: envelope.kind.clone(),
                    reason: e.to_string(),
                }
            })?;
            let message = wire
                .into_message()
                .map_err(|reason| MalformedEvent::InvalidPayload {
                    kind: envelope.kind.clone(),
                    reason,
                })?;
            Ok(Some(ServerEvent::Message(message)))
        }
        _ => Ok(None),
    }
}

/// Message as it appears on the wire, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub channel_id: String,
    pub author_id: String,
    pub author: AuthorSnapshot,
    pub content: String,
    pub created_timestamp: String,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl WireMessage {
    /// Validate into a [`Message`]. Messages from the server are never pending.
    pub fn into_message(self) -> Result<Message, String> {
        if self.channel_id.is_empty() {
            return Err("channelId is empty".to_string());
        }
        let created_at = parse_timestamp(&self.created_timestamp)
            .map_err(|e| format!("createdTimestamp {:?}: {}", self.created_timestamp, e))?;

        Ok(Message {
            id: self.id.and_then(MessageId::new),
            channel_id: ChannelId::new(self.channel_id),
            author_id: self.author_id,
            author: self.author,
            content: self.content,
            created_at,
            embeds: self.embeds,
            nonce: self.nonce.filter(|n| !n.is_empty()).map(Nonce::new),
            pending: false,
        })
    }

    pub fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.id.as_ref().map(|id| id.as_str().to_string()),
            channel_id: msg.channel_id.as_str().to_string(),
            author_id: msg.author_id.clone(),
            author: msg.author.clone(),
            content: msg.content.clone(),
            created_timestamp: format_timestamp(&msg.created_at),
            embeds: msg.embeds.clone(),
            nonce: msg.nonce.as_ref().map(|n| n.as_str().to_string()),
        }
    }
}

/// Decode a list of messages returned by a fetch call. One bad entry fails the whole page.
pub fn decode_page(wire: Vec<WireMessage>) -> Result<Vec<Message>, String> {
    wire.into_iter().map(WireMessage::into_message).collect()
}

/// Body of the create-message call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub channel_id: ChannelId,
    pub content: String,
    pub nonce: Nonce,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_frame(extra: &str) -> String {
        format!(
            r#"{{"type":"message","data":{{"id":"m3","channelId":"general","authorId":"u-1",
            "author":{{"name":"alice"}},"content":"hi",
            "createdTimestamp":"2024-01-01T00:00:03.000Z"{extra}}}}}"#
        )
    }

    #[test]
    fn decodes_message_envelope() {
        let event = decode_frame(&message_frame(r#","nonce":"n1""#))
            .unwrap()
            .unwrap();
        let ServerEvent::Message(msg) = event;
        assert_eq!(msg.id.unwrap().as_str(), "m3");
        assert_eq!(msg.channel_id.as_str(), "general");
        assert_eq!(msg.nonce.unwrap().as_str(), "n1");
        assert!(msg.embeds.is_empty());
        assert!(!msg.pending);
    }

    #[test]
    fn unknown_type_is_ignored() {
        let decoded = decode_frame(r#"{"type":"typing","data":{"user":"bob"}}"#).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn envelope_without_data_is_allowed_for_unknown_types() {
        assert!(decode_frame(r#"{"type":"ping"}"#).unwrap().is_none());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = decode_frame("not json").unwrap_err();
        assert_eq!(err.error_code(), "invalid_json");
        let err = decode_frame(r#"{"data":{}}"#).unwrap_err();
        assert_eq!(err.error_code(), "invalid_json");
    }

    #[test]
    fn bad_message_payload_is_malformed() {
        let err = decode_frame(r#"{"type":"message","data":{"id":"m1"}}"#).unwrap_err();
        assert_eq!(err.error_code(), "invalid_payload");
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let frame = message_frame("").replace("2024-01-01T00:00:03.000Z", "last tuesday");
        let err = decode_frame(&frame).unwrap_err();
        assert!(matches!(err, MalformedEvent::InvalidPayload { .. }));
    }

    #[test]
    fn empty_id_and_nonce_decode_to_none() {
        let frame = message_frame(r#","nonce":"""#).replace(r#""id":"m3""#, r#""id":"""#);
        let Some(ServerEvent::Message(msg)) = decode_frame(&frame).unwrap() else {
            panic!("expected message");
        };
        assert!(msg.id.is_none());
        assert!(msg.nonce.is_none());
    }

    #[test]
    fn create_request_is_camel_case() {
        let req = CreateMessageRequest {
            channel_id: ChannelId::new("general"),
            content: "hi".into(),
            nonce: Nonce::new("n1"),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["channelId"], "general");
        assert_eq!(json["nonce"], "n1");
    }

    #[test]
    fn wire_message_keeps_canonical_timestamp() {
        let Some(ServerEvent::Message(msg)) = decode_frame(&message_frame("")).unwrap() else {
            panic!("expected message");
        };
        let wire = WireMessage::from_message(&msg);
        assert_eq!(wire.created_timestamp, "2024-01-01T00:00:03.000Z");
        assert!(wire.nonce.is_none());
    }
}
