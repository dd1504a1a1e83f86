//! Error types for each seam of the sync core, with stable error codes.

use crate::models::{ChannelId, Nonce};

/// Failures of the shared push connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The connection is not `Open` (disconnected, connecting or waiting to reconnect).
    #[error("push connection is not open")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    /// The link went away between the state check and the write.
    #[error("push connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Transport(_) => "transport",
            Self::Closed => "closed",
        }
    }
}

/// Failures of the request/response calls (create, fetch, fetch older).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("channel not found: {channel_id}")]
    NotFound { channel_id: ChannelId },

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotFound { .. } => "channel_not_found",
            Self::Rejected { .. } => "rejected",
            Self::Network(_) => "network",
            Self::Decode(_) => "decode",
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } => false,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::Network(_) | Self::Decode(_) => true,
        }
    }
}

/// An inbound push frame that could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEvent {
    #[error("frame is not a JSON envelope: {0}")]
    InvalidJson(String),

    #[error("`{kind}` payload is invalid: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl MalformedEvent {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

/// Why a send was refused before any pending entry or network call was made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendRejected {
    #[error("message content is empty")]
    EmptyContent,

    #[error("no active channel session")]
    NotActive,
}

impl SendRejected {
    pub fn error_code(&self) -> &str {
        match self {
            Self::EmptyContent => "empty_content",
            Self::NotActive => "not_active",
        }
    }
}

/// Errors surfaced by the UI-facing session controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Terminal for the session; raised before it reaches `Active`.
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("no active channel session")]
    NotActive,

    #[error(transparent)]
    Request(#[from] ApiError),

    #[error("no pending send with nonce {0}")]
    UnknownNonce(Nonce),

    /// The session ended while the request was in flight; its response was discarded.
    #[error("session ended before the response arrived")]
    Superseded,
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::ChannelNotFound(_) => "channel_not_found",
            Self::NotActive => "not_active",
            Self::Request(inner) => inner.error_code(),
            Self::UnknownNonce(_) => "unknown_nonce",
            Self::Superseded => "superseded",
        }
    }
}
