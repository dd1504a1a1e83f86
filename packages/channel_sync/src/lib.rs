//! Client-side real-time sync core for channel-based chat.
//!
//! One shared push connection fans events out to subscribers; each mounted
//! channel keeps an ordered, deduplicated log and reconciles optimistic sends
//! against their broadcasts by nonce.

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod models;
pub mod pending;
pub mod send;
pub mod session;
pub mod store;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use api::{ChatApi, HttpChatApi};
pub use config::{ConnectionConfig, FileConfig, ServerConfig, SessionConfig, load_config};
pub use connection::{ConnectionManager, ConnectionState, Connector, PushLink, WsConnector};
pub use error::{ApiError, ConnectionError, MalformedEvent, SendRejected, SessionError};
pub use models::{AuthorContext, AuthorSnapshot, ChannelId, Message, MessageId, Nonce};
pub use session::{ChannelSessionController, Delivery, ScrollOutcome, SessionPhase, TimelineEntry};
