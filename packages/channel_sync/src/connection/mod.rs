//! The single process-wide push connection.
//!
//! - `link`: `Connector` seam and the channel pair that represents one live link
//! - `manager`: `ConnectionManager`: open/close/reconnect state machine and event fan-out
//! - `websocket`: `WsConnector`, the tokio-tungstenite implementation

pub mod link;
pub mod manager;
pub mod websocket;

pub use link::{Connector, PushLink};
pub use manager::{ConnectionManager, ConnectionState, Subscription, SubscriptionId};
pub use websocket::WsConnector;
