use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::ConnectionError;

/// One live underlying connection, seen as a pair of text-frame channels.
///
/// Dropping `outbound` asks the transport to close the link. The inbound
/// channel ending means the peer (or the network) closed it.
pub struct PushLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Establishes push links. Implemented over WebSocket in production and by
/// scripted doubles in tests.
pub trait Connector: Send + Sync + 'static {
    /// One-time warm-up request to the endpoint that owns the push channel.
    fn prime(&self) -> BoxFuture<'static, Result<(), ConnectionError>>;

    fn connect(&self) -> BoxFuture<'static, Result<PushLink, ConnectionError>>;
}
