use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};

use crate::config::{ConnectionConfig, ServerConfig};
use crate::error::ConnectionError;

use super::link::{Connector, PushLink};

/// Push links over WebSocket, primed with a plain GET to the same path.
#[derive(Clone)]
pub struct WsConnector {
    server: ServerConfig,
    http: reqwest::Client,
    capacity: usize,
}

impl WsConnector {
    pub fn new(server: ServerConfig, connection: &ConnectionConfig) -> Self {
        Self {
            server,
            http: reqwest::Client::new(),
            capacity: connection.outbound_capacity,
        }
    }
}

fn transport_error(err: tungstenite::Error) -> ConnectionError {
    ConnectionError::Transport(err.to_string())
}

impl Connector for WsConnector {
    fn prime(&self) -> BoxFuture<'static, Result<(), ConnectionError>> {
        let http = self.http.clone();
        let url = self.server.push_http_url();
        async move {
            let resp = http
                .get(&url)
                .send()
                .await
                .map_err(|e| ConnectionError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ConnectionError::Transport(format!(
                    "priming {} returned {}",
                    url,
                    resp.status()
                )));
            }
            Ok(())
        }
        .boxed()
    }

    fn connect(&self) -> BoxFuture<'static, Result<PushLink, ConnectionError>> {
        let url = self.server.push_ws_url();
        let capacity = self.capacity;
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(transport_error)?;
            debug!(url = %url, "websocket connected");
            let (mut ws_write, mut ws_read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<String>(capacity);
            let (in_tx, in_rx) = mpsc::channel::<String>(capacity);

            // Writer: drain outbound channel → socket. Channel closed = deliberate close.
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                        warn!(error = %e, "websocket write failed");
                        return;
                    }
                }
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
            });

            // Reader: socket → inbound channel. Dropping in_tx reports the close.
            tokio::spawn(async move {
                while let Some(frame) = ws_read.next().await {
                    match frame {
                        Ok(tungstenite::Message::Text(text)) => {
                            if in_tx.send(text.as_str().to_owned()).await.is_err() {
                                break;
                            }
                        }
                        Ok(tungstenite::Message::Binary(_)) => {
                            debug!("ignoring binary push frame");
                        }
                        Ok(tungstenite::Message::Close(_)) => break,
                        // Pings are answered by tungstenite itself.
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "websocket read failed");
                            break;
                        }
                    }
                }
            });

            Ok(PushLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
        .boxed()
    }
}
