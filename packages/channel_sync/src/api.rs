//! Request/response calls to the chat server, independent of the push channel.

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::models::{ChannelId, Message, MessageId};
use crate::wire::{CreateMessageRequest, WireMessage, decode_page};

/// The three outbound calls the sync core issues.
///
/// `create_message`'s returned copy is only used to detect failure; the
/// push broadcast carrying the same nonce is what resolves a pending send.
pub trait ChatApi: Send + Sync + 'static {
    fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> BoxFuture<'static, Result<Message, ApiError>>;

    /// Most recent `limit` messages, oldest first.
    fn fetch_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
    ) -> BoxFuture<'static, Result<Vec<Message>, ApiError>>;

    /// Up to `limit` messages strictly older than `before`, oldest first.
    /// An empty page means history is exhausted.
    fn fetch_older_messages(
        &self,
        channel_id: ChannelId,
        before: MessageId,
        limit: u32,
    ) -> BoxFuture<'static, Result<Vec<Message>, ApiError>>;
}

/// JSON-over-HTTP implementation.
#[derive(Clone)]
pub struct HttpChatApi {
    server: ServerConfig,
    http: reqwest::Client,
}

impl HttpChatApi {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            http: reqwest::Client::new(),
        }
    }

    fn messages_url(&self, channel_id: &ChannelId) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.server.api_url("/channels"))
            .map_err(|e| ApiError::Network(format!("invalid api url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Network("api url cannot be a base".to_string()))?
            .push(channel_id.as_str())
            .push("messages");
        Ok(url)
    }

    fn fetch_page(
        &self,
        channel_id: ChannelId,
        query: Vec<(&'static str, String)>,
    ) -> BoxFuture<'static, Result<Vec<Message>, ApiError>> {
        let http = self.http.clone();
        let url = self.messages_url(&channel_id);
        async move {
            let url = url?;
            debug!(channel = %channel_id, url = %url, "fetching messages");
            let resp = http.get(url).query(&query).send().await.map_err(network)?;
            let resp = check_status(resp, &channel_id).await?;
            let wire: Vec<WireMessage> = resp
                .json()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()))?;
            decode_page(wire).map_err(ApiError::Decode)
        }
        .boxed()
    }
}

fn network(err: reqwest::Error) -> ApiError {
    ApiError::Network(err.to_string())
}

async fn check_status(
    resp: reqwest::Response,
    channel_id: &ChannelId,
) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound {
            channel_id: channel_id.clone(),
        });
    }
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(ApiError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp)
}

impl ChatApi for HttpChatApi {
    fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> BoxFuture<'static, Result<Message, ApiError>> {
        let http = self.http.clone();
        let url = self.messages_url(&request.channel_id);
        async move {
            let url = url?;
            let resp = http.post(url).json(&request).send().await.map_err(network)?;
            let resp = check_status(resp, &request.channel_id).await?;
            let wire: WireMessage = resp
                .json()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()))?;
            wire.into_message().map_err(ApiError::Decode)
        }
        .boxed()
    }

    fn fetch_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
    ) -> BoxFuture<'static, Result<Vec<Message>, ApiError>> {
        self.fetch_page(channel_id, vec![("limit", limit.to_string())])
    }

    fn fetch_older_messages(
        &self,
        channel_id: ChannelId,
        before: MessageId,
        limit: u32,
    ) -> BoxFuture<'static, Result<Vec<Message>, ApiError>> {
        self.fetch_page(
            channel_id,
            vec![
                ("before", before.as_str().to_string()),
                ("limit", limit.to_string()),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerFileConfig;

    #[test]
    fn messages_url_escapes_channel() {
        let api = HttpChatApi::new(ServerConfig::from_file(&ServerFileConfig::default()));
        let url = api.messages_url(&ChannelId::new("team chat")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:3000/api/channels/team%20chat/messages"
        );
    }
}
