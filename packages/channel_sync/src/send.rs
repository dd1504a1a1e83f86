//! OptimisticSendCoordinator: pending entries, nonces and the create call.
//!
//! The create call's response never resolves a pending entry; only the
//! broadcast carrying the same nonce does (see [`crate::store`]). A failed
//! call marks the entry `Failed` so the user can retry or discard it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::error::{ApiError, SendRejected, SessionError};
use crate::models::{AuthorContext, ChannelId, Message, Nonce};
use crate::pending::PendingSendQueue;
use crate::wire::CreateMessageRequest;

/// A send that produced a pending entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub nonce: Nonce,
    /// Set when the create call failed; the entry is then marked `Failed`.
    pub request_error: Option<ApiError>,
}

impl Accepted {
    pub fn failed(&self) -> bool {
        self.request_error.is_some()
    }
}

#[derive(Clone)]
pub struct OptimisticSendCoordinator {
    api: Arc<dyn ChatApi>,
}

impl OptimisticSendCoordinator {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    /// Validate, create the pending entry and build the create request.
    ///
    /// Whitespace-only content is rejected before anything is queued.
    pub fn prepare(
        channel_id: &ChannelId,
        content: &str,
        author: &AuthorContext,
        queue: &mut PendingSendQueue,
    ) -> Result<CreateMessageRequest, SendRejected> {
        if content.trim().is_empty() {
            return Err(SendRejected::EmptyContent);
        }
        let nonce = Nonce::generate();
        let message = Message::pending(
            channel_id.clone(),
            author,
            content.to_string(),
            nonce.clone(),
        );
        queue.push(nonce.clone(), message);
        debug!(channel = %channel_id, nonce = %nonce, queued = queue.len(), "pending send queued");

        Ok(CreateMessageRequest {
            channel_id: channel_id.clone(),
            content: content.to_string(),
            nonce,
        })
    }

    /// Return a failed entry to `Sending` and rebuild its request with the same nonce.
    pub fn prepare_retry(
        channel_id: &ChannelId,
        nonce: &Nonce,
        queue: &mut PendingSendQueue,
    ) -> Result<CreateMessageRequest, SessionError> {
        let message = queue
            .mark_retrying(nonce)
            .ok_or_else(|| SessionError::UnknownNonce(nonce.clone()))?;
        debug!(channel = %channel_id, nonce = %nonce, "retrying failed send");
        Ok(CreateMessageRequest {
            channel_id: channel_id.clone(),
            content: message.content.clone(),
            nonce: nonce.clone(),
        })
    }

    /// Record the outcome of a create call. Success changes nothing: the entry
    /// waits for its broadcast.
    pub fn complete(
        queue: &mut PendingSendQueue,
        nonce: &Nonce,
        result: &Result<Message, ApiError>,
    ) {
        match result {
            Ok(echo) => {
                if echo.nonce.as_ref().is_some_and(|n| n != nonce) {
                    warn!(nonce = %nonce, "create response carried a different nonce");
                }
            }
            Err(e) => {
                if queue.mark_failed(nonce, e.to_string()) {
                    warn!(nonce = %nonce, code = e.error_code(), error = %e, "send failed");
                } else {
                    debug!(nonce = %nonce, "send failed after its broadcast already arrived");
                }
            }
        }
    }

    /// Issue the create call for a prepared request.
    pub async fn issue(&self, request: CreateMessageRequest) -> Result<Message, ApiError> {
        self.api.create_message(request).await
    }

    /// Prepare, call and record in one step, for callers that own the queue exclusively.
    pub async fn send_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
        author: &AuthorContext,
        queue: &mut PendingSendQueue,
    ) -> Result<Accepted, SendRejected> {
        let request = Self::prepare(channel_id, content, author, queue)?;
        let nonce = request.nonce.clone();
        let result = self.issue(request).await;
        Self::complete(queue, &nonce, &result);
        Ok(Accepted {
            nonce,
            request_error: result.err(),
        })
    }
}
