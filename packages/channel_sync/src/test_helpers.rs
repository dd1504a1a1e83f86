//! Test doubles shared by the unit tests: scripted push connector, scripted
//! chat API and message builders.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc};

use crate::api::ChatApi;
use crate::connection::{Connector, PushLink};
use crate::error::{ApiError, ConnectionError};
use crate::models::{AuthorContext, AuthorSnapshot, ChannelId, Message, MessageId};
use crate::wire::{CreateMessageRequest, Envelope, MESSAGE_EVENT, WireMessage};

// ── messages ────────────────────────────────────────────────────────────

/// Authoritative message `id` in `channel`, created `secs` after the epoch.
pub fn message(id: &str, channel: &str, content: &str, secs: i64) -> Message {
    Message {
        id: MessageId::new(id),
        channel_id: ChannelId::new(channel),
        author_id: "u-2".to_string(),
        author: AuthorSnapshot {
            name: "bob".to_string(),
            avatar: None,
        },
        content: content.to_string(),
        created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        embeds: Vec::new(),
        nonce: None,
        pending: false,
    }
}

/// The broadcast the server would push for `msg`.
pub fn broadcast_frame(msg: &Message) -> String {
    let envelope = Envelope::new(MESSAGE_EVENT, &WireMessage::from_message(msg)).unwrap();
    serde_json::to_string(&envelope).unwrap()
}

pub fn alice() -> AuthorContext {
    AuthorContext::new("u-1", "alice")
}

pub fn ids(messages: &[Message]) -> Vec<&str> {
    messages
        .iter()
        .map(|m| m.id.as_ref().map(MessageId::as_str).unwrap_or("<pending>"))
        .collect()
}

// ── push connector ──────────────────────────────────────────────────────
//
// Every `connect()` yields a link whose far end is handed to the test.

/// The server side of one scripted link.
pub struct RemoteEnd {
    /// Frames the client sent.
    pub received: mpsc::Receiver<String>,
    push: Option<mpsc::Sender<String>>,
}

impl RemoteEnd {
    /// Push a frame to the client.
    pub async fn push_text(&self, text: impl Into<String>) {
        let push = self.push.as_ref().expect("remote already disconnected");
        push.send(text.into()).await.unwrap();
    }

    /// Simulate a server-side (unexpected) close.
    pub fn disconnect(&mut self) {
        self.push = None;
    }

    /// Whether the client side has dropped its outbound sender.
    pub fn client_closed(&mut self) -> bool {
        matches!(
            self.received.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        )
    }
}

#[derive(Default)]
struct Script {
    fail_next: VecDeque<ConnectionError>,
    remotes: VecDeque<RemoteEnd>,
    gate: Option<Arc<Semaphore>>,
}

/// Counts a dial as in flight until its future completes or is dropped.
struct Dialing(Arc<AtomicUsize>);

impl Drop for Dialing {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
    prime_calls: Arc<AtomicUsize>,
    connect_calls: Arc<AtomicUsize>,
    dials_in_flight: Arc<AtomicUsize>,
    max_dials_in_flight: Arc<AtomicUsize>,
    prime_fails: bool,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_prime() -> Self {
        Self {
            prime_fails: true,
            ..Self::default()
        }
    }

    pub fn fail_next_connect(&self, err: ConnectionError) {
        self.script.lock().unwrap().fail_next.push_back(err);
    }

    /// Hold every `connect()` issued from now on until its future is dropped.
    pub fn hold_connects(&self) {
        self.script.lock().unwrap().gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Later `connect()` calls complete immediately; held ones stay held.
    pub fn stop_holding_connects(&self) {
        self.script.lock().unwrap().gate = None;
    }

    /// Most `connect()` futures ever alive at the same time.
    pub fn max_concurrent_dials(&self) -> usize {
        self.max_dials_in_flight.load(Ordering::SeqCst)
    }

    /// Remote end of the oldest link not yet taken by the test.
    pub fn take_remote(&self) -> RemoteEnd {
        self.script
            .lock()
            .unwrap()
            .remotes
            .pop_front()
            .expect("no link has been established")
    }

    pub fn prime_count(&self) -> usize {
        self.prime_calls.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn prime(&self) -> BoxFuture<'static, Result<(), ConnectionError>> {
        self.prime_calls.fetch_add(1, Ordering::SeqCst);
        let fails = self.prime_fails;
        async move {
            if fails {
                Err(ConnectionError::Transport("priming refused".into()))
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    fn connect(&self) -> BoxFuture<'static, Result<PushLink, ConnectionError>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.dials_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_dials_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let dialing = Dialing(self.dials_in_flight.clone());
        let mut script = self.script.lock().unwrap();
        let result = match script.fail_next.pop_front() {
            Some(err) => Err(err),
            None => {
                let (out_tx, out_rx) = mpsc::channel(64);
                let (in_tx, in_rx) = mpsc::channel(64);
                script.remotes.push_back(RemoteEnd {
                    received: out_rx,
                    push: Some(in_tx),
                });
                Ok(PushLink {
                    outbound: out_tx,
                    inbound: in_rx,
                })
            }
        };
        let gate = script.gate.clone();
        async move {
            let _dialing = dialing;
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
            result
        }
        .boxed()
    }
}

// ── chat api ────────────────────────────────────────────────────────────

#[derive(Default)]
struct ApiScript {
    channels: HashMap<ChannelId, Vec<Message>>,
    next_id: u64,
    fail_create: VecDeque<ApiError>,
    fail_fetch: VecDeque<ApiError>,
    fail_older: VecDeque<ApiError>,
    gate: Option<Arc<Semaphore>>,
    holding: bool,
    created: Vec<CreateMessageRequest>,
}

/// In-memory chat server. Responses can be held back with [`ScriptedApi::hold`]
/// and let through one at a time with [`ScriptedApi::release`].
#[derive(Clone, Default)]
pub struct ScriptedApi {
    script: Arc<Mutex<ApiScript>>,
    create_calls: Arc<AtomicUsize>,
    fetch_calls: Arc<AtomicUsize>,
    older_calls: Arc<AtomicUsize>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(self, channel: &str, history: Vec<Message>) -> Self {
        self.script
            .lock()
            .unwrap()
            .channels
            .insert(ChannelId::new(channel), history);
        self
    }

    /// Append a message to the server-side log without broadcasting it.
    pub fn persist(&self, msg: Message) {
        self.script
            .lock()
            .unwrap()
            .channels
            .entry(msg.channel_id.clone())
            .or_default()
            .push(msg);
    }

    pub fn fail_next_create(&self, err: ApiError) {
        self.script.lock().unwrap().fail_create.push_back(err);
    }

    pub fn fail_next_fetch(&self, err: ApiError) {
        self.script.lock().unwrap().fail_fetch.push_back(err);
    }

    pub fn fail_next_older(&self, err: ApiError) {
        self.script.lock().unwrap().fail_older.push_back(err);
    }

    /// Hold every response issued from now on until released.
    pub fn hold(&self) {
        let mut script = self.script.lock().unwrap();
        script.gate = Some(Arc::new(Semaphore::new(0)));
        script.holding = true;
    }

    /// Let `n` held responses through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.script.lock().unwrap().gate {
            gate.add_permits(n);
        }
    }

    /// Stop holding responses issued from now on. Already held ones still
    /// wait for [`ScriptedApi::release`].
    pub fn unhold(&self) {
        self.script.lock().unwrap().holding = false;
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn older_count(&self) -> usize {
        self.older_calls.load(Ordering::SeqCst)
    }

    pub fn created_requests(&self) -> Vec<CreateMessageRequest> {
        self.script.lock().unwrap().created.clone()
    }

    fn gate(script: &ApiScript) -> Option<Arc<Semaphore>> {
        script.gate.clone().filter(|_| script.holding)
    }

    fn respond<T: Send + 'static>(
        gate: Option<Arc<Semaphore>>,
        result: Result<T, ApiError>,
    ) -> BoxFuture<'static, Result<T, ApiError>> {
        async move {
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
            result
        }
        .boxed()
    }
}

impl ChatApi for ScriptedApi {
    fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> BoxFuture<'static, Result<Message, ApiError>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script.created.push(request.clone());
        let result = if let Some(err) = script.fail_create.pop_front() {
            Err(err)
        } else if !script.channels.contains_key(&request.channel_id) {
            Err(ApiError::NotFound {
                channel_id: request.channel_id.clone(),
            })
        } else {
            script.next_id += 1;
            let msg = Message {
                id: MessageId::new(format!("srv-{}", script.next_id)),
                channel_id: request.channel_id.clone(),
                author_id: "u-1".to_string(),
                author: alice().snapshot,
                content: request.content.clone(),
                created_at: Utc::now(),
                embeds: Vec::new(),
                nonce: Some(request.nonce.clone()),
                pending: false,
            };
            script
                .channels
                .entry(request.channel_id.clone())
                .or_default()
                .push(msg.clone());
            Ok(msg)
        };
        Self::respond(Self::gate(&script), result)
    }

    fn fetch_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
    ) -> BoxFuture<'static, Result<Vec<Message>, ApiError>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        let result = match script.fail_fetch.pop_front() {
            Some(err) => Err(err),
            None => match script.channels.get(&channel_id) {
                Some(log) => {
                    let start = log.len().saturating_sub(limit as usize);
                    Ok(log[start..].to_vec())
                }
                None => Err(ApiError::NotFound { channel_id }),
            },
        };
        Self::respond(Self::gate(&script), result)
    }

    fn fetch_older_messages(
        &self,
        channel_id: ChannelId,
        before: MessageId,
        limit: u32,
    ) -> BoxFuture<'static, Result<Vec<Message>, ApiError>> {
        self.older_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        let result = match script.fail_older.pop_front() {
            Some(err) => Err(err),
            None => match script.channels.get(&channel_id) {
                Some(log) => {
                    let end = log
                        .iter()
                        .position(|m| m.id.as_ref() == Some(&before))
                        .unwrap_or(0);
                    let start = end.saturating_sub(limit as usize);
                    Ok(log[start..end].to_vec())
                }
                None => Err(ApiError::NotFound { channel_id }),
            },
        };
        Self::respond(Self::gate(&script), result)
    }
}
