//! ConnectionManager: the one shared push connection.
//!
//! Owns at most one live [`PushLink`] at a time. An unexpected close moves to
//! `Reconnecting` and schedules exactly one attempt after a fixed delay; a
//! deliberate `close()` sets the `expected_close` flag first and schedules
//! nothing. Every link, reconnect timer and pending connect is tagged with a
//! generation number so that work started for a superseded link is dropped.
//! Dials never overlap, so two underlying connections never coexist.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::wire::{Envelope, ServerEvent, decode_frame};

use super::link::{Connector, PushLink};

/// Lifecycle of the shared connection. Only the manager sets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting { next_attempt_at: Instant },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// Stable handle identifying one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving side of a subscription. Events arrive in transport order.
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }
}

struct LinkSlot {
    state: ConnectionState,
    primed: bool,
    /// Set immediately before a deliberate close so the close is not treated as a drop.
    expected_close: bool,
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    reader_cancel: Option<CancellationToken>,
    reconnect_timer: Option<CancellationToken>,
    /// Cancels the dial in progress, if any.
    dialing: Option<CancellationToken>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    link: Mutex<LinkSlot>,
    /// Held for the whole of each dial, so a superseded dial is gone before the next starts.
    dial_lock: tokio::sync::Mutex<()>,
    subscribers: Mutex<BTreeMap<SubscriptionId, mpsc::UnboundedSender<ServerEvent>>>,
    next_subscription: AtomicU64,
}

/// Process-wide push connection. Cheap to clone; all clones share one link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state_tx,
                link: Mutex::new(LinkSlot {
                    state: ConnectionState::Disconnected,
                    primed: false,
                    expected_close: false,
                    generation: 0,
                    outbound: None,
                    reader_cancel: None,
                    reconnect_timer: None,
                    dialing: None,
                }),
                dial_lock: tokio::sync::Mutex::new(()),
                subscribers: Mutex::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Establish the connection. A no-op unless currently `Disconnected`.
    ///
    /// The first call primes the endpoint; a priming failure is logged and
    /// ignored. A failed connect is reported to the caller and also handled
    /// like a drop: the manager moves to `Reconnecting`.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        let (generation, needs_prime, dial) = {
            let mut slot = self.inner.lock_link();
            if slot.state != ConnectionState::Disconnected {
                debug!(state = slot.state.label(), "open() ignored, connection already exists");
                return Ok(());
            }
            slot.expected_close = false;
            slot.generation += 1;
            let needs_prime = !slot.primed;
            slot.primed = true;
            self.inner.set_state(&mut slot, ConnectionState::Connecting);
            (slot.generation, needs_prime, start_dial(&mut slot))
        };

        if needs_prime {
            match self.inner.connector.prime().await {
                Ok(()) => debug!("push endpoint primed"),
                Err(e) => warn!(error = %e, "priming request failed, connecting anyway"),
            }
        }

        self.inner.establish(generation, dial).await
    }

    /// Deliberately close the connection and cancel any scheduled reconnect.
    pub fn close(&self) {
        let mut slot = self.inner.lock_link();
        slot.expected_close = true;
        slot.generation += 1;
        if let Some(timer) = slot.reconnect_timer.take() {
            timer.cancel();
        }
        if let Some(dial) = slot.dialing.take() {
            debug!("abandoning dial in progress");
            dial.cancel();
        }
        if let Some(reader) = slot.reader_cancel.take() {
            reader.cancel();
        }
        // Dropping the sender tells the transport to close the link.
        if slot.outbound.take().is_some() {
            info!("push connection closed by application");
        }
        self.inner.set_state(&mut slot, ConnectionState::Disconnected);
    }

    /// Send one envelope. Fails fast with `NotConnected` unless `Open`.
    pub fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(envelope)
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let slot = self.inner.lock_link();
        if !slot.state.is_open() {
            return Err(ConnectionError::NotConnected);
        }
        let outbound = slot.outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ConnectionError::Transport("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Register a subscriber. Every inbound event is delivered to every subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock_subscribers().insert(id, tx);
        debug!(subscription = %id, "subscribed to push events");
        Subscription { id, events: rx }
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.lock_subscribers().remove(&id).is_some();
        if removed {
            debug!(subscription = %id, "unsubscribed from push events");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock_subscribers().len()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.lock_link().state
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }
}

impl Inner {
    fn lock_link(&self) -> MutexGuard<'_, LinkSlot> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(
        &self,
    ) -> MutexGuard<'_, BTreeMap<SubscriptionId, mpsc::UnboundedSender<ServerEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, slot: &mut LinkSlot, state: ConnectionState) {
        if slot.state != state {
            debug!(from = slot.state.label(), to = state.label(), "connection state change");
        }
        slot.state = state;
        self.state_tx.send_replace(state);
    }

    /// Dial a new link for `generation` and install it if still current.
    ///
    /// Dials never overlap: a dial waits for any earlier one to finish, and
    /// `close()` cancels the one in progress.
    async fn establish(
        self: &Arc<Self>,
        generation: u64,
        dial: CancellationToken,
    ) -> Result<(), ConnectionError> {
        let _dialing = self.dial_lock.lock().await;
        if self.lock_link().generation != generation {
            debug!("skipping dial for a superseded generation");
            return Ok(());
        }

        let result = tokio::select! {
            biased;
            _ = dial.cancelled() => {
                debug!("dial abandoned");
                return Ok(());
            }
            result = self.connector.connect() => result,
        };

        let mut slot = self.lock_link();
        if slot.generation != generation {
            // close() ran while we were dialing; the new link is dropped here.
            debug!("discarding link established for a superseded generation");
            return Ok(());
        }
        slot.dialing = None;

        match result {
            Ok(PushLink { outbound, inbound }) => {
                let cancel = CancellationToken::new();
                slot.outbound = Some(outbound);
                slot.reader_cancel = Some(cancel.clone());
                self.set_state(&mut slot, ConnectionState::Open);
                drop(slot);
                info!("push connection open");

                let inner = self.clone();
                tokio::spawn(async move {
                    inner.read_loop(inbound, cancel, generation).await;
                });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "push connect failed");
                self.schedule_reconnect(&mut slot);
                Err(e)
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<String>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                frame = inbound.recv() => match frame {
                    Some(text) => self.dispatch(&text),
                    None => break,
                },
            }
        }
        self.handle_link_closed(generation);
    }

    fn dispatch(&self, text: &str) {
        match decode_frame(text) {
            Ok(Some(event)) => self.fan_out(event),
            Ok(None) => debug!("ignoring push frame of unrecognized type"),
            Err(e) => warn!(code = e.error_code(), error = %e, "dropping malformed push frame"),
        }
    }

    fn fan_out(&self, event: ServerEvent) {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                debug!(subscription = %id, "dropping subscriber with closed receiver");
            }
            alive
        });
    }

    fn handle_link_closed(self: &Arc<Self>, generation: u64) {
        let mut slot = self.lock_link();
        if slot.generation != generation {
            return;
        }
        slot.outbound = None;
        slot.reader_cancel = None;
        if slot.expected_close {
            self.set_state(&mut slot, ConnectionState::Disconnected);
            return;
        }
        warn!("push connection lost");
        self.schedule_reconnect(&mut slot);
    }

    /// Move to `Reconnecting` and arm exactly one reconnect attempt.
    fn schedule_reconnect(self: &Arc<Self>, slot: &mut LinkSlot) {
        slot.generation += 1;
        let generation = slot.generation;
        let next_attempt_at = Instant::now() + self.config.reconnect_delay;
        self.set_state(slot, ConnectionState::Reconnecting { next_attempt_at });

        let timer = CancellationToken::new();
        if let Some(previous) = slot.reconnect_timer.replace(timer.clone()) {
            previous.cancel();
        }
        info!(
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "reconnect scheduled"
        );

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep_until(next_attempt_at) => inner.reconnect(generation).await,
            }
        });
    }

    async fn reconnect(self: &Arc<Self>, generation: u64) {
        let dial = {
            let mut slot = self.lock_link();
            let waiting = matches!(slot.state, ConnectionState::Reconnecting { .. });
            if slot.generation != generation || !waiting {
                return;
            }
            slot.reconnect_timer = None;
            self.set_state(&mut slot, ConnectionState::Connecting);
            start_dial(&mut slot)
        };
        info!("attempting reconnect");
        // A failure re-enters Reconnecting inside establish().
        let _ = self.establish(generation, dial).await;
    }
}

fn start_dial(slot: &mut LinkSlot) -> CancellationToken {
    let dial = CancellationToken::new();
    if let Some(previous) = slot.dialing.replace(dial.clone()) {
        previous.cancel();
    }
    dial
}
