//! ChannelSessionController: one channel view's lifecycle.
//!
//! A session moves `Initializing -> Active -> Terminated`. Every request it
//! issues carries a [`Ticket`] (channel plus session epoch); when the response
//! arrives it is applied only if the same session is still current, so a
//! switched-away or unmounted session can never touch a newer session's log.
//!
//! Locks are never held across a network call: each operation prepares under
//! the lock, awaits without it, then re-validates its ticket before applying.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ConnectionState, Subscription, SubscriptionId};
use crate::error::{ApiError, SendRejected, SessionError};
use crate::models::{AuthorContext, ChannelId, Message, Nonce};
use crate::pending::{DeliveryStatus, PendingSendQueue};
use crate::send::{Accepted, OptimisticSendCoordinator};
use crate::store::{LoadOlder, MessageStore, OlderRequest};
use crate::wire::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No channel mounted.
    Idle,
    Initializing,
    Active,
    Terminated,
}

/// How a timeline entry stands relative to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Confirmed,
    Sending,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub message: Message,
    pub delivery: Delivery,
}

impl TimelineEntry {
    /// Nonce of a pending entry, for retry and discard.
    pub fn nonce(&self) -> Option<&Nonce> {
        self.message.nonce.as_ref()
    }
}

/// Result of a scroll or an explicit request for older history.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrollOutcome {
    /// Not at the top boundary, no active session, or nothing loaded to page back from.
    Ignored,
    /// A page request is already in flight.
    Suppressed,
    Loaded { added: usize },
    Exhausted,
    /// The log is unchanged; scrolling again retries.
    Failed(ApiError),
    /// The session changed while the request was in flight.
    Discarded,
}

/// Identity of the session a request was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ticket {
    channel_id: ChannelId,
    epoch: u64,
}

struct Session {
    ticket: Ticket,
    phase: SessionPhase,
    store: MessageStore,
    pending: PendingSendQueue,
    load_error: Option<ApiError>,
    loading_older: bool,
    subscription: Option<SubscriptionId>,
    pump: Option<CancellationToken>,
}

/// Holds a session's `loading_older` slot; clears it on drop.
struct OlderInFlight<'a> {
    inner: &'a ControllerInner,
    ticket: &'a Ticket,
}

impl Drop for OlderInFlight<'_> {
    fn drop(&mut self) {
        self.inner
            .with_session(self.ticket, SessionPhase::Active, |session| {
                session.loading_older = false;
            });
    }
}

struct ControllerInner {
    api: Arc<dyn ChatApi>,
    connection: ConnectionManager,
    sender: OptimisticSendCoordinator,
    author: AuthorContext,
    config: SessionConfig,
    session: Mutex<Option<Session>>,
    epoch: AtomicU64,
    revision: watch::Sender<u64>,
}

/// Drives the mounted channel. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ChannelSessionController {
    inner: Arc<ControllerInner>,
}

impl ChannelSessionController {
    pub fn new(
        api: Arc<dyn ChatApi>,
        connection: ConnectionManager,
        author: AuthorContext,
        config: SessionConfig,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(ControllerInner {
                sender: OptimisticSendCoordinator::new(api.clone()),
                api,
                connection,
                author,
                config,
                session: Mutex::new(None),
                epoch: AtomicU64::new(0),
                revision,
            }),
        }
    }

    /// Mount `channel_id`, terminating whatever session was mounted before.
    ///
    /// Opens the shared connection if needed, subscribes, and loads the most
    /// recent page. A missing channel is terminal; any other load failure
    /// still reaches `Active` with an empty log and [`Self::load_error`] set.
    pub async fn mount(&self, channel_id: ChannelId) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.terminate_current("switched channel");

        let ticket = Ticket {
            channel_id: channel_id.clone(),
            epoch: inner.epoch.fetch_add(1, Ordering::SeqCst) + 1,
        };
        // Subscribe before loading so broadcasts racing the initial page are buffered.
        let subscription = inner.connection.subscribe();
        *inner.lock_session() = Some(Session {
            ticket: ticket.clone(),
            phase: SessionPhase::Initializing,
            store: MessageStore::new(channel_id.clone(), inner.config.page_size),
            pending: PendingSendQueue::new(),
            load_error: None,
            loading_older: false,
            subscription: Some(subscription.id()),
            pump: None,
        });
        inner.bump();
        info!(channel = %channel_id, "mounting channel session");

        if let Err(e) = inner.connection.open().await {
            warn!(channel = %channel_id, error = %e, "push connection unavailable, will keep retrying");
        }

        let page = inner
            .api
            .fetch_messages(channel_id.clone(), inner.config.initial_page_size)
            .await;

        let cancel = CancellationToken::new();
        let applied = inner.with_session(&ticket, SessionPhase::Initializing, |session| {
            match page {
                Ok(page) => {
                    session.store.apply_initial(page);
                }
                Err(ApiError::NotFound { .. }) => {
                    session.phase = SessionPhase::Terminated;
                    return Err(SessionError::ChannelNotFound(channel_id.clone()));
                }
                Err(e) => {
                    warn!(channel = %channel_id, code = e.error_code(), error = %e, "initial load failed");
                    session.load_error = Some(e);
                }
            }
            session.phase = SessionPhase::Active;
            session.pump = Some(cancel.clone());
            Ok(())
        });

        let result = match applied {
            Some(Ok(())) => {
                tokio::spawn(inner.clone().run_pump(ticket, subscription, cancel));
                Ok(())
            }
            Some(Err(e)) => {
                warn!(channel = %channel_id, "channel not found, session terminated");
                inner.connection.unsubscribe(subscription.id());
                inner.with_session(&ticket, SessionPhase::Terminated, |session| {
                    session.subscription = None;
                });
                Err(e)
            }
            None => {
                debug!(channel = %channel_id, "discarding initial page for a superseded session");
                Err(SessionError::Superseded)
            }
        };
        inner.bump();
        result
    }

    /// Terminate the current session without mounting another.
    pub fn unmount(&self) {
        self.inner.terminate_current("unmounted");
        self.inner.bump();
    }

    /// Optimistically send `content` to the mounted channel.
    pub async fn send_message(&self, content: &str) -> Result<Accepted, SendRejected> {
        let inner = &self.inner;
        let (ticket, request) = {
            let mut guard = inner.lock_session();
            let session = guard
                .as_mut()
                .filter(|s| s.phase == SessionPhase::Active)
                .ok_or(SendRejected::NotActive)?;
            let request = OptimisticSendCoordinator::prepare(
                &session.ticket.channel_id,
                content,
                &inner.author,
                &mut session.pending,
            )?;
            (session.ticket.clone(), request)
        };
        inner.bump();

        let nonce = request.nonce.clone();
        let result = inner.sender.issue(request).await;
        inner.finish_send(&ticket, &nonce, &result);
        Ok(Accepted {
            nonce,
            request_error: result.err(),
        })
    }

    /// Re-issue a failed send with its original nonce.
    pub async fn retry_send(&self, nonce: &Nonce) -> Result<Accepted, SessionError> {
        let inner = &self.inner;
        let (ticket, request) = {
            let mut guard = inner.lock_session();
            let session = guard
                .as_mut()
                .filter(|s| s.phase == SessionPhase::Active)
                .ok_or(SessionError::NotActive)?;
            let request = OptimisticSendCoordinator::prepare_retry(
                &session.ticket.channel_id,
                nonce,
                &mut session.pending,
            )?;
            (session.ticket.clone(), request)
        };
        inner.bump();

        let result = inner.sender.issue(request).await;
        inner.finish_send(&ticket, nonce, &result);
        Ok(Accepted {
            nonce: nonce.clone(),
            request_error: result.err(),
        })
    }

    /// Remove a failed pending entry at the user's request.
    pub fn discard_failed(&self, nonce: &Nonce) -> Result<(), SessionError> {
        {
            let mut guard = self.inner.lock_session();
            let session = guard
                .as_mut()
                .filter(|s| s.phase == SessionPhase::Active)
                .ok_or(SessionError::NotActive)?;
            session
                .pending
                .discard_failed(nonce)
                .ok_or_else(|| SessionError::UnknownNonce(nonce.clone()))?;
        }
        debug!(nonce = %nonce, "failed send discarded");
        self.inner.bump();
        Ok(())
    }

    /// React to the viewport's distance from the top of the loaded history.
    pub async fn handle_scroll(&self, scroll_top: f64) -> ScrollOutcome {
        if scroll_top > self.inner.config.scroll_threshold_px {
            return ScrollOutcome::Ignored;
        }
        self.load_older().await
    }

    /// Request the page before the oldest loaded message, unless one is already in flight.
    ///
    /// Dropping the returned future before it completes still releases the
    /// in-flight slot, so the next scroll can try again.
    pub async fn load_older(&self) -> ScrollOutcome {
        let inner = &self.inner;
        let (ticket, before) = {
            let mut guard = inner.lock_session();
            let Some(session) = guard.as_mut().filter(|s| s.phase == SessionPhase::Active) else {
                return ScrollOutcome::Ignored;
            };
            if session.loading_older {
                debug!(channel = %session.ticket.channel_id, "older page already in flight");
                return ScrollOutcome::Suppressed;
            }
            let before = match session.store.next_older() {
                OlderRequest::Before(id) => id,
                OlderRequest::Exhausted => return ScrollOutcome::Exhausted,
                OlderRequest::NoCursor => {
                    debug!(channel = %session.ticket.channel_id, "nothing loaded to page back from");
                    return ScrollOutcome::Ignored;
                }
            };
            session.loading_older = true;
            (session.ticket.clone(), before)
        };
        let in_flight = OlderInFlight {
            inner: inner.as_ref(),
            ticket: &ticket,
        };

        let page = inner
            .api
            .fetch_older_messages(ticket.channel_id.clone(), before, inner.config.page_size)
            .await;

        let applied = inner.with_session(&ticket, SessionPhase::Active, |session| match page {
            Ok(page) => match session.store.merge_older(page) {
                LoadOlder::Loaded { added } => ScrollOutcome::Loaded { added },
                LoadOlder::Exhausted => ScrollOutcome::Exhausted,
            },
            Err(e) => {
                warn!(channel = %ticket.channel_id, code = e.error_code(), error = %e, "loading older messages failed");
                ScrollOutcome::Failed(e)
            }
        });
        // Released only after the page is merged, so no second request races it.
        drop(in_flight);
        match applied {
            Some(outcome) => {
                inner.bump();
                outcome
            }
            None => {
                debug!(channel = %ticket.channel_id, "discarding older page for a superseded session");
                ScrollOutcome::Discarded
            }
        }
    }

    /// Confirmed messages in log order, then pending entries in FIFO order.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let guard = self.inner.lock_session();
        let Some(session) = guard.as_ref() else {
            return Vec::new();
        };
        let confirmed = session.store.messages().iter().map(|m| TimelineEntry {
            message: m.clone(),
            delivery: Delivery::Confirmed,
        });
        let pending = session.pending.iter().map(|p| TimelineEntry {
            message: p.message.clone(),
            delivery: match &p.status {
                DeliveryStatus::Sending => Delivery::Sending,
                DeliveryStatus::Failed { reason } => Delivery::Failed {
                    reason: reason.clone(),
                },
            },
        });
        confirmed.chain(pending).collect()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner
            .lock_session()
            .as_ref()
            .map_or(SessionPhase::Idle, |s| s.phase)
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.inner
            .lock_session()
            .as_ref()
            .map(|s| s.ticket.channel_id.clone())
    }

    /// The non-fatal initial load failure, if any.
    pub fn load_error(&self) -> Option<ApiError> {
        self.inner
            .lock_session()
            .as_ref()
            .and_then(|s| s.load_error.clone())
    }

    pub fn is_exhausted(&self) -> bool {
        self.inner
            .lock_session()
            .as_ref()
            .is_some_and(|s| s.store.is_exhausted())
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.inner.connection.current_state()
    }

    /// Compose is offered only while a session is active and the push connection is open.
    pub fn compose_enabled(&self) -> bool {
        self.phase() == SessionPhase::Active && self.connection_status().is_open()
    }

    /// Revision counter bumped after every visible change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}

impl ControllerInner {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must not be called while the session lock is held.
    fn bump(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }

    /// Run `f` if `ticket`'s session is still current and in `phase`.
    fn with_session<R>(
        &self,
        ticket: &Ticket,
        phase: SessionPhase,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut guard = self.lock_session();
        let session = guard
            .as_mut()
            .filter(|s| &s.ticket == ticket && s.phase == phase)?;
        Some(f(session))
    }

    fn terminate_current(&self, reason: &'static str) {
        let Some(mut session) = self.lock_session().take() else {
            return;
        };
        if let Some(pump) = session.pump.take() {
            pump.cancel();
        }
        if let Some(id) = session.subscription.take() {
            self.connection.unsubscribe(id);
        }
        info!(
            channel = %session.ticket.channel_id,
            pending = session.pending.len(),
            reason,
            "channel session terminated"
        );
    }

    fn finish_send(&self, ticket: &Ticket, nonce: &Nonce, result: &Result<Message, ApiError>) {
        let applied = self.with_session(ticket, SessionPhase::Active, |session| {
            OptimisticSendCoordinator::complete(&mut session.pending, nonce, result);
        });
        match applied {
            Some(()) => self.bump(),
            None => debug!(nonce = %nonce, "discarding send result for a superseded session"),
        }
    }

    /// Apply live events in delivery order, and catch up whenever a new link opens.
    async fn run_pump(
        self: Arc<Self>,
        ticket: Ticket,
        mut subscription: Subscription,
        cancel: CancellationToken,
    ) {
        let mut states = self.connection.watch_state();
        states.mark_unchanged();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(ServerEvent::Message(msg)) => self.apply_live(&ticket, msg),
                    None => break,
                },
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Open is only published when a fresh link is installed.
                    if states.borrow_and_update().is_open() {
                        tokio::spawn(self.clone().catch_up(ticket.clone()));
                    }
                    self.bump();
                }
            }
        }
        debug!(channel = %ticket.channel_id, "event pump stopped");
    }

    fn apply_live(&self, ticket: &Ticket, msg: Message) {
        let outcome = self.with_session(ticket, SessionPhase::Active, |session| {
            session.store.on_incoming_message(msg, &mut session.pending)
        });
        if outcome.is_some_and(|o| o.changed()) {
            self.bump();
        }
    }

    /// Re-fetch the newest page and feed it through live reconciliation, so
    /// broadcasts missed while disconnected still resolve pending sends.
    async fn catch_up(self: Arc<Self>, ticket: Ticket) {
        debug!(channel = %ticket.channel_id, "catching up after reconnect");
        let page = self
            .api
            .fetch_messages(ticket.channel_id.clone(), self.config.initial_page_size)
            .await;
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                warn!(channel = %ticket.channel_id, code = e.error_code(), error = %e, "catch-up fetch failed");
                return;
            }
        };
        let changed = self.with_session(&ticket, SessionPhase::Active, |session| {
            page.into_iter()
                .map(|msg| session.store.on_incoming_message(msg, &mut session.pending))
                .filter(|o| o.changed())
                .count()
        });
        match changed {
            Some(0) => {}
            Some(n) => {
                info!(channel = %ticket.channel_id, applied = n, "caught up after reconnect");
                self.bump();
            }
            None => debug!(channel = %ticket.channel_id, "discarding catch-up page for a superseded session"),
        }
    }
}
