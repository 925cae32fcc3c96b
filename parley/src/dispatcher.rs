//! Inbound event routing.
//!
//! The [`UpdateDispatcher`] is the single entry point for transport
//! adapters. For every inbound event it:
//!
//! 1. drops updates produced before the process started (payments excepted),
//! 2. resolves the conversation's session and counts the request towards
//!    the eviction sweep,
//! 3. applies the permission gate, then the acceptance gate,
//! 4. classifies the event and calls exactly one capability,
//! 5. reports capability failures to the session's error hook and always
//!    finishes with `end_of_turn`.
//!
//! A failure in one turn never escapes into the transport: the caller only
//! ever sees a [`Dispatch`] describing what happened.

use crate::callback::CallbackRegistry;
use crate::cancel::Cancellation;
use crate::config::RuntimeConfig;
use crate::error::{SessionError, SessionResult, StoreError};
use crate::events::{AttachmentKind, ConversationId, EventKind, InboundEvent, MessageContent};
use crate::eviction::{Clock, EvictionPolicy, SweepTrigger};
use crate::maintenance::{MaintenanceHandle, MaintenanceService};
use crate::session::{
    RejectReason, Session, SessionFactory, SessionStore, SessionStoreBuilder, Turn,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Outcomes
// ============================================================================

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A capability ran to completion.
    Handled,
    /// The message predates process start and was dropped.
    Dropped,
    /// The button click predates process start; only acknowledged.
    Skipped,
    /// The sender failed the permission gate.
    Denied,
    /// The button click was refused.
    Rejected(RejectReason),
    /// Acceptance is outstanding; the event went to the acceptance hook.
    AcceptanceRequired,
    /// A message nobody handles, such as a bare sticker.
    Ignored,
    /// A capability failed and the session's error hook was told.
    Failed,
    /// The event could not be processed at all.
    Aborted,
    /// The dispatcher is shutting down.
    ShuttingDown,
}

/// How the transport should answer a button click.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAck {
    /// Clear the client's loading indicator.
    Answered,
    /// Stale click; acknowledge without showing anything.
    Skipped,
    /// Show the refusal to the user.
    Rejected(RejectReason),
}

/// Result of [`UpdateDispatcher::handle_inbound_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// What happened.
    pub outcome: DispatchOutcome,
    /// Set for button clicks only.
    pub ack: Option<CallbackAck>,
}

impl Dispatch {
    fn new(outcome: DispatchOutcome, is_callback: bool) -> Self {
        let ack = is_callback.then_some(match outcome {
            DispatchOutcome::Skipped => CallbackAck::Skipped,
            DispatchOutcome::Rejected(reason) => CallbackAck::Rejected(reason),
            _ => CallbackAck::Answered,
        });
        Self { outcome, ack }
    }
}

/// Dispatcher statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    /// Events received.
    pub received: u64,
    /// Events a capability handled.
    pub handled: u64,
    /// Events whose capability failed.
    pub failed: u64,
    /// Events dropped or skipped before reaching a session.
    pub dropped: u64,
    /// Events refused by a gate.
    pub rejected: u64,
    /// Events that could not be processed.
    pub aborted: u64,
}

impl DispatchStats {
    fn record(&mut self, outcome: DispatchOutcome) {
        self.received += 1;
        match outcome {
            DispatchOutcome::Handled
            | DispatchOutcome::AcceptanceRequired
            | DispatchOutcome::Ignored => self.handled += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Dropped
            | DispatchOutcome::Skipped
            | DispatchOutcome::ShuttingDown => self.dropped += 1,
            DispatchOutcome::Denied | DispatchOutcome::Rejected(_) => self.rejected += 1,
            DispatchOutcome::Aborted => self.aborted += 1,
        }
    }
}

/// Summary of an orderly shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether all in-flight turns finished within the drain timeout.
    pub drained: bool,
    /// Sessions disposed.
    pub disposed: usize,
}

// ============================================================================
// Commands
// ============================================================================

/// A parsed command such as `/set-role 123 admin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lower-cased name without prefix or `@bot` suffix.
    pub name: String,
    /// Whitespace-separated arguments.
    pub args: Vec<String>,
}

impl Command {
    /// Parse `text` as a command. Returns `None` for free text.
    #[must_use]
    pub fn parse(text: &str, prefix: &str) -> Option<Self> {
        let rest = text.trim_start().strip_prefix(prefix)?;
        let head = rest.split(char::is_whitespace).next()?;
        let name = head.split_once('@').map_or(head, |(name, _bot)| name);
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_lowercase(),
            args: rest[head.len()..]
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        })
    }
}

// ============================================================================
// In-flight tracking
// ============================================================================

#[derive(Debug, Default)]
struct TurnTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl TurnTracker {
    fn enter(self: &Arc<Self>) -> TurnGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        TurnGuard(Arc::clone(self))
    }

    /// Wait until no turn is in flight or `timeout` elapses.
    async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active.load(Ordering::SeqCst) == 0;
            }
        }
    }
}

struct TurnGuard(Arc<TurnTracker>);

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes inbound events to per-conversation sessions.
#[derive(Debug)]
pub struct UpdateDispatcher {
    store: Arc<SessionStore>,
    started_at: SystemTime,
    drop_pre_start: bool,
    command_prefix: String,
    drain_timeout: Duration,
    maintenance_interval: Duration,
    tracker: Arc<TurnTracker>,
    closing: AtomicBool,
    stats: RwLock<DispatchStats>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl UpdateDispatcher {
    /// Start building a dispatcher around a session factory.
    pub fn builder(factory: impl SessionFactory + 'static) -> DispatcherBuilder {
        DispatcherBuilder {
            store: SessionStore::builder(factory),
            config: RuntimeConfig::default(),
            started_at: None,
        }
    }

    /// The underlying session store.
    #[must_use]
    pub const fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The callback registry shared with sessions.
    #[must_use]
    pub fn callbacks(&self) -> &CallbackRegistry {
        self.store.callbacks()
    }

    /// When events stop counting as stale.
    #[must_use]
    pub const fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Get current dispatcher statistics.
    pub async fn stats(&self) -> DispatchStats {
        *self.stats.read().await
    }

    /// Process one inbound event.
    ///
    /// Never fails: every error is contained and reported through the
    /// returned [`Dispatch`].
    pub async fn handle_inbound_event(&self, event: InboundEvent, cancel: Cancellation) -> Dispatch {
        let _guard = self.tracker.enter();
        let is_callback = event.callback_query().is_some();

        let outcome = if self.closing.load(Ordering::SeqCst) {
            debug!(conversation = %event.conversation, "event refused during shutdown");
            DispatchOutcome::ShuttingDown
        } else {
            let conversation = event.conversation.clone();
            let kind = event.kind_name();
            match AssertUnwindSafe(self.dispatch(event, cancel))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let err = SessionError::from_panic(&*payload);
                    error!(
                        conversation = %conversation,
                        kind,
                        error = %err,
                        "dispatch aborted"
                    );
                    DispatchOutcome::Aborted
                }
            }
        };

        self.stats.write().await.record(outcome);
        Dispatch::new(outcome, is_callback)
    }

    async fn dispatch(&self, event: InboundEvent, cancel: Cancellation) -> DispatchOutcome {
        let is_payment = matches!(event.kind, EventKind::Payment(_));
        if self.drop_pre_start && !is_payment && event.timestamp < self.started_at {
            trace!(
                conversation = %event.conversation,
                kind = event.kind_name(),
                "stale update dropped"
            );
            return if event.callback_query().is_some() {
                DispatchOutcome::Skipped
            } else {
                DispatchOutcome::Dropped
            };
        }

        let conversation = event.conversation.clone();
        let handle = match self.store.get_or_create(&conversation, &event).await {
            Ok(handle) => handle,
            Err(StoreError::Begin { source, handle, .. }) => {
                self.store.run_eviction_sweep().await;
                let session = handle.session().as_ref();
                report_failure(session, &conversation, &source).await;
                finish_turn(session, &conversation).await;
                return DispatchOutcome::Failed;
            }
            Err(StoreError::ShuttingDown) => return DispatchOutcome::ShuttingDown,
            Err(err) => {
                error!(conversation = %conversation, error = %err, "session unavailable");
                return DispatchOutcome::Aborted;
            }
        };
        self.store.run_eviction_sweep().await;

        let session = handle.session().as_ref();
        let turn = Turn::new(event, cancel);

        let outcome = match guarded(self.route(session, &turn), &turn.cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                report_failure(session, &conversation, &err).await;
                DispatchOutcome::Failed
            }
        };
        finish_turn(session, &conversation).await;
        outcome
    }

    async fn route(&self, session: &dyn Session, turn: &Turn) -> SessionResult<DispatchOutcome> {
        let conversation = turn.conversation();

        if !session.is_permitted(turn).await {
            if let Some(query) = turn.event.callback_query() {
                session
                    .on_rejected_callback(RejectReason::Permission, &query.query_id)
                    .await?;
                return Ok(DispatchOutcome::Rejected(RejectReason::Permission));
            }
            debug!(
                conversation = %conversation,
                sender = %turn.event.sender_id,
                "sender not permitted"
            );
            return Ok(DispatchOutcome::Denied);
        }

        if session.needs_acceptance().await {
            session.on_acceptance_required(turn).await?;
            return Ok(DispatchOutcome::AcceptanceRequired);
        }

        match &turn.event.kind {
            EventKind::Payment(payment) => session.on_payment(payment, turn).await?,
            EventKind::Message(message) => return self.route_message(session, message, turn).await,
            EventKind::Callback(query) => {
                let handled = self
                    .callbacks()
                    .invoke(&query.query_id, &query.token, &query.message_id, conversation)
                    .await?
                    || session.on_callback(query, turn).await?;
                if !handled {
                    debug!(conversation = %conversation, token = %query.token, "unknown selection");
                    session
                        .on_rejected_callback(RejectReason::UnknownSelection, &query.query_id)
                        .await?;
                    return Ok(DispatchOutcome::Rejected(RejectReason::UnknownSelection));
                }
            }
        }
        Ok(DispatchOutcome::Handled)
    }

    async fn route_message(
        &self,
        session: &dyn Session,
        message: &MessageContent,
        turn: &Turn,
    ) -> SessionResult<DispatchOutcome> {
        if let Some(photo) = message.attachment(AttachmentKind::Photo) {
            session.on_photo(photo, turn).await?;
        } else if let Some(file) = message
            .attachments
            .iter()
            .find(|a| a.kind != AttachmentKind::Sticker)
        {
            session.on_document(file, turn).await?;
        } else if let Some(text) = message.text.as_deref() {
            match Command::parse(text, &self.command_prefix) {
                Some(command) => {
                    trace!(conversation = %turn.conversation(), command = %command.name, "command");
                    session.on_command(&command.name, &command.args, turn).await?;
                }
                None => session.on_message(text, turn).await?,
            }
        } else {
            trace!(conversation = %turn.conversation(), "message without routable content");
            return Ok(DispatchOutcome::Ignored);
        }
        Ok(DispatchOutcome::Handled)
    }

    /// Start the background maintenance sweep.
    ///
    /// Returns `false` if it is already running.
    pub async fn start_periodic_maintenance(&self) -> bool {
        let mut slot = self.maintenance.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(
            MaintenanceService::new(Arc::clone(&self.store), self.maintenance_interval).start(),
        );
        true
    }

    /// Refuse new events, wait for in-flight turns and dispose every session.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.closing.store(true, Ordering::SeqCst);

        let maintenance = self.maintenance.lock().await.take();
        if let Some(handle) = maintenance {
            handle.stop().await;
        }

        let drained = self.tracker.wait_idle(self.drain_timeout).await;
        if !drained {
            warn!(
                timeout = ?self.drain_timeout,
                "turns still in flight at shutdown"
            );
        }

        let disposed = self.store.dispose_all().await;
        info!(drained, disposed, "dispatcher shut down");
        ShutdownReport { drained, disposed }
    }
}

/// Run a capability future, turning panics and cancellation into errors.
async fn guarded<F>(fut: F, cancel: &Cancellation) -> SessionResult<DispatchOutcome>
where
    F: Future<Output = SessionResult<DispatchOutcome>>,
{
    tokio::select! {
        biased;
        result = AssertUnwindSafe(fut).catch_unwind() => match result {
            Ok(result) => result,
            Err(payload) => Err(SessionError::from_panic(&*payload)),
        },
        () = cancel.cancelled() => Err(SessionError::Cancelled),
    }
}

async fn report_failure(
    session: &dyn Session,
    conversation: &ConversationId,
    err: &SessionError,
) {
    if err.is_cancelled() {
        debug!(conversation = %conversation, "turn cancelled");
    } else {
        debug!(conversation = %conversation, error = %err, "capability failed");
    }

    match AssertUnwindSafe(session.on_error(err)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(conversation = %conversation, error = %e, "error hook failed"),
        Err(payload) => warn!(
            conversation = %conversation,
            error = %SessionError::from_panic(&*payload),
            "error hook panicked"
        ),
    }
}

async fn finish_turn(session: &dyn Session, conversation: &ConversationId) {
    match AssertUnwindSafe(session.end_of_turn()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(conversation = %conversation, error = %e, "end of turn failed"),
        Err(payload) => warn!(
            conversation = %conversation,
            error = %SessionError::from_panic(&*payload),
            "end of turn panicked"
        ),
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`UpdateDispatcher`].
#[derive(Debug)]
pub struct DispatcherBuilder {
    store: SessionStoreBuilder,
    config: RuntimeConfig,
    started_at: Option<SystemTime>,
}

impl DispatcherBuilder {
    /// Apply a runtime configuration. Call before the other setters.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.store = self.store.config(&config);
        self.config = config;
        self
    }

    /// Treat events older than `started_at` as stale.
    #[must_use]
    pub const fn started_at(mut self, started_at: SystemTime) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Share an existing callback registry.
    #[must_use]
    pub fn callbacks(mut self, callbacks: CallbackRegistry) -> Self {
        self.store = self.store.callbacks(callbacks);
        self
    }

    /// Use a custom clock for eviction and token ageing.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.store = self.store.clock(clock);
        self
    }

    /// Use a custom eviction policy.
    #[must_use]
    pub fn policy(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.store = self.store.policy(policy);
        self
    }

    /// Use a custom sweep trigger.
    #[must_use]
    pub fn trigger(mut self, trigger: impl SweepTrigger + 'static) -> Self {
        self.store = self.store.trigger(trigger);
        self
    }

    /// Build the dispatcher.
    #[must_use]
    pub fn build(self) -> UpdateDispatcher {
        let config = self.config;
        UpdateDispatcher {
            store: Arc::new(self.store.build()),
            started_at: self.started_at.unwrap_or_else(SystemTime::now),
            drop_pre_start: config.drop_pre_start,
            drain_timeout: config.drain_timeout(),
            maintenance_interval: config.maintenance_interval(),
            command_prefix: config.command_prefix,
            tracker: Arc::new(TurnTracker::default()),
            closing: AtomicBool::new(false),
            stats: RwLock::new(DispatchStats::default()),
            maintenance: Mutex::new(None),
        }
    }
}
