//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use parley::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

/// One capability call observed on a [`RecordingSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Begin,
    Acceptance,
    Command(String, Vec<String>),
    Message(String),
    Photo(String),
    Document(String),
    Payment(u64),
    StaticCallback(String),
    Rejected(RejectReason, String),
    Error(String),
    EndOfTurn,
}

/// How a [`RecordingSession`] behaves.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub permitted: bool,
    pub needs_acceptance: bool,
    pub fail_begin: bool,
    pub fail_on_message: bool,
    pub panic_on_message: bool,
    pub fail_on_error: bool,
    pub message_delay: Option<Duration>,
    pub static_callback: Option<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            permitted: true,
            needs_acceptance: false,
            fail_begin: false,
            fail_on_message: false,
            panic_on_message: false,
            fail_on_error: false,
            message_delay: None,
            static_callback: None,
        }
    }
}

/// Session that records every capability call.
#[derive(Debug)]
pub struct RecordingSession {
    pub conversation: ConversationId,
    pub behavior: Behavior,
    calls: Mutex<Vec<Call>>,
    disposals: AtomicUsize,
}

impl RecordingSession {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for RecordingSession {
    async fn begin(&self, _event: &InboundEvent) -> SessionResult<()> {
        self.record(Call::Begin);
        if self.behavior.fail_begin {
            return Err(SessionError::handler("begin failed"));
        }
        Ok(())
    }

    async fn is_permitted(&self, _turn: &Turn) -> bool {
        self.behavior.permitted
    }

    async fn needs_acceptance(&self) -> bool {
        self.behavior.needs_acceptance
    }

    async fn on_acceptance_required(&self, _turn: &Turn) -> SessionResult<()> {
        self.record(Call::Acceptance);
        Ok(())
    }

    async fn on_command(&self, name: &str, args: &[String], _turn: &Turn) -> SessionResult<()> {
        self.record(Call::Command(name.to_string(), args.to_vec()));
        Ok(())
    }

    async fn on_message(&self, text: &str, _turn: &Turn) -> SessionResult<()> {
        self.record(Call::Message(text.to_string()));
        if let Some(delay) = self.behavior.message_delay {
            tokio::time::sleep(delay).await;
        }
        assert!(!self.behavior.panic_on_message, "message handler exploded");
        if self.behavior.fail_on_message {
            return Err(SessionError::handler("message handler failed"));
        }
        Ok(())
    }

    async fn on_photo(&self, attachment: &Attachment, _turn: &Turn) -> SessionResult<()> {
        self.record(Call::Photo(attachment.file_id.clone()));
        Ok(())
    }

    async fn on_document(&self, attachment: &Attachment, _turn: &Turn) -> SessionResult<()> {
        self.record(Call::Document(attachment.file_id.clone()));
        Ok(())
    }

    async fn on_payment(&self, payment: &Payment, _turn: &Turn) -> SessionResult<()> {
        self.record(Call::Payment(payment.total_amount));
        Ok(())
    }

    async fn on_callback(&self, query: &CallbackQuery, _turn: &Turn) -> SessionResult<bool> {
        if self.behavior.static_callback.as_deref() == Some(query.token.as_str()) {
            self.record(Call::StaticCallback(query.token.clone()));
            return Ok(true);
        }
        Ok(false)
    }

    async fn on_rejected_callback(&self, reason: RejectReason, query_id: &str) -> SessionResult<()> {
        self.record(Call::Rejected(reason, query_id.to_string()));
        Ok(())
    }

    async fn on_error(&self, error: &SessionError) -> SessionResult<()> {
        self.record(Call::Error(error.to_string()));
        if self.behavior.fail_on_error {
            return Err(SessionError::handler("error hook failed"));
        }
        Ok(())
    }

    async fn end_of_turn(&self) -> SessionResult<()> {
        self.record(Call::EndOfTurn);
        Ok(())
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    behavior: Behavior,
    fail: bool,
    created: AtomicUsize,
    sessions: Mutex<HashMap<ConversationId, Arc<RecordingSession>>>,
}

/// Factory that hands out [`RecordingSession`]s and remembers them.
#[derive(Debug, Clone, Default)]
pub struct RecordingFactory(Arc<FactoryState>);

impl RecordingFactory {
    pub fn new(behavior: Behavior) -> Self {
        Self(Arc::new(FactoryState {
            behavior,
            ..FactoryState::default()
        }))
    }

    /// A factory whose every `create` fails.
    pub fn failing() -> Self {
        Self(Arc::new(FactoryState {
            fail: true,
            ..FactoryState::default()
        }))
    }

    pub fn created(&self) -> usize {
        self.0.created.load(Ordering::SeqCst)
    }

    pub fn session(&self, conversation: &str) -> Arc<RecordingSession> {
        Arc::clone(&self.0.sessions.lock().unwrap()[&ConversationId::from(conversation)])
    }
}

#[async_trait]
impl SessionFactory for RecordingFactory {
    async fn create(
        &self,
        ctx: SessionContext,
        _event: &InboundEvent,
    ) -> SessionResult<Arc<dyn Session>> {
        if self.0.fail {
            return Err(SessionError::handler("factory refused"));
        }
        self.0.created.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(RecordingSession {
            conversation: ctx.conversation.clone(),
            behavior: self.0.behavior.clone(),
            calls: Mutex::new(Vec::new()),
            disposals: AtomicUsize::new(0),
        });
        self.0
            .sessions
            .lock()
            .unwrap()
            .insert(ctx.conversation, Arc::clone(&session));
        Ok(session)
    }
}

/// A dispatcher that treats every event as fresh.
pub fn dispatcher(factory: &RecordingFactory) -> UpdateDispatcher {
    UpdateDispatcher::builder(factory.clone())
        .started_at(SystemTime::UNIX_EPOCH)
        .build()
}

/// Events stamped well before any sensible process start.
pub fn stale(event: InboundEvent) -> InboundEvent {
    event.at(SystemTime::now() - Duration::from_secs(3600))
}
