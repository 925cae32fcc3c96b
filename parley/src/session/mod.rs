//! Per-conversation sessions.
//!
//! A [`Session`] is the application's stateful handler for one conversation.
//! The runtime never looks inside it: it creates one through a
//! [`SessionFactory`], caches it in the [`SessionStore`], routes inbound
//! events to its capabilities and disposes it on eviction.

mod store;

pub use store::{SessionHandle, SessionStore, SessionStoreBuilder, SweepReport};

use crate::callback::CallbackRegistry;
use crate::cancel::Cancellation;
use crate::error::{SessionError, SessionResult};
use crate::events::{Attachment, CallbackQuery, ConversationId, InboundEvent, Payment};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Why a button click was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The sender is not allowed to act in this conversation.
    Permission,
    /// The token is unknown, expired or already invalidated.
    UnknownSelection,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permission => f.write_str("permission denied"),
            Self::UnknownSelection => f.write_str("unknown selection"),
        }
    }
}

/// One inbound event being processed, plus its cancellation signal.
#[derive(Debug, Clone)]
pub struct Turn {
    /// The event that started this turn.
    pub event: InboundEvent,
    /// Fires when the transport shuts down. Long-running handlers should
    /// watch it.
    pub cancel: Cancellation,
}

impl Turn {
    /// Create a turn for an event.
    #[must_use]
    pub fn new(event: InboundEvent, cancel: Cancellation) -> Self {
        Self { event, cancel }
    }

    /// Conversation the turn belongs to.
    #[must_use]
    pub const fn conversation(&self) -> &ConversationId {
        &self.event.conversation
    }
}

/// Capabilities the runtime calls on a session.
///
/// Only [`on_message`](Self::on_message) and [`on_error`](Self::on_error)
/// are required; everything else defaults to a no-op.
#[async_trait]
pub trait Session: Send + Sync {
    /// Called for every inbound event that resolves to this session, before
    /// any other capability.
    async fn begin(&self, _event: &InboundEvent) -> SessionResult<()> {
        Ok(())
    }

    /// Whether the sender may interact with this conversation.
    async fn is_permitted(&self, _turn: &Turn) -> bool {
        true
    }

    /// Whether the user still has to accept terms before anything else.
    async fn needs_acceptance(&self) -> bool {
        false
    }

    /// Receives every event while acceptance is outstanding.
    async fn on_acceptance_required(&self, _turn: &Turn) -> SessionResult<()> {
        Ok(())
    }

    /// A command such as `/set-role 123 admin`, already split.
    async fn on_command(&self, _name: &str, _args: &[String], _turn: &Turn) -> SessionResult<()> {
        Ok(())
    }

    /// Free text that is not a command.
    async fn on_message(&self, text: &str, turn: &Turn) -> SessionResult<()>;

    /// A photo attachment.
    async fn on_photo(&self, _attachment: &Attachment, _turn: &Turn) -> SessionResult<()> {
        Ok(())
    }

    /// A document or other file attachment.
    async fn on_document(&self, _attachment: &Attachment, _turn: &Turn) -> SessionResult<()> {
        Ok(())
    }

    /// A completed payment.
    async fn on_payment(&self, _payment: &Payment, _turn: &Turn) -> SessionResult<()> {
        Ok(())
    }

    /// A click whose token the callback registry does not know.
    ///
    /// Sessions that encode static actions in button data handle them here.
    /// Return `Ok(true)` when handled.
    async fn on_callback(&self, _query: &CallbackQuery, _turn: &Turn) -> SessionResult<bool> {
        Ok(false)
    }

    /// A click that was refused.
    async fn on_rejected_callback(
        &self,
        _reason: RejectReason,
        _query_id: &str,
    ) -> SessionResult<()> {
        Ok(())
    }

    /// A capability raised an error during the current turn.
    async fn on_error(&self, error: &SessionError) -> SessionResult<()>;

    /// Runs exactly once at the end of every turn.
    async fn end_of_turn(&self) -> SessionResult<()> {
        Ok(())
    }

    /// Release private state. Called once, synchronously, on eviction or
    /// shutdown.
    fn dispose(&self) {}
}

/// What a factory gets to build a session with.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Conversation the session is for.
    pub conversation: ConversationId,
    /// Registry the session subscribes its button handlers to.
    pub callbacks: CallbackRegistry,
}

/// Builds sessions for conversations seen for the first time.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Create the session for `ctx.conversation`.
    async fn create(
        &self,
        ctx: SessionContext,
        event: &InboundEvent,
    ) -> SessionResult<Arc<dyn Session>>;
}

#[async_trait]
impl<F> SessionFactory for F
where
    F: Fn(SessionContext) -> Arc<dyn Session> + Send + Sync,
{
    async fn create(
        &self,
        ctx: SessionContext,
        _event: &InboundEvent,
    ) -> SessionResult<Arc<dyn Session>> {
        Ok(self(ctx))
    }
}
