//! Parley - conversational runtime core for chat bots.
//!
//! Parley sits between a messaging-platform transport and application
//! code. The transport hands it inbound events; Parley keeps one stateful
//! session per conversation, routes each event to the right capability of
//! that session and reclaims sessions nobody has talked to in a while.
//!
//! # Architecture
//!
//! - **Dispatcher** ([`dispatcher`]) - Classifies inbound events and routes
//!   them to session capabilities
//! - **Session** ([`session`]) - The session contract and the conversation
//!   to session cache
//! - **Callbacks** ([`callback`]) - Opaque button tokens mapped to handlers
//! - **Eviction** ([`eviction`]) - Idle detection and sweep scheduling
//! - **Maintenance** ([`maintenance`]) - Background sweeps for quiet bots
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use parley::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Session for Echo {
//!     async fn on_message(&self, text: &str, _turn: &Turn) -> SessionResult<()> {
//!         println!("{text}");
//!         Ok(())
//!     }
//!
//!     async fn on_error(&self, _error: &SessionError) -> SessionResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! let dispatcher = UpdateDispatcher::builder(|_ctx: SessionContext| -> Arc<dyn Session> {
//!     Arc::new(Echo)
//! })
//! .build();
//!
//! let event = InboundEvent::text("telegram:42", "42", "hello");
//! dispatcher.handle_inbound_event(event, Cancellation::never()).await;
//! ```

pub mod callback;
pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod eviction;
pub mod maintenance;
pub mod session;
pub mod util;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use std::sync::Arc;

    // Error types
    pub use crate::error::{
        ConfigError, ConfigResult, Result, RuntimeError, SessionError, SessionResult, StoreError,
        StoreResult,
    };

    // Callbacks
    pub use crate::callback::{CallbackInvocation, CallbackRegistry, CallbackToken};

    // Cancellation
    pub use crate::cancel::{CancelSource, Cancellation};

    // Config
    pub use crate::config::{ConfigIssue, IssueLevel, RuntimeConfig};

    // Dispatcher
    pub use crate::dispatcher::{
        CallbackAck, Command, Dispatch, DispatchOutcome, DispatchStats, DispatcherBuilder,
        ShutdownReport, UpdateDispatcher,
    };

    // Events
    pub use crate::events::{
        Attachment, AttachmentKind, CallbackQuery, ConversationId, EventKind, InboundEvent,
        MessageContent, Payment,
    };

    // Eviction
    pub use crate::eviction::{
        Always, Clock, EveryNth, EvictionPolicy, IdleEviction, ManualClock, Never, SweepTrigger,
        SystemClock,
    };

    // Maintenance
    pub use crate::maintenance::{MaintenanceHandle, MaintenanceService, MaintenanceStatus};

    // Session
    pub use crate::session::{
        RejectReason, Session, SessionContext, SessionFactory, SessionHandle, SessionStore,
        SessionStoreBuilder, SweepReport, Turn,
    };
}
