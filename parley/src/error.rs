//! Unified error types for parley.
//!
//! Each concern owns a small `thiserror` enum with its own `Result` alias.
//! Everything converts into [`RuntimeError`] for callers that only care
//! that something failed.

use crate::events::ConversationId;
use crate::session::SessionHandle;
use std::fmt;

// ============================================================================
// Main Error Type
// ============================================================================

/// Top-level error type for parley operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Session capability error.
    #[error("session: {0}")]
    Session(#[from] SessionError),

    /// Session store error.
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for parley operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

// ============================================================================
// Session Errors
// ============================================================================

/// Error raised by a session capability or a callback handler.
///
/// The dispatcher never lets one of these escape a turn: it is forwarded to
/// [`Session::on_error`](crate::session::Session::on_error) instead.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The handler reported a failure.
    #[error("{0}")]
    Handler(String),

    /// The turn was cancelled before the handler finished.
    #[error("cancelled")]
    Cancelled,

    /// The handler panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Create a handler error from a string.
    #[inline]
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Build a [`SessionError::Panicked`] from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked(msg)
    }

    /// Whether this error came from a cancelled turn.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for session capabilities.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

// ============================================================================
// Store Errors
// ============================================================================

/// Error type for session store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The session factory could not build a session.
    #[error("failed to create session for {conversation}: {source}")]
    Factory {
        /// Conversation the session was requested for.
        conversation: ConversationId,
        /// Underlying factory error.
        #[source]
        source: SessionError,
    },

    /// The session was resolved but its `begin` hook failed.
    ///
    /// The handle is carried along so the caller can still report the
    /// failure to the session and close the turn.
    #[error("begin hook failed for {conversation}: {source}")]
    Begin {
        /// Conversation the session belongs to.
        conversation: ConversationId,
        /// Error raised by `begin`.
        #[source]
        source: SessionError,
        /// The resolved session.
        handle: Box<SessionHandle>,
    },

    /// The store no longer accepts lookups.
    #[error("store is shutting down")]
    ShuttingDown,
}

/// Result type for session store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Error type for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// Invalid value.
    #[error("invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create an invalid value error.
    #[inline]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Display Helpers
// ============================================================================

/// A wrapper that displays errors in a user-friendly format.
#[derive(Debug)]
pub struct DisplayError<'a>(pub &'a RuntimeError);

impl fmt::Display for DisplayError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            RuntimeError::Session(e) => write!(f, "Session error: {e}"),
            RuntimeError::Store(e) => write!(f, "Session store error: {e}"),
            RuntimeError::Config(e) => write!(f, "Configuration error: {e}"),
            RuntimeError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}
