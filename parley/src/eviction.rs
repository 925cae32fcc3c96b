//! Eviction policy, sweep trigger and clock.
//!
//! Two independent knobs decide when idle sessions are reclaimed:
//!
//! - a [`SweepTrigger`] answers the cheap question "does this request run a
//!   sweep at all?" from a monotonic request counter;
//! - an [`EvictionPolicy`] answers "which records are stale?" from record
//!   timestamps only.
//!
//! Both are injected into the session store so tests can force sweeps and
//! move time deterministically.

use crate::events::ConversationId;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

// ============================================================================
// Clock
// ============================================================================

/// Source of monotonic time for record timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Eviction policy
// ============================================================================

/// Snapshot of one store record handed to the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStamp {
    /// Conversation owning the record.
    pub conversation: ConversationId,
    /// Last time an inbound event touched the record.
    pub last_active: Instant,
}

/// Decides which idle sessions to reclaim.
///
/// Implementations must be pure: they may look at the stamps and the
/// supplied instant, nothing else.
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    /// Select the conversations to evict.
    fn select(&self, request_counter: u64, records: &[RecordStamp], now: Instant)
    -> Vec<ConversationId>;
}

/// Evicts every record idle for longer than a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEviction {
    idle_threshold: Duration,
}

impl IdleEviction {
    /// Create a policy with the given idle threshold.
    #[must_use]
    pub const fn new(idle_threshold: Duration) -> Self {
        Self { idle_threshold }
    }

    /// The configured idle threshold.
    #[must_use]
    pub const fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }
}

impl EvictionPolicy for IdleEviction {
    fn select(
        &self,
        _request_counter: u64,
        records: &[RecordStamp],
        now: Instant,
    ) -> Vec<ConversationId> {
        records
            .iter()
            .filter(|r| now.saturating_duration_since(r.last_active) > self.idle_threshold)
            .map(|r| r.conversation.clone())
            .collect()
    }
}

// ============================================================================
// Sweep trigger
// ============================================================================

/// Decides whether a given request runs an eviction sweep.
pub trait SweepTrigger: Send + Sync + fmt::Debug {
    /// `request_counter` starts at 1 for the first request.
    fn should_sweep(&self, request_counter: u64) -> bool;
}

/// Sweep on every Nth request. `EveryNth(0)` never sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EveryNth(pub u64);

impl SweepTrigger for EveryNth {
    fn should_sweep(&self, request_counter: u64) -> bool {
        self.0 != 0 && request_counter % self.0 == 0
    }
}

/// Sweep on every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

impl SweepTrigger for Always {
    fn should_sweep(&self, _request_counter: u64) -> bool {
        true
    }
}

/// Never sweep from the request path; rely on maintenance instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl SweepTrigger for Never {
    fn should_sweep(&self, _request_counter: u64) -> bool {
        false
    }
}
