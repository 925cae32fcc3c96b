//! Ephemeral button-click handler registry.
//!
//! Every time a session renders interactive UI it subscribes one handler per
//! button and gets back an opaque [`CallbackToken`] to embed in the button.
//! A later click presents the token back and the registry runs the handler.
//!
//! Tokens are random 128-bit values and are never reissued while mapped.
//! Invalidated tokens are gone for good: invoking one reports "not found".
//!
//! A registry owned by a [`SessionStore`](crate::session::SessionStore) also
//! knows which conversations currently have a session, and stamps each token
//! with the session generation of its owner. A token whose owner has no
//! session, or a newer one than the token was issued under, is orphaned and
//! is refused on invoke even before a sweep removes it.

use crate::error::SessionResult;
use crate::eviction::{Clock, SystemClock};
use crate::events::ConversationId;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Opaque identifier of one pending handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(String);

impl CallbackToken {
    /// Borrow the token as it should be embedded in a button.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CallbackToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arguments a handler receives when its button is clicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackInvocation {
    /// Platform query id of the click.
    pub query_id: String,
    /// Message that carried the button.
    pub message_id: String,
    /// Conversation the click came from.
    pub conversation: ConversationId,
}

/// Boxed future returned by a handler.
pub type CallbackFuture = BoxFuture<'static, SessionResult<()>>;

/// Type-erased button handler.
pub type CallbackHandler = Arc<dyn Fn(CallbackInvocation) -> CallbackFuture + Send + Sync>;

struct Entry {
    owner: ConversationId,
    generation: Option<u64>,
    handler: CallbackHandler,
    created_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<CallbackToken, Entry>,
    /// Conversations with a live session, keyed to that session's generation.
    live_owners: HashMap<ConversationId, u64>,
    generations: u64,
}

impl RegistryState {
    fn retain(&mut self, keep: impl Fn(&Entry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| keep(e));
        before - self.entries.len()
    }
}

fn is_orphan(live_owners: &HashMap<ConversationId, u64>, entry: &Entry) -> bool {
    let live = live_owners.get(&entry.owner).copied();
    live.is_none() || live != entry.generation
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    clock: Arc<dyn Clock>,
    verify_owner: bool,
    track_owners: AtomicBool,
}

/// Concurrency-safe map from token to handler.
///
/// Cloning is cheap and every clone shares the same map.
#[derive(Clone)]
pub struct CallbackRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("verify_owner", &self.inner.verify_owner)
            .field("track_owners", &self.inner.track_owners)
            .finish_non_exhaustive()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    /// Create a registry on the system clock without owner verification.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Arc::new(SystemClock), false)
    }

    /// Create a registry with an explicit clock and owner verification mode.
    ///
    /// With `verify_owner` set, a token presented from a conversation other
    /// than the one that subscribed it is treated as unknown.
    #[must_use]
    pub fn with_config(clock: Arc<dyn Clock>, verify_owner: bool) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                clock,
                verify_owner,
                track_owners: AtomicBool::new(false),
            }),
        }
    }

    /// Refuse tokens whose owner has no live session from now on.
    ///
    /// The session store turns this on for its registry and reports owners
    /// through [`open_owner`](Self::open_owner) and
    /// [`remove_owner`](Self::remove_owner).
    pub(crate) fn track_owners(&self) {
        self.inner.track_owners.store(true, Ordering::SeqCst);
    }

    /// Record that `owner` has a new live session.
    ///
    /// Tokens issued under an earlier session of the same owner stay orphaned.
    pub(crate) async fn open_owner(&self, owner: &ConversationId) {
        let mut state = self.inner.state.write().await;
        state.generations += 1;
        let generation = state.generations;
        state.live_owners.insert(owner.clone(), generation);
    }

    fn tracks_owners(&self) -> bool {
        self.inner.track_owners.load(Ordering::SeqCst)
    }

    /// Register a handler owned by `owner` and return its fresh token.
    pub async fn subscribe<F, Fut>(&self, owner: &ConversationId, handler: F) -> CallbackToken
    where
        F: Fn(CallbackInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SessionResult<()>> + Send + 'static,
    {
        let handler: CallbackHandler =
            Arc::new(move |inv: CallbackInvocation| -> CallbackFuture { Box::pin(handler(inv)) });
        self.subscribe_boxed(owner, handler).await
    }

    /// Register an already type-erased handler.
    pub async fn subscribe_boxed(
        &self,
        owner: &ConversationId,
        handler: CallbackHandler,
    ) -> CallbackToken {
        let created_at = self.inner.clock.now();
        let mut state = self.inner.state.write().await;

        let token = loop {
            let candidate = CallbackToken(crate::util::random_hex());
            if !state.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        let generation = state.live_owners.get(owner).copied();
        state.entries.insert(
            token.clone(),
            Entry {
                owner: owner.clone(),
                generation,
                handler,
                created_at,
            },
        );
        debug!(conversation = %owner, token = %token, "callback subscribed");
        token
    }

    /// Remove one token. Unknown tokens are ignored.
    ///
    /// Returns whether the token was mapped.
    pub async fn unsubscribe(&self, token: &CallbackToken) -> bool {
        let removed = self.inner.state.write().await.entries.remove(token).is_some();
        if removed {
            debug!(token = %token, "callback unsubscribed");
        }
        removed
    }

    /// Remove a batch of tokens in one critical section.
    ///
    /// Returns how many were actually mapped.
    pub async fn unsubscribe_all<'a, I>(&self, tokens: I) -> usize
    where
        I: IntoIterator<Item = &'a CallbackToken>,
    {
        let mut state = self.inner.state.write().await;
        let removed = tokens
            .into_iter()
            .filter(|t| state.entries.remove(*t).is_some())
            .count();
        debug!(removed, "callbacks unsubscribed");
        removed
    }

    /// Run the handler mapped to `token`.
    ///
    /// Returns `Ok(false)` without side effects when the token is unknown,
    /// orphaned, or (with owner verification) belongs to another conversation.
    /// Handler errors are returned as-is; the token stays mapped either way.
    pub async fn invoke(
        &self,
        query_id: &str,
        token: &str,
        message_id: &str,
        conversation: &ConversationId,
    ) -> SessionResult<bool> {
        let handler = {
            let state = self.inner.state.read().await;
            let Some(entry) = state.entries.get(token) else {
                trace!(token, "callback token not found");
                return Ok(false);
            };
            if self.tracks_owners() && is_orphan(&state.live_owners, entry) {
                debug!(token, owner = %entry.owner, "orphaned callback token");
                return Ok(false);
            }
            if self.inner.verify_owner && entry.owner != *conversation {
                debug!(
                    token,
                    owner = %entry.owner,
                    conversation = %conversation,
                    "callback token presented by foreign conversation"
                );
                return Ok(false);
            }
            Arc::clone(&entry.handler)
        };

        handler(CallbackInvocation {
            query_id: query_id.to_string(),
            message_id: message_id.to_string(),
            conversation: conversation.clone(),
        })
        .await?;
        Ok(true)
    }

    /// Drop every token created more than `max_age` ago.
    pub async fn sweep_older_than(&self, max_age: Duration) -> usize {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.write().await;
        state.retain(|e| now.saturating_duration_since(e.created_at) <= max_age)
    }

    /// Drop every token owned by `owner` and forget it as a live owner.
    pub async fn remove_owner(&self, owner: &ConversationId) -> usize {
        let mut state = self.inner.state.write().await;
        state.live_owners.remove(owner);
        state.retain(|e| e.owner != *owner)
    }

    /// Drop every token whose owner is not in `live`, along with any token
    /// this registry already considers orphaned.
    pub async fn retain_owners(&self, live: &HashSet<ConversationId>) -> usize {
        let tracking = self.tracks_owners();
        let mut state = self.inner.state.write().await;
        state.live_owners.retain(|o, _| live.contains(o));

        let RegistryState {
            entries,
            live_owners,
            ..
        } = &mut *state;
        let live_owners = &*live_owners;
        let before = entries.len();
        entries.retain(|_, e| live.contains(&e.owner) && !(tracking && is_orphan(live_owners, e)));
        before - entries.len()
    }

    /// Whether `token` is currently mapped.
    pub async fn contains(&self, token: &str) -> bool {
        self.inner.state.read().await.entries.contains_key(token)
    }

    /// Number of mapped tokens.
    pub async fn len(&self) -> usize {
        self.inner.state.read().await.entries.len()
    }

    /// Whether no token is mapped.
    pub async fn is_empty(&self) -> bool {
        self.inner.state.read().await.entries.is_empty()
    }
}
