//! Conversation-id to session cache.
//!
//! The store guarantees at most one live session per conversation. Lookup
//! and insertion of a record happen under the store lock; the record carries
//! a once-only slot that the first caller fills by running the factory
//! outside that lock, so a slow factory stalls only its own conversation.
//! Eviction runs under the store lock and skips any record with a turn in
//! flight, including records whose session is still being built.

use super::{Session, SessionContext, SessionFactory};
use crate::callback::CallbackRegistry;
use crate::config::RuntimeConfig;
use crate::error::{StoreError, StoreResult};
use crate::events::{ConversationId, InboundEvent};
use crate::eviction::{
    Clock, EveryNth, EvictionPolicy, IdleEviction, RecordStamp, SweepTrigger, SystemClock,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, error, info, trace, warn};

/// The once-only home of a conversation's session.
#[derive(Default)]
struct SessionSlot {
    session: OnceCell<Arc<dyn Session>>,
    disposed: AtomicBool,
}

impl SessionSlot {
    /// Dispose the session if it was built and nobody disposed it yet.
    fn dispose(&self, id: &ConversationId) -> bool {
        let Some(session) = self.session.get() else {
            return false;
        };
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        dispose(id, session.as_ref());
        true
    }
}

struct SessionRecord {
    slot: Arc<SessionSlot>,
    last_active: Instant,
    turn_lock: Arc<Mutex<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl SessionRecord {
    fn pending(now: Instant) -> Self {
        Self {
            slot: Arc::new(SessionSlot::default()),
            last_active: now,
            turn_lock: Arc::new(Mutex::new(())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    fn is_built(&self) -> bool {
        self.slot.session.get().is_some()
    }
}

/// Marks a record as in use until dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A resolved session, pinned against eviction for as long as it lives.
///
/// When turn serialization is on, the handle also holds the conversation's
/// turn lock.
pub struct SessionHandle {
    conversation: ConversationId,
    session: Arc<dyn Session>,
    turn: Option<OwnedMutexGuard<()>>,
    _in_flight: InFlight,
}

impl SessionHandle {
    /// The resolved session.
    #[must_use]
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Conversation the session belongs to.
    #[must_use]
    pub const fn conversation(&self) -> &ConversationId {
        &self.conversation
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("conversation", &self.conversation)
            .field("serialized", &self.turn.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Request counter value the sweep was evaluated at.
    pub request_counter: u64,
    /// Whether the trigger fired.
    pub swept: bool,
    /// Conversations whose sessions were evicted and disposed.
    pub evicted: Vec<ConversationId>,
    /// Callback tokens removed, both by owner and by age.
    pub tokens_removed: usize,
    /// Records left in the store.
    pub remaining: usize,
}

/// Concurrency-safe map from conversation to cached session.
pub struct SessionStore {
    records: Mutex<HashMap<ConversationId, SessionRecord>>,
    factory: Arc<dyn SessionFactory>,
    callbacks: CallbackRegistry,
    clock: Arc<dyn Clock>,
    policy: Box<dyn EvictionPolicy>,
    trigger: Box<dyn SweepTrigger>,
    callback_max_age: Duration,
    serialize_turns: bool,
    requests: AtomicU64,
    closed: AtomicBool,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("policy", &self.policy)
            .field("trigger", &self.trigger)
            .field("callback_max_age", &self.callback_max_age)
            .field("serialize_turns", &self.serialize_turns)
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Start building a store around a session factory.
    pub fn builder(factory: impl SessionFactory + 'static) -> SessionStoreBuilder {
        SessionStoreBuilder::new(Arc::new(factory))
    }

    /// The registry sessions subscribe their button handlers to.
    #[must_use]
    pub const fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// Resolve the session for `conversation`, creating it on first use.
    ///
    /// The record's timestamp is refreshed and the session's `begin` hook runs
    /// once per call. Concurrent first-time calls for the same conversation
    /// all receive the same session instance.
    ///
    /// # Errors
    ///
    /// [`StoreError::Factory`] if the session could not be built,
    /// [`StoreError::Begin`] if `begin` failed (the handle is attached), and
    /// [`StoreError::ShuttingDown`] after [`dispose_all`](Self::dispose_all).
    pub async fn get_or_create(
        &self,
        conversation: &ConversationId,
        event: &InboundEvent,
    ) -> StoreResult<SessionHandle> {
        let (slot, turn_lock, in_flight) = {
            let mut records = self.records.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(StoreError::ShuttingDown);
            }
            let now = self.clock.now();
            let record = records
                .entry(conversation.clone())
                .or_insert_with(|| SessionRecord::pending(now));
            record.last_active = now;
            record.in_flight.fetch_add(1, Ordering::SeqCst);
            (
                Arc::clone(&record.slot),
                Arc::clone(&record.turn_lock),
                Arc::clone(&record.in_flight),
            )
        };

        let in_flight = InFlight(in_flight);
        let session = match self.resolve(conversation, &slot, event).await {
            Ok(session) => session,
            Err(err) => {
                drop(in_flight);
                self.discard_pending(conversation, &slot).await;
                return Err(err);
            }
        };

        let turn = if self.serialize_turns {
            Some(turn_lock.lock_owned().await)
        } else {
            None
        };

        let handle = SessionHandle {
            conversation: conversation.clone(),
            session,
            turn,
            _in_flight: in_flight,
        };

        if let Err(source) = handle.session.begin(event).await {
            return Err(StoreError::Begin {
                conversation: conversation.clone(),
                source,
                handle: Box::new(handle),
            });
        }
        Ok(handle)
    }

    /// Fill the record's slot on first use, or wait for whoever is filling it.
    async fn resolve(
        &self,
        conversation: &ConversationId,
        slot: &SessionSlot,
        event: &InboundEvent,
    ) -> StoreResult<Arc<dyn Session>> {
        let mut created = false;
        let created_here = &mut created;
        let session = slot
            .session
            .get_or_try_init(move || async move {
                // Opened first so the factory itself may subscribe buttons.
                self.callbacks.open_owner(conversation).await;
                let ctx = SessionContext {
                    conversation: conversation.clone(),
                    callbacks: self.callbacks.clone(),
                };
                match self.factory.create(ctx, event).await {
                    Ok(session) => {
                        *created_here = true;
                        Ok(session)
                    }
                    Err(source) => {
                        self.callbacks.remove_owner(conversation).await;
                        Err(StoreError::Factory {
                            conversation: conversation.clone(),
                            source,
                        })
                    }
                }
            })
            .await?;
        let session = Arc::clone(session);

        // A creator reads the flag under the store lock so that it and a
        // concurrent dispose_all agree on who disposes the new session.
        let closed = if created {
            let _records = self.records.lock().await;
            self.closed.load(Ordering::SeqCst)
        } else {
            self.closed.load(Ordering::SeqCst)
        };
        if closed {
            if created {
                self.callbacks.remove_owner(conversation).await;
                slot.dispose(conversation);
            }
            return Err(StoreError::ShuttingDown);
        }
        if created {
            debug!(conversation = %conversation, "session created");
        } else {
            trace!(conversation = %conversation, "session reused");
        }
        Ok(session)
    }

    /// Drop a record whose session was never built, once nobody waits on it.
    async fn discard_pending(&self, conversation: &ConversationId, slot: &SessionSlot) {
        let mut records = self.records.lock().await;
        let abandoned = records.get(conversation).is_some_and(|r| {
            std::ptr::eq(Arc::as_ptr(&r.slot), slot) && !r.is_built() && !r.is_busy()
        });
        if abandoned {
            records.remove(conversation);
        }
    }

    /// Refresh a record's timestamp without resolving it.
    ///
    /// Returns whether the conversation had a record.
    pub async fn touch(&self, conversation: &ConversationId) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(conversation) {
            Some(record) => {
                record.last_active = self.clock.now();
                true
            }
            None => false,
        }
    }

    /// Count one request and sweep if the trigger says so.
    pub async fn run_eviction_sweep(&self) -> SweepReport {
        let counter = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.trigger.should_sweep(counter) {
            return SweepReport {
                request_counter: counter,
                ..SweepReport::default()
            };
        }
        self.sweep(counter).await
    }

    /// Sweep now regardless of the trigger.
    pub async fn sweep_now(&self) -> SweepReport {
        let counter = self.requests.load(Ordering::SeqCst);
        self.sweep(counter).await
    }

    async fn sweep(&self, counter: u64) -> SweepReport {
        let (evicted, tokens_removed, remaining) = {
            let mut records = self.records.lock().await;
            let now = self.clock.now();

            let stamps: Vec<RecordStamp> = records
                .iter()
                .filter(|(_, r)| !r.is_busy())
                .map(|(id, r)| RecordStamp {
                    conversation: id.clone(),
                    last_active: r.last_active,
                })
                .collect();

            let mut evicted = Vec::new();
            let mut tokens_removed = 0;
            for id in self.policy.select(counter, &stamps, now) {
                // The policy may name ids that are busy or already gone.
                if !records.get(&id).is_some_and(|r| !r.is_busy()) {
                    continue;
                }
                if let Some(record) = records.remove(&id) {
                    tokens_removed += self.callbacks.remove_owner(&id).await;
                    if record.is_built() {
                        evicted.push((id, record.slot));
                    }
                }
            }

            let live: HashSet<ConversationId> = records.keys().cloned().collect();
            tokens_removed += self.callbacks.retain_owners(&live).await;
            tokens_removed += self.callbacks.sweep_older_than(self.callback_max_age).await;

            (evicted, tokens_removed, records.len())
        };

        for (id, slot) in &evicted {
            slot.dispose(id);
        }

        let evicted: Vec<ConversationId> = evicted.into_iter().map(|(id, _)| id).collect();
        if !evicted.is_empty() || tokens_removed > 0 {
            info!(
                request_counter = counter,
                evicted = evicted.len(),
                tokens_removed,
                remaining,
                "eviction sweep"
            );
        }

        SweepReport {
            request_counter: counter,
            swept: true,
            evicted,
            tokens_removed,
            remaining,
        }
    }

    /// Close the store and dispose every cached session.
    ///
    /// Later lookups fail with [`StoreError::ShuttingDown`]. Returns the
    /// number of sessions disposed. A session whose factory is still running
    /// is disposed by its creator once the factory returns.
    pub async fn dispose_all(&self) -> usize {
        let drained: Vec<(ConversationId, SessionRecord)> = {
            let mut records = self.records.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            let drained = records.drain().collect();
            self.callbacks.retain_owners(&HashSet::new()).await;
            drained
        };

        let mut disposed = 0;
        for (id, record) in &drained {
            if record.is_built() && record.is_busy() {
                warn!(conversation = %id, "disposing session with a turn still in flight");
            }
            if record.slot.dispose(id) {
                disposed += 1;
            }
        }
        disposed
    }

    /// Whether a record exists for `conversation`.
    pub async fn contains(&self, conversation: &ConversationId) -> bool {
        self.records.lock().await.contains_key(conversation)
    }

    /// Number of cached sessions.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Requests counted so far by [`run_eviction_sweep`](Self::run_eviction_sweep).
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

fn dispose(id: &ConversationId, session: &dyn Session) {
    match catch_unwind(AssertUnwindSafe(|| session.dispose())) {
        Ok(()) => debug!(conversation = %id, "session disposed"),
        Err(_) => error!(conversation = %id, "session panicked while disposing"),
    }
}

/// Builder for [`SessionStore`].
pub struct SessionStoreBuilder {
    factory: Arc<dyn SessionFactory>,
    callbacks: Option<CallbackRegistry>,
    clock: Option<Arc<dyn Clock>>,
    policy: Option<Box<dyn EvictionPolicy>>,
    trigger: Option<Box<dyn SweepTrigger>>,
    callback_max_age: Duration,
    serialize_turns: bool,
    verify_callback_owner: bool,
}

impl fmt::Debug for SessionStoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStoreBuilder")
            .field("callback_max_age", &self.callback_max_age)
            .field("serialize_turns", &self.serialize_turns)
            .finish_non_exhaustive()
    }
}

impl SessionStoreBuilder {
    fn new(factory: Arc<dyn SessionFactory>) -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            factory,
            callbacks: None,
            clock: None,
            policy: None,
            trigger: None,
            callback_max_age: defaults.callback_max_age(),
            serialize_turns: defaults.serialize_turns,
            verify_callback_owner: defaults.verify_callback_owner,
        }
    }

    /// Apply eviction, sweep and callback settings from a config.
    #[must_use]
    pub fn config(mut self, config: &RuntimeConfig) -> Self {
        self.policy = Some(Box::new(IdleEviction::new(config.idle_threshold())));
        self.trigger = Some(Box::new(EveryNth(config.sweep_every)));
        self.callback_max_age = config.callback_max_age();
        self.serialize_turns = config.serialize_turns;
        self.verify_callback_owner = config.verify_callback_owner;
        self
    }

    /// Share an existing callback registry.
    ///
    /// The store takes over owner tracking for it, so tokens of
    /// conversations without a session stop being invokable.
    #[must_use]
    pub fn callbacks(mut self, callbacks: CallbackRegistry) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Use a custom clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a custom eviction policy.
    #[must_use]
    pub fn policy(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Use a custom sweep trigger.
    #[must_use]
    pub fn trigger(mut self, trigger: impl SweepTrigger + 'static) -> Self {
        self.trigger = Some(Box::new(trigger));
        self
    }

    /// Maximum callback token age.
    #[must_use]
    pub const fn callback_max_age(mut self, max_age: Duration) -> Self {
        self.callback_max_age = max_age;
        self
    }

    /// Serialize turns per conversation.
    #[must_use]
    pub const fn serialize_turns(mut self, enabled: bool) -> Self {
        self.serialize_turns = enabled;
        self
    }

    /// Build the store.
    #[must_use]
    pub fn build(self) -> SessionStore {
        let defaults = RuntimeConfig::default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let callbacks = self.callbacks.unwrap_or_else(|| {
            CallbackRegistry::with_config(Arc::clone(&clock), self.verify_callback_owner)
        });

        callbacks.track_owners();

        SessionStore {
            records: Mutex::new(HashMap::new()),
            factory: self.factory,
            callbacks,
            policy: self
                .policy
                .unwrap_or_else(|| Box::new(IdleEviction::new(defaults.idle_threshold()))),
            trigger: self
                .trigger
                .unwrap_or_else(|| Box::new(EveryNth(defaults.sweep_every))),
            clock,
            callback_max_age: self.callback_max_age,
            serialize_turns: self.serialize_turns,
            requests: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SessionError, SessionResult};
    use crate::eviction::{Always, ManualClock, Never};
    use crate::session::Turn;
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct StubSession {
        begins: AtomicUsize,
        disposals: AtomicUsize,
        fail_begin: bool,
    }

    #[async_trait]
    impl Session for StubSession {
        async fn begin(&self, _event: &InboundEvent) -> SessionResult<()> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            if self.fail_begin {
                return Err(SessionError::handler("begin refused"));
            }
            Ok(())
        }

        async fn on_message(&self, _text: &str, _turn: &Turn) -> SessionResult<()> {
            Ok(())
        }

        async fn on_error(&self, _error: &SessionError) -> SessionResult<()> {
            Ok(())
        }

        fn dispose(&self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FactoryState {
        created: AtomicUsize,
        sessions: std::sync::Mutex<Vec<Arc<StubSession>>>,
        fail_begin: bool,
    }

    #[derive(Clone)]
    struct CountingFactory(Arc<FactoryState>);

    impl CountingFactory {
        fn new(fail_begin: bool) -> Self {
            Self(Arc::new(FactoryState {
                fail_begin,
                ..FactoryState::default()
            }))
        }

        fn created(&self) -> usize {
            self.0.created.load(Ordering::SeqCst)
        }

        fn stub(&self, index: usize) -> Arc<StubSession> {
            Arc::clone(&self.0.sessions.lock().unwrap()[index])
        }
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        async fn create(
            &self,
            _ctx: SessionContext,
            _event: &InboundEvent,
        ) -> SessionResult<Arc<dyn Session>> {
            self.0.created.fetch_add(1, Ordering::SeqCst);
            // Give concurrent callers a chance to interleave.
            tokio::task::yield_now().await;
            let stub = Arc::new(StubSession {
                fail_begin: self.0.fail_begin,
                ..StubSession::default()
            });
            self.0.sessions.lock().unwrap().push(Arc::clone(&stub));
            Ok(stub)
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl SessionFactory for FailingFactory {
        async fn create(
            &self,
            _ctx: SessionContext,
            _event: &InboundEvent,
        ) -> SessionResult<Arc<dyn Session>> {
            Err(SessionError::handler("no sessions today"))
        }
    }

    /// Builds sessions at once, except for `slow`, which waits for a permit.
    #[derive(Clone)]
    struct GatedFactory {
        gate: Arc<Semaphore>,
        built: Arc<std::sync::Mutex<Vec<Arc<StubSession>>>>,
    }

    impl GatedFactory {
        fn new() -> Self {
            Self {
                gate: Arc::new(Semaphore::new(0)),
                built: Arc::default(),
            }
        }

        fn stub(&self, index: usize) -> Arc<StubSession> {
            Arc::clone(&self.built.lock().unwrap()[index])
        }
    }

    #[async_trait]
    impl SessionFactory for GatedFactory {
        async fn create(
            &self,
            ctx: SessionContext,
            _event: &InboundEvent,
        ) -> SessionResult<Arc<dyn Session>> {
            if ctx.conversation == ConversationId::from("slow") {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| SessionError::handler("gate closed"))?;
            }
            let stub = Arc::new(StubSession::default());
            self.built.lock().unwrap().push(Arc::clone(&stub));
            Ok(stub)
        }
    }

    fn event(id: &str) -> InboundEvent {
        InboundEvent::text(id, "user", "hello")
    }

    fn idle_store(factory: &CountingFactory, clock: &ManualClock) -> SessionStore {
        SessionStore::builder(factory.clone())
            .clock(Arc::new(clock.clone()))
            .policy(IdleEviction::new(Duration::from_secs(60)))
            .trigger(Always)
            .serialize_turns(false)
            .build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_creates_once() {
        let factory = CountingFactory::new(false);
        let store = Arc::new(
            SessionStore::builder(factory.clone())
                .serialize_turns(false)
                .build(),
        );
        let id = ConversationId::from("c1");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                let handle = store.get_or_create(&id, &event("c1")).await.unwrap();
                Arc::clone(handle.session())
            }));
        }

        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }

        assert_eq!(factory.created(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(factory.stub(0).begins.load(Ordering::SeqCst), 16);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_activity_postpones_eviction() {
        let factory = CountingFactory::new(false);
        let clock = ManualClock::new();
        let store = idle_store(&factory, &clock);
        let id = ConversationId::from("busy-talker");

        drop(store.get_or_create(&id, &event("busy-talker")).await.unwrap());
        clock.advance(Duration::from_secs(50));
        drop(store.get_or_create(&id, &event("busy-talker")).await.unwrap());
        clock.advance(Duration::from_secs(50));

        let report = store.run_eviction_sweep().await;
        assert!(report.swept);
        assert!(report.evicted.is_empty());
        assert!(store.contains(&id).await);
    }

    #[tokio::test]
    async fn test_idle_session_evicted_and_disposed_once() {
        let factory = CountingFactory::new(false);
        let clock = ManualClock::new();
        let store = idle_store(&factory, &clock);
        let idle = ConversationId::from("idle");
        let active = ConversationId::from("active");

        drop(store.get_or_create(&idle, &event("idle")).await.unwrap());
        let idle_token = store.callbacks().subscribe(&idle, |_| async { Ok(()) }).await;

        clock.advance(Duration::from_secs(120));
        drop(store.get_or_create(&active, &event("active")).await.unwrap());
        let active_token = store
            .callbacks()
            .subscribe(&active, |_| async { Ok(()) })
            .await;

        let report = store.run_eviction_sweep().await;
        assert_eq!(report.evicted, vec![idle.clone()]);
        assert_eq!(report.remaining, 1);
        assert_eq!(factory.stub(0).disposals.load(Ordering::SeqCst), 1);
        assert!(!store.callbacks().contains(idle_token.as_str()).await);
        assert!(store.callbacks().contains(active_token.as_str()).await);

        // A second sweep finds nothing more to do.
        let report = store.run_eviction_sweep().await;
        assert!(report.evicted.is_empty());
        assert_eq!(factory.stub(0).disposals.load(Ordering::SeqCst), 1);
        assert_eq!(factory.stub(1).disposals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_touch_refreshes_without_begin() {
        let factory = CountingFactory::new(false);
        let clock = ManualClock::new();
        let store = idle_store(&factory, &clock);
        let id = ConversationId::from("touched");

        assert!(!store.touch(&id).await);
        drop(store.get_or_create(&id, &event("touched")).await.unwrap());

        clock.advance(Duration::from_secs(50));
        assert!(store.touch(&id).await);
        clock.advance(Duration::from_secs(50));

        assert!(store.sweep_now().await.evicted.is_empty());
        assert_eq!(factory.stub(0).begins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_in_use_is_not_evicted() {
        let factory = CountingFactory::new(false);
        let clock = ManualClock::new();
        let store = idle_store(&factory, &clock);
        let id = ConversationId::from("long-turn");

        let handle = store.get_or_create(&id, &event("long-turn")).await.unwrap();
        clock.advance(Duration::from_secs(600));

        assert!(store.sweep_now().await.evicted.is_empty());
        assert!(store.contains(&id).await);

        drop(handle);
        assert_eq!(store.sweep_now().await.evicted, vec![id]);
    }

    #[tokio::test]
    async fn test_trigger_every_nth_request() {
        let factory = CountingFactory::new(false);
        let store = SessionStore::builder(factory.clone())
            .trigger(EveryNth(3))
            .build();

        let swept: Vec<bool> = {
            let mut out = Vec::new();
            for _ in 0..6 {
                out.push(store.run_eviction_sweep().await.swept);
            }
            out
        };
        assert_eq!(swept, vec![false, false, true, false, false, true]);
        assert_eq!(store.request_count(), 6);
    }

    #[tokio::test]
    async fn test_factory_error_leaves_no_record() {
        let store = SessionStore::builder(FailingFactory).build();
        let id = ConversationId::from("broken");

        let err = store.get_or_create(&id, &event("broken")).await.unwrap_err();
        assert!(matches!(err, StoreError::Factory { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_begin_error_returns_handle() {
        let factory = CountingFactory::new(true);
        let store = SessionStore::builder(factory.clone()).build();
        let id = ConversationId::from("grumpy");

        let err = store.get_or_create(&id, &event("grumpy")).await.unwrap_err();
        match err {
            StoreError::Begin { handle, source, .. } => {
                assert_eq!(handle.conversation(), &id);
                assert!(matches!(source, SessionError::Handler(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.contains(&id).await);
    }

    #[tokio::test]
    async fn test_dispose_all_closes_store() {
        let factory = CountingFactory::new(false);
        let store = SessionStore::builder(factory.clone())
            .trigger(Never)
            .build();
        let id = ConversationId::from("c");

        drop(store.get_or_create(&id, &event("c")).await.unwrap());
        store.callbacks().subscribe(&id, |_| async { Ok(()) }).await;

        assert_eq!(store.dispose_all().await, 1);
        assert_eq!(factory.stub(0).disposals.load(Ordering::SeqCst), 1);
        assert!(store.callbacks().is_empty().await);

        let err = store.get_or_create(&id, &event("c")).await.unwrap_err();
        assert!(matches!(err, StoreError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_serialized_turns_wait_for_handle() {
        let factory = CountingFactory::new(false);
        let store = Arc::new(SessionStore::builder(factory.clone()).build());
        let id = ConversationId::from("serial");

        let first = store.get_or_create(&id, &event("serial")).await.unwrap();

        let second = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move { store.get_or_create(&id, &event("serial")).await.is_ok() })
        };

        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        drop(first);
        assert!(second.await.unwrap());
    }

    #[tokio::test]
    async fn test_slow_factory_stalls_only_its_conversation() {
        let factory = GatedFactory::new();
        let clock = ManualClock::new();
        let store = Arc::new(
            SessionStore::builder(factory.clone())
                .clock(Arc::new(clock.clone()))
                .policy(IdleEviction::new(Duration::from_secs(60)))
                .build(),
        );

        let slow = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .get_or_create(&ConversationId::from("slow"), &event("slow"))
                    .await
                    .is_ok()
            })
        };
        tokio::task::yield_now().await;

        let fast = ConversationId::from("fast");
        let handle = tokio::time::timeout(
            Duration::from_secs(1),
            store.get_or_create(&fast, &event("fast")),
        )
        .await
        .expect("fast conversation waited on the slow factory")
        .unwrap();
        drop(handle);

        // A record still waiting on its factory is never evicted.
        clock.advance(Duration::from_secs(120));
        assert_eq!(store.sweep_now().await.evicted, vec![fast]);
        assert!(store.contains(&ConversationId::from("slow")).await);
        assert!(!slow.is_finished());

        factory.gate.add_permits(1);
        assert!(slow.await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_session_built_after_close_is_disposed_by_its_creator() {
        let factory = GatedFactory::new();
        let store = Arc::new(SessionStore::builder(factory.clone()).build());

        let slow = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .get_or_create(&ConversationId::from("slow"), &event("slow"))
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert_eq!(store.dispose_all().await, 0);
        factory.gate.add_permits(1);

        let err = slow.await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::ShuttingDown));
        assert_eq!(factory.stub(0).disposals.load(Ordering::SeqCst), 1);
        assert_eq!(factory.stub(0).begins.load(Ordering::SeqCst), 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_evicted_session_cannot_arm_new_buttons() {
        let factory = CountingFactory::new(false);
        let clock = ManualClock::new();
        let store = idle_store(&factory, &clock);
        let id = ConversationId::from("gone");

        let handle = store.get_or_create(&id, &event("gone")).await.unwrap();
        drop(handle);
        clock.advance(Duration::from_secs(120));
        assert_eq!(store.run_eviction_sweep().await.evicted, vec![id.clone()]);

        // A late subscribe from the disposed session is refused on click.
        let late = store.callbacks().subscribe(&id, |_| async { Ok(()) }).await;
        assert!(!store.callbacks().invoke("q", late.as_str(), "m", &id).await.unwrap());
    }
}
