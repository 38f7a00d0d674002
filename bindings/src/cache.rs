//! Binding cache - one live computation per canonical query.
//!
//! Consumers acquire handles on descriptors. Equal descriptors share one
//! binding, which is computed by a single worker task and recomputed when a
//! ledger change touches its recorded dependencies.
//!
//! ```text
//!   acquire ──► canonicalize ──► index: key → id ──► bindings: id → Binding
//!                                                        │
//!     ledger feed ──► forwarder ──► Job::Changed ──┐     │ Job::Compute
//!                                                  ▼     ▼
//!                                            ┌─────────────────┐
//!                                            │  worker (FIFO)  │── settle ──► bus
//!                                            └─────────────────┘
//! ```
//!
//! ## Binding lifecycle
//!
//! - `Pending`: created, never computed
//! - `Fresh`: value matches the ledger as of `last_computed_at`
//! - `Dirty`: a change touched a dependency; recompute queued
//! - `Failed`: last computation failed; last-good value still served
//!
//! Unheld bindings are evicted after `idle_grace_ms`. Re-acquiring during the
//! grace period keeps the binding and its value.
//!
//! ## Read-your-writes
//!
//! A ledger mutation reaches the worker through the change feed, so right
//! after a write a binding can still be Fresh with the old value. The worker
//! records the sequence of the last change it applied; [`BindingCache::sync`]
//! and [`BindingCache::resolve`] wait until it catches up with the ledger's
//! version as of the call. [`BindingCache::peek`] never waits.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tracing::{debug, error, info, warn};

use crate::bus::{dispatch, BindingEvent, Callback, Delivery, HandleToken, SubscriberList, SubscriptionId};
use crate::compute::{self, CustomQuery, CustomRegistry};
use crate::config::EngineConfig;
use crate::descriptor::{canonicalize, CacheKey, QueryDescriptor, ResolvedQuery};
use crate::ledger::{ChangeEvent, ChangeKind, EntityRef, LedgerError, LedgerFacade};
use crate::tracker::{with_tracking, DependencySet};
use crate::types::{EngineError, Result, Value};

type BindingId = u64;

// ============================================================================
// Public types
// ============================================================================

/// Binding lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Pending,
    Fresh,
    Dirty,
    Failed,
}

/// Point-in-time view of a binding.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingSnapshot {
    /// Canonical key
    pub key: CacheKey,
    /// Lifecycle state
    pub state: BindingState,
    /// Last computed value (last-good when failed)
    pub value: Option<Value>,
    /// Error of the last failed computation
    pub error: Option<LedgerError>,
    /// When the value was last computed successfully
    pub last_computed_at: Option<DateTime<Utc>>,
    /// Live handles
    pub holders: usize,
    /// Registered callbacks
    pub subscribers: usize,
    /// Recorded dependencies
    pub dependencies: usize,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Bindings currently in the cache
    pub live_bindings: usize,
    /// Computations started
    pub computations: u64,
    /// Change events processed
    pub change_events: u64,
    /// Callback invocations
    pub notifications: u64,
    /// Bindings removed after their grace period
    pub evictions: u64,
}

/// A consumer's hold on a binding.
///
/// Not `Clone`: each handle is one holder. Dropping a handle does not release
/// it; call [`BindingCache::release`].
#[derive(Debug)]
pub struct BindingHandle {
    key: CacheKey,
    binding: BindingId,
    token: HandleToken,
    settled: watch::Receiver<u64>,
}

impl BindingHandle {
    /// Canonical key of the binding.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Whether two handles hold the same binding.
    pub fn same_binding(&self, other: &BindingHandle) -> bool {
        self.binding == other.binding
    }
}

// ============================================================================
// Internal state
// ============================================================================

struct Binding {
    id: BindingId,
    key: CacheKey,
    query: ResolvedQuery,
    state: BindingState,
    value: Option<Value>,
    /// Bumped whenever `value` changes
    version: u64,
    /// Version last delivered to public subscribers
    announced: u64,
    dependencies: DependencySet,
    holders: HashSet<HandleToken>,
    subscribers: SubscriberList,
    last_computed_at: Option<DateTime<Utc>>,
    last_error: Option<LedgerError>,
    queued: bool,
    in_flight: bool,
    failures: u32,
    retry_at: Option<Instant>,
    release_epoch: u64,
    /// Last holder left while computing; start the eviction timer on settle
    evict_on_settle: bool,
    settled: watch::Sender<u64>,
}

impl Binding {
    fn new(id: BindingId, key: CacheKey, query: ResolvedQuery) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            id,
            key,
            query,
            state: BindingState::Pending,
            value: None,
            version: 0,
            announced: 0,
            dependencies: DependencySet::default(),
            holders: HashSet::new(),
            subscribers: SubscriberList::default(),
            last_computed_at: None,
            last_error: None,
            queued: false,
            in_flight: false,
            failures: 0,
            retry_at: None,
            release_epoch: 0,
            evict_on_settle: false,
            settled,
        }
    }

    fn store_value(&mut self, value: Value) {
        if self.value.as_ref() != Some(&value) {
            self.value = Some(value);
            self.version += 1;
        }
    }

    /// Mark queued if a computation is needed and none is pending.
    fn needs_enqueue(&mut self) -> bool {
        if self.state == BindingState::Fresh || self.queued || self.in_flight {
            return false;
        }
        self.queued = true;
        true
    }

    fn snapshot(&self) -> BindingSnapshot {
        BindingSnapshot {
            key: self.key.clone(),
            state: self.state,
            value: self.value.clone(),
            error: self.last_error.clone(),
            last_computed_at: self.last_computed_at,
            holders: self.holders.len(),
            subscribers: self.subscribers.len(),
            dependencies: self.dependencies.len(),
        }
    }
}

#[derive(Default)]
struct CacheState {
    bindings: HashMap<BindingId, Binding>,
    index: HashMap<CacheKey, BindingId>,
    next_id: BindingId,
    /// Binding currently being computed by the worker
    computing: Option<BindingId>,
    /// Changes seen while `computing` was running
    flight_events: Vec<ChangeEvent>,
    closed: bool,
}

impl CacheState {
    fn get(&self, key: &CacheKey) -> Option<&Binding> {
        let id = self.index.get(key)?;
        self.bindings.get(id)
    }

    fn get_mut(&mut self, key: &CacheKey) -> Option<&mut Binding> {
        let id = self.index.get(key)?;
        self.bindings.get_mut(id)
    }

    fn held(&self, handle: &BindingHandle) -> Result<&Binding> {
        self.get(&handle.key)
            .filter(|b| b.id == handle.binding && b.holders.contains(&handle.token))
            .ok_or_else(|| EngineError::StaleHandle(handle.key.clone()))
    }

    fn held_mut(&mut self, handle: &BindingHandle) -> Result<&mut Binding> {
        self.get_mut(&handle.key)
            .filter(|b| b.id == handle.binding && b.holders.contains(&handle.token))
            .ok_or_else(|| EngineError::StaleHandle(handle.key.clone()))
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Binding> {
        let id = self.index.remove(key)?;
        self.bindings.remove(&id)
    }

    fn clear(&mut self) {
        self.bindings.clear();
        self.index.clear();
        self.flight_events.clear();
    }
}

enum Job {
    Compute(CacheKey),
    Changed(ChangeEvent),
    InvalidateAll,
    Evict {
        key: CacheKey,
        id: BindingId,
        epoch: u64,
    },
    Shutdown,
}

#[derive(Default)]
struct Stats {
    computations: AtomicU64,
    change_events: AtomicU64,
    notifications: AtomicU64,
    evictions: AtomicU64,
}

struct CacheInner {
    config: EngineConfig,
    ledger: Arc<dyn LedgerFacade>,
    custom: CustomRegistry,
    state: Mutex<CacheState>,
    jobs: mpsc::UnboundedSender<Job>,
    /// Sequence of the last ledger change applied by the worker
    applied: watch::Sender<u64>,
    runtime: RuntimeHandle,
    stats: Stats,
    next_token: AtomicU64,
    next_subscription: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`BindingCache`].
#[derive(Default)]
pub struct BindingCacheBuilder {
    config: EngineConfig,
    custom: CustomRegistry,
}

impl BindingCacheBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a computation for `Operation::Custom` descriptors.
    pub fn custom_query(mut self, query: Arc<dyn CustomQuery>) -> Self {
        self.custom.register(query);
        self
    }

    /// Build the cache and start its worker and change-feed forwarder.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn build(self, ledger: Arc<dyn LedgerFacade>) -> BindingCache {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let changes = ledger.subscribe_changes();
        // Changes published before the subscription are already reflected in
        // every read the worker will make.
        let (applied, _) = watch::channel(ledger.version());

        let inner = Arc::new(CacheInner {
            config: self.config,
            ledger,
            custom: self.custom,
            state: Mutex::new(CacheState::default()),
            jobs: jobs_tx,
            applied,
            runtime: RuntimeHandle::current(),
            stats: Stats::default(),
            next_token: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        });

        let worker = inner.runtime.spawn(run_worker(Arc::downgrade(&inner), jobs_rx));
        let forwarder = inner
            .runtime
            .spawn(run_forwarder(Arc::downgrade(&inner), BroadcastStream::new(changes)));
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([worker, forwarder]);

        info!(
            idle_grace_ms = inner.config.idle_grace_ms,
            retry_base_ms = inner.config.retry_base_ms,
            "binding cache started"
        );
        BindingCache { inner }
    }
}

// ============================================================================
// BindingCache
// ============================================================================

/// Shared, reactive cache of ledger query results.
#[derive(Clone)]
pub struct BindingCache {
    inner: Arc<CacheInner>,
}

impl BindingCache {
    /// Create a cache over `ledger`. Must be called inside a tokio runtime.
    pub fn new(ledger: Arc<dyn LedgerFacade>, config: EngineConfig) -> Self {
        Self::builder().config(config).build(ledger)
    }

    pub fn builder() -> BindingCacheBuilder {
        BindingCacheBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The ledger this cache reads from.
    pub fn ledger(&self) -> &Arc<dyn LedgerFacade> {
        &self.inner.ledger
    }

    /// Acquire a handle on the binding for `descriptor`.
    ///
    /// Returns immediately. The value arrives through [`peek`](Self::peek),
    /// [`resolve`](Self::resolve) or a subscription.
    pub fn acquire(&self, descriptor: &QueryDescriptor) -> Result<BindingHandle> {
        self.inner.acquire(descriptor, None).map(|(handle, _)| handle)
    }

    /// Acquire and subscribe in one step, so no settle can be missed.
    pub fn acquire_subscribed<F>(&self, descriptor: &QueryDescriptor, callback: F) -> Result<(BindingHandle, SubscriptionId)>
    where
        F: Fn(&BindingEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let (handle, id) = self.inner.acquire(descriptor, Some((Delivery::Distinct, callback)))?;
        match id {
            Some(id) => Ok((handle, id)),
            None => Err(EngineError::InvariantViolation("subscription not registered".into())),
        }
    }

    /// Acquire with a callback that runs after every settle.
    pub(crate) fn acquire_settled(&self, descriptor: &QueryDescriptor, callback: Callback) -> Result<BindingHandle> {
        self.inner
            .acquire(descriptor, Some((Delivery::Settled, callback)))
            .map(|(handle, _)| handle)
    }

    /// Release a handle. Its subscriptions are removed with it.
    pub fn release(&self, handle: BindingHandle) -> Result<()> {
        self.inner.release(handle)
    }

    /// Last known value, without forcing a computation.
    pub fn peek(&self, handle: &BindingHandle) -> Option<Value> {
        let state = self.inner.lock_state();
        state.held(handle).ok().and_then(|b| b.value.clone())
    }

    pub fn state(&self, handle: &BindingHandle) -> Result<BindingState> {
        let state = self.inner.lock_state();
        state.held(handle).map(|b| b.state)
    }

    pub fn snapshot(&self, handle: &BindingHandle) -> Result<BindingSnapshot> {
        let state = self.inner.lock_state();
        state.held(handle).map(Binding::snapshot)
    }

    /// Wait until every ledger change published before this call has been
    /// applied, so bindings it touched are no longer marked Fresh.
    pub async fn sync(&self) -> Result<()> {
        let target = self.inner.ledger.version();
        let mut applied = self.inner.applied.subscribe();
        loop {
            if self.is_shut_down() {
                return Err(EngineError::ShutDown);
            }
            if *applied.borrow_and_update() >= target {
                return Ok(());
            }
            if applied.changed().await.is_err() {
                return Err(EngineError::ShutDown);
            }
        }
    }

    /// Wait for the binding to settle and return its value.
    ///
    /// Ledger writes made before the call are reflected in the result. A
    /// failed binding yields its last-good value; `LedgerRead` is returned
    /// only when no value was ever computed.
    pub async fn resolve(&self, handle: &BindingHandle) -> Result<Value> {
        self.sync().await?;
        let mut settled = handle.settled.clone();
        loop {
            let _ = settled.borrow_and_update();
            {
                let state = self.inner.lock_state();
                if state.closed {
                    return Err(EngineError::ShutDown);
                }
                let binding = state.held(handle)?;
                match (binding.state, &binding.value, &binding.last_error) {
                    (BindingState::Fresh, Some(value), _) => return Ok(value.clone()),
                    (BindingState::Failed, Some(value), _) => return Ok(value.clone()),
                    (BindingState::Failed, None, Some(err)) => return Err(EngineError::LedgerRead(err.clone())),
                    _ => {}
                }
            }

            if settled.changed().await.is_err() {
                let state = self.inner.lock_state();
                return Err(if state.closed {
                    EngineError::ShutDown
                } else {
                    EngineError::StaleHandle(handle.key.clone())
                });
            }
        }
    }

    /// Subscribe to value changes and failures of a held binding.
    pub fn subscribe<F>(&self, handle: &BindingHandle, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&BindingEvent) + Send + Sync + 'static,
    {
        self.inner.subscribe(handle, Delivery::Distinct, Arc::new(callback))
    }

    /// Remove a subscription made through `handle`. Returns whether it existed.
    pub fn unsubscribe(&self, handle: &BindingHandle, id: SubscriptionId) -> Result<bool> {
        let mut state = self.inner.lock_state();
        let binding = state.held_mut(handle)?;
        Ok(binding.subscribers.remove(id, handle.token))
    }

    /// Stream of events for a held binding.
    pub fn updates(&self, handle: &BindingHandle) -> Result<(SubscriptionId, UnboundedReceiverStream<BindingEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(handle, move |event: &BindingEvent| {
            // Receiver gone means the consumer stopped listening.
            let _ = tx.send(event.clone());
        })?;
        Ok((id, UnboundedReceiverStream::new(rx)))
    }

    /// Mark every binding dirty and recompute the held ones.
    pub fn invalidate_all(&self) -> Result<()> {
        self.inner.note_flight_change(&ChangeEvent::new(ChangeKind::Update, [EntityRef::AllAccounts]));
        self.inner.send(Job::InvalidateAll)
    }

    /// Drop every binding. Outstanding handles become stale.
    pub fn reset(&self) {
        let dropped = {
            let mut state = self.inner.lock_state();
            let count = state.bindings.len();
            state.clear();
            count
        };
        info!(dropped, "binding cache reset");
    }

    /// Stop the worker. Later acquires fail with `ShutDown`.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.clear();
        }
        // Wake `sync` waiters; the worker will not advance `applied` again.
        self.inner.applied.send_modify(|_| {});
        let _ = self.inner.jobs.send(Job::Shutdown);
        info!("binding cache shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub fn stats(&self) -> CacheStats {
        let live_bindings = self.inner.lock_state().bindings.len();
        let stats = &self.inner.stats;
        CacheStats {
            live_bindings,
            computations: stats.computations.load(Ordering::Relaxed),
            change_events: stats.change_events.load(Ordering::Relaxed),
            notifications: stats.notifications.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Consumer-side operations
// ============================================================================

impl CacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, job: Job) -> Result<()> {
        self.jobs.send(job).map_err(|_| EngineError::ShutDown)
    }

    /// Send `job` after `delay`.
    fn schedule(&self, delay: Duration, job: Job) {
        let jobs = self.jobs.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = jobs.send(job);
        });
    }

    fn schedule_eviction(&self, binding: &Binding) {
        debug!(key = %binding.key.digest(), grace_ms = self.config.idle_grace_ms, "eviction scheduled");
        self.schedule(
            self.config.idle_grace(),
            Job::Evict {
                key: binding.key.clone(),
                id: binding.id,
                epoch: binding.release_epoch,
            },
        );
    }

    fn acquire(
        &self,
        descriptor: &QueryDescriptor,
        subscription: Option<(Delivery, Callback)>,
    ) -> Result<(BindingHandle, Option<SubscriptionId>)> {
        let key = canonicalize(descriptor)?;
        let query = descriptor.resolve()?;
        if let ResolvedQuery::Custom { ref name, .. } = query {
            if !self.custom.contains(name) {
                return Err(EngineError::InvalidDescriptor(format!(
                    "no custom query registered as `{}`",
                    name
                )));
            }
        }

        let token = HandleToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut state = self.lock_state();
        if state.closed {
            return Err(EngineError::ShutDown);
        }

        if let Some(&id) = state.index.get(&key) {
            if !state.bindings.contains_key(&id) {
                error!(key = %key, id, "index points at a missing binding");
                state.index.remove(&key);
                return Err(EngineError::InvariantViolation(format!("index entry without binding for {}", key)));
            }
        } else {
            let id = state.next_id;
            state.next_id += 1;
            if state.bindings.contains_key(&id) {
                error!(key = %key, id, "duplicate binding id");
                return Err(EngineError::InvariantViolation(format!("binding id {} already in use", id)));
            }
            debug!(key = %key.digest(), canonical = %key, "binding created");
            state.bindings.insert(id, Binding::new(id, key.clone(), query));
            state.index.insert(key.clone(), id);
        }

        let binding = state
            .get_mut(&key)
            .ok_or_else(|| EngineError::InvariantViolation(format!("binding vanished during acquire: {}", key)))?;

        binding.holders.insert(token);
        binding.release_epoch += 1;
        binding.evict_on_settle = false;

        let subscription_id = subscription.map(|(delivery, callback)| {
            let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
            binding.subscribers.push(id, token, delivery, callback);
            id
        });

        let handle = BindingHandle {
            key: key.clone(),
            binding: binding.id,
            token,
            settled: binding.settled.subscribe(),
        };

        if binding.needs_enqueue() {
            self.send(Job::Compute(key.clone()))?;
        }
        debug!(key = %key.digest(), holders = binding.holders.len(), state = ?binding.state, "binding acquired");

        Ok((handle, subscription_id))
    }

    fn release(&self, handle: BindingHandle) -> Result<()> {
        let mut state = self.lock_state();
        let binding = state.held_mut(&handle)?;

        binding.holders.remove(&handle.token);
        binding.subscribers.remove_owner(handle.token);
        debug!(key = %handle.key.digest(), holders = binding.holders.len(), "binding released");

        if binding.holders.is_empty() {
            binding.release_epoch += 1;
            if binding.in_flight {
                binding.evict_on_settle = true;
            } else {
                self.schedule_eviction(binding);
            }
        }
        Ok(())
    }

    fn subscribe(&self, handle: &BindingHandle, delivery: Delivery, callback: Callback) -> Result<SubscriptionId> {
        let mut state = self.lock_state();
        let binding = state.held_mut(handle)?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        binding.subscribers.push(id, handle.token, delivery, callback);
        Ok(id)
    }

    /// Remember a change that arrived while a computation is running, so the
    /// result can be checked against it when it settles.
    fn note_flight_change(&self, event: &ChangeEvent) {
        let mut state = self.lock_state();
        if state.computing.is_some() {
            state.flight_events.push(event.clone());
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker(inner: Weak<CacheInner>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match job {
            Job::Compute(key) => inner.compute(key).await,
            Job::Changed(event) => inner.apply_change(&event),
            Job::InvalidateAll => inner.invalidate_all(),
            Job::Evict { key, id, epoch } => inner.evict(&key, id, epoch),
            Job::Shutdown => break,
        }
    }
    debug!("binding cache worker stopped");
}

async fn run_forwarder(inner: Weak<CacheInner>, mut changes: BroadcastStream<ChangeEvent>) {
    while let Some(item) = changes.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let job = match item {
            Ok(event) => {
                inner.note_flight_change(&event);
                Job::Changed(event)
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "ledger change feed lagged, invalidating all bindings");
                inner.note_flight_change(&ChangeEvent::new(ChangeKind::Update, [EntityRef::AllAccounts]));
                Job::InvalidateAll
            }
        };
        if inner.send(job).is_err() {
            break;
        }
    }
    debug!("ledger change forwarder stopped");
}

impl CacheInner {
    async fn compute(&self, key: CacheKey) {
        let (id, query) = {
            let mut state = self.lock_state();
            let Some(binding) = state.get_mut(&key) else {
                return;
            };
            if !binding.queued {
                return;
            }
            if binding.state == BindingState::Failed {
                if let Some(retry_at) = binding.retry_at {
                    let now = Instant::now();
                    if retry_at > now {
                        debug!(key = %key.digest(), failures = binding.failures, "retry deferred by backoff");
                        self.schedule(retry_at - now, Job::Compute(key));
                        return;
                    }
                }
            }
            binding.queued = false;
            if binding.state == BindingState::Fresh {
                return;
            }
            binding.in_flight = true;
            let id = binding.id;
            let query = binding.query.clone();
            state.computing = Some(id);
            state.flight_events.clear();
            (id, query)
        };

        self.stats.computations.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key.digest(), "computing binding");

        let custom = &self.custom;
        let (result, dependencies) = with_tracking(Arc::clone(&self.ledger), |reader| async move {
            compute::evaluate(&query, &reader, custom).await
        })
        .await;

        let (targets, event) = {
            let mut state = self.lock_state();
            state.computing = None;
            let flight_events = std::mem::take(&mut state.flight_events);
            let Some(binding) = state.get_mut(&key).filter(|b| b.id == id) else {
                debug!(key = %key.digest(), "discarding result for dropped binding");
                return;
            };
            binding.in_flight = false;

            let invalidated = flight_events.iter().any(|e| dependencies.is_invalidated_by(e));
            binding.dependencies = dependencies;

            let outcome = if invalidated {
                if let Ok(value) = result {
                    binding.store_value(value);
                }
                binding.state = BindingState::Dirty;
                debug!(key = %key.digest(), "invalidated while computing, requeueing");
                if !binding.holders.is_empty() && binding.needs_enqueue() {
                    let _ = self.jobs.send(Job::Compute(key.clone()));
                }
                None
            } else {
                let outcome = self.settle(binding, result);
                binding.settled.send_modify(|n| *n = n.wrapping_add(1));
                Some(outcome)
            };

            if binding.holders.is_empty() && binding.evict_on_settle {
                binding.evict_on_settle = false;
                self.schedule_eviction(binding);
            }

            match outcome {
                Some(outcome) => outcome,
                None => return,
            }
        };

        if !targets.is_empty() {
            dispatch(&targets, &event);
            self.stats
                .notifications
                .fetch_add(targets.len() as u64, Ordering::Relaxed);
            if self.config.log_notifications {
                debug!(key = %key.digest(), subscribers = targets.len(), failed = event.is_failure(), "notification delivered");
            }
        }
    }

    /// Store a computation result and pick the callbacks to notify.
    fn settle(&self, binding: &mut Binding, result: std::result::Result<Value, LedgerError>) -> (Vec<Callback>, BindingEvent) {
        let was_failed = binding.state == BindingState::Failed;
        match result {
            Ok(value) => {
                let computed_at = Utc::now();
                binding.store_value(value.clone());
                binding.state = BindingState::Fresh;
                binding.last_computed_at = Some(computed_at);
                binding.last_error = None;
                binding.failures = 0;
                binding.retry_at = None;

                let publish = binding.version != binding.announced || was_failed;
                binding.announced = binding.version;
                debug!(key = %binding.key.digest(), changed = publish, "binding fresh");

                let event = BindingEvent::Updated {
                    key: binding.key.clone(),
                    value,
                    computed_at,
                };
                (binding.subscribers.targets(publish), event)
            }
            Err(err) => {
                let error_changed = binding.last_error.as_ref() != Some(&err);
                binding.state = BindingState::Failed;
                binding.failures = binding.failures.saturating_add(1);
                binding.retry_at = Some(Instant::now() + self.config.retry_delay(binding.failures));
                binding.last_error = Some(err.clone());
                warn!(key = %binding.key.digest(), error = %err, failures = binding.failures, "binding computation failed");

                let publish = !was_failed || error_changed;
                let event = BindingEvent::Failed {
                    key: binding.key.clone(),
                    error: err,
                    last_good: binding.value.clone(),
                };
                (binding.subscribers.targets(publish), event)
            }
        }
    }

    fn apply_change(&self, event: &ChangeEvent) {
        self.stats.change_events.fetch_add(1, Ordering::Relaxed);

        let mut requeue = Vec::new();
        let mut matched = 0usize;
        {
            let mut state = self.lock_state();
            for binding in state.bindings.values_mut() {
                if binding.state == BindingState::Pending || !binding.dependencies.is_invalidated_by(event) {
                    continue;
                }
                matched += 1;
                if binding.state == BindingState::Fresh {
                    binding.state = BindingState::Dirty;
                }
                if !binding.holders.is_empty() && binding.needs_enqueue() {
                    requeue.push(binding.key.clone());
                }
            }
        }

        debug!(kind = ?event.kind, affected = event.affected.len(), matched, queued = requeue.len(), "change event applied");
        for key in requeue {
            let _ = self.jobs.send(Job::Compute(key));
        }
        self.applied.send_if_modified(|applied| {
            if event.sequence > *applied {
                *applied = event.sequence;
                true
            } else {
                false
            }
        });
    }

    fn invalidate_all(&self) {
        let mut requeue = Vec::new();
        {
            let mut state = self.lock_state();
            for binding in state.bindings.values_mut() {
                match binding.state {
                    BindingState::Fresh => binding.state = BindingState::Dirty,
                    BindingState::Failed => {
                        binding.failures = 0;
                        binding.retry_at = None;
                    }
                    BindingState::Pending | BindingState::Dirty => {}
                }
                if !binding.holders.is_empty() && binding.needs_enqueue() {
                    requeue.push(binding.key.clone());
                }
            }
        }

        info!(queued = requeue.len(), "all bindings invalidated");
        for key in requeue {
            let _ = self.jobs.send(Job::Compute(key));
        }
    }

    fn evict(&self, key: &CacheKey, id: BindingId, epoch: u64) {
        let mut state = self.lock_state();
        let idle = state.get(key).map_or(false, |b| {
            b.id == id && b.release_epoch == epoch && b.holders.is_empty() && !b.in_flight
        });
        if idle && state.remove(key).is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key.digest(), "binding evicted");
        }
    }
}
