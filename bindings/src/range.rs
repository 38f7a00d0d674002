//! Ranged aggregates composed from per-period bindings.
//!
//! A net worth series over `[start, end]` is split into period buckets. Each
//! bucket is an ordinary `SumBalance(scope, asOf = period end)` binding, so
//! overlapping reports share their common periods and a ledger change only
//! recomputes the periods it touches.
//!
//! ```text
//!   get_series(Jan..Mar)
//!        │
//!        ├── SumBalance asOf 01-31 ──┐
//!        ├── SumBalance asOf 02-29 ──┼── settled ──► recompose ──► RangeSeries
//!        └── SumBalance asOf 03-31 ──┘   (all constituents settled)
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::NaiveDate;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::{BindingEvent, Callback, SubscriptionId};
use crate::cache::{BindingCache, BindingHandle, BindingState};
use crate::descriptor::{canonicalize, CacheKey, QueryDescriptor};
use crate::period::{periods_between, Granularity, PeriodKey};
use crate::types::{AccountScope, Cents, EngineError, RangeSeries, Result, SeriesPoint};

/// Series consumer callback.
pub type SeriesCallback = Arc<dyn Fn(&RangeSeries) + Send + Sync>;

/// Entry point for ranged queries over a [`BindingCache`].
#[derive(Clone)]
pub struct RangeAggregator {
    cache: BindingCache,
}

impl RangeAggregator {
    pub fn new(cache: BindingCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &BindingCache {
        &self.cache
    }

    /// Acquire the per-period bindings for `[start, end]` and return a handle
    /// on the composed series.
    pub fn get_series(
        &self,
        scope: AccountScope,
        start: NaiveDate,
        end: NaiveDate,
        granularity: Granularity,
    ) -> Result<SeriesHandle> {
        if start > end {
            return Err(EngineError::InvalidRange { start, end });
        }

        let (ready, _) = watch::channel(None);
        let inner = Arc::new(SeriesInner {
            cache: self.cache.clone(),
            scope,
            granularity,
            state: Mutex::new(SeriesState {
                start,
                end,
                key: series_key(scope, start, end, granularity)?,
                periods: BTreeMap::new(),
                current: None,
                subscribers: Vec::new(),
                released: false,
            }),
            ready,
            next_subscription: AtomicU64::new(1),
        });

        let handle = SeriesHandle { inner };
        handle.set_range(start, end)?;
        Ok(handle)
    }
}

fn series_key(scope: AccountScope, start: NaiveDate, end: NaiveDate, granularity: Granularity) -> Result<CacheKey> {
    canonicalize(&QueryDescriptor::net_worth_series(scope, start, end, granularity))
}

struct SeriesState {
    start: NaiveDate,
    end: NaiveDate,
    key: CacheKey,
    periods: BTreeMap<PeriodKey, BindingHandle>,
    current: Option<RangeSeries>,
    subscribers: Vec<(SubscriptionId, SeriesCallback)>,
    released: bool,
}

struct SeriesInner {
    cache: BindingCache,
    scope: AccountScope,
    granularity: Granularity,
    state: Mutex<SeriesState>,
    ready: watch::Sender<Option<RangeSeries>>,
    next_subscription: AtomicU64,
}

impl SeriesInner {
    fn lock_state(&self) -> MutexGuard<'_, SeriesState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail with `StaleHandle` once the series is released or its bindings
    /// were dropped by a cache reset or shutdown. A dropped series is marked
    /// released and its last composition discarded.
    fn check_live(&self, state: &mut SeriesState) -> Result<()> {
        if state.released {
            return Err(EngineError::StaleHandle(state.key.clone()));
        }
        let dropped = state
            .periods
            .values()
            .any(|handle| matches!(self.cache.state(handle), Err(EngineError::StaleHandle(_)) | Err(EngineError::ShutDown)));
        if dropped {
            warn!(key = %state.key.digest(), "series bindings dropped by the cache");
            state.released = true;
            state.subscribers.clear();
            state.periods.clear();
            state.current = None;
            self.ready.send_replace(None);
            return Err(EngineError::StaleHandle(state.key.clone()));
        }
        Ok(())
    }

    /// The series as of now, `None` while any constituent is unsettled.
    fn compose(&self, state: &SeriesState) -> Option<RangeSeries> {
        let mut points = Vec::with_capacity(state.periods.len());
        let mut failed = Vec::new();
        for (period, handle) in &state.periods {
            let snapshot = self.cache.snapshot(handle).ok()?;
            match snapshot.state {
                BindingState::Pending | BindingState::Dirty => return None,
                BindingState::Failed => failed.push(*period),
                BindingState::Fresh => {}
            }
            let value = snapshot
                .value
                .and_then(|v| v.as_amount())
                .unwrap_or(Cents::ZERO);
            points.push(SeriesPoint { period: *period, value });
        }
        Some(RangeSeries { points, failed })
    }

    /// Compose the series if every constituent has settled.
    ///
    /// Lock order is series state, then cache.
    fn recompose(&self) {
        let (series, targets) = {
            let mut state = self.lock_state();
            if self.check_live(&mut state).is_err() {
                return;
            }
            let Some(series) = self.compose(&state) else {
                return;
            };
            if state.current.as_ref() == Some(&series) {
                // Settled without a change; `ready` waiters still need to look.
                self.ready.send_modify(|_| {});
                return;
            }
            debug!(
                key = %state.key.digest(),
                periods = series.len(),
                failed = series.failed.len(),
                net_worth = %series.net_worth(),
                "series composed"
            );
            state.current = Some(series.clone());
            self.ready.send_replace(Some(series.clone()));
            let targets: Vec<SeriesCallback> = state.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (series, targets)
        };

        for callback in targets {
            callback(&series);
        }
    }
}

/// Handle on a composed series. Clones share the same constituents.
#[derive(Clone)]
pub struct SeriesHandle {
    inner: Arc<SeriesInner>,
}

impl SeriesHandle {
    /// Canonical key of the series' current range.
    pub fn key(&self) -> CacheKey {
        self.inner.lock_state().key.clone()
    }

    pub fn scope(&self) -> AccountScope {
        self.inner.scope
    }

    pub fn granularity(&self) -> Granularity {
        self.inner.granularity
    }

    /// Current `(start, end)`.
    pub fn range(&self) -> (NaiveDate, NaiveDate) {
        let state = self.inner.lock_state();
        (state.start, state.end)
    }

    /// Period buckets currently covered.
    pub fn periods(&self) -> Vec<PeriodKey> {
        self.inner.lock_state().periods.keys().copied().collect()
    }

    /// Last composed series, if every constituent has settled at least once.
    ///
    /// `None` once the series is released or dropped by a cache reset.
    pub fn current(&self) -> Option<RangeSeries> {
        let mut state = self.inner.lock_state();
        self.inner.check_live(&mut state).ok()?;
        state.current.clone()
    }

    /// Wait for a composed series that reflects every ledger write made
    /// before the call.
    pub async fn ready(&self) -> Result<RangeSeries> {
        self.inner.cache.sync().await?;
        let mut rx = self.inner.ready.subscribe();
        loop {
            let _ = rx.borrow_and_update();
            {
                let mut state = self.inner.lock_state();
                self.inner.check_live(&mut state)?;
                // Compose directly: a constituent may have settled before its
                // callback stored the new composition.
                if let Some(series) = self.inner.compose(&state) {
                    return Ok(series);
                }
            }
            if rx.changed().await.is_err() {
                return Err(EngineError::ShutDown);
            }
        }
    }

    /// Called with every newly composed series.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RangeSeries) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let callback: SeriesCallback = Arc::new(callback);
        self.inner.lock_state().subscribers.push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.inner.lock_state();
        let before = state.subscribers.len();
        state.subscribers.retain(|(sid, _)| *sid != id);
        state.subscribers.len() != before
    }

    /// Move the range. Periods still covered keep their bindings; only new
    /// periods are acquired and dropped ones released.
    pub fn set_range(&self, start: NaiveDate, end: NaiveDate) -> Result<()> {
        if start > end {
            return Err(EngineError::InvalidRange { start, end });
        }

        let wanted = periods_between(start, end, self.inner.granularity);
        {
            let mut state = self.inner.lock_state();
            self.inner.check_live(&mut state)?;

            let dropped: Vec<PeriodKey> = state
                .periods
                .keys()
                .filter(|p| !wanted.contains(p))
                .copied()
                .collect();
            for period in &dropped {
                if let Some(handle) = state.periods.remove(period) {
                    if let Err(err) = self.inner.cache.release(handle) {
                        warn!(period = %period, error = %err, "failed to release period binding");
                    }
                }
            }

            let mut added = 0usize;
            for period in &wanted {
                if state.periods.contains_key(period) {
                    continue;
                }
                let descriptor = QueryDescriptor::sum_balance(self.inner.scope).as_of(period.end_date());
                let handle = self.inner.cache.acquire_settled(&descriptor, self.settle_callback())?;
                state.periods.insert(*period, handle);
                added += 1;
            }

            state.start = start;
            state.end = end;
            state.key = series_key(self.inner.scope, start, end, self.inner.granularity)?;
            state.current = None;
            self.inner.ready.send_replace(None);
            debug!(
                key = %state.key.digest(),
                periods = wanted.len(),
                added,
                dropped = dropped.len(),
                "series range set"
            );
        }

        // Covered periods may already be fresh and will not settle again.
        self.inner.recompose();
        Ok(())
    }

    /// Keep the start, move the end.
    pub fn extend_to(&self, end: NaiveDate) -> Result<()> {
        let (start, _) = self.range();
        self.set_range(start, end)
    }

    /// Release every constituent binding. The handle is unusable afterwards.
    pub fn release(&self) -> Result<()> {
        let periods = {
            let mut state = self.inner.lock_state();
            if state.released {
                return Err(EngineError::StaleHandle(state.key.clone()));
            }
            state.released = true;
            state.subscribers.clear();
            std::mem::take(&mut state.periods)
        };

        let mut first_error = None;
        for (_, handle) in periods {
            if let Err(err) = self.inner.cache.release(handle) {
                first_error.get_or_insert(err);
            }
        }
        // Wake anyone waiting in `ready`.
        self.inner.ready.send_modify(|_| {});

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn settle_callback(&self) -> Callback {
        let series: Weak<SeriesInner> = Arc::downgrade(&self.inner);
        Arc::new(move |_event: &BindingEvent| {
            if let Some(series) = series.upgrade() {
                series.recompose();
            }
        })
    }
}
