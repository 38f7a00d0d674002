//! Dependency tracking for binding computations.
//!
//! A computation gets a [`TrackedReader`] instead of the raw ledger. Each read
//! records what it depends on before it reaches the ledger, so the recorded
//! set is complete even when the read fails. The set decides which change
//! events invalidate the binding.
//!
//! ```text
//! with_tracking(ledger, |reader| async { reader.read_balance(..).await })
//!        │
//!        ├─► reader.read_balance(a, asOf)
//!        │      records Field(Account a) + Aggregate(DateBucket{a, ..asOf})
//!        │      then reads the ledger
//!        │
//!        └─► scope ends: (result, DependencySet); later reads fail
//! ```
//!
//! While a computation runs, its task carries a count of tracked reads in
//! progress. A facade can call [`is_untracked_read`] to reject reads that
//! reach it any other way, e.g. from a custom query holding its own ledger.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::error;

use crate::ledger::{ChangeEvent, DateBucket, EntityRef, LedgerError, LedgerFacade};
use crate::types::{AccountId, AccountScope, Cents};

tokio::task_local! {
    /// Tracked reads in progress on the computing task.
    static TRACKED_READS: Cell<u32>;
}

/// Whether the current task is running a computation and the ledger read
/// about to happen did not come through its [`TrackedReader`].
pub fn is_untracked_read() -> bool {
    TRACKED_READS.try_with(|reads| reads.get() == 0).unwrap_or(false)
}

/// Marks a tracked read in progress for as long as it lives.
struct TrackedReadGuard;

impl TrackedReadGuard {
    fn enter() -> Self {
        let _ = TRACKED_READS.try_with(|reads| reads.set(reads.get() + 1));
        TrackedReadGuard
    }
}

impl Drop for TrackedReadGuard {
    fn drop(&mut self) {
        let _ = TRACKED_READS.try_with(|reads| reads.set(reads.get().saturating_sub(1)));
    }
}

/// How a computation depends on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Which entities exist
    Existence,
    /// A field of one entity
    Field,
    /// A sum over a range of transactions
    Aggregate,
}

/// One recorded dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub entity: EntityRef,
    pub kind: DependencyKind,
}

impl DependencyRecord {
    pub fn new(entity: EntityRef, kind: DependencyKind) -> Self {
        Self { entity, kind }
    }

    /// Whether a change to `changed` invalidates this dependency.
    pub fn covers(&self, changed: &EntityRef) -> bool {
        if &self.entity == changed {
            return true;
        }

        match (changed, &self.entity, self.kind) {
            // Whole account set changed: every account and aggregate read is stale.
            (EntityRef::AllAccounts, _, _) => true,
            (EntityRef::Account { .. }, EntityRef::AllAccounts, DependencyKind::Existence) => true,
            (EntityRef::Transaction { account, date }, EntityRef::DateBucket(bucket), DependencyKind::Aggregate) => {
                bucket.contains(account, *date)
            }
            (EntityRef::DateBucket(changed), EntityRef::DateBucket(bucket), DependencyKind::Aggregate) => {
                bucket.overlaps(changed)
            }
            _ => false,
        }
    }
}

/// Dependencies recorded by one computation. Replaced wholesale on recompute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    records: HashSet<DependencyRecord>,
}

impl DependencySet {
    pub fn insert(&mut self, record: DependencyRecord) {
        self.records.insert(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, record: &DependencyRecord) -> bool {
        self.records.contains(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependencyRecord> {
        self.records.iter()
    }

    /// Whether any affected entity of `event` hits a recorded dependency.
    pub fn is_invalidated_by(&self, event: &ChangeEvent) -> bool {
        event
            .affected
            .iter()
            .any(|changed| self.records.iter().any(|record| record.covers(changed)))
    }
}

/// The only ledger read path available to a computation.
///
/// Clones share one dependency log. Once the owning [`with_tracking`] scope
/// returns, every read fails with [`LedgerError::UntrackedRead`].
#[derive(Clone)]
pub struct TrackedReader {
    ledger: Arc<dyn LedgerFacade>,
    log: Arc<Mutex<Option<DependencySet>>>,
}

impl TrackedReader {
    fn record<const N: usize>(&self, records: [DependencyRecord; N]) -> Result<(), LedgerError> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        match log.as_mut() {
            Some(set) => {
                for record in records {
                    set.insert(record);
                }
                Ok(())
            }
            None => {
                error!("ledger read attempted after its tracking scope ended");
                Err(LedgerError::UntrackedRead)
            }
        }
    }

    /// Whether the tracking scope is still open.
    pub fn is_active(&self) -> bool {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Balance of one account, optionally as of a date.
    pub async fn read_balance(&self, account: &AccountId, as_of: Option<NaiveDate>) -> Result<Cents, LedgerError> {
        self.record([
            DependencyRecord::new(EntityRef::account(account.clone()), DependencyKind::Field),
            DependencyRecord::new(
                EntityRef::DateBucket(DateBucket {
                    account: Some(account.clone()),
                    from: None,
                    through: as_of,
                }),
                DependencyKind::Aggregate,
            ),
        ])?;
        let _guard = TrackedReadGuard::enter();
        self.ledger.read_balance(account, as_of).await
    }

    /// Summed balance of every account in `scope`.
    pub async fn read_aggregate_balance(
        &self,
        scope: AccountScope,
        as_of: Option<NaiveDate>,
    ) -> Result<Cents, LedgerError> {
        self.record([
            DependencyRecord::new(EntityRef::AllAccounts, DependencyKind::Existence),
            DependencyRecord::new(
                EntityRef::DateBucket(DateBucket {
                    account: None,
                    from: None,
                    through: as_of,
                }),
                DependencyKind::Aggregate,
            ),
        ])?;
        let _guard = TrackedReadGuard::enter();
        self.ledger.read_aggregate_balance(scope, as_of).await
    }
}

/// Run `f` with a fresh tracked reader and return its result together with
/// every dependency it recorded.
pub async fn with_tracking<F, Fut, T>(ledger: Arc<dyn LedgerFacade>, f: F) -> (T, DependencySet)
where
    F: FnOnce(TrackedReader) -> Fut,
    Fut: Future<Output = T>,
{
    let log = Arc::new(Mutex::new(Some(DependencySet::default())));
    let reader = TrackedReader {
        ledger,
        log: Arc::clone(&log),
    };

    let result = TRACKED_READS.scope(Cell::new(0), f(reader)).await;
    let dependencies = log
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .unwrap_or_default();
    (result, dependencies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Account, ChangeKind, InMemoryLedger, Transaction};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ledger() -> Arc<dyn LedgerFacade> {
        Arc::new(InMemoryLedger::with_data(
            vec![Account::new("checking", "Checking"), Account::new("savings", "Savings")],
            vec![Transaction::new("t1", "checking", date(2024, 1, 5), Cents(12_000))],
        ))
    }

    #[tokio::test]
    async fn test_records_balance_dependencies() {
        let (result, deps) = with_tracking(ledger(), |reader| async move {
            reader
                .read_balance(&"checking".to_string(), Some(date(2024, 1, 31)))
                .await
        })
        .await;

        assert_eq!(result.unwrap(), Cents(12_000));
        assert_eq!(deps.len(), 2);
        assert!(deps.contains(&DependencyRecord::new(EntityRef::account("checking"), DependencyKind::Field)));

        let same_account = ChangeEvent::new(ChangeKind::Insert, [EntityRef::transaction("checking", date(2024, 1, 20))]);
        let later = ChangeEvent::new(ChangeKind::Insert, [EntityRef::transaction("checking", date(2024, 2, 1))]);
        let other_account = ChangeEvent::new(ChangeKind::Insert, [EntityRef::transaction("savings", date(2024, 1, 20))]);
        assert!(deps.is_invalidated_by(&same_account));
        assert!(!deps.is_invalidated_by(&later));
        assert!(!deps.is_invalidated_by(&other_account));
    }

    #[tokio::test]
    async fn test_aggregate_dependencies() {
        let (_, deps) = with_tracking(ledger(), |reader| async move {
            reader.read_aggregate_balance(AccountScope::OnBudget, None).await
        })
        .await;

        let any_tx = ChangeEvent::new(ChangeKind::Insert, [EntityRef::transaction("savings", date(2030, 1, 1))]);
        let new_account = ChangeEvent::new(ChangeKind::Insert, [EntityRef::account("brokerage")]);
        let everything = ChangeEvent::new(ChangeKind::Update, [EntityRef::AllAccounts]);
        assert!(deps.is_invalidated_by(&any_tx));
        assert!(deps.is_invalidated_by(&new_account));
        assert!(deps.is_invalidated_by(&everything));
    }

    #[tokio::test]
    async fn test_records_before_failed_read() {
        let (result, deps) = with_tracking(ledger(), |reader| async move {
            reader.read_balance(&"missing".to_string(), None).await
        })
        .await;

        assert!(matches!(result, Err(LedgerError::UnknownAccount(_))));
        assert!(deps.contains(&DependencyRecord::new(EntityRef::account("missing"), DependencyKind::Field)));
    }

    #[tokio::test]
    async fn test_read_after_scope_rejected() {
        let (escaped, _) = with_tracking(ledger(), |reader| async move { reader }).await;

        assert!(!escaped.is_active());
        let err = escaped.read_aggregate_balance(AccountScope::All, None).await.unwrap_err();
        assert_eq!(err, LedgerError::UntrackedRead);
    }

    #[tokio::test]
    async fn test_direct_facade_read_in_scope_rejected() {
        let direct = ledger();
        let bypass = Arc::clone(&direct);
        let (result, deps) = with_tracking(direct, |_reader| async move {
            bypass.read_aggregate_balance(AccountScope::All, None).await
        })
        .await;

        assert_eq!(result.unwrap_err(), LedgerError::UntrackedRead);
        assert!(deps.is_empty());
        assert!(!is_untracked_read());
    }

    #[tokio::test]
    async fn test_nested_tracked_reads_allowed() {
        let (result, _) = with_tracking(ledger(), |reader| async move {
            let checking = "checking".to_string();
            let (a, b) = tokio::join!(
                reader.read_balance(&checking, None),
                reader.read_aggregate_balance(AccountScope::All, None),
            );
            Ok::<_, LedgerError>(a? + b?)
        })
        .await;

        assert_eq!(result.unwrap(), Cents(24_000));
    }

    #[test]
    fn test_field_dependency_ignores_other_accounts() {
        let record = DependencyRecord::new(EntityRef::account("checking"), DependencyKind::Field);
        assert!(record.covers(&EntityRef::account("checking")));
        assert!(!record.covers(&EntityRef::account("savings")));
        assert!(record.covers(&EntityRef::AllAccounts));
    }
}
