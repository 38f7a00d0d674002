//! Ledger access facade.
//!
//! The engine never talks to storage directly. It reads balances through
//! [`LedgerFacade`] and learns about mutations from the facade's change feed,
//! where each [`ChangeEvent`] names the entities a mutation touched.

pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

use crate::types::{AccountId, AccountScope, Cents};

pub use memory::{Account, InMemoryLedger, Transaction};

/// Ledger read errors. Cloned into failed bindings and failure events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Backend not reachable or not loaded
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// Account id not present in the ledger
    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),

    /// Storage layer failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Read issued through a reader whose tracking scope has ended
    #[error("Ledger read outside of a tracking scope")]
    UntrackedRead,
}

/// A set of transactions filtered by account and an inclusive date range.
///
/// Unset fields are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateBucket {
    /// Restrict to one account
    pub account: Option<AccountId>,
    /// First day covered
    pub from: Option<NaiveDate>,
    /// Last day covered
    pub through: Option<NaiveDate>,
}

impl DateBucket {
    /// Whether a transaction on `account` at `date` falls in the bucket.
    pub fn contains(&self, account: &str, date: NaiveDate) -> bool {
        if let Some(ref filter) = self.account {
            if filter != account {
                return false;
            }
        }
        self.from.map_or(true, |from| date >= from) && self.through.map_or(true, |through| date <= through)
    }

    /// Whether two buckets can share a transaction.
    pub fn overlaps(&self, other: &DateBucket) -> bool {
        if let (Some(a), Some(b)) = (&self.account, &other.account) {
            if a != b {
                return false;
            }
        }
        let disjoint_before = matches!((self.through, other.from), (Some(t), Some(f)) if t < f);
        let disjoint_after = matches!((other.through, self.from), (Some(t), Some(f)) if t < f);
        !disjoint_before && !disjoint_after
    }
}

/// A ledger entity or aggregate scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityRef {
    /// One account's own fields (existence, budget flag, opening balance)
    Account { id: AccountId },
    /// The set of accounts as a whole
    AllAccounts,
    /// A transaction, located by account and date
    Transaction { account: AccountId, date: NaiveDate },
    /// A range of transactions
    DateBucket(DateBucket),
}

impl EntityRef {
    pub fn account(id: impl Into<AccountId>) -> Self {
        EntityRef::Account { id: id.into() }
    }

    pub fn transaction(account: impl Into<AccountId>, date: NaiveDate) -> Self {
        EntityRef::Transaction {
            account: account.into(),
            date,
        }
    }
}

/// Kind of ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A ledger mutation as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Entities the mutation touched
    pub affected: HashSet<EntityRef>,
    /// Mutation kind
    pub kind: ChangeKind,
    /// Position in the facade's change feed (0 when unsequenced)
    #[serde(default)]
    pub sequence: u64,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, affected: impl IntoIterator<Item = EntityRef>) -> Self {
        Self {
            affected: affected.into_iter().collect(),
            kind,
            sequence: 0,
        }
    }
}

/// Read API and change feed of the ledger.
///
/// The engine only reads. Every read a computation makes goes through a
/// [`crate::TrackedReader`] wrapping this facade.
#[async_trait]
pub trait LedgerFacade: Send + Sync {
    /// Balance of one account, optionally as of a date (inclusive).
    async fn read_balance(&self, account: &AccountId, as_of: Option<NaiveDate>) -> Result<Cents, LedgerError>;

    /// Summed balance of every account in `scope`.
    async fn read_aggregate_balance(
        &self,
        scope: AccountScope,
        as_of: Option<NaiveDate>,
    ) -> Result<Cents, LedgerError>;

    /// Subscribe to the mutation feed.
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Sequence of the last published [`ChangeEvent`].
    ///
    /// A mutation that has returned to its caller is at or below this value.
    /// Facades whose feed is not sequenced report 0, which opts them out of
    /// read-your-writes waiting in [`crate::BindingCache::sync`].
    fn version(&self) -> u64 {
        0
    }

    /// Date of the earliest ledger activity, if any.
    async fn earliest_activity(&self) -> Result<Option<NaiveDate>, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_bucket_contains() {
        let bucket = DateBucket {
            account: Some("checking".into()),
            from: None,
            through: Some(date(2024, 1, 31)),
        };
        assert!(bucket.contains("checking", date(2023, 6, 1)));
        assert!(bucket.contains("checking", date(2024, 1, 31)));
        assert!(!bucket.contains("checking", date(2024, 2, 1)));
        assert!(!bucket.contains("savings", date(2024, 1, 1)));
    }

    #[test]
    fn test_bucket_overlap() {
        let through_jan = DateBucket {
            account: None,
            from: None,
            through: Some(date(2024, 1, 31)),
        };
        let february = DateBucket {
            account: None,
            from: Some(date(2024, 2, 1)),
            through: Some(date(2024, 2, 29)),
        };
        let savings_jan = DateBucket {
            account: Some("savings".into()),
            from: Some(date(2024, 1, 10)),
            through: Some(date(2024, 1, 12)),
        };
        let checking_any = DateBucket {
            account: Some("checking".into()),
            ..Default::default()
        };

        assert!(!through_jan.overlaps(&february));
        assert!(!february.overlaps(&through_jan));
        assert!(through_jan.overlaps(&savings_jan));
        assert!(!savings_jan.overlaps(&checking_any));
        assert!(checking_any.overlaps(&february));
    }
}
