//! In-memory reference ledger.
//!
//! Holds accounts with opening balances and a flat transaction list. Every
//! mutation publishes a [`ChangeEvent`] on a broadcast channel. Reads can be
//! counted, delayed or made to fail, which the engine tests rely on.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error};

use super::{ChangeEvent, ChangeKind, DateBucket, EntityRef, LedgerError, LedgerFacade};
use crate::tracker;
use crate::types::{AccountId, AccountScope, Cents};

/// Capacity of the change feed before slow receivers lag.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account id
    pub id: AccountId,
    /// Display name
    pub name: String,
    /// Whether the account is tracked by the budget
    #[serde(default = "default_on_budget")]
    pub on_budget: bool,
    /// Closed accounts keep their history
    #[serde(default)]
    pub closed: bool,
    /// Balance before the first transaction
    #[serde(default)]
    pub opening_balance: Cents,
    /// Day the opening balance takes effect (always, if unset)
    #[serde(default)]
    pub opened_on: Option<NaiveDate>,
}

fn default_on_budget() -> bool {
    true
}

impl Account {
    /// An open, on-budget account with no opening balance.
    pub fn new(id: impl Into<AccountId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            on_budget: true,
            closed: false,
            opening_balance: Cents::ZERO,
            opened_on: None,
        }
    }

    pub fn off_budget(mut self) -> Self {
        self.on_budget = false;
        self
    }

    pub fn with_opening_balance(mut self, balance: Cents, opened_on: Option<NaiveDate>) -> Self {
        self.opening_balance = balance;
        self.opened_on = opened_on;
        self
    }

    fn opening_as_of(&self, as_of: Option<NaiveDate>) -> Cents {
        match (self.opened_on, as_of) {
            (Some(opened), Some(as_of)) if opened > as_of => Cents::ZERO,
            _ => self.opening_balance,
        }
    }
}

/// A posted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id
    pub id: String,
    /// Owning account
    pub account: AccountId,
    /// Posting date
    pub date: NaiveDate,
    /// Signed amount
    pub amount: Cents,
    /// Optional payee
    #[serde(default)]
    pub payee: Option<String>,
}

impl Transaction {
    pub fn new(id: impl Into<String>, account: impl Into<AccountId>, date: NaiveDate, amount: Cents) -> Self {
        Self {
            id: id.into(),
            account: account.into(),
            date,
            amount,
            payee: None,
        }
    }

    fn entity(&self) -> EntityRef {
        EntityRef::transaction(self.account.clone(), self.date)
    }
}

#[derive(Default)]
struct LedgerState {
    accounts: BTreeMap<AccountId, Account>,
    transactions: BTreeMap<String, Transaction>,
}

impl LedgerState {
    fn balance(&self, account: &Account, as_of: Option<NaiveDate>) -> Cents {
        let posted: Cents = self
            .transactions
            .values()
            .filter(|t| t.account == account.id && as_of.map_or(true, |d| t.date <= d))
            .map(|t| t.amount)
            .sum();
        account.opening_as_of(as_of) + posted
    }
}

/// Reference [`LedgerFacade`] backed by in-process maps.
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
    changes: broadcast::Sender<ChangeEvent>,
    /// Last published sequence; held while sending so the feed stays ordered
    sequence: Mutex<u64>,
    reads: AtomicU64,
    failing: RwLock<Option<LedgerError>>,
    read_delay: RwLock<Option<Duration>>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            state: RwLock::new(LedgerState::default()),
            changes,
            sequence: Mutex::new(0),
            reads: AtomicU64::new(0),
            failing: RwLock::new(None),
            read_delay: RwLock::new(None),
        }
    }

    /// Create a ledger preloaded with data. No change events are emitted.
    pub fn with_data(accounts: Vec<Account>, transactions: Vec<Transaction>) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.state.write().unwrap_or_else(PoisonError::into_inner);
            for account in accounts {
                state.accounts.insert(account.id.clone(), account);
            }
            for tx in transactions {
                state.transactions.insert(tx.id.clone(), tx);
            }
        }
        ledger
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Insert or replace an account.
    pub fn upsert_account(&self, account: Account) {
        let id = account.id.clone();
        let kind = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match state.accounts.insert(id.clone(), account) {
                Some(_) => ChangeKind::Update,
                None => ChangeKind::Insert,
            }
        };
        self.publish(ChangeEvent::new(kind, [EntityRef::account(id)]));
    }

    /// Remove an account and its transactions.
    pub fn remove_account(&self, id: &str) -> Result<(), LedgerError> {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.accounts.remove(id).is_none() {
                return Err(LedgerError::UnknownAccount(id.to_string()));
            }
            state.transactions.retain(|_, t| t.account != id);
        }
        let bucket = DateBucket {
            account: Some(id.to_string()),
            ..Default::default()
        };
        self.publish(ChangeEvent::new(
            ChangeKind::Delete,
            [EntityRef::account(id), EntityRef::DateBucket(bucket)],
        ));
        Ok(())
    }

    /// Post a transaction to an existing account.
    pub fn add_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        let entity = tx.entity();
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !state.accounts.contains_key(&tx.account) {
                return Err(LedgerError::UnknownAccount(tx.account));
            }
            state.transactions.insert(tx.id.clone(), tx);
        }
        self.publish(ChangeEvent::new(ChangeKind::Insert, [entity]));
        Ok(())
    }

    /// Replace a transaction with the same id. Both its old and new location
    /// are reported as affected.
    pub fn update_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        let new_entity = tx.entity();
        let old_entity = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !state.accounts.contains_key(&tx.account) {
                return Err(LedgerError::UnknownAccount(tx.account));
            }
            let old = state
                .transactions
                .get(&tx.id)
                .map(Transaction::entity)
                .ok_or_else(|| LedgerError::Storage(format!("unknown transaction {}", tx.id)))?;
            state.transactions.insert(tx.id.clone(), tx);
            old
        };
        self.publish(ChangeEvent::new(ChangeKind::Update, [old_entity, new_entity]));
        Ok(())
    }

    /// Delete a transaction by id.
    pub fn delete_transaction(&self, id: &str) -> Result<(), LedgerError> {
        let entity = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state
                .transactions
                .remove(id)
                .map(|t| t.entity())
                .ok_or_else(|| LedgerError::Storage(format!("unknown transaction {}", id)))?
        };
        self.publish(ChangeEvent::new(ChangeKind::Delete, [entity]));
        Ok(())
    }

    /// Post many transactions at once, announced as a single date-bucket change.
    ///
    /// A transaction whose id already exists replaces the stored one, and the
    /// replaced copy's location is added to the change. Returns the number of
    /// transactions imported. Fails without importing anything if any
    /// transaction names an unknown account.
    pub fn import_transactions(&self, transactions: Vec<Transaction>) -> Result<usize, LedgerError> {
        if transactions.is_empty() {
            return Ok(0);
        }

        let count = transactions.len();
        let from = transactions.iter().map(|t| t.date).min();
        let through = transactions.iter().map(|t| t.date).max();
        let first_account = transactions[0].account.clone();
        let single_account = transactions.iter().all(|t| t.account == first_account);

        let replaced: Vec<EntityRef> = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(unknown) = transactions.iter().find(|t| !state.accounts.contains_key(&t.account)) {
                return Err(LedgerError::UnknownAccount(unknown.account.clone()));
            }
            transactions
                .into_iter()
                .filter_map(|tx| state.transactions.insert(tx.id.clone(), tx))
                .map(|old| old.entity())
                .collect()
        };

        let bucket = DateBucket {
            account: single_account.then_some(first_account),
            from,
            through,
        };
        debug!(count, replaced = replaced.len(), "imported transactions");
        let kind = if replaced.is_empty() {
            ChangeKind::Insert
        } else {
            ChangeKind::Update
        };
        let affected = std::iter::once(EntityRef::DateBucket(bucket)).chain(replaced);
        self.publish(ChangeEvent::new(kind, affected));
        Ok(count)
    }

    fn publish(&self, mut event: ChangeEvent) {
        let mut sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        *sequence += 1;
        event.sequence = *sequence;
        // No receivers is fine: nothing is bound yet.
        let _ = self.changes.send(event);
    }

    // ========================================================================
    // Inspection and fault injection
    // ========================================================================

    /// All accounts, ordered by id.
    pub fn accounts(&self) -> Vec<Account> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.accounts.values().cloned().collect()
    }

    /// One account by id.
    pub fn account(&self, id: &str) -> Option<Account> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.accounts.get(id).cloned()
    }

    /// All transactions, ordered by id.
    pub fn transactions(&self) -> Vec<Transaction> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.transactions.values().cloned().collect()
    }

    /// Number of balance reads served (including failed ones).
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Make every read fail with `error` until cleared with `None`.
    pub fn set_failing(&self, error: Option<LedgerError>) {
        *self.failing.write().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Delay every read, to simulate a slow backend.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.write().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    async fn before_read(&self) -> Result<(), LedgerError> {
        if tracker::is_untracked_read() {
            error!("ledger read bypassed the tracked reader during a computation");
            return Err(LedgerError::UntrackedRead);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let delay = *self.read_delay.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self.failing.read().unwrap_or_else(PoisonError::into_inner).clone();
        match failing {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerFacade for InMemoryLedger {
    async fn read_balance(&self, account: &AccountId, as_of: Option<NaiveDate>) -> Result<Cents, LedgerError> {
        self.before_read().await?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let account = state
            .accounts
            .get(account)
            .ok_or_else(|| LedgerError::UnknownAccount(account.clone()))?;
        Ok(state.balance(account, as_of))
    }

    async fn read_aggregate_balance(
        &self,
        scope: AccountScope,
        as_of: Option<NaiveDate>,
    ) -> Result<Cents, LedgerError> {
        self.before_read().await?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .accounts
            .values()
            .filter(|a| scope.includes(a.on_budget))
            .map(|a| state.balance(a, as_of))
            .sum())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn version(&self) -> u64 {
        *self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn earliest_activity(&self) -> Result<Option<NaiveDate>, LedgerError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let first_tx = state.transactions.values().map(|t| t.date).min();
        let first_open = state.accounts.values().filter_map(|a| a.opened_on).min();
        Ok(match (first_tx, first_open) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }
}
