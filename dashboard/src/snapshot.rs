//! Ledger snapshot loading
//!
//! The dashboard works on a JSON export `{ "accounts": [...], "transactions": [...] }`.

use anyhow::Context;
use ledger_bindings::ledger::{Account, InMemoryLedger, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl LedgerSnapshot {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading ledger snapshot {}", path.display()))?;
        let snapshot: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing ledger snapshot {}", path.display()))?;
        snapshot.validate()?;
        info!(
            accounts = snapshot.accounts.len(),
            transactions = snapshot.transactions.len(),
            "loaded ledger snapshot"
        );
        Ok(snapshot)
    }

    /// Every transaction must reference a known account.
    fn validate(&self) -> anyhow::Result<()> {
        for tx in &self.transactions {
            if !self.accounts.iter().any(|a| a.id == tx.account) {
                anyhow::bail!("transaction {} references unknown account {}", tx.id, tx.account);
            }
        }
        Ok(())
    }

    pub fn into_ledger(self) -> InMemoryLedger {
        InMemoryLedger::with_data(self.accounts, self.transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_bindings::{Cents, LedgerFacade};

    #[tokio::test]
    async fn test_load_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{
                "accounts": [
                    {"id": "checking", "name": "Checking", "opening_balance": 10000},
                    {"id": "house", "name": "House", "on_budget": false}
                ],
                "transactions": [
                    {"id": "t1", "account": "checking", "date": "2024-01-15", "amount": -2500}
                ]
            }"#,
        )
        .unwrap();

        let ledger = LedgerSnapshot::load(&path).unwrap().into_ledger();
        assert_eq!(ledger.accounts().len(), 2);
        assert_eq!(
            ledger.read_balance(&"checking".to_string(), None).await.unwrap(),
            Cents(7500)
        );
        assert!(!ledger.account("house").unwrap().on_budget);
    }

    #[test]
    fn test_unknown_account_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{"transactions": [{"id": "t1", "account": "ghost", "date": "2024-01-15", "amount": 1}]}"#,
        )
        .unwrap();

        let err = LedgerSnapshot::load(&path).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
