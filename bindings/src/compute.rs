//! Evaluation of resolved queries against a tracked reader.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::descriptor::{ResolvedQuery, Scalar};
use crate::ledger::LedgerError;
use crate::period::periods_between;
use crate::tracker::TrackedReader;
use crate::types::{RangeSeries, SeriesPoint, Value};

/// A computation registered under a name and addressed by
/// `Operation::Custom` descriptors.
///
/// Implementations must read the ledger only through `reader`, otherwise the
/// binding will not be invalidated when its inputs change. Facades that check
/// [`crate::tracker::is_untracked_read`] fail such reads with
/// `LedgerError::UntrackedRead`.
#[async_trait]
pub trait CustomQuery: Send + Sync {
    /// Name matched against the descriptor's `name` parameter.
    fn name(&self) -> &str;

    /// Compute the value.
    async fn evaluate(&self, params: &BTreeMap<String, Scalar>, reader: &TrackedReader) -> Result<Value, LedgerError>;
}

/// Registered custom queries, by name.
#[derive(Clone, Default)]
pub struct CustomRegistry {
    queries: HashMap<String, Arc<dyn CustomQuery>>,
}

impl CustomRegistry {
    pub fn register(&mut self, query: Arc<dyn CustomQuery>) {
        self.queries.insert(query.name().to_string(), query);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomQuery>> {
        self.queries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queries.contains_key(name)
    }
}

/// Compute the value of `query`.
pub async fn evaluate(query: &ResolvedQuery, reader: &TrackedReader, custom: &CustomRegistry) -> Result<Value, LedgerError> {
    match query {
        ResolvedQuery::Balance { account, as_of } => reader.read_balance(account, *as_of).await.map(Value::Amount),
        ResolvedQuery::SumBalance { scope, as_of } => {
            reader.read_aggregate_balance(*scope, *as_of).await.map(Value::Amount)
        }
        ResolvedQuery::NetWorthSeries {
            scope,
            start,
            end,
            granularity,
        } => {
            let mut points = Vec::new();
            for period in periods_between(*start, *end, *granularity) {
                let value = reader.read_aggregate_balance(*scope, Some(period.end_date())).await?;
                points.push(SeriesPoint { period, value });
            }
            Ok(Value::Series(RangeSeries {
                points,
                failed: Vec::new(),
            }))
        }
        ResolvedQuery::Custom { name, params } => match custom.get(name) {
            Some(query) => query.evaluate(params, reader).await,
            None => Err(LedgerError::Storage(format!("no custom query registered as `{}`", name))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EntityKind, QueryDescriptor};
    use crate::ledger::{Account, InMemoryLedger, LedgerFacade, Transaction};
    use crate::period::Granularity;
    use crate::tracker::with_tracking;
    use crate::types::{AccountScope, Cents};
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ledger() -> Arc<dyn LedgerFacade> {
        Arc::new(InMemoryLedger::with_data(
            vec![Account::new("checking", "Checking"), Account::new("house", "House").off_budget()],
            vec![
                Transaction::new("t1", "checking", date(2024, 2, 3), Cents(5_000)),
                Transaction::new("t2", "house", date(2024, 3, 9), Cents(100_000)),
            ],
        ))
    }

    struct DoubleOnBudget;

    #[async_trait]
    impl CustomQuery for DoubleOnBudget {
        fn name(&self) -> &str {
            "double_on_budget"
        }

        async fn evaluate(&self, _params: &BTreeMap<String, Scalar>, reader: &TrackedReader) -> Result<Value, LedgerError> {
            let on_budget = reader.read_aggregate_balance(AccountScope::OnBudget, None).await?;
            Ok(Value::Amount(on_budget + on_budget))
        }
    }

    #[tokio::test]
    async fn test_series_reads_each_period_end() {
        let query = QueryDescriptor::net_worth_series(
            AccountScope::All,
            date(2024, 1, 1),
            date(2024, 3, 1),
            Granularity::Month,
        )
        .resolve()
        .unwrap();

        let registry = CustomRegistry::default();
        let (value, deps) = with_tracking(ledger(), |reader| async move {
            evaluate(&query, &reader, &registry).await
        })
        .await;

        let series = value.unwrap().as_series().cloned().unwrap();
        let values: Vec<Cents> = series.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![Cents(0), Cents(5_000), Cents(105_000)]);
        assert_eq!(series.total_change(), Cents(105_000));
        // AllAccounts existence plus one date bucket per period
        assert_eq!(deps.len(), 4);
    }

    #[tokio::test]
    async fn test_custom_query_dispatch() {
        let mut registry = CustomRegistry::default();
        registry.register(Arc::new(DoubleOnBudget));

        let query = QueryDescriptor::custom(EntityKind::Aggregate, "double_on_budget")
            .resolve()
            .unwrap();
        let (value, _) = with_tracking(ledger(), |reader| async move {
            evaluate(&query, &reader, &registry).await
        })
        .await;
        assert_eq!(value.unwrap(), Value::Amount(Cents(10_000)));
    }
}
