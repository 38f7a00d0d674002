//! Core value and error types shared across the engine.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

use crate::descriptor::CacheKey;
use crate::ledger::LedgerError;
use crate::period::PeriodKey;

/// Account identifier as used by the ledger.
pub type AccountId = String;

/// Amount in minor currency units (cents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl Cents {
    /// Zero amount.
    pub const ZERO: Cents = Cents(0);

    /// Amount in major units, for presentation and prompts.
    pub fn to_major(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Add for Cents {
    type Output = Cents;

    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0 + rhs.0)
    }
}

impl Sub for Cents {
    type Output = Cents;

    fn sub(self, rhs: Cents) -> Cents {
        Cents(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Cents {
        Cents(iter.map(|c| c.0).sum())
    }
}

/// Which accounts an aggregate covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountScope {
    /// Every account in the ledger
    All,
    /// Accounts tracked by the budget
    OnBudget,
    /// Tracking accounts outside the budget
    OffBudget,
}

impl AccountScope {
    /// Parameter spelling used in descriptors.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountScope::All => "all",
            AccountScope::OnBudget => "onBudget",
            AccountScope::OffBudget => "offBudget",
        }
    }

    /// Parse the descriptor spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(AccountScope::All),
            "onBudget" => Some(AccountScope::OnBudget),
            "offBudget" => Some(AccountScope::OffBudget),
            _ => None,
        }
    }

    /// Whether an account with the given budget flag is in scope.
    pub fn includes(&self, on_budget: bool) -> bool {
        match self {
            AccountScope::All => true,
            AccountScope::OnBudget => on_budget,
            AccountScope::OffBudget => !on_budget,
        }
    }
}

impl fmt::Display for AccountScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One point of a ranged report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Period bucket
    pub period: PeriodKey,
    /// Value at the end of the period
    pub value: Cents,
}

/// Ordered time series backing a ranged report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSeries {
    /// Points in period order, one per bucket
    pub points: Vec<SeriesPoint>,
    /// Periods whose binding is currently failed (value is last-good or zero)
    pub failed: Vec<PeriodKey>,
}

impl RangeSeries {
    /// Number of periods.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the series has no periods.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Value of the last period.
    pub fn net_worth(&self) -> Cents {
        self.points.last().map(|p| p.value).unwrap_or_default()
    }

    /// Change between the first and the last period.
    pub fn total_change(&self) -> Cents {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => last.value - first.value,
            _ => Cents::ZERO,
        }
    }

    /// Value for a given period, if it is part of the series.
    pub fn value_at(&self, period: &PeriodKey) -> Option<Cents> {
        self.points.iter().find(|p| &p.period == period).map(|p| p.value)
    }

    /// Whether every period computed successfully.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of a binding computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Value {
    /// A single amount
    Amount(Cents),
    /// A time series
    Series(RangeSeries),
}

impl Value {
    /// The amount, if this is a scalar value.
    pub fn as_amount(&self) -> Option<Cents> {
        match self {
            Value::Amount(c) => Some(*c),
            Value::Series(_) => None,
        }
    }

    /// The series, if this is a ranged value.
    pub fn as_series(&self) -> Option<&RangeSeries> {
        match self {
            Value::Series(s) => Some(s),
            Value::Amount(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Amount(c) => write!(f, "{}", c),
            Value::Series(s) => write!(f, "series[{}] -> {}", s.len(), s.net_worth()),
        }
    }
}

/// Error types for the binding engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Malformed or incomplete query parameters
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Range aggregator input error
    #[error("Invalid range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    /// Ledger read failed and no value was ever computed
    #[error("Ledger read failed: {0}")]
    LedgerRead(#[from] LedgerError),

    /// Handle refers to a binding that was released, evicted or reset
    #[error("Stale handle for binding {0}")]
    StaleHandle(CacheKey),

    /// Internal cache invariant broken; the offending operation was aborted
    #[error("Cache invariant violated: {0}")]
    InvariantViolation(String),

    /// The cache worker has been shut down
    #[error("Binding cache is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::Granularity;

    #[test]
    fn test_cents_display() {
        assert_eq!(Cents(12000).to_string(), "120.00");
        assert_eq!(Cents(5).to_string(), "0.05");
        assert_eq!(Cents(-1999).to_string(), "-19.99");
        assert_eq!(Cents::ZERO.to_string(), "0.00");
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(AccountScope::parse("onBudget"), Some(AccountScope::OnBudget));
        assert_eq!(AccountScope::parse("everything"), None);
        assert!(AccountScope::OffBudget.includes(false));
        assert!(!AccountScope::OffBudget.includes(true));
    }

    #[test]
    fn test_series_summary() {
        let jan = PeriodKey::containing(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), Granularity::Month);
        let feb = jan.next();
        let series = RangeSeries {
            points: vec![
                SeriesPoint { period: jan, value: Cents(1000) },
                SeriesPoint { period: feb, value: Cents(4500) },
            ],
            failed: vec![],
        };

        assert_eq!(series.net_worth(), Cents(4500));
        assert_eq!(series.total_change(), Cents(3500));
        assert_eq!(series.value_at(&feb), Some(Cents(4500)));
        assert!(series.is_complete());
    }

    #[test]
    fn test_value_json_shape() {
        let json = serde_json::to_value(Value::Amount(Cents(12000))).unwrap();
        assert_eq!(json, serde_json::json!({"type": "amount", "data": 12000}));

        let back: Value = serde_json::from_value(json).unwrap();
        assert_eq!(back.as_amount(), Some(Cents(12000)));
    }
}
