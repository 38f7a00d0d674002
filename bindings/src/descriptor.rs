//! Query descriptors and their canonical cache keys.
//!
//! A descriptor says *what* to compute. It is a closed set of entity kinds and
//! operations with a per-operation table of required parameters, checked when
//! the descriptor is canonicalized. The canonical key is independent of the
//! order parameters were added in, so equal queries always share a binding.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::period::Granularity;
use crate::types::{AccountId, AccountScope, EngineError, Result};

/// What kind of ledger entity a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A single account
    Account,
    /// A filtered set of accounts
    AccountSet,
    /// A whole-ledger aggregate
    Aggregate,
}

impl EntityKind {
    fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::AccountSet => "account_set",
            EntityKind::Aggregate => "aggregate",
        }
    }
}

/// What to compute over the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Balance of one account
    Balance,
    /// Summed balance of the accounts in a scope
    SumBalance,
    /// Per-period summed balance over a date range
    NetWorthSeries,
    /// A registered custom computation
    Custom,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Balance => "balance",
            Operation::SumBalance => "sum_balance",
            Operation::NetWorthSeries => "net_worth_series",
            Operation::Custom => "custom",
        }
    }

    /// Entity kinds this operation applies to.
    fn accepts(&self, kind: EntityKind) -> bool {
        match self {
            Operation::Balance => kind == EntityKind::Account,
            Operation::SumBalance => matches!(kind, EntityKind::AccountSet | EntityKind::Aggregate),
            Operation::NetWorthSeries => kind == EntityKind::Aggregate,
            Operation::Custom => true,
        }
    }

    /// Parameters that must be present.
    fn required_params(&self) -> &'static [&'static str] {
        match self {
            Operation::Balance => &["accountId"],
            Operation::SumBalance => &["scope"],
            Operation::NetWorthSeries => &["start", "end"],
            Operation::Custom => &["name"],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scalar {
    Str(String),
    Int(i64),
    Bool(bool),
    Date(NaiveDate),
}

impl Scalar {
    /// Typed, escaped encoding used inside canonical keys.
    fn encode(&self) -> String {
        match self {
            Scalar::Str(s) => format!("s:{}", escape(s)),
            Scalar::Int(i) => format!("i:{}", i),
            Scalar::Bool(b) => format!("b:{}", b),
            Scalar::Date(d) => format!("d:{}", d.format("%Y-%m-%d")),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Scalar::Str(_) => "string",
            Scalar::Int(_) => "integer",
            Scalar::Bool(_) => "boolean",
            Scalar::Date(_) => "date",
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<NaiveDate> for Scalar {
    fn from(d: NaiveDate) -> Self {
        Scalar::Date(d)
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '?' => out.push_str("%3F"),
            _ => out.push(c),
        }
    }
    out
}

/// Immutable description of a query.
///
/// Parameters live in an ordered map, so two descriptors built with the same
/// parameters in different orders are structurally equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryDescriptor {
    entity_kind: EntityKind,
    operation: Operation,
    params: BTreeMap<String, Scalar>,
}

impl QueryDescriptor {
    /// Create a descriptor with no parameters.
    pub fn new(entity_kind: EntityKind, operation: Operation) -> Self {
        Self {
            entity_kind,
            operation,
            params: BTreeMap::new(),
        }
    }

    /// Balance of a single account.
    pub fn balance(account: impl Into<AccountId>) -> Self {
        Self::new(EntityKind::Account, Operation::Balance).with_param("accountId", account.into())
    }

    /// Summed balance of every account in `scope`.
    pub fn sum_balance(scope: AccountScope) -> Self {
        Self::new(EntityKind::Aggregate, Operation::SumBalance).with_param("scope", scope.as_str())
    }

    /// Net worth series over `[start, end]`.
    pub fn net_worth_series(
        scope: AccountScope,
        start: NaiveDate,
        end: NaiveDate,
        granularity: Granularity,
    ) -> Self {
        Self::new(EntityKind::Aggregate, Operation::NetWorthSeries)
            .with_param("scope", scope.as_str())
            .with_param("start", start)
            .with_param("end", end)
            .with_param("granularity", granularity.as_str())
    }

    /// A registered custom computation.
    pub fn custom(entity_kind: EntityKind, name: impl Into<String>) -> Self {
        Self::new(entity_kind, Operation::Custom).with_param("name", name.into())
    }

    /// Add or replace a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Evaluate as of a date instead of "now".
    pub fn as_of(self, date: NaiveDate) -> Self {
        self.with_param("asOf", date)
    }

    pub fn entity_kind(&self) -> EntityKind {
        self.entity_kind
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn params(&self) -> &BTreeMap<String, Scalar> {
        &self.params
    }

    /// Get a parameter.
    pub fn param(&self, name: &str) -> Option<&Scalar> {
        self.params.get(name)
    }

    /// Validate against the parameter table and produce a typed query.
    pub fn resolve(&self) -> Result<ResolvedQuery> {
        if !self.operation.accepts(self.entity_kind) {
            return Err(EngineError::InvalidDescriptor(format!(
                "{} does not apply to {}",
                self.operation,
                self.entity_kind.as_str()
            )));
        }

        for required in self.operation.required_params() {
            if !self.params.contains_key(*required) {
                return Err(EngineError::InvalidDescriptor(format!(
                    "{} requires parameter `{}`",
                    self.operation, required
                )));
            }
        }

        let query = match self.operation {
            Operation::Balance => ResolvedQuery::Balance {
                account: self.string_param("accountId")?,
                as_of: self.optional_date("asOf")?,
            },
            Operation::SumBalance => ResolvedQuery::SumBalance {
                scope: self.scope_param()?,
                as_of: self.optional_date("asOf")?,
            },
            Operation::NetWorthSeries => {
                let start = self.date_param("start")?;
                let end = self.date_param("end")?;
                if start > end {
                    return Err(EngineError::InvalidRange { start, end });
                }
                let granularity = match self.params.get("granularity") {
                    None => Granularity::Month,
                    Some(_) => {
                        let raw = self.string_param("granularity")?;
                        Granularity::parse(&raw).ok_or_else(|| {
                            EngineError::InvalidDescriptor(format!("unknown granularity `{}`", raw))
                        })?
                    }
                };
                let scope = if self.params.contains_key("scope") {
                    self.scope_param()?
                } else {
                    AccountScope::All
                };
                ResolvedQuery::NetWorthSeries {
                    scope,
                    start,
                    end,
                    granularity,
                }
            }
            Operation::Custom => ResolvedQuery::Custom {
                name: self.string_param("name")?,
                params: self.params.clone(),
            },
        };

        Ok(query)
    }

    /// Parameters with operation defaults filled in.
    fn normalized_params(&self) -> BTreeMap<String, Scalar> {
        let mut params = self.params.clone();
        if self.operation == Operation::NetWorthSeries {
            params
                .entry("scope".to_string())
                .or_insert_with(|| AccountScope::All.as_str().into());
            params
                .entry("granularity".to_string())
                .or_insert_with(|| Granularity::Month.as_str().into());
        }
        params
    }

    fn string_param(&self, name: &str) -> Result<String> {
        match self.params.get(name) {
            Some(Scalar::Str(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Scalar::Str(_)) => Err(EngineError::InvalidDescriptor(format!(
                "parameter `{}` must not be empty",
                name
            ))),
            Some(other) => Err(type_error(name, "string", other)),
            None => Err(EngineError::InvalidDescriptor(format!("missing parameter `{}`", name))),
        }
    }

    fn date_param(&self, name: &str) -> Result<NaiveDate> {
        match self.params.get(name) {
            Some(Scalar::Date(d)) => Ok(*d),
            Some(other) => Err(type_error(name, "date", other)),
            None => Err(EngineError::InvalidDescriptor(format!("missing parameter `{}`", name))),
        }
    }

    fn optional_date(&self, name: &str) -> Result<Option<NaiveDate>> {
        match self.params.get(name) {
            None => Ok(None),
            Some(_) => self.date_param(name).map(Some),
        }
    }

    fn scope_param(&self) -> Result<AccountScope> {
        let raw = self.string_param("scope")?;
        AccountScope::parse(&raw)
            .ok_or_else(|| EngineError::InvalidDescriptor(format!("unknown account scope `{}`", raw)))
    }
}

fn type_error(name: &str, expected: &str, actual: &Scalar) -> EngineError {
    EngineError::InvalidDescriptor(format!(
        "parameter `{}` must be a {}, got {}",
        name,
        expected,
        actual.type_name()
    ))
}

/// Validated, typed form of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedQuery {
    Balance {
        account: AccountId,
        as_of: Option<NaiveDate>,
    },
    SumBalance {
        scope: AccountScope,
        as_of: Option<NaiveDate>,
    },
    NetWorthSeries {
        scope: AccountScope,
        start: NaiveDate,
        end: NaiveDate,
        granularity: Granularity,
    },
    Custom {
        name: String,
        params: BTreeMap<String, Scalar>,
    },
}

/// Canonical, order-independent cache identity of a descriptor.
///
/// Format: `kind/operation?name=type:value&...` with parameters sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    fn from_parts(kind: EntityKind, operation: Operation, params: &BTreeMap<String, Scalar>) -> Self {
        let encoded: Vec<String> = params
            .iter()
            .map(|(name, value)| format!("{}={}", escape(name), value.encode()))
            .collect();
        Self(format!("{}/{}?{}", kind.as_str(), operation.as_str(), encoded.join("&")))
    }

    /// The canonical string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short hash for log fields (first 8 bytes of SHA-256, hex encoded).
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let hash = hasher.finalize();
        hex::encode(&hash[..8])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic cache key for a descriptor.
///
/// Fails with `InvalidDescriptor` (or `InvalidRange` for inverted series
/// bounds) when the descriptor does not satisfy its operation's table.
pub fn canonicalize(descriptor: &QueryDescriptor) -> Result<CacheKey> {
    descriptor.resolve()?;
    Ok(CacheKey::from_parts(
        descriptor.entity_kind,
        descriptor.operation,
        &descriptor.normalized_params(),
    ))
}
