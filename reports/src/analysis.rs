//! AI financial analysis report.
//!
//! Gathers balances through the binding cache, asks the configured LLM for an
//! HTML write-up and stores the result in the widget's `lastAnalysis` meta
//! key so the dashboard can show it without asking again.
//!
//! ```text
//! accounts ──► BindingCache (Balance ×N, SumBalance all/onBudget)
//!                    │ resolve
//!                    ▼
//!              FinancialData ──► prompt ──► LlmBackend ──► strip fences
//!                                                              │
//!                         WidgetStore.update(lastAnalysis) ◄───┘
//! ```

use chrono::{DateTime, Utc};
use ledger_bindings::ledger::Account;
use ledger_bindings::{AccountScope, BindingCache, BindingHandle, Cents, EngineError, QueryDescriptor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{CompletionRequest, LlmBackend, LlmError};
use crate::config::LlmConfig;
use crate::widget::{StoreError, WidgetMeta, WidgetStore};

/// Widget meta key holding the last analysis.
pub const LAST_ANALYSIS_KEY: &str = "lastAnalysis";

/// Errors from the analysis report.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// LLM analysis is switched off in the settings
    #[error("LLM analysis is disabled")]
    Disabled,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A balance binding produced something other than an amount
    #[error("Unexpected value for {0}")]
    UnexpectedValue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One account as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub name: String,
    #[serde(rename = "offbudget")]
    pub off_budget: bool,
    pub closed: bool,
    /// Balance in major units
    pub balance: f64,
}

/// Balances the analysis is based on. Amounts are in major units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialData {
    pub accounts: Vec<AccountSummary>,
    pub total_balance: f64,
    pub on_budget_balance: f64,
    pub off_budget_balance: f64,
}

impl FinancialData {
    fn new(accounts: Vec<AccountSummary>, total: Cents, on_budget: Cents) -> Self {
        Self {
            accounts,
            total_balance: total.to_major(),
            on_budget_balance: on_budget.to_major(),
            off_budget_balance: (total - on_budget).to_major(),
        }
    }

    /// The headline numbers kept with a stored analysis.
    pub fn summary(&self) -> FinancialSummary {
        FinancialSummary {
            total_balance: self.total_balance,
            on_budget_balance: self.on_budget_balance,
            off_budget_balance: self.off_budget_balance,
            account_count: self.accounts.len(),
        }
    }
}

/// Headline numbers stored with an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialSummary {
    pub total_balance: f64,
    pub on_budget_balance: f64,
    pub off_budget_balance: f64,
    pub account_count: usize,
}

/// A stored analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// HTML produced by the model
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Numbers the analysis was based on
    pub financial_data: FinancialSummary,
}

impl AnalysisResult {
    /// Whether the ledger moved since this analysis was made.
    pub fn is_stale(&self, current: &FinancialSummary) -> bool {
        self.financial_data != *current
    }
}

/// Build the analysis prompt.
pub fn build_prompt(data: &FinancialData) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(data)?;
    Ok(format!(
        "Analyze the following financial data and provide insights:\n\
         {json}\n\
         \n\
         Please provide a detailed analysis of the financial health and any recommendations.\n\
         If there are any issues, please highlight them in a red color.\n\
         If there are any savings opportunities, please highlight them in a green color.\n\
         If there are any areas that are performing well, please highlight them in a blue color.\n\
         \n\
         Remember the user already has access to the financial data, so don't repeat it.\n\
         Your main goal is to help the user understand their financial data and make decisions \
         to improve their financial health.\n\
         \n\
         Return the analysis in HTML format; your response should be only the HTML.\n"
    ))
}

/// Remove a leading ```` ```html ```` and a trailing ```` ``` ```` fence.
pub fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```html")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let without_close = without_open.strip_suffix("```").unwrap_or(without_open);
    without_close.trim().to_string()
}

/// Runs AI analyses for dashboard widgets.
pub struct AnalysisService {
    cache: BindingCache,
    backend: Arc<dyn LlmBackend>,
    store: Arc<dyn WidgetStore>,
}

impl AnalysisService {
    pub fn new(cache: BindingCache, backend: Arc<dyn LlmBackend>, store: Arc<dyn WidgetStore>) -> Self {
        Self { cache, backend, store }
    }

    /// Build the service from saved LLM settings.
    pub fn from_config(
        cache: BindingCache,
        config: &LlmConfig,
        store: Arc<dyn WidgetStore>,
    ) -> Result<Self, AnalysisError> {
        if !config.enabled {
            return Err(AnalysisError::Disabled);
        }
        Ok(Self::new(cache, config.backend()?, store))
    }

    pub fn backend(&self) -> &Arc<dyn LlmBackend> {
        &self.backend
    }

    /// Resolve current balances for `accounts` and the aggregates.
    ///
    /// Bindings are held only for the duration of the call; a live dashboard
    /// holding the same queries shares them.
    pub async fn gather(&self, accounts: &[Account]) -> Result<FinancialData, AnalysisError> {
        let mut handles = Vec::with_capacity(accounts.len() + 2);
        let acquired = self.acquire_all(accounts, &mut handles);
        let resolved = match acquired {
            Ok(()) => self.resolve_amounts(&handles).await,
            Err(err) => Err(err),
        };

        for handle in handles {
            if let Err(err) = self.cache.release(handle) {
                warn!(error = %err, "failed to release analysis binding");
            }
        }

        let amounts = resolved?;
        let (total, on_budget) = (amounts[0], amounts[1]);
        let summaries = accounts
            .iter()
            .zip(&amounts[2..])
            .map(|(account, balance)| AccountSummary {
                name: account.name.clone(),
                off_budget: !account.on_budget,
                closed: account.closed,
                balance: balance.to_major(),
            })
            .collect();

        Ok(FinancialData::new(summaries, total, on_budget))
    }

    fn acquire_all(&self, accounts: &[Account], handles: &mut Vec<BindingHandle>) -> Result<(), AnalysisError> {
        handles.push(self.cache.acquire(&QueryDescriptor::sum_balance(AccountScope::All))?);
        handles.push(self.cache.acquire(&QueryDescriptor::sum_balance(AccountScope::OnBudget))?);
        for account in accounts {
            handles.push(self.cache.acquire(&QueryDescriptor::balance(account.id.clone()))?);
        }
        Ok(())
    }

    async fn resolve_amounts(&self, handles: &[BindingHandle]) -> Result<Vec<Cents>, AnalysisError> {
        let mut amounts = Vec::with_capacity(handles.len());
        for handle in handles {
            let value = self.cache.resolve(handle).await?;
            let amount = value
                .as_amount()
                .ok_or_else(|| AnalysisError::UnexpectedValue(handle.key().to_string()))?;
            amounts.push(amount);
        }
        Ok(amounts)
    }

    /// Run an analysis for a widget and store it under `lastAnalysis`.
    pub async fn analyze(&self, widget_id: &str, accounts: &[Account]) -> Result<AnalysisResult, AnalysisError> {
        if self.store.get(widget_id).await?.is_none() {
            return Err(StoreError::NotFound(widget_id.to_string()).into());
        }

        let data = self.gather(accounts).await?;
        let prompt = build_prompt(&data)?;
        debug!(widget_id, accounts = data.accounts.len(), model = self.backend.id(), "requesting analysis");

        let response = self.backend.complete(CompletionRequest::user(prompt)).await?;

        let result = AnalysisResult {
            content: strip_code_fences(&response.content),
            timestamp: Utc::now(),
            financial_data: data.summary(),
        };

        let mut meta = WidgetMeta::new();
        meta.insert(LAST_ANALYSIS_KEY.to_string(), serde_json::to_value(&result)?);
        self.store.update(widget_id, meta).await?;

        info!(widget_id, tokens = response.usage.total(), "stored analysis");
        Ok(result)
    }

    /// The stored analysis of a widget, if any.
    pub async fn last_analysis(&self, widget_id: &str) -> Result<Option<AnalysisResult>, AnalysisError> {
        let widget = self.store.get(widget_id).await?;
        Ok(widget.and_then(|w| w.meta_value(LAST_ANALYSIS_KEY)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::widget::{MemoryWidgetStore, WidgetRecord};
    use chrono::NaiveDate;
    use ledger_bindings::ledger::{InMemoryLedger, Transaction};
    use ledger_bindings::{EngineConfig, LedgerFacade};
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ledger() -> Arc<InMemoryLedger> {
        Arc::new(InMemoryLedger::with_data(
            vec![
                Account::new("checking", "Checking").with_opening_balance(Cents(150_000), None),
                Account::new("savings", "Savings").with_opening_balance(Cents(500_000), None),
                Account::new("car", "Car loan").off_budget().with_opening_balance(Cents(-800_000), None),
            ],
            vec![Transaction::new("t1", "checking", date(2024, 3, 1), Cents(-25_050))],
        ))
    }

    fn cache(ledger: &Arc<InMemoryLedger>) -> BindingCache {
        let facade: Arc<dyn LedgerFacade> = ledger.clone();
        BindingCache::new(facade, EngineConfig::default())
    }

    fn store() -> Arc<MemoryWidgetStore> {
        Arc::new(MemoryWidgetStore::with_widgets([
            WidgetRecord::new("ai-1", "ai-analysis-card").with_meta("name", json!("Insights"))
        ]))
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```html\n<p>hi</p>\n```"), "<p>hi</p>");
        assert_eq!(strip_code_fences("```\n<p>hi</p>```"), "<p>hi</p>");
        assert_eq!(strip_code_fences("<p>plain</p>"), "<p>plain</p>");
    }

    #[test]
    fn test_prompt_embeds_json() {
        let data = FinancialData::new(
            vec![AccountSummary {
                name: "Checking".into(),
                off_budget: false,
                closed: false,
                balance: 1249.5,
            }],
            Cents(124_950),
            Cents(124_950),
        );
        let prompt = build_prompt(&data).unwrap();
        assert!(prompt.contains(r#""offbudget":false"#));
        assert!(prompt.contains(r#""totalBalance":1249.5"#));
        assert!(prompt.contains("only the HTML"));
    }

    #[tokio::test]
    async fn test_gather_balances() {
        let ledger = ledger();
        let cache = cache(&ledger);
        let service = AnalysisService::new(cache.clone(), Arc::new(MockBackend::default()), store());

        let data = service.gather(&ledger.accounts()).await.unwrap();

        assert_eq!(data.total_balance, -1750.5);
        assert_eq!(data.on_budget_balance, 6249.5);
        assert_eq!(data.off_budget_balance, -8000.0);
        let car = data.accounts.iter().find(|a| a.name == "Car loan").unwrap();
        assert!(car.off_budget);
        assert_eq!(car.balance, -8000.0);
        // Handles are released after gathering; the binding stays warm for reuse.
        let again = cache.acquire(&QueryDescriptor::balance("checking")).unwrap();
        assert_eq!(cache.snapshot(&again).unwrap().holders, 1);
        assert_eq!(cache.peek(&again).and_then(|v| v.as_amount()), Some(Cents(124_950)));
    }

    #[tokio::test]
    async fn test_analyze_persists_last_analysis() {
        let ledger = ledger();
        let backend = Arc::new(MockBackend::new("gpt-4").with_response("```html\n<p style=\"color: green\">Save more</p>\n```"));
        let store = store();
        let service = AnalysisService::new(cache(&ledger), backend.clone(), store.clone());

        let result = service.analyze("ai-1", &ledger.accounts()).await.unwrap();

        assert_eq!(result.content, "<p style=\"color: green\">Save more</p>");
        assert_eq!(result.financial_data.account_count, 3);
        assert!(backend.last_request().unwrap().user_text().contains("Car loan"));

        let widget = store.get("ai-1").await.unwrap().unwrap();
        assert_eq!(widget.meta["name"], json!("Insights"));
        assert_eq!(service.last_analysis("ai-1").await.unwrap(), Some(result.clone()));
        assert!(!result.is_stale(&service.gather(&ledger.accounts()).await.unwrap().summary()));

        ledger
            .add_transaction(Transaction::new("t2", "savings", date(2024, 4, 1), Cents(10_000)))
            .unwrap();
        let current = service.gather(&ledger.accounts()).await.unwrap().summary();
        assert!(result.is_stale(&current));
    }

    #[tokio::test]
    async fn test_analyze_unknown_widget_skips_llm() {
        let ledger = ledger();
        let backend = Arc::new(MockBackend::default());
        let service = AnalysisService::new(cache(&ledger), backend.clone(), store());

        let err = service.analyze("missing", &ledger.accounts()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Store(StoreError::NotFound(_))));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_previous_analysis() {
        let ledger = ledger();
        let backend = Arc::new(MockBackend::default().with_failure(LlmError::Api {
            status: 500,
            message: "overloaded".into(),
        }));
        let store = store();
        let service = AnalysisService::new(cache(&ledger), backend, store.clone());

        assert!(matches!(
            service.analyze("ai-1", &ledger.accounts()).await,
            Err(AnalysisError::Llm(LlmError::Api { status: 500, .. }))
        ));
        assert_eq!(service.last_analysis("ai-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disabled_config() {
        let ledger = ledger();
        let config = LlmConfig::default();
        assert!(matches!(
            AnalysisService::from_config(cache(&ledger), &config, store()),
            Err(AnalysisError::Disabled)
        ));
    }
}
