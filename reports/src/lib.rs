//! Ledger Reports - Dashboard Reports over the Binding Cache
//!
//! Report widgets read ledger values through `ledger-bindings` and persist
//! their settings and snapshots in a widget store:
//!
//! - **AI analysis**: balances are gathered through the cache, sent to an
//!   LLM and the HTML answer is stored as `lastAnalysis`
//! - **Net worth**: a ranged series composed from per-period bindings,
//!   following the widget's saved time frame
//! - **LLM settings**: provider config saved as a preference, and
//!   connection testing
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │ AnalysisService  │────►│   LlmBackend     │     │   WidgetStore    │
//! │ NetWorthReport   │     │ (OpenAI / mock)  │     │ (memory / JSON)  │
//! └────────┬─────────┘     └──────────────────┘     └────────▲─────────┘
//!          │ acquire / resolve / get_series                   │ meta merge
//!          ▼                                                  │
//! ┌──────────────────────────────┐                            │
//! │ BindingCache / RangeAggregator│───── snapshots ───────────┘
//! └──────────────────────────────┘
//! ```

pub mod analysis;
pub mod backend;
pub mod config;
pub mod net_worth;
pub mod preferences;
pub mod widget;

pub use analysis::{AnalysisError, AnalysisResult, AnalysisService, FinancialData, FinancialSummary};
pub use backend::{LlmBackend, LlmError, MockBackend, OpenAiBackend};
pub use config::{load_llm_config, save_llm_config, test_connection, ConnectionTestResult, LlmConfig, LlmProvider};
pub use net_worth::{NetWorthReport, NetWorthWidgetMeta};
pub use preferences::{JsonFilePreferenceStore, MemoryPreferenceStore, PreferenceStore};
pub use widget::{JsonFileWidgetStore, MemoryWidgetStore, StoreError, WidgetRecord, WidgetStore};
