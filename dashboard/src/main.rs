//! ledger-dashboard: Report widgets over a ledger snapshot
//!
//! Loads a JSON ledger export into the in-memory ledger, serves report
//! queries through the binding cache and keeps widget settings and
//! snapshots in a JSON widget store:
//! - Account balances as of any date
//! - Net worth series following a widget's saved time frame
//! - AI financial analysis through the configured LLM
//!
//! LLM settings saved with `llm-config` live in the preference store and
//! take precedence over the `[llm]` table of the config file.

mod config;
mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ledger_bindings::ledger::InMemoryLedger;
use ledger_bindings::period::{parse_period_date, selectable_months};
use ledger_bindings::{BindingCache, Granularity, LedgerFacade, QueryDescriptor, RangeAggregator, TimeFrame};
use ledger_reports::net_worth::{DEFAULT_TITLE, DEFAULT_WINDOW_MONTHS};
use ledger_reports::widget::JsonFileWidgetStore;
use ledger_reports::{
    load_llm_config, save_llm_config, test_connection, AnalysisService, JsonFilePreferenceStore, LlmConfig,
    LlmProvider, NetWorthReport, NetWorthWidgetMeta, WidgetRecord, WidgetStore,
};

use config::Config;
use snapshot::LedgerSnapshot;

#[derive(Parser)]
#[command(name = "ledger-dashboard")]
#[command(about = "Report widgets over a ledger snapshot")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ledger-dashboard.toml", env = "LEDGER_DASHBOARD_CONFIG")]
    config: PathBuf,

    /// Ledger snapshot (overrides config file)
    #[arg(long, env = "LEDGER_SNAPSHOT")]
    ledger: Option<PathBuf>,

    /// Widget store (overrides config file)
    #[arg(long, env = "LEDGER_WIDGETS")]
    widgets: Option<PathBuf>,

    /// Preference store (overrides config file)
    #[arg(long, env = "LEDGER_PREFERENCES")]
    preferences: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show an account balance
    Balance {
        /// Account id
        #[arg(short, long)]
        account: String,
        /// Balance at the end of this day (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        as_of: Option<NaiveDate>,
    },

    /// Show the net worth series
    NetWorth {
        /// First period (YYYY-MM)
        #[arg(long, value_parser = parse_date)]
        start: Option<NaiveDate>,
        /// Last period (YYYY-MM)
        #[arg(long, value_parser = parse_date)]
        end: Option<NaiveDate>,
        /// Period width: day, month or year
        #[arg(short, long, default_value = "month", value_parser = parse_granularity)]
        granularity: Granularity,
        /// Read the time frame from, and store the snapshot in, this widget
        #[arg(short, long)]
        widget: Option<String>,
    },

    /// Run an AI analysis for a widget
    Analyze {
        #[arg(short, long)]
        widget: String,
    },

    /// Test the configured LLM connection and record a successful test
    TestLlm,

    /// Show the LLM settings, or save new ones when any option is given
    LlmConfig {
        /// openai, anthropic, custom or ollama
        #[arg(short, long, value_parser = parse_provider)]
        provider: Option<LlmProvider>,
        /// API key
        #[arg(long, env = "LEDGER_LLM_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        /// Model name
        #[arg(short, long)]
        model: Option<String>,
        /// API base URL
        #[arg(long)]
        base_url: Option<String>,
        /// Turn analysis off
        #[arg(long, conflicts_with = "enable")]
        disable: bool,
        /// Turn analysis on
        #[arg(long)]
        enable: bool,
    },

    /// List the months a report range can cover
    Months,

    /// Add a widget to the store and print its id
    AddWidget {
        /// Widget type, e.g. net-worth-card
        #[arg(short = 't', long = "type")]
        widget_type: String,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    parse_period_date(s).ok_or_else(|| format!("invalid date: {}", s))
}

fn parse_provider(s: &str) -> Result<LlmProvider, String> {
    match s.to_ascii_lowercase().as_str() {
        "openai" => Ok(LlmProvider::OpenAi),
        "anthropic" => Ok(LlmProvider::Anthropic),
        "custom" => Ok(LlmProvider::Custom),
        "ollama" => Ok(LlmProvider::Ollama),
        _ => Err(format!("invalid provider: {} (openai, anthropic, custom or ollama)", s)),
    }
}

fn parse_granularity(s: &str) -> Result<Granularity, String> {
    Granularity::parse(s).ok_or_else(|| format!("invalid granularity: {} (day, month or year)", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ledger_dashboard=info".parse()?)
                .add_directive("ledger_bindings=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(ledger) = cli.ledger {
        config.paths.ledger = ledger;
    }
    if let Some(widgets) = cli.widgets {
        config.paths.widgets = widgets;
    }
    if let Some(preferences) = cli.preferences {
        config.paths.preferences = preferences;
    }

    let today = Local::now().date_naive();

    match cli.command {
        Commands::Balance { account, as_of } => balance(&config, account, as_of).await,
        Commands::NetWorth {
            start,
            end,
            granularity,
            widget,
        } => net_worth(&config, start, end, granularity, widget, today).await,
        Commands::Analyze { widget } => analyze(&config, widget).await,
        Commands::TestLlm => test_llm(&config).await,
        Commands::LlmConfig {
            provider,
            api_key,
            model,
            base_url,
            disable,
            enable,
        } => {
            let prefs = JsonFilePreferenceStore::open(&config.paths.preferences).await?;
            let mut llm = effective_llm_config(&config, &prefs).await?;
            let changed = provider.is_some()
                || api_key.is_some()
                || model.is_some()
                || base_url.is_some()
                || disable
                || enable;
            if changed {
                if let Some(provider) = provider {
                    llm.provider = provider;
                }
                if let Some(api_key) = api_key {
                    llm.api_key = api_key;
                }
                if let Some(model) = model {
                    llm.model = Some(model);
                }
                if let Some(base_url) = base_url {
                    llm.base_url = Some(base_url);
                }
                if disable {
                    llm.enabled = false;
                }
                if enable {
                    llm.enabled = true;
                }
                // Settings changed, so an earlier test no longer applies
                llm.last_tested = None;
                save_llm_config(&prefs, &llm).await?;
            }
            print_llm_config(&llm);
            Ok(())
        }
        Commands::Months => {
            let ledger = LedgerSnapshot::load(&config.paths.ledger)?.into_ledger();
            let earliest = ledger.earliest_activity().await?;
            for month in selectable_months(earliest, today) {
                println!("{} {}", month, month.start.format("%B, %Y"));
            }
            Ok(())
        }
        Commands::AddWidget { widget_type, name } => {
            let store = JsonFileWidgetStore::open(&config.paths.widgets).await?;
            let mut widget = WidgetRecord::create(widget_type);
            if let Some(name) = name {
                widget = widget.with_meta("name", serde_json::Value::String(name));
            }
            let id = widget.id.clone();
            store.insert(widget).await?;
            println!("{}", id);
            Ok(())
        }
    }
}

/// Saved LLM settings, falling back to the config file.
async fn effective_llm_config(config: &Config, prefs: &JsonFilePreferenceStore) -> anyhow::Result<LlmConfig> {
    Ok(load_llm_config(prefs).await?.unwrap_or_else(|| config.llm.clone()))
}

fn print_llm_config(llm: &LlmConfig) {
    println!("provider:    {}", llm.provider);
    println!("model:       {}", llm.model());
    println!("base url:    {}", llm.base_url().unwrap_or("(none)"));
    println!("api key:     {}", mask_key(&llm.api_key));
    println!("enabled:     {}", llm.enabled);
    match llm.last_tested {
        Some(at) => println!("last tested: {}", at.to_rfc3339()),
        None => println!("last tested: never"),
    }
}

fn mask_key(key: &str) -> String {
    let count = key.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let tail: String = key.chars().skip(count - 4).collect();
    format!("{}{}", "*".repeat(count - 4), tail)
}

async fn test_llm(config: &Config) -> anyhow::Result<()> {
    let prefs = JsonFilePreferenceStore::open(&config.paths.preferences).await?;
    let mut llm = effective_llm_config(config, &prefs).await?;
    let result = test_connection(Some(&llm)).await;
    println!("{}", result.message);
    if !result.success {
        std::process::exit(1);
    }
    llm.record_test(&result);
    save_llm_config(&prefs, &llm).await?;
    info!(path = %prefs.path().display(), "recorded LLM connection test");
    Ok(())
}

/// Load the ledger snapshot and start a binding cache over it.
fn open_engine(config: &Config) -> anyhow::Result<(Arc<InMemoryLedger>, BindingCache)> {
    let ledger = Arc::new(LedgerSnapshot::load(&config.paths.ledger)?.into_ledger());
    let facade: Arc<dyn LedgerFacade> = ledger.clone();
    let cache = BindingCache::new(facade, config.engine.clone());
    Ok((ledger, cache))
}

async fn balance(config: &Config, account: String, as_of: Option<NaiveDate>) -> anyhow::Result<()> {
    let (_ledger, cache) = open_engine(config)?;

    let mut descriptor = QueryDescriptor::balance(account.clone());
    if let Some(as_of) = as_of {
        descriptor = descriptor.as_of(as_of);
    }
    let handle = cache.acquire(&descriptor)?;
    let value = cache.resolve(&handle).await;
    cache.release(handle)?;
    cache.shutdown();

    println!("{}: {}", account, value?);
    Ok(())
}

async fn net_worth(
    config: &Config,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    granularity: Granularity,
    widget: Option<String>,
    today: NaiveDate,
) -> anyhow::Result<()> {
    let (ledger, cache) = open_engine(config)?;
    let store = JsonFileWidgetStore::open(&config.paths.widgets).await?;
    let earliest = ledger.earliest_activity().await?;

    let (frame, title) = match &widget {
        Some(id) => {
            let record = store
                .get(id)
                .await?
                .with_context(|| format!("widget {} not found", id))?;
            let meta = NetWorthWidgetMeta::from_widget(&record);
            (meta.time_frame(today), meta.title().to_string())
        }
        None => (
            TimeFrame::trailing_months(today, DEFAULT_WINDOW_MONTHS),
            DEFAULT_TITLE.to_string(),
        ),
    };
    let (default_start, default_end) = frame.resolve(today, earliest);
    let start = start.unwrap_or(default_start);
    let end = end.unwrap_or(default_end);

    let aggregator = RangeAggregator::new(cache.clone());
    let report = NetWorthReport::generate(&aggregator, start, end, granularity).await;
    cache.shutdown();
    let report = report?;

    println!("{}", title);
    for point in &report.points {
        println!("  {:<10} {:>14}", point.label, point.value.to_string());
    }
    println!("Net worth:    {}", report.net_worth);
    println!("Total change: {}", report.total_change);
    if !report.failed.is_empty() {
        warn!(periods = report.failed.len(), "some periods could not be computed");
    }

    if let Some(id) = widget {
        report.persist_snapshot(&store, &id).await?;
        info!(widget = %id, "stored net worth snapshot");
    }
    Ok(())
}

async fn analyze(config: &Config, widget: String) -> anyhow::Result<()> {
    let (ledger, cache) = open_engine(config)?;
    let store: Arc<dyn WidgetStore> = Arc::new(JsonFileWidgetStore::open(&config.paths.widgets).await?);
    let prefs = JsonFilePreferenceStore::open(&config.paths.preferences).await?;
    let llm = effective_llm_config(config, &prefs).await?;
    let service = AnalysisService::from_config(cache.clone(), &llm, store)?;
    let accounts = ledger.accounts();

    if let Some(previous) = service.last_analysis(&widget).await? {
        let current = service.gather(&accounts).await?.summary();
        if !previous.is_stale(&current) {
            info!(widget = %widget, at = %previous.timestamp, "ledger unchanged since last analysis");
        }
    }

    let result = service.analyze(&widget, &accounts).await;
    cache.shutdown();
    println!("{}", result?.content);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key_keeps_last_four() {
        assert_eq!(mask_key("sk-abcdef1234"), "*********1234");
        assert_eq!(mask_key("abc"), "***");
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn test_parse_provider() {
        assert_eq!(parse_provider("Ollama"), Ok(LlmProvider::Ollama));
        assert_eq!(parse_provider("openai"), Ok(LlmProvider::OpenAi));
        assert!(parse_provider("gemini").is_err());
    }

    #[tokio::test]
    async fn test_saved_llm_config_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            llm: LlmConfig::new(LlmProvider::OpenAi, "sk-file"),
            ..Default::default()
        };
        let prefs = JsonFilePreferenceStore::open(dir.path().join("preferences.json")).await.unwrap();

        assert_eq!(effective_llm_config(&config, &prefs).await.unwrap(), config.llm);

        let saved = LlmConfig::new(LlmProvider::Ollama, "").with_model("llama3.1");
        save_llm_config(&prefs, &saved).await.unwrap();
        assert_eq!(effective_llm_config(&config, &prefs).await.unwrap(), saved);
    }
}
