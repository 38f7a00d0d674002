//! Net worth report.
//!
//! Reads the widget's saved time frame, composes the series through the
//! [`RangeAggregator`] and keeps a `lastNetWorth` snapshot in the widget meta.

use chrono::{DateTime, NaiveDate, Utc};
use ledger_bindings::period::parse_period_date;
use ledger_bindings::{AccountScope, Cents, Granularity, PeriodKey, RangeAggregator, RangeSeries, TimeFrame, TimeFrameMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::widget::{StoreError, WidgetMeta, WidgetRecord, WidgetStore};

/// Widget meta key holding the last computed report.
pub const LAST_NET_WORTH_KEY: &str = "lastNetWorth";

/// Title used when the widget has no name.
pub const DEFAULT_TITLE: &str = "Net Worth";

/// Months covered when a widget has no saved time frame.
pub const DEFAULT_WINDOW_MONTHS: u32 = 6;

/// Time frame as stored in widget meta: `YYYY-MM` strings plus a mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTimeFrame {
    pub start: String,
    pub end: String,
    pub mode: TimeFrameMode,
}

impl StoredTimeFrame {
    /// `None` when either bound does not parse.
    pub fn to_time_frame(&self) -> Option<TimeFrame> {
        Some(TimeFrame {
            start: parse_period_date(&self.start)?,
            end: parse_period_date(&self.end)?,
            mode: self.mode,
        })
    }
}

impl From<&TimeFrame> for StoredTimeFrame {
    fn from(frame: &TimeFrame) -> Self {
        Self {
            start: frame.start.format("%Y-%m").to_string(),
            end: frame.end.format("%Y-%m").to_string(),
            mode: frame.mode,
        }
    }
}

/// The net worth widget's own meta keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetWorthWidgetMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame: Option<StoredTimeFrame>,
}

impl NetWorthWidgetMeta {
    pub fn from_widget(widget: &WidgetRecord) -> Self {
        Self {
            name: widget.meta_value("name"),
            time_frame: widget.meta_value("timeFrame"),
        }
    }

    pub fn title(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(DEFAULT_TITLE)
    }

    /// The saved time frame, or a sliding window over the last six months.
    pub fn time_frame(&self, today: NaiveDate) -> TimeFrame {
        match self.time_frame.as_ref().map(|f| (f, f.to_time_frame())) {
            Some((_, Some(frame))) => frame,
            Some((stored, None)) => {
                warn!(start = %stored.start, end = %stored.end, "ignoring unparsable time frame");
                TimeFrame::trailing_months(today, DEFAULT_WINDOW_MONTHS)
            }
            None => TimeFrame::trailing_months(today, DEFAULT_WINDOW_MONTHS),
        }
    }
}

/// Save a widget's time frame, keeping its other meta keys.
pub async fn save_time_frame(store: &dyn WidgetStore, widget_id: &str, frame: &TimeFrame) -> Result<(), StoreError> {
    let mut meta = WidgetMeta::new();
    meta.insert("timeFrame".to_string(), serde_json::to_value(StoredTimeFrame::from(frame))?);
    store.update(widget_id, meta).await?;
    Ok(())
}

/// Rename a widget. An empty name resets it to the default title.
pub async fn rename_widget(store: &dyn WidgetStore, widget_id: &str, name: &str) -> Result<(), StoreError> {
    let name = if name.is_empty() { DEFAULT_TITLE } else { name };
    let mut meta = WidgetMeta::new();
    meta.insert("name".to_string(), serde_json::Value::String(name.to_string()));
    store.update(widget_id, meta).await?;
    Ok(())
}

/// One graph point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPoint {
    /// Period label, e.g. `2024-03`
    pub label: String,
    /// Last day of the period
    pub date: NaiveDate,
    pub value: Cents,
}

/// A computed net worth report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetWorthReport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: Granularity,
    /// Value of the last period
    pub net_worth: Cents,
    /// Last period minus first period
    pub total_change: Cents,
    pub points: Vec<GraphPoint>,
    /// Periods that could not be computed (value is last-good or zero)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<PeriodKey>,
    pub computed_at: DateTime<Utc>,
}

impl NetWorthReport {
    pub fn from_series(series: &RangeSeries, start: NaiveDate, end: NaiveDate, granularity: Granularity) -> Self {
        Self {
            start,
            end,
            granularity,
            net_worth: series.net_worth(),
            total_change: series.total_change(),
            points: series
                .points
                .iter()
                .map(|p| GraphPoint {
                    label: p.period.to_string(),
                    date: p.period.end_date(),
                    value: p.value,
                })
                .collect(),
            failed: series.failed.clone(),
            computed_at: Utc::now(),
        }
    }

    /// Compose the all-accounts series for `[start, end]` and wait for it.
    ///
    /// The series handle is released afterwards; its period bindings stay
    /// warm for the cache's grace period.
    pub async fn generate(
        aggregator: &RangeAggregator,
        start: NaiveDate,
        end: NaiveDate,
        granularity: Granularity,
    ) -> ledger_bindings::Result<Self> {
        let handle = aggregator.get_series(AccountScope::All, start, end, granularity)?;
        let series = handle.ready().await;
        if let Err(err) = handle.release() {
            warn!(error = %err, "failed to release net worth series");
        }
        let series = series?;
        debug!(periods = series.len(), complete = series.is_complete(), "net worth series ready");
        Ok(Self::from_series(&series, start, end, granularity))
    }

    /// Store this report under `lastNetWorth`.
    pub async fn persist_snapshot(&self, store: &dyn WidgetStore, widget_id: &str) -> Result<(), StoreError> {
        let mut meta = WidgetMeta::new();
        meta.insert(LAST_NET_WORTH_KEY.to_string(), serde_json::to_value(self)?);
        store.update(widget_id, meta).await?;
        Ok(())
    }

    /// The stored report of a widget, if any.
    pub async fn load_snapshot(store: &dyn WidgetStore, widget_id: &str) -> Result<Option<Self>, StoreError> {
        Ok(store.get(widget_id).await?.and_then(|w| w.meta_value(LAST_NET_WORTH_KEY)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::widget::MemoryWidgetStore;
    use ledger_bindings::ledger::{Account, InMemoryLedger, Transaction};
    use ledger_bindings::{BindingCache, EngineConfig, LedgerFacade, SeriesPoint};
    use serde_json::json;
    use std::sync::Arc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn month(y: i32, m: u32) -> PeriodKey {
        PeriodKey::containing(date(y, m, 1), Granularity::Month)
    }

    #[test]
    fn test_default_time_frame_is_six_month_window() {
        let meta = NetWorthWidgetMeta::default();
        let frame = meta.time_frame(date(2024, 6, 18));

        assert_eq!(frame.mode, TimeFrameMode::SlidingWindow);
        assert_eq!(frame.start, date(2024, 1, 1));
        assert_eq!(frame.end, date(2024, 6, 1));
        assert_eq!(meta.title(), "Net Worth");
    }

    #[test]
    fn test_meta_from_widget() {
        let widget = WidgetRecord::new("nw", "net-worth-card")
            .with_meta("name", json!("Family"))
            .with_meta("timeFrame", json!({"start": "2023-01", "end": "2023-12", "mode": "static"}));
        let meta = NetWorthWidgetMeta::from_widget(&widget);

        assert_eq!(meta.title(), "Family");
        let frame = meta.time_frame(date(2024, 6, 18));
        assert_eq!(frame.resolve(date(2024, 6, 18), None), (date(2023, 1, 1), date(2023, 12, 1)));
    }

    #[test]
    fn test_unparsable_time_frame_falls_back() {
        let widget = WidgetRecord::new("nw", "net-worth-card")
            .with_meta("timeFrame", json!({"start": "soon", "end": "2023-12", "mode": "static"}));
        let frame = NetWorthWidgetMeta::from_widget(&widget).time_frame(date(2024, 6, 18));
        assert_eq!(frame.mode, TimeFrameMode::SlidingWindow);
    }

    #[test]
    fn test_report_from_series() {
        let series = RangeSeries {
            points: vec![
                SeriesPoint { period: month(2024, 1), value: Cents(10_000) },
                SeriesPoint { period: month(2024, 2), value: Cents(7_500) },
            ],
            failed: vec![month(2024, 2)],
        };
        let report = NetWorthReport::from_series(&series, date(2024, 1, 1), date(2024, 2, 1), Granularity::Month);

        assert_eq!(report.net_worth, Cents(7_500));
        assert_eq!(report.total_change, Cents(-2_500));
        assert_eq!(report.points[1].label, "2024-02");
        assert_eq!(report.points[1].date, date(2024, 2, 29));
        assert_eq!(report.failed, vec![month(2024, 2)]);
    }

    #[tokio::test]
    async fn test_save_time_frame_and_rename_keep_other_keys() {
        let store = MemoryWidgetStore::with_widgets([
            WidgetRecord::new("nw", "net-worth-card").with_meta("conditions", json!([]))
        ]);
        let frame = TimeFrame {
            start: date(2024, 1, 1),
            end: date(2024, 3, 1),
            mode: TimeFrameMode::Static,
        };

        save_time_frame(&store, "nw", &frame).await.unwrap();
        rename_widget(&store, "nw", "").await.unwrap();

        let widget = store.get("nw").await.unwrap().unwrap();
        assert_eq!(widget.meta["timeFrame"], json!({"start": "2024-01", "end": "2024-03", "mode": "static"}));
        assert_eq!(widget.meta["name"], json!("Net Worth"));
        assert_eq!(widget.meta["conditions"], json!([]));
    }

    #[tokio::test]
    async fn test_generate_and_snapshot() {
        let ledger = Arc::new(InMemoryLedger::with_data(
            vec![
                Account::new("checking", "Checking"),
                Account::new("house", "House").off_budget(),
            ],
            vec![
                Transaction::new("t1", "checking", date(2024, 1, 10), Cents(50_000)),
                Transaction::new("t2", "house", date(2024, 2, 1), Cents(20_000_000)),
                Transaction::new("t3", "checking", date(2024, 3, 5), Cents(-10_000)),
            ],
        ));
        let facade: Arc<dyn LedgerFacade> = ledger.clone();
        let aggregator = RangeAggregator::new(BindingCache::new(facade, EngineConfig::default()));

        let report = NetWorthReport::generate(&aggregator, date(2024, 1, 1), date(2024, 3, 1), Granularity::Month)
            .await
            .unwrap();

        let values: Vec<_> = report.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![Cents(50_000), Cents(20_050_000), Cents(20_040_000)]);
        assert_eq!(report.net_worth, Cents(20_040_000));
        assert_eq!(report.total_change, Cents(19_990_000));

        let store = MemoryWidgetStore::with_widgets([WidgetRecord::new("nw", "net-worth-card")]);
        assert_eq!(NetWorthReport::load_snapshot(&store, "nw").await.unwrap(), None);
        report.persist_snapshot(&store, "nw").await.unwrap();
        assert_eq!(NetWorthReport::load_snapshot(&store, "nw").await.unwrap(), Some(report));
    }

    #[tokio::test]
    async fn test_generate_rejects_inverted_range() {
        let facade: Arc<dyn LedgerFacade> = Arc::new(InMemoryLedger::new());
        let aggregator = RangeAggregator::new(BindingCache::new(facade, EngineConfig::default()));

        let err = NetWorthReport::generate(&aggregator, date(2024, 3, 1), date(2024, 1, 1), Granularity::Month)
            .await
            .unwrap_err();
        assert!(matches!(err, ledger_bindings::EngineError::InvalidRange { .. }));
    }
}
