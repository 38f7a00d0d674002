//! Period buckets and report time frames.
//!
//! Ranged reports are decomposed into fixed windows (days, months, years) so
//! each window can be cached on its own and shared between reports whose
//! ranges overlap.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a period bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Month,
    Year,
}

impl Granularity {
    /// Parameter spelling used in descriptors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    /// Parse the descriptor spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Granularity::Day),
            "month" => Some(Granularity::Month),
            "year" => Some(Granularity::Year),
            _ => None,
        }
    }
}

impl Default for Granularity {
    fn default() -> Self {
        Self::Month
    }
}

/// A single period bucket, identified by its granularity and first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodKey {
    /// Bucket width
    pub granularity: Granularity,
    /// First day of the bucket
    pub start: NaiveDate,
}

impl PeriodKey {
    /// The bucket of the given width that contains `date`.
    pub fn containing(date: NaiveDate, granularity: Granularity) -> Self {
        let start = match granularity {
            Granularity::Day => Some(date),
            Granularity::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1),
            Granularity::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        };
        Self {
            granularity,
            start: start.unwrap_or(date),
        }
    }

    /// The following bucket.
    pub fn next(&self) -> Self {
        let start = match self.granularity {
            Granularity::Day => self.start.checked_add_days(Days::new(1)),
            Granularity::Month => self.start.checked_add_months(Months::new(1)),
            Granularity::Year => self.start.checked_add_months(Months::new(12)),
        };
        Self {
            granularity: self.granularity,
            start: start.unwrap_or(NaiveDate::MAX),
        }
    }

    /// Last day of the bucket (inclusive).
    pub fn end_date(&self) -> NaiveDate {
        self.next()
            .start
            .checked_sub_days(Days::new(1))
            .unwrap_or(self.start)
    }

    /// Whether `date` falls inside the bucket.
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end_date()
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.granularity {
            Granularity::Day => write!(f, "{}", self.start.format("%Y-%m-%d")),
            Granularity::Month => write!(f, "{}", self.start.format("%Y-%m")),
            Granularity::Year => write!(f, "{}", self.start.format("%Y")),
        }
    }
}

/// Every bucket from the one containing `start` to the one containing `end`.
///
/// Returns an empty list when `start > end`.
pub fn periods_between(start: NaiveDate, end: NaiveDate, granularity: Granularity) -> Vec<PeriodKey> {
    let mut periods = Vec::new();
    if start > end {
        return periods;
    }

    let last = PeriodKey::containing(end, granularity);
    let mut current = PeriodKey::containing(start, granularity);
    while current <= last {
        periods.push(current);
        let next = current.next();
        if next.start == NaiveDate::MAX {
            break;
        }
        current = next;
    }
    periods
}

/// Parse `YYYY-MM-DD`, `YYYY-MM` (first of month) or `YYYY` (first of year).
pub fn parse_period_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d") {
        return Some(date);
    }
    s.parse::<i32>()
        .ok()
        .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1))
}

/// Number of whole months from the month of `from` to the month of `to`.
fn months_between(from: NaiveDate, to: NaiveDate) -> i32 {
    (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32
}

/// How a saved report range follows the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeFrameMode {
    /// Fixed start and end
    Static,
    /// Same length, always ending at the current month
    SlidingWindow,
    /// From the earliest ledger activity to the current month
    Full,
}

/// Saved date range of a report widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFrame {
    /// Range start
    pub start: NaiveDate,
    /// Range end
    pub end: NaiveDate,
    /// Calendar behavior
    pub mode: TimeFrameMode,
}

impl TimeFrame {
    /// Sliding window of `months` months ending in the month of `today`.
    pub fn trailing_months(today: NaiveDate, months: u32) -> Self {
        let end = PeriodKey::containing(today, Granularity::Month).start;
        let start = end
            .checked_sub_months(Months::new(months.saturating_sub(1)))
            .unwrap_or(end);
        Self {
            start,
            end,
            mode: TimeFrameMode::SlidingWindow,
        }
    }

    /// Concrete `(start, end)` for the current calendar.
    pub fn resolve(&self, today: NaiveDate, earliest: Option<NaiveDate>) -> (NaiveDate, NaiveDate) {
        match self.mode {
            TimeFrameMode::Static => (self.start, self.end),
            TimeFrameMode::SlidingWindow => {
                let length = months_between(self.start, self.end).max(0) as u32;
                let end = PeriodKey::containing(today, Granularity::Month).start;
                let start = end.checked_sub_months(Months::new(length)).unwrap_or(end);
                (start, end)
            }
            TimeFrameMode::Full => {
                let end = PeriodKey::containing(today, Granularity::Month).start;
                let start = earliest
                    .map(|d| PeriodKey::containing(d, Granularity::Month).start)
                    .unwrap_or(end)
                    .min(end);
                (start, end)
            }
        }
    }
}

/// Months offered by a report's range picker, newest first.
///
/// Always covers at least the last twelve months, even for a young ledger.
pub fn selectable_months(earliest: Option<NaiveDate>, today: NaiveDate) -> Vec<PeriodKey> {
    let current = PeriodKey::containing(today, Granularity::Month).start;
    let year_ago = current.checked_sub_months(Months::new(12)).unwrap_or(current);
    let first = earliest
        .map(|d| PeriodKey::containing(d, Granularity::Month).start)
        .unwrap_or(current)
        .min(year_ago);

    let mut months = periods_between(first, current, Granularity::Month);
    months.reverse();
    months
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_month_bucket_bounds() {
        let feb = PeriodKey::containing(date(2024, 2, 17), Granularity::Month);
        assert_eq!(feb.start, date(2024, 2, 1));
        assert_eq!(feb.end_date(), date(2024, 2, 29));
        assert_eq!(feb.next().start, date(2024, 3, 1));
        assert!(feb.contains(date(2024, 2, 29)));
        assert!(!feb.contains(date(2024, 3, 1)));
        assert_eq!(feb.to_string(), "2024-02");
    }

    #[test]
    fn test_year_and_day_buckets() {
        let year = PeriodKey::containing(date(2023, 7, 4), Granularity::Year);
        assert_eq!(year.start, date(2023, 1, 1));
        assert_eq!(year.end_date(), date(2023, 12, 31));
        assert_eq!(year.to_string(), "2023");

        let day = PeriodKey::containing(date(2023, 12, 31), Granularity::Day);
        assert_eq!(day.end_date(), date(2023, 12, 31));
        assert_eq!(day.next().start, date(2024, 1, 1));
    }

    #[test]
    fn test_periods_between() {
        let months = periods_between(date(2023, 11, 15), date(2024, 2, 3), Granularity::Month);
        let labels: Vec<String> = months.iter().map(|p| p.to_string()).collect();
        assert_eq!(labels, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);

        assert!(periods_between(date(2024, 2, 1), date(2024, 1, 1), Granularity::Month).is_empty());
    }

    #[test]
    fn test_parse_period_date() {
        assert_eq!(parse_period_date("2024-03"), Some(date(2024, 3, 1)));
        assert_eq!(parse_period_date("2024-03-09"), Some(date(2024, 3, 9)));
        assert_eq!(parse_period_date("2021"), Some(date(2021, 1, 1)));
        assert_eq!(parse_period_date("march"), None);
    }

    #[test]
    fn test_sliding_window_follows_today() {
        let frame = TimeFrame {
            start: date(2023, 1, 1),
            end: date(2023, 6, 1),
            mode: TimeFrameMode::SlidingWindow,
        };
        let (start, end) = frame.resolve(date(2024, 3, 20), None);
        assert_eq!(start, date(2023, 10, 1));
        assert_eq!(end, date(2024, 3, 1));
    }

    #[test]
    fn test_full_and_static_frames() {
        let frame = TimeFrame {
            start: date(2023, 1, 1),
            end: date(2023, 6, 1),
            mode: TimeFrameMode::Full,
        };
        assert_eq!(
            frame.resolve(date(2024, 3, 20), Some(date(2022, 5, 9))),
            (date(2022, 5, 1), date(2024, 3, 1))
        );

        let fixed = TimeFrame { mode: TimeFrameMode::Static, ..frame };
        assert_eq!(fixed.resolve(date(2024, 3, 20), None), (date(2023, 1, 1), date(2023, 6, 1)));
    }

    #[test]
    fn test_selectable_months_covers_a_year() {
        let months = selectable_months(Some(date(2024, 2, 10)), date(2024, 3, 5));
        assert_eq!(months.len(), 13);
        assert_eq!(months.first().unwrap().to_string(), "2024-03");
        assert_eq!(months.last().unwrap().to_string(), "2023-03");

        let long = selectable_months(Some(date(2020, 1, 1)), date(2024, 3, 5));
        assert_eq!(long.last().unwrap().to_string(), "2020-01");
    }
}
