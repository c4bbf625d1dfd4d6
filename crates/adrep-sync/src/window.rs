//! Reporting windows and checkpoint keys derived from the run date.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `20250714` for 2025-07-14.
pub fn date_number(date: NaiveDate) -> u32 {
    date.year().max(0) as u32 * 10_000 + date.month() * 100 + date.day()
}

/// Half-open `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UtcWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeWindow {
    pub run_date: NaiveDate,
    /// The day the report covers.
    pub covered_date: NaiveDate,
    pub key: String,
}

impl ExchangeWindow {
    pub fn for_run(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            covered_date: run_date - Duration::days(1),
            key: date_key(run_date),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub start_key: u32,
    pub end_key: u32,
    /// Rows outside this window are not counted.
    pub filter: UtcWindow,
}

impl QualityWindow {
    pub fn for_run(run_date: NaiveDate, tz: Tz) -> Result<Self> {
        let start = run_date - Duration::days(2);
        Ok(Self {
            start,
            end: run_date,
            start_key: date_number(start),
            end_key: date_number(run_date),
            filter: previous_local_day(run_date, tz)?,
        })
    }

    pub fn key(&self) -> String {
        self.start_key.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsWindow {
    pub covered_date: NaiveDate,
    pub key: String,
}

impl AnalyticsWindow {
    pub fn for_run(run_date: NaiveDate) -> Self {
        let covered_date = run_date - Duration::days(1);
        Self {
            covered_date,
            key: date_key(covered_date),
        }
    }
}

/// The local calendar day before `run_date` (seen from midnight UTC) in `tz`, as UTC bounds.
pub fn previous_local_day(run_date: NaiveDate, tz: Tz) -> Result<UtcWindow> {
    let run_start = Utc.from_utc_datetime(&run_date.and_time(chrono::NaiveTime::MIN));
    let local_day = run_start.with_timezone(&tz).date_naive() - Duration::days(1);
    let local_midnight = local_day.and_time(chrono::NaiveTime::MIN);
    let start = tz
        .from_local_datetime(&local_midnight)
        .earliest()
        .ok_or_else(|| anyhow!("midnight of {local_day} does not exist in {tz}"))?
        .with_timezone(&Utc);
    Ok(UtcWindow {
        start,
        end: start + Duration::hours(24),
    })
}

/// Keep the items whose timestamp falls inside `window`; items without one are dropped.
pub fn filter_to_window<T, F>(items: Vec<T>, window: &UtcWindow, timestamp: F) -> (Vec<T>, usize)
where
    F: Fn(&T) -> Option<DateTime<Utc>>,
{
    let before = items.len();
    let kept: Vec<T> = items
        .into_iter()
        .filter(|item| timestamp(item).is_some_and(|at| window.contains(at)))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn exchange_and_analytics_cover_the_previous_day() {
        let exchange = ExchangeWindow::for_run(day(2025, 7, 14));
        assert_eq!(exchange.key, "2025-07-14");
        assert_eq!(exchange.covered_date, day(2025, 7, 13));

        let analytics = AnalyticsWindow::for_run(day(2025, 3, 1));
        assert_eq!(analytics.covered_date, day(2025, 2, 28));
        assert_eq!(analytics.key, "2025-02-28");
    }

    #[test]
    fn quality_window_uses_the_named_timezone() {
        let window =
            QualityWindow::for_run(day(2025, 7, 14), chrono_tz::America::Los_Angeles).unwrap();
        assert_eq!(window.start_key, 20250712);
        assert_eq!(window.end_key, 20250714);
        assert_eq!(window.key(), "20250712");
        assert_eq!(window.filter.start, Utc.with_ymd_and_hms(2025, 7, 12, 7, 0, 0).unwrap());
        assert_eq!(window.filter.end, Utc.with_ymd_and_hms(2025, 7, 13, 7, 0, 0).unwrap());
    }

    #[test]
    fn window_is_half_open() {
        let window = QualityWindow::for_run(day(2025, 7, 14), chrono_tz::America::Los_Angeles)
            .unwrap()
            .filter;
        assert!(window.contains(window.start));
        assert!(!window.contains(window.end));
        assert!(window.contains(window.end - Duration::seconds(1)));
    }

    #[test]
    fn filtering_drops_rows_outside_or_without_time() {
        let window = previous_local_day(day(2025, 7, 14), chrono_tz::UTC).unwrap();
        let rows = vec![
            Some(Utc.with_ymd_and_hms(2025, 7, 13, 0, 0, 0).unwrap()),
            Some(Utc.with_ymd_and_hms(2025, 7, 13, 23, 59, 59).unwrap()),
            Some(Utc.with_ymd_and_hms(2025, 7, 14, 0, 0, 0).unwrap()),
            None,
        ];
        let (kept, dropped) = filter_to_window(rows, &window, |at| *at);
        assert_eq!(kept.len(), 2);
        assert_eq!(dropped, 2);
    }
}
