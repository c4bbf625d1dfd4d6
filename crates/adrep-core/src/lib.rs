//! Core report model, checkpoint records and metric helpers for adrep.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "adrep-core";

/// Placeholder used wherever a grouping dimension is empty or absent.
pub const NOT_SET: &str = "(not set)";

/// Normalize a raw grouping value, mapping empty or missing input to [`NOT_SET`].
pub fn group_key(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => NOT_SET.to_string(),
    }
}

/// `numerator / denominator`, or 0 when the result would not be finite.
pub fn safe_rate(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let rate = numerator / denominator;
    if rate.is_finite() {
        rate
    } else {
        0.0
    }
}

/// Same as [`safe_rate`], scaled to a percentage.
pub fn safe_percent(numerator: f64, denominator: f64) -> f64 {
    safe_rate(numerator, denominator) * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Exchange,
    Quality,
    Analytics,
}

impl ReportKind {
    /// Run order used by the top-level driver.
    pub const ALL: [ReportKind; 3] = [
        ReportKind::Exchange,
        ReportKind::Quality,
        ReportKind::Analytics,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ReportKind::Exchange => "exchange",
            ReportKind::Quality => "quality",
            ReportKind::Analytics => "analytics",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exchange" | "adx" => Ok(ReportKind::Exchange),
            "quality" | "anura" => Ok(ReportKind::Quality),
            "analytics" | "ga4" => Ok(ReportKind::Analytics),
            other => Err(format!("unknown report kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    Processing,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointStatus::Processing => "PROCESSING",
            CheckpointStatus::Completed => "COMPLETED",
            CheckpointStatus::Failed => "FAILED",
        }
    }
}

/// Durable per-run progress record, keyed by report date.
///
/// `job_ids` holds the identifiers handed out by a remote reporting API.
/// They act as idempotency tokens: a slot is filled once and never replaced
/// through [`Checkpoint::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub report_key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub job_ids: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ready: BTreeMap<String, bool>,
    #[serde(default)]
    pub status: Option<CheckpointStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(report_key: impl Into<String>) -> Self {
        Self {
            report_key: report_key.into(),
            job_ids: BTreeMap::new(),
            ready: BTreeMap::new(),
            status: None,
            row_count: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// A PROCESSING record with no progress, as written at job start.
    pub fn fresh(report_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut checkpoint = Self::new(report_key);
        checkpoint.status = Some(CheckpointStatus::Processing);
        checkpoint.created_at = Some(now);
        checkpoint.updated_at = Some(now);
        checkpoint
    }

    pub fn job_id(&self, slot: &str) -> Option<&str> {
        self.job_ids
            .get(slot)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn is_ready(&self, slot: &str) -> bool {
        self.ready.get(slot).copied().unwrap_or(false)
    }

    pub fn is_completed(&self) -> bool {
        self.status == Some(CheckpointStatus::Completed)
    }

    /// Field-level upsert of `patch` into this record.
    ///
    /// Returns the job-id slots whose proposed value was dropped because the
    /// slot already held a different id.
    pub fn apply(&mut self, patch: &CheckpointPatch, now: DateTime<Utc>) -> Vec<String> {
        let mut rejected = Vec::new();
        for (slot, id) in &patch.job_ids {
            if id.is_empty() {
                continue;
            }
            match self.job_id(slot) {
                Some(existing) if existing != id => rejected.push(slot.clone()),
                Some(_) => {}
                None => {
                    self.job_ids.insert(slot.clone(), id.clone());
                }
            }
        }
        for (slot, ready) in &patch.ready {
            self.ready.insert(slot.clone(), *ready);
        }
        if let Some(status) = patch.status {
            self.status = Some(status);
        }
        if let Some(row_count) = patch.row_count {
            self.row_count = Some(row_count);
        }
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        self.updated_at = Some(now);
        rejected
    }
}

/// Partial checkpoint update. Unset fields leave the stored record untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointPatch {
    pub job_ids: BTreeMap<String, String>,
    pub ready: BTreeMap<String, bool>,
    pub status: Option<CheckpointStatus>,
    pub row_count: Option<u64>,
}

impl CheckpointPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_id(mut self, slot: &str, id: impl Into<String>) -> Self {
        self.job_ids.insert(slot.to_string(), id.into());
        self
    }

    pub fn ready(mut self, slot: &str, ready: bool) -> Self {
        self.ready.insert(slot.to_string(), ready);
        self
    }

    pub fn status(mut self, status: CheckpointStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn row_count(mut self, row_count: u64) -> Self {
        self.row_count = Some(row_count);
        self
    }
}

/// Normalized exchange-revenue row handed from the exchange adapter to the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub date: String,
    pub country_name: String,
    pub ad_unit_name: String,
    pub browser_name: String,
    pub source: String,
    pub campaign: String,
    pub ad_exchange_revenue: f64,
    pub ad_server_revenue: f64,
    pub clicks: u64,
    pub impressions: u64,
    pub viewable_impressions: u64,
    pub ad_requests: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficVerdict {
    Good,
    Bad,
    Warn,
    Other,
}

impl TrafficVerdict {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "good" => TrafficVerdict::Good,
            "bad" => TrafficVerdict::Bad,
            "warn" => TrafficVerdict::Warn,
            _ => TrafficVerdict::Other,
        }
    }
}

/// One traffic-quality row; `verdict` is only present on response rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub source: String,
    pub campaign: String,
    pub verdict: Option<TrafficVerdict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub date: String,
    pub source: String,
    pub medium: String,
    pub campaign_name: String,
    pub campaign_id: String,
    pub sessions: u64,
    pub revenue: f64,
    pub events: u64,
    pub page_views: u64,
    pub engaged_sessions: u64,
    pub users: u64,
    pub ad_revenue: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 14, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn empty_and_missing_group_keys_use_sentinel() {
        assert_eq!(group_key(None), NOT_SET);
        assert_eq!(group_key(Some("")), NOT_SET);
        assert_eq!(group_key(Some("   ")), NOT_SET);
        assert_eq!(group_key(Some("google")), "google");
    }

    #[test]
    fn zero_denominator_rates_are_zero() {
        assert_eq!(safe_rate(10.0, 0.0), 0.0);
        assert_eq!(safe_rate(0.0, 0.0), 0.0);
        assert_eq!(safe_percent(5.0, 0.0), 0.0);
        assert_eq!(safe_rate(1.0, 4.0), 0.25);
        assert_eq!(safe_percent(1.0, 4.0), 25.0);
    }

    #[test]
    fn job_ids_are_filled_once() {
        let mut checkpoint = Checkpoint::fresh("2025-07-14", ts(1));
        let rejected = checkpoint.apply(&CheckpointPatch::new().job_id("report", "r-1"), ts(2));
        assert!(rejected.is_empty());

        let rejected = checkpoint.apply(
            &CheckpointPatch::new()
                .job_id("report", "r-2")
                .job_id("result", "res-1"),
            ts(3),
        );
        assert_eq!(rejected, vec!["report".to_string()]);
        assert_eq!(checkpoint.job_id("report"), Some("r-1"));
        assert_eq!(checkpoint.job_id("result"), Some("res-1"));
        assert_eq!(checkpoint.created_at, Some(ts(1)));
        assert_eq!(checkpoint.updated_at, Some(ts(3)));
    }

    #[test]
    fn patch_leaves_unset_fields_alone() {
        let mut checkpoint = Checkpoint::fresh("20250712", ts(1));
        checkpoint.apply(&CheckpointPatch::new().ready("request", true), ts(2));
        checkpoint.apply(&CheckpointPatch::new().status(CheckpointStatus::Failed), ts(3));

        assert!(checkpoint.is_ready("request"));
        assert!(!checkpoint.is_ready("response"));
        assert_eq!(checkpoint.status, Some(CheckpointStatus::Failed));
        assert_eq!(checkpoint.row_count, None);
    }

    #[test]
    fn checkpoint_serializes_in_camel_case() {
        let mut checkpoint = Checkpoint::fresh("2025-07-14", ts(1));
        checkpoint.apply(&CheckpointPatch::new().job_id("report", "42"), ts(2));
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["reportKey"], "2025-07-14");
        assert_eq!(json["jobIds"]["report"], "42");
        assert_eq!(json["status"], "PROCESSING");
        assert!(json.get("updatedAt").is_some());
    }

    #[test]
    fn report_kind_parses_short_aliases() {
        assert_eq!("adx".parse::<ReportKind>(), Ok(ReportKind::Exchange));
        assert_eq!("Quality".parse::<ReportKind>(), Ok(ReportKind::Quality));
        assert!("dfp".parse::<ReportKind>().is_err());
    }
}
