//! Web-analytics reports are synchronous; pagination is by row offset.

use adrep_core::{group_key, AnalyticsRecord};
use adrep_storage::HttpFetcher;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{json_f64, json_str, json_u64, AdapterError};

pub const ANALYTICS_DIMENSIONS: [&str; 5] = [
    "date",
    "sessionSource",
    "sessionMedium",
    "sessionCampaignName",
    "sessionCampaignId",
];

pub const ANALYTICS_METRICS: [&str; 7] = [
    "sessions",
    "totalRevenue",
    "eventCount",
    "screenPageViews",
    "engagedSessions",
    "totalUsers",
    "totalAdRevenue",
];

#[async_trait]
pub trait AnalyticsReportApi: Send + Sync {
    /// One page of rows for `date`, starting at `offset`.
    async fn run_report(
        &self,
        date: NaiveDate,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<JsonValue>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct AnalyticsApiClient {
    http: HttpFetcher,
    base_url: String,
    property_id: String,
    access_token: String,
}

impl AnalyticsApiClient {
    pub fn new(
        http: HttpFetcher,
        base_url: impl Into<String>,
        property_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            property_id: property_id.into(),
            access_token: access_token.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunReportResponse {
    #[serde(default)]
    rows: Vec<JsonValue>,
    #[serde(default)]
    row_count: Option<u64>,
}

fn named(names: &[&str]) -> Vec<JsonValue> {
    names.iter().map(|name| json!({ "name": name })).collect()
}

pub(crate) fn run_report_body(date: NaiveDate, limit: u64, offset: u64) -> JsonValue {
    let day = date.format("%Y-%m-%d").to_string();
    json!({
        "dateRanges": [{ "startDate": day, "endDate": day }],
        "dimensions": named(&ANALYTICS_DIMENSIONS),
        "metrics": named(&ANALYTICS_METRICS),
        "limit": limit,
        "offset": offset,
    })
}

#[async_trait]
impl AnalyticsReportApi for AnalyticsApiClient {
    async fn run_report(
        &self,
        date: NaiveDate,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let url = format!("{}/properties/{}:runReport", self.base_url, self.property_id);
        let response: RunReportResponse = self
            .http
            .post_json(&url, &run_report_body(date, limit, offset), Some(&self.access_token))
            .await?;
        debug!(
            %date,
            offset,
            rows = response.rows.len(),
            row_count = ?response.row_count,
            "analytics page fetched"
        );
        Ok(response.rows)
    }
}

pub fn parse_analytics_row(row: &JsonValue) -> AnalyticsRecord {
    let empty = Vec::new();
    let dims = row
        .get("dimensionValues")
        .and_then(JsonValue::as_array)
        .unwrap_or(&empty);
    let metrics = row
        .get("metricValues")
        .and_then(JsonValue::as_array)
        .unwrap_or(&empty);

    let dim = |idx: usize| json_str(dims.get(idx).and_then(|d| d.get("value")));
    let int = |idx: usize| json_u64(metrics.get(idx).and_then(|m| m.get("value")));
    let float = |idx: usize| json_f64(metrics.get(idx).and_then(|m| m.get("value")));

    AnalyticsRecord {
        date: dim(0).unwrap_or_default().to_string(),
        source: group_key(dim(1)),
        medium: group_key(dim(2)),
        campaign_name: group_key(dim(3)),
        campaign_id: group_key(dim(4)),
        sessions: int(0),
        revenue: float(1),
        events: int(2),
        page_views: int(3),
        engaged_sessions: int(4),
        users: int(5),
        ad_revenue: float(6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;
    use adrep_core::NOT_SET;

    #[test]
    fn parses_named_metric_rows() {
        let raw = read_fixture(&["analytics", "run_report.json"]);
        let response: RunReportResponse = serde_json::from_slice(&raw).expect("fixture");
        assert_eq!(response.row_count, Some(2));

        let records: Vec<AnalyticsRecord> = response.rows.iter().map(parse_analytics_row).collect();
        assert_eq!(records[0].source, "google");
        assert_eq!(records[0].medium, "cpc");
        assert_eq!(records[0].sessions, 40);
        assert!((records[0].revenue - 12.5).abs() < 1e-9);
        assert!((records[0].ad_revenue - 3.75).abs() < 1e-9);
        assert_eq!(records[0].users, 38);

        assert_eq!(records[1].source, NOT_SET);
        assert_eq!(records[1].medium, "(none)");
        assert_eq!(records[1].campaign_id, NOT_SET);
    }

    #[test]
    fn request_body_covers_one_day_with_offset() {
        let body = run_report_body(NaiveDate::from_ymd_opt(2025, 7, 13).unwrap(), 250_000, 500_000);
        assert_eq!(body["dateRanges"][0]["startDate"], "2025-07-13");
        assert_eq!(body["dateRanges"][0]["endDate"], "2025-07-13");
        assert_eq!(body["dimensions"][1]["name"], "sessionSource");
        assert_eq!(body["metrics"][6]["name"], "totalAdRevenue");
        assert_eq!(body["offset"], 500_000);
    }
}
