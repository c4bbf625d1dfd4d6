//! Ad-exchange revenue reports: create a report definition, run it as a
//! long-running operation, then page through the result rows.

use adrep_core::{group_key, ExchangeRecord};
use adrep_storage::{HttpFetcher, Page, PollStatus};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::{json_f64, json_str, json_u64, AdapterError};

const API: &str = "exchange";

pub const EXCHANGE_DIMENSIONS: [&str; 8] = [
    "DATE",
    "COUNTRY_NAME",
    "AD_UNIT_NAME_ALL_LEVEL",
    "BROWSER_NAME",
    "CUSTOM_DIMENSION_0_VALUE",
    "CUSTOM_DIMENSION_1_VALUE",
    "AD_UNIT_ID",
    "AD_UNIT_NAME",
];

pub const EXCHANGE_METRICS: [&str; 8] = [
    "AD_EXCHANGE_REVENUE",
    "AD_EXCHANGE_CLICKS",
    "AD_EXCHANGE_IMPRESSIONS",
    "AD_EXCHANGE_AVERAGE_ECPM",
    "AD_EXCHANGE_CTR",
    "AD_EXCHANGE_ACTIVE_VIEW_VIEWABLE_IMPRESSIONS",
    "AD_REQUESTS",
    "AD_SERVER_REVENUE",
];

mod dim {
    pub const DATE: usize = 0;
    pub const COUNTRY_NAME: usize = 1;
    pub const AD_UNIT_NAME_ALL_LEVEL: usize = 2;
    pub const BROWSER_NAME: usize = 3;
    pub const SOURCE: usize = 4;
    pub const CAMPAIGN: usize = 5;
}

mod metric {
    pub const AD_EXCHANGE_REVENUE: usize = 0;
    pub const CLICKS: usize = 1;
    pub const IMPRESSIONS: usize = 2;
    pub const VIEWABLE_IMPRESSIONS: usize = 5;
    pub const AD_REQUESTS: usize = 6;
    pub const AD_SERVER_REVENUE: usize = 7;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeReportRequest {
    /// The single day the report covers.
    pub covered_date: NaiveDate,
    /// Deterministic name used to find a previously created definition.
    pub display_name: String,
    pub custom_dimension_key_ids: Vec<i64>,
}

#[async_trait]
pub trait ExchangeReportApi: Send + Sync {
    /// Id of an existing report definition with this display name, if any.
    async fn find_report(&self, display_name: &str) -> Result<Option<String>, AdapterError>;
    async fn create_report(&self, request: &ExchangeReportRequest) -> Result<String, AdapterError>;
    /// Start a run and return the operation handle to poll.
    async fn run_report(&self, report_id: &str) -> Result<String, AdapterError>;
    /// `Ready(result_id)` once the operation is done.
    async fn poll_operation(&self, operation: &str) -> Result<PollStatus<String>, AdapterError>;
    async fn fetch_rows_page(
        &self,
        report_id: &str,
        result_id: &str,
        page_size: u32,
        page_token: Option<String>,
    ) -> Result<Page<JsonValue, String>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct AdManagerClient {
    http: HttpFetcher,
    base_url: String,
    network_code: String,
    access_token: String,
}

impl AdManagerClient {
    pub fn new(
        http: HttpFetcher,
        base_url: impl Into<String>,
        network_code: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            network_code: network_code.into(),
            access_token: access_token.into(),
        }
    }

    fn reports_url(&self) -> String {
        format!("{}/networks/{}/reports", self.base_url, self.network_code)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportResource {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListReportsResponse {
    #[serde(default)]
    reports: Vec<ReportResource>,
}

#[derive(Debug, Deserialize)]
struct OperationHandle {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<JsonValue>,
    #[serde(default)]
    response: Option<OperationResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    #[serde(default)]
    report_result: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchRowsResponse {
    #[serde(default)]
    rows: Vec<JsonValue>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Last path segment of a resource name such as `networks/1/reports/42`.
fn resource_id(name: &str) -> Option<&str> {
    name.rsplit('/').next().filter(|id| !id.is_empty())
}

/// `networks/1/reports/42/results/99` -> `99`.
fn result_id_from(report_result: &str) -> Option<&str> {
    report_result
        .split_once("results/")
        .map(|(_, rest)| rest.trim_matches('/'))
        .filter(|id| !id.is_empty())
}

fn date_json(date: NaiveDate) -> JsonValue {
    json!({ "year": date.year(), "month": date.month(), "day": date.day() })
}

pub(crate) fn report_definition(request: &ExchangeReportRequest) -> JsonValue {
    json!({
        "visibility": "HIDDEN",
        "displayName": request.display_name,
        "reportDefinition": {
            "customDimensionKeyIds": request.custom_dimension_key_ids,
            "dimensions": EXCHANGE_DIMENSIONS,
            "metrics": EXCHANGE_METRICS,
            "dateRange": {
                "fixed": {
                    "startDate": date_json(request.covered_date),
                    "endDate": date_json(request.covered_date),
                }
            },
            "filters": [],
            "reportType": "HISTORICAL",
            "timePeriodColumn": "TIME_PERIOD_COLUMN_DATE",
        },
    })
}

#[async_trait]
impl ExchangeReportApi for AdManagerClient {
    async fn find_report(&self, display_name: &str) -> Result<Option<String>, AdapterError> {
        let filter = format!("displayName = \"{display_name}\"");
        let listed: ListReportsResponse = self
            .http
            .get_json(&self.reports_url(), &[("filter", filter)], Some(&self.access_token))
            .await?;
        let found = listed
            .reports
            .iter()
            .find(|r| r.display_name.as_deref() == Some(display_name))
            .and_then(|r| resource_id(&r.name))
            .map(str::to_string);
        debug!(display_name, found = ?found, "looked up existing exchange report");
        Ok(found)
    }

    async fn create_report(&self, request: &ExchangeReportRequest) -> Result<String, AdapterError> {
        info!(
            display_name = %request.display_name,
            covered = %request.covered_date,
            "creating exchange report"
        );
        let body = report_definition(request);
        let created: ReportResource = self
            .http
            .post_json(&self.reports_url(), &body, Some(&self.access_token))
            .await?;
        resource_id(&created.name)
            .map(str::to_string)
            .ok_or_else(|| {
                AdapterError::unexpected(API, format!("report name `{}` has no id", created.name))
            })
    }

    async fn run_report(&self, report_id: &str) -> Result<String, AdapterError> {
        let url = format!("{}/{report_id}:run", self.reports_url());
        let handle: OperationHandle = self
            .http
            .post_json(&url, &json!({}), Some(&self.access_token))
            .await?;
        info!(report_id, operation = %handle.name, "exchange report run started");
        Ok(handle.name)
    }

    async fn poll_operation(&self, operation: &str) -> Result<PollStatus<String>, AdapterError> {
        let url = format!("{}/{}", self.base_url, operation.trim_start_matches('/'));
        let op: Operation = self.http.get_json(&url, &[], Some(&self.access_token)).await?;
        if !op.done {
            return Ok(PollStatus::Pending);
        }
        if let Some(error) = op.error {
            return Ok(PollStatus::Failed(error.to_string()));
        }
        let report_result = op
            .response
            .and_then(|r| r.report_result)
            .ok_or_else(|| {
                AdapterError::unexpected(API, "finished operation without reportResult")
            })?;
        result_id_from(&report_result)
            .map(|id| PollStatus::Ready(id.to_string()))
            .ok_or_else(|| {
                AdapterError::unexpected(
                    API,
                    format!("cannot read result id from `{report_result}`"),
                )
            })
    }

    async fn fetch_rows_page(
        &self,
        report_id: &str,
        result_id: &str,
        page_size: u32,
        page_token: Option<String>,
    ) -> Result<Page<JsonValue, String>, AdapterError> {
        let url = format!("{}/{report_id}/results/{result_id}:fetchRows", self.reports_url());
        let mut query = vec![("pageSize", page_size.to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        let page: FetchRowsResponse = self
            .http
            .get_json(&url, &query, Some(&self.access_token))
            .await?;
        Ok(Page {
            rows: page.rows,
            next: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

/// Map one positional result row into an [`ExchangeRecord`].
pub fn parse_exchange_row(row: &JsonValue) -> ExchangeRecord {
    let empty = Vec::new();
    let dims = row
        .get("dimensionValues")
        .and_then(JsonValue::as_array)
        .unwrap_or(&empty);
    let metrics = row
        .pointer("/metricValueGroups/0/primaryValues")
        .and_then(JsonValue::as_array)
        .unwrap_or(&empty);

    let dim_str = |idx: usize| json_str(dims.get(idx).and_then(|d| d.get("stringValue")));
    let metric_int = |idx: usize| json_u64(metrics.get(idx).and_then(|m| m.get("intValue")));
    let metric_double = |idx: usize| json_f64(metrics.get(idx).and_then(|m| m.get("doubleValue")));

    ExchangeRecord {
        date: dim_str(dim::DATE).unwrap_or_default().to_string(),
        country_name: group_key(dim_str(dim::COUNTRY_NAME)),
        ad_unit_name: group_key(dim_str(dim::AD_UNIT_NAME_ALL_LEVEL)),
        browser_name: group_key(dim_str(dim::BROWSER_NAME)),
        source: group_key(dim_str(dim::SOURCE)),
        campaign: group_key(dim_str(dim::CAMPAIGN)),
        ad_exchange_revenue: metric_double(metric::AD_EXCHANGE_REVENUE),
        ad_server_revenue: metric_double(metric::AD_SERVER_REVENUE),
        clicks: metric_int(metric::CLICKS),
        impressions: metric_int(metric::IMPRESSIONS),
        viewable_impressions: metric_int(metric::VIEWABLE_IMPRESSIONS),
        ad_requests: metric_int(metric::AD_REQUESTS),
    }
}
