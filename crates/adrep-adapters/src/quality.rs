//! Traffic-quality reports. Two raw feeds ("request" and "response") are
//! generated asynchronously by the API and downloaded as a zipped CSV.

use std::io::{Cursor, Read};

use adrep_core::{group_key, QualityRecord, TrafficVerdict};
use adrep_storage::{HttpFetcher, PollStatus};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{json_str, AdapterError};

const API: &str = "quality";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityFeed {
    Request,
    Response,
}

impl QualityFeed {
    pub const ALL: [QualityFeed; 2] = [QualityFeed::Request, QualityFeed::Response];

    pub fn api_type(self) -> &'static str {
        match self {
            QualityFeed::Request => "request",
            QualityFeed::Response => "response",
        }
    }

    fn title(self) -> &'static str {
        match self {
            QualityFeed::Request => "Request",
            QualityFeed::Response => "Response",
        }
    }

    /// Checkpoint slot holding the created report id. Also the readiness flag name.
    pub fn report_slot(self) -> &'static str {
        self.api_type()
    }

    pub fn metadata_slot(self) -> &'static str {
        match self {
            QualityFeed::Request => "requestMetadata",
            QualityFeed::Response => "responseMetadata",
        }
    }

    pub fn standard_columns(self) -> &'static [&'static str] {
        match self {
            QualityFeed::Request => &["source", "campaign"],
            QualityFeed::Response => &[
                "source",
                "campaign",
                "result",
                "rule_sets",
                "invalid_traffic_type",
                "ad_blocker",
                "page",
            ],
        }
    }

    /// Deterministic report name; the same window always yields the same name.
    pub fn report_name(self, hours: u32, start: u32, end: u32, suffix: &str) -> String {
        format!("Quality {} Report Last{hours}Hours {start}-{end} {suffix}", self.title())
            .trim_end()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityReportRequest {
    pub feed: QualityFeed,
    pub start: u32,
    pub end: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QualityReportListing {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub status: String,
}

/// An existing `Ready` report of this feed type and exact name.
pub fn find_ready_report(
    listings: &[QualityReportListing],
    feed: QualityFeed,
    name: &str,
) -> Option<String> {
    listings
        .iter()
        .find(|r| r.status == "Ready" && r.name == name && r.kind == feed.api_type())
        .map(|r| r.id.clone())
}

/// Readiness of `report_id` within a listing. Unknown ids are still pending.
pub fn report_status(listings: &[QualityReportListing], report_id: &str) -> PollStatus<()> {
    match listings.iter().find(|r| r.id == report_id) {
        Some(r) if r.status == "Ready" => PollStatus::Ready(()),
        Some(r) if r.status == "Failed" => {
            PollStatus::Failed(format!("report {report_id} failed to generate"))
        }
        Some(r) => {
            debug!(report_id, status = %r.status, "quality report not ready");
            PollStatus::Pending
        }
        None => {
            debug!(report_id, listed = listings.len(), "quality report not listed yet");
            PollStatus::Pending
        }
    }
}

#[async_trait]
pub trait QualityReportApi: Send + Sync {
    async fn list_reports(&self) -> Result<Vec<QualityReportListing>, AdapterError>;
    async fn create_report(&self, request: &QualityReportRequest) -> Result<String, AdapterError>;
    /// Resolve the metadata id used to download a ready report.
    async fn report_metadata(&self, report_id: &str) -> Result<String, AdapterError>;
    /// Raw rows of a report, one JSON object per row.
    async fn download(&self, metadata_id: &str) -> Result<Vec<JsonValue>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct QualityApiClient {
    http: HttpFetcher,
    base_url: String,
    token: String,
    instance_id: u64,
}

impl QualityApiClient {
    pub fn new(
        http: HttpFetcher,
        base_url: impl Into<String>,
        token: impl Into<String>,
        instance_id: u64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            instance_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableResponse {
    table: TableRows,
}

#[derive(Debug, Deserialize)]
struct TableRows {
    #[serde(default)]
    rows: Vec<QualityReportListing>,
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    url: String,
}

#[async_trait]
impl QualityReportApi for QualityApiClient {
    async fn list_reports(&self) -> Result<Vec<QualityReportListing>, AdapterError> {
        let url = format!("{}/raw/table", self.base_url);
        let table: TableResponse = self
            .http
            .post_json(&url, &json!({ "token": self.token }), None)
            .await?;
        debug!(reports = table.table.rows.len(), "listed quality reports");
        Ok(table.table.rows)
    }

    async fn create_report(&self, request: &QualityReportRequest) -> Result<String, AdapterError> {
        let url = format!("{}/raw/request", self.base_url);
        let body = json!({
            "token": self.token,
            "instance": self.instance_id,
            "type": request.feed.api_type(),
            "start": request.start,
            "end": request.end,
            "standard": request.feed.standard_columns(),
            "name": request.name,
            "send_email": false,
        });
        info!(feed = request.feed.api_type(), name = %request.name, "creating quality report");
        let created: CreateResponse = self.http.post_json(&url, &body, None).await?;
        created.id.filter(|id| !id.is_empty()).ok_or_else(|| {
            AdapterError::unexpected(
                API,
                format!(
                    "{} report not created: {}",
                    request.feed.api_type(),
                    created.message.unwrap_or_default()
                ),
            )
        })
    }

    async fn report_metadata(&self, report_id: &str) -> Result<String, AdapterError> {
        let url = format!("{}/raw/report", self.base_url);
        let metadata: MetadataResponse = self
            .http
            .post_json(&url, &json!({ "token": self.token, "raw": report_id }), None)
            .await?;
        Ok(metadata.id)
    }

    async fn download(&self, metadata_id: &str) -> Result<Vec<JsonValue>, AdapterError> {
        let url = format!("{}/raw/download/{metadata_id}", self.base_url);
        let link: DownloadResponse = self
            .http
            .post_json(&url, &json!({ "token": self.token, "raw": metadata_id }), None)
            .await?;
        let file_url = percent_decode_str(&link.url)
            .decode_utf8()
            .map_err(|e| AdapterError::unexpected(API, format!("download url is not utf-8: {e}")))?
            .into_owned();
        let bytes = self.http.get_bytes(&file_url).await?;
        let rows = decode_archive(&bytes)?;
        info!(metadata_id, rows = rows.len(), bytes = bytes.len(), "downloaded quality report");
        Ok(rows)
    }
}

/// Rows from a downloaded report body: the first `.csv` of a ZIP archive, or a JSON array.
pub fn decode_archive(bytes: &[u8]) -> Result<Vec<JsonValue>, AdapterError> {
    if bytes.starts_with(ZIP_MAGIC) {
        let csv_text = first_csv_in_zip(bytes)?;
        return csv_rows(&csv_text);
    }
    let parsed: JsonValue = serde_json::from_slice(bytes)
        .map_err(|e| AdapterError::Archive(format!("body is neither zip nor json: {e}")))?;
    match parsed {
        JsonValue::Array(rows) => Ok(rows),
        other => Err(AdapterError::Archive(format!(
            "expected a json array of rows, got {}",
            json_kind(&other)
        ))),
    }
}

fn first_csv_in_zip(bytes: &[u8]) -> Result<String, AdapterError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| AdapterError::Archive(e.to_string()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| AdapterError::Archive(e.to_string()))?;
        if !entry.is_file() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let name = entry.name().to_string();
        debug!(entry = %name, size = entry.size(), "extracting csv from archive");
        let mut raw = Vec::new();
        entry
            .read_to_end(&mut raw)
            .map_err(|e| AdapterError::Archive(format!("reading {name}: {e}")))?;
        return Ok(match String::from_utf8(raw) {
            Ok(text) => text,
            Err(err) => {
                warn!(entry = %name, "csv is not valid utf-8; replacing invalid bytes");
                String::from_utf8_lossy(err.as_bytes()).into_owned()
            }
        });
    }
    Err(AdapterError::Archive("no csv file found in zip".to_string()))
}

fn csv_rows(text: &str) -> Result<Vec<JsonValue>, AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| AdapterError::Archive(format!("csv headers: {e}")))?
        .clone();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(line = line + 2, error = %err, "skipping unreadable csv row");
                continue;
            }
        };
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        let object: Map<String, JsonValue> = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.to_string(), JsonValue::String(value.to_string())))
            .collect();
        rows.push(JsonValue::Object(object));
    }
    Ok(rows)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn field<'a>(row: &'a JsonValue, name: &str) -> Option<&'a str> {
    json_str(row.get(name)).or_else(|| json_str(row.get(name.to_ascii_lowercase())))
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DD HH:MM:SS[.fff]` (read as UTC).
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn parse_quality_row(row: &JsonValue) -> QualityRecord {
    QualityRecord {
        timestamp: field(row, "TIMESTAMP").and_then(parse_timestamp),
        source: group_key(field(row, "SOURCE")),
        campaign: group_key(field(row, "CAMPAIGN")),
        verdict: field(row, "RESULT")
            .filter(|v| !v.trim().is_empty())
            .map(TrafficVerdict::parse),
    }
}
