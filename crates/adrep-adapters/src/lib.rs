//! Report API contracts and reqwest-backed clients for the three upstream reporting APIs.

pub mod analytics;
pub mod exchange;
pub mod quality;

use adrep_storage::{ErrorClass, FetchError, PollError};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use analytics::{
    parse_analytics_row, AnalyticsApiClient, AnalyticsReportApi, ANALYTICS_DIMENSIONS,
    ANALYTICS_METRICS,
};
pub use exchange::{
    parse_exchange_row, AdManagerClient, ExchangeReportApi, ExchangeReportRequest,
    EXCHANGE_DIMENSIONS, EXCHANGE_METRICS,
};
pub use quality::{
    decode_archive, find_ready_report, parse_quality_row, report_status, QualityApiClient,
    QualityFeed, QualityReportApi, QualityReportListing, QualityReportRequest,
};

pub const CRATE_NAME: &str = "adrep-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("unexpected {api} response: {message}")]
    UnexpectedResponse { api: &'static str, message: String },
    #[error("report archive: {0}")]
    Archive(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn unexpected(api: &'static str, message: impl Into<String>) -> Self {
        AdapterError::UnexpectedResponse {
            api,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Fetch(err) if err.class() == ErrorClass::Transient)
    }
}

/// Integer metric that may arrive as a JSON number or a numeric string.
pub(crate) fn json_u64(value: Option<&JsonValue>) -> u64 {
    match value {
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(JsonValue::String(s)) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && *f >= 0.0)
                        .map(|f| f as u64)
                })
                .unwrap_or(0)
        }
        _ => 0,
    }
}

pub(crate) fn json_f64(value: Option<&JsonValue>) -> f64 {
    let parsed = match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite()).unwrap_or(0.0)
}

pub(crate) fn json_str(value: Option<&JsonValue>) -> Option<&str> {
    value.and_then(JsonValue::as_str)
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_helpers_accept_strings_and_numbers() {
        assert_eq!(json_u64(Some(&json!("42"))), 42);
        assert_eq!(json_u64(Some(&json!(7))), 7);
        assert_eq!(json_u64(Some(&json!("n/a"))), 0);
        assert_eq!(json_u64(None), 0);
        assert_eq!(json_f64(Some(&json!("1.25"))), 1.25);
        assert_eq!(json_f64(Some(&json!(0.5))), 0.5);
        assert_eq!(json_f64(Some(&json!(null))), 0.0);
    }

    #[test]
    fn only_transient_fetch_errors_are_transient() {
        let err = AdapterError::from(FetchError::HttpStatus {
            status: 502,
            url: "https://reports.example".into(),
            body: String::new(),
        });
        assert!(err.is_transient());
        assert!(!AdapterError::unexpected("exchange", "missing name").is_transient());
    }
}
