//! Run configuration, built once at process start and shared by reference.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use adrep_core::ReportKind;
use adrep_storage::{HttpClientConfig, PageLimits, PollPolicy};
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required setting `{0}` is not set")]
    Missing(&'static str),
    #[error("invalid value for `{var}`: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub api_base: String,
    pub network_code: Option<String>,
    pub access_token: Option<String>,
    /// Custom dimension keys for the source and campaign dimensions, in that order.
    pub custom_dimension_key_ids: Vec<i64>,
    pub page_size: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            api_base: "https://admanager.googleapis.com/v1".to_string(),
            network_code: None,
            access_token: None,
            custom_dimension_key_ids: Vec::new(),
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub api_base: String,
    pub api_token: Option<String>,
    pub instance_id: Option<u64>,
    pub report_hours: u32,
    pub report_suffix: String,
    /// IANA zone whose calendar day bounds the counted rows.
    pub timezone: String,
    pub ready_delay_ms: u64,
    pub ready_max_attempts: u32,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.anura.io/v1".to_string(),
            api_token: None,
            instance_id: None,
            report_hours: 24,
            report_suffix: String::new(),
            timezone: "America/Los_Angeles".to_string(),
            ready_delay_ms: 10_000,
            ready_max_attempts: 60,
        }
    }
}

impl QualitySettings {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone.parse::<Tz>().map_err(|err| ConfigError::Invalid {
            var: "QUALITY_TIMEZONE",
            reason: err.to_string(),
        })
    }

    pub fn readiness_policy(&self) -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(self.ready_delay_ms), self.ready_max_attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    pub api_base: String,
    pub property_id: Option<String>,
    pub access_token: Option<String>,
    pub page_size: u64,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            api_base: "https://analyticsdata.googleapis.com/v1beta".to_string(),
            property_id: None,
            access_token: None,
            page_size: 250_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    /// Overrides "today" as the run date.
    pub report_date: Option<NaiveDate>,
    pub force_rerun: bool,
    pub checkpoint_dir: PathBuf,
    pub warehouse_dir: Option<PathBuf>,
    pub dump_dir: PathBuf,
    pub object_store_dir: Option<PathBuf>,
    pub cleanup_local_files: bool,
    pub slack_webhook_url: Option<String>,
    pub reports_dir: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub poll: PollPolicy,
    pub page_ceiling: usize,
    pub page_pause_ms: u64,
    pub exchange: ExchangeSettings,
    pub quality: QualitySettings,
    pub analytics: AnalyticsSettings,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            report_date: None,
            force_rerun: false,
            checkpoint_dir: PathBuf::from("./checkpoints"),
            warehouse_dir: None,
            dump_dir: PathBuf::from("./dumps"),
            object_store_dir: None,
            cleanup_local_files: false,
            slack_webhook_url: None,
            reports_dir: None,
            http_timeout_secs: 20,
            user_agent: "adrep-bot/0.1".to_string(),
            poll: PollPolicy::default(),
            page_ceiling: 100,
            page_pause_ms: 100,
            exchange: ExchangeSettings::default(),
            quality: QualitySettings::default(),
            analytics: AnalyticsSettings::default(),
        }
    }
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(raw) = var("REPORT_DATE") {
            config.report_date = Some(parse_value("REPORT_DATE", &raw)?);
        }
        if let Some(raw) = var("FORCE_RERUN") {
            config.force_rerun = parse_flag(&raw);
        }
        if let Some(dir) = var("CHECKPOINT_DIR") {
            config.checkpoint_dir = PathBuf::from(dir);
        }
        config.warehouse_dir = var("WAREHOUSE_DIR").map(PathBuf::from);
        if let Some(dir) = var("DUMP_DIR") {
            config.dump_dir = PathBuf::from(dir);
        }
        config.object_store_dir = var("OBJECT_STORE_DIR").map(PathBuf::from);
        if let Some(raw) = var("CLEANUP_LOCAL_FILES") {
            config.cleanup_local_files = parse_flag(&raw);
        }
        config.slack_webhook_url = var("SLACK_WEBHOOK_URL");
        config.reports_dir = var("REPORTS_DIR").map(PathBuf::from);
        if let Some(raw) = var("ADREP_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = parse_value("ADREP_HTTP_TIMEOUT_SECS", &raw)?;
        }
        if let Some(agent) = var("ADREP_USER_AGENT") {
            config.user_agent = agent;
        }

        if let Some(raw) = var("POLL_INITIAL_DELAY_MS") {
            config.poll.initial_delay =
                Duration::from_millis(parse_value("POLL_INITIAL_DELAY_MS", &raw)?);
        }
        if let Some(raw) = var("POLL_MULTIPLIER") {
            config.poll.multiplier = parse_value("POLL_MULTIPLIER", &raw)?;
        }
        if let Some(raw) = var("POLL_MAX_DELAY_MS") {
            config.poll.max_delay = Duration::from_millis(parse_value("POLL_MAX_DELAY_MS", &raw)?);
        }
        if let Some(raw) = var("POLL_MAX_ATTEMPTS") {
            config.poll.max_attempts = parse_value("POLL_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = var("PAGE_CEILING") {
            config.page_ceiling = parse_value("PAGE_CEILING", &raw)?;
        }
        if let Some(raw) = var("PAGE_PAUSE_MS") {
            config.page_pause_ms = parse_value("PAGE_PAUSE_MS", &raw)?;
        }

        let exchange = &mut config.exchange;
        if let Some(base) = var("EXCHANGE_API_BASE") {
            exchange.api_base = base;
        }
        exchange.network_code = var("EXCHANGE_NETWORK_CODE");
        exchange.access_token = var("EXCHANGE_ACCESS_TOKEN");
        if let Some(raw) = var("EXCHANGE_CUSTOM_DIMENSION_IDS") {
            exchange.custom_dimension_key_ids = raw
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| parse_value("EXCHANGE_CUSTOM_DIMENSION_IDS", id))
                .collect::<Result<_, _>>()?;
        }
        if let Some(raw) = var("EXCHANGE_PAGE_SIZE") {
            exchange.page_size = parse_value("EXCHANGE_PAGE_SIZE", &raw)?;
        }

        let quality = &mut config.quality;
        if let Some(base) = var("QUALITY_API_BASE") {
            quality.api_base = base;
        }
        quality.api_token = var("QUALITY_API_TOKEN");
        if let Some(raw) = var("QUALITY_INSTANCE_ID") {
            quality.instance_id = Some(parse_value("QUALITY_INSTANCE_ID", &raw)?);
        }
        if let Some(raw) = var("QUALITY_REPORT_HOURS") {
            quality.report_hours = parse_value("QUALITY_REPORT_HOURS", &raw)?;
        }
        if let Some(suffix) = var("QUALITY_REPORT_SUFFIX") {
            quality.report_suffix = suffix;
        }
        if let Some(zone) = var("QUALITY_TIMEZONE") {
            quality.timezone = zone;
        }
        if let Some(raw) = var("QUALITY_READY_DELAY_MS") {
            quality.ready_delay_ms = parse_value("QUALITY_READY_DELAY_MS", &raw)?;
        }
        if let Some(raw) = var("QUALITY_READY_MAX_ATTEMPTS") {
            quality.ready_max_attempts = parse_value("QUALITY_READY_MAX_ATTEMPTS", &raw)?;
        }

        let analytics = &mut config.analytics;
        if let Some(base) = var("ANALYTICS_API_BASE") {
            analytics.api_base = base;
        }
        analytics.property_id = var("ANALYTICS_PROPERTY_ID");
        analytics.access_token = var("ANALYTICS_ACCESS_TOKEN");
        if let Some(raw) = var("ANALYTICS_PAGE_SIZE") {
            analytics.page_size = parse_value("ANALYTICS_PAGE_SIZE", &raw)?;
        }

        config.quality.tz()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.quality.tz()?;
        Ok(config)
    }

    /// Check that every setting the selected jobs need is present.
    pub fn validate(&self, kinds: &[ReportKind]) -> Result<(), ConfigError> {
        self.warehouse_dir()?;
        for kind in kinds {
            match kind {
                ReportKind::Exchange => {
                    require(&self.exchange.network_code, "EXCHANGE_NETWORK_CODE")?;
                    require(&self.exchange.access_token, "EXCHANGE_ACCESS_TOKEN")?;
                    if self.exchange.page_size == 0 {
                        return Err(ConfigError::Invalid {
                            var: "EXCHANGE_PAGE_SIZE",
                            reason: "must be positive".to_string(),
                        });
                    }
                }
                ReportKind::Quality => {
                    require(&self.quality.api_token, "QUALITY_API_TOKEN")?;
                    if self.quality.instance_id.is_none() {
                        return Err(ConfigError::Missing("QUALITY_INSTANCE_ID"));
                    }
                    self.quality.tz()?;
                }
                ReportKind::Analytics => {
                    require(&self.analytics.property_id, "ANALYTICS_PROPERTY_ID")?;
                    require(&self.analytics.access_token, "ANALYTICS_ACCESS_TOKEN")?;
                    if self.analytics.page_size == 0 {
                        return Err(ConfigError::Invalid {
                            var: "ANALYTICS_PAGE_SIZE",
                            reason: "must be positive".to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn warehouse_dir(&self) -> Result<&Path, ConfigError> {
        self.warehouse_dir
            .as_deref()
            .ok_or(ConfigError::Missing("WAREHOUSE_DIR"))
    }

    pub fn run_date(&self, today: NaiveDate) -> NaiveDate {
        self.report_date.unwrap_or(today)
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            max_pages: self.page_ceiling,
            pause: Duration::from_millis(self.page_pause_ms),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn checkpoint_path(&self, kind: ReportKind) -> PathBuf {
        self.checkpoint_dir.join(format!("{}-checkpoint.json", kind.name()))
    }
}

fn require(value: &Option<String>, var: &'static str) -> Result<(), ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(()),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw, "1" | "true" | "TRUE" | "True" | "yes")
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| ConfigError::Invalid {
        var,
        reason: format!("`{raw}`: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = EtlConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.poll.initial_delay, Duration::from_secs(5));
        assert_eq!(config.poll.multiplier, 1.5);
        assert_eq!(config.poll.max_attempts, 60);
        assert_eq!(config.page_ceiling, 100);
        assert_eq!(config.exchange.page_size, 1000);
        assert_eq!(config.quality.timezone, "America/Los_Angeles");
        assert_eq!(config.analytics.page_size, 250_000);
        assert!(!config.force_rerun);
    }

    #[test]
    fn reads_overrides_and_lists() {
        let config = EtlConfig::from_lookup(lookup(&[
            ("REPORT_DATE", "2025-07-14"),
            ("FORCE_RERUN", "true"),
            ("WAREHOUSE_DIR", "/tmp/wh"),
            ("EXCHANGE_CUSTOM_DIMENSION_IDS", "11, 12"),
            ("QUALITY_INSTANCE_ID", "987"),
            ("POLL_MAX_ATTEMPTS", "3"),
        ]))
        .expect("config");
        assert_eq!(config.report_date, NaiveDate::from_ymd_opt(2025, 7, 14));
        assert!(config.force_rerun);
        assert_eq!(config.exchange.custom_dimension_key_ids, vec![11, 12]);
        assert_eq!(config.quality.instance_id, Some(987));
        assert_eq!(config.poll.max_attempts, 3);
        assert_eq!(config.warehouse_dir().expect("dir"), Path::new("/tmp/wh"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = EtlConfig::from_lookup(lookup(&[("REPORT_DATE", "14/07/2025")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "REPORT_DATE", .. }));

        let err =
            EtlConfig::from_lookup(lookup(&[("QUALITY_TIMEZONE", "Mars/Olympus")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "QUALITY_TIMEZONE", .. }));
    }

    #[test]
    fn validation_only_checks_selected_jobs() {
        let config = EtlConfig::from_lookup(lookup(&[
            ("WAREHOUSE_DIR", "/tmp/wh"),
            ("ANALYTICS_PROPERTY_ID", "123"),
            ("ANALYTICS_ACCESS_TOKEN", "token"),
        ]))
        .expect("config");
        assert!(config.validate(&[ReportKind::Analytics]).is_ok());
        assert!(matches!(
            config.validate(&[ReportKind::Exchange]),
            Err(ConfigError::Missing("EXCHANGE_NETWORK_CODE"))
        ));
        assert!(matches!(
            config.validate(&[ReportKind::Quality]),
            Err(ConfigError::Missing("QUALITY_API_TOKEN"))
        ));

        let no_warehouse = EtlConfig::from_lookup(lookup(&[])).expect("config");
        assert!(matches!(
            no_warehouse.validate(&[]),
            Err(ConfigError::Missing("WAREHOUSE_DIR"))
        ));
    }

    #[test]
    fn yaml_file_fills_missing_fields_with_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("adrep.yaml");
        std::fs::write(
            &path,
            "warehouse_dir: /data/warehouse\n\
             quality:\n  api_token: secret\n  instance_id: 42\n  report_suffix: nightly\n",
        )
        .expect("write yaml");

        let config = EtlConfig::from_yaml_file(&path).expect("config");
        assert_eq!(config.quality.instance_id, Some(42));
        assert_eq!(config.quality.report_suffix, "nightly");
        assert_eq!(config.quality.report_hours, 24);
        assert_eq!(config.page_ceiling, 100);
        assert!(config.validate(&[ReportKind::Quality]).is_ok());
    }
}
