use std::sync::Arc;

use adrep_adapters::{parse_exchange_row, ExchangeReportApi, ExchangeReportRequest};
use adrep_core::{CheckpointPatch, CheckpointStatus, ExchangeRecord, ReportKind};
use adrep_storage::{fetch_all_pages, poll_until, PageLimits, PollPolicy};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use super::{CheckpointHandle, JobDeps, JobError, JobOutcome, ReportJob, Step};
use crate::aggregate::{aggregate_exchange, top_groups, ExchangeAggregate, ExchangeTotals};
use crate::config::EtlConfig;
use crate::schema::{row, Cell, Row, EXCHANGE_BY_SOURCE_TABLE, EXCHANGE_SUMMARY_TABLE};
use crate::window::ExchangeWindow;

pub const REPORT_SLOT: &str = "report";
pub const RESULT_SLOT: &str = "result";

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeJobSettings {
    pub poll: PollPolicy,
    pub paging: PageLimits,
    pub page_size: u32,
    pub custom_dimension_key_ids: Vec<i64>,
}

impl ExchangeJobSettings {
    pub fn from_config(config: &EtlConfig) -> Self {
        Self {
            poll: config.poll,
            paging: config.page_limits(),
            page_size: config.exchange.page_size,
            custom_dimension_key_ids: config.exchange.custom_dimension_key_ids.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ExchangeState {
    AcquireReport,
    RunAndPoll {
        report_id: String,
    },
    FetchRows {
        report_id: String,
        result_id: String,
    },
    Aggregate {
        report_id: String,
        rows: Vec<JsonValue>,
        truncated: bool,
    },
    Persist {
        report_id: String,
        aggregate: ExchangeAggregate,
        rows_fetched: usize,
        truncated: bool,
    },
}

pub struct ExchangeJob {
    api: Arc<dyn ExchangeReportApi>,
    deps: JobDeps,
    settings: ExchangeJobSettings,
    window: ExchangeWindow,
}

impl ExchangeJob {
    pub fn new(
        api: Arc<dyn ExchangeReportApi>,
        deps: JobDeps,
        settings: ExchangeJobSettings,
        run_date: NaiveDate,
    ) -> Self {
        Self {
            api,
            deps,
            settings,
            window: ExchangeWindow::for_run(run_date),
        }
    }

    pub fn window(&self) -> &ExchangeWindow {
        &self.window
    }

    fn request(&self) -> ExchangeReportRequest {
        ExchangeReportRequest {
            covered_date: self.window.covered_date,
            display_name: format!("{} Exchange Report", self.window.key),
            custom_dimension_key_ids: self.settings.custom_dimension_key_ids.clone(),
        }
    }

    async fn acquire_report(&self, checkpoint: &mut CheckpointHandle) -> Result<String, JobError> {
        if let Some(report_id) = checkpoint.job_id(REPORT_SLOT) {
            info!(report_id, "report id from checkpoint");
            return Ok(report_id.to_string());
        }

        let request = self.request();
        let report_id = match self.api.find_report(&request.display_name).await? {
            Some(report_id) => {
                info!(
                    report_id = %report_id,
                    name = %request.display_name,
                    "reusing existing report definition"
                );
                report_id
            }
            None => {
                let report_id = self.api.create_report(&request).await?;
                info!(
                    report_id = %report_id,
                    name = %request.display_name,
                    "created report definition"
                );
                report_id
            }
        };
        checkpoint
            .record(CheckpointPatch::new().job_id(REPORT_SLOT, &report_id))
            .await?;
        Ok(report_id)
    }

    async fn run_and_poll(
        &self,
        report_id: &str,
        checkpoint: &mut CheckpointHandle,
    ) -> Result<String, JobError> {
        if let Some(result_id) = checkpoint.job_id(RESULT_SLOT) {
            info!(result_id, "result id from checkpoint");
            return Ok(result_id.to_string());
        }

        let operation = self.api.run_report(report_id).await?;
        info!(report_id, operation = %operation, "report run started");
        let api = Arc::clone(&self.api);
        let result_id: String = poll_until(&self.settings.poll, "exchange report run", |_attempt| {
            let api = Arc::clone(&api);
            let operation = operation.clone();
            async move { api.poll_operation(&operation).await }
        })
        .await?;

        checkpoint
            .record(CheckpointPatch::new().job_id(RESULT_SLOT, &result_id))
            .await?;
        Ok(result_id)
    }

    async fn fetch_rows(
        &self,
        report_id: &str,
        result_id: &str,
    ) -> Result<(Vec<JsonValue>, bool), JobError> {
        let api = Arc::clone(&self.api);
        let page_size = self.settings.page_size;
        let fetch_page = |token: Option<String>| {
            let api = Arc::clone(&api);
            let report_id = report_id.to_string();
            let result_id = result_id.to_string();
            async move { api.fetch_rows_page(&report_id, &result_id, page_size, token).await }
        };
        let paged =
            fetch_all_pages("exchange result rows", self.settings.paging, fetch_page).await?;

        self.deps
            .dump(ReportKind::Exchange, "rows", self.window.covered_date, report_id, &paged.rows)
            .await;
        Ok((paged.rows, paged.truncated))
    }

    fn persistable_rows(&self, report_id: &str, aggregate: &ExchangeAggregate) -> (Row, Vec<Row>) {
        let now = Utc::now();
        let summary = &aggregate.summary;
        let summary_row = row([
            ("report_date", self.window.run_date.into()),
            ("report_id", report_id.into()),
            ("total_revenue", summary.total_revenue().into()),
            ("total_exchange_revenue", summary.exchange_revenue.into()),
            ("total_ad_server_revenue", summary.ad_server_revenue.into()),
            ("total_clicks", summary.clicks.into()),
            ("total_impressions", summary.impressions.into()),
            ("total_viewable_impressions", summary.viewable_impressions.into()),
            ("total_ad_requests", summary.ad_requests.into()),
            ("average_ecpm", summary.ecpm().into()),
            ("average_ctr", summary.ctr().into()),
            ("status", CheckpointStatus::Completed.as_str().into()),
            ("created_at", now.into()),
            ("updated_at", now.into()),
            ("display_date", self.window.covered_date.into()),
        ]);
        let source_rows = aggregate
            .by_source
            .iter()
            .map(|(source, totals)| {
                row([
                    ("report_date", self.window.run_date.into()),
                    ("report_id", report_id.into()),
                    ("source", source.as_str().into()),
                    ("revenue", totals.total_revenue().into()),
                    ("exchange_revenue", totals.exchange_revenue.into()),
                    ("ad_server_revenue", totals.ad_server_revenue.into()),
                    ("clicks", totals.clicks.into()),
                    ("impressions", totals.impressions.into()),
                    ("ad_requests", totals.ad_requests.into()),
                    ("created_at", now.into()),
                    ("display_date", self.window.covered_date.into()),
                ])
            })
            .collect();
        (summary_row, source_rows)
    }
}

fn log_summary(key: &str, aggregate: &ExchangeAggregate) {
    let summary = &aggregate.summary;
    info!(
        key,
        rows = summary.rows,
        total_revenue = summary.total_revenue(),
        exchange_revenue = summary.exchange_revenue,
        ad_server_revenue = summary.ad_server_revenue,
        clicks = summary.clicks,
        impressions = summary.impressions,
        ad_requests = summary.ad_requests,
        ecpm = summary.ecpm(),
        ctr = summary.ctr(),
        "exchange summary"
    );
    for (source, revenue) in top_groups(&aggregate.by_source, 5, ExchangeTotals::total_revenue) {
        info!(key, source = %source, revenue, "top source by revenue");
    }
    for (ad_unit, revenue) in top_groups(&aggregate.by_ad_unit, 5, ExchangeTotals::total_revenue) {
        info!(key, ad_unit = %ad_unit, revenue, "top ad unit by revenue");
    }
}

#[async_trait]
impl ReportJob for ExchangeJob {
    type State = ExchangeState;

    fn kind(&self) -> ReportKind {
        ReportKind::Exchange
    }

    fn report_key(&self) -> String {
        self.window.key.clone()
    }

    fn deps(&self) -> &JobDeps {
        &self.deps
    }

    fn summary_location(&self) -> (&'static str, Cell) {
        (EXCHANGE_SUMMARY_TABLE, Cell::Date(self.window.run_date))
    }

    fn start(&self) -> ExchangeState {
        ExchangeState::AcquireReport
    }

    fn state_name(state: &ExchangeState) -> &'static str {
        match state {
            ExchangeState::AcquireReport => "acquire_report",
            ExchangeState::RunAndPoll { .. } => "run_and_poll",
            ExchangeState::FetchRows { .. } => "fetch_rows",
            ExchangeState::Aggregate { .. } => "aggregate",
            ExchangeState::Persist { .. } => "persist",
        }
    }

    async fn advance(
        &mut self,
        state: ExchangeState,
        checkpoint: &mut CheckpointHandle,
    ) -> Result<Step<ExchangeState>, JobError> {
        let next = match state {
            ExchangeState::AcquireReport => ExchangeState::RunAndPoll {
                report_id: self.acquire_report(checkpoint).await?,
            },
            ExchangeState::RunAndPoll { report_id } => {
                let result_id = self.run_and_poll(&report_id, checkpoint).await?;
                ExchangeState::FetchRows { report_id, result_id }
            }
            ExchangeState::FetchRows { report_id, result_id } => {
                let (rows, truncated) = self.fetch_rows(&report_id, &result_id).await?;
                ExchangeState::Aggregate {
                    report_id,
                    rows,
                    truncated,
                }
            }
            ExchangeState::Aggregate {
                report_id,
                rows,
                truncated,
            } => {
                let records: Vec<ExchangeRecord> = rows.iter().map(parse_exchange_row).collect();
                let aggregate = aggregate_exchange(&records);
                log_summary(&self.window.key, &aggregate);
                ExchangeState::Persist {
                    report_id,
                    aggregate,
                    rows_fetched: rows.len(),
                    truncated,
                }
            }
            ExchangeState::Persist {
                report_id,
                aggregate,
                rows_fetched,
                truncated,
            } => {
                let (summary, source_rows) = self.persistable_rows(&report_id, &aggregate);
                // The summary row marks the date as reported, so it goes last.
                if !source_rows.is_empty() {
                    self.deps
                        .warehouse
                        .insert_rows(EXCHANGE_BY_SOURCE_TABLE, &source_rows)
                        .await?;
                }
                self.deps
                    .warehouse
                    .insert_rows(EXCHANGE_SUMMARY_TABLE, std::slice::from_ref(&summary))
                    .await?;
                checkpoint
                    .record(CheckpointPatch::new().status(CheckpointStatus::Completed))
                    .await?;
                return Ok(Step::Done(JobOutcome::Completed {
                    kind: ReportKind::Exchange,
                    report_key: self.window.key.clone(),
                    rows_fetched,
                    truncated,
                    summary,
                }));
            }
        };
        Ok(Step::Next(next))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use adrep_adapters::AdapterError;
    use adrep_core::CheckpointStatus;
    use adrep_storage::{CheckpointStore, Page, PollStatus};
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::jobs::drive;
    use crate::jobs::testing::{checkpoint_store, deps, instant_poll, no_pause, warehouse};

    fn exchange_row(source: &str, revenue: f64, clicks: u64, impressions: u64) -> JsonValue {
        json!({
            "dimensionValues": [
                { "stringValue": "20250713" },
                { "stringValue": "United States" },
                { "stringValue": "site » top" },
                { "stringValue": "Chrome" },
                { "stringValue": source },
                { "stringValue": "summer" },
                { "intValue": "1" },
                { "stringValue": "top" }
            ],
            "metricValueGroups": [{
                "primaryValues": [
                    { "doubleValue": revenue },
                    { "intValue": clicks.to_string() },
                    { "intValue": impressions.to_string() },
                    { "doubleValue": 0.0 },
                    { "doubleValue": 0.0 },
                    { "intValue": "0" },
                    { "intValue": (impressions * 2).to_string() },
                    { "doubleValue": 0.0 }
                ]
            }]
        })
    }

    #[derive(Default)]
    struct FakeExchange {
        existing_report: Option<String>,
        /// Polls answer Pending this many times, then Ready. `None` never finishes.
        ready_after: Option<usize>,
        endless_pages: bool,
        finds: AtomicUsize,
        creates: AtomicUsize,
        runs: Mutex<Vec<String>>,
        polls: AtomicUsize,
        pages: AtomicUsize,
    }

    impl FakeExchange {
        fn calls(&self) -> usize {
            self.finds.load(Ordering::SeqCst)
                + self.creates.load(Ordering::SeqCst)
                + self.runs.lock().unwrap().len()
                + self.polls.load(Ordering::SeqCst)
                + self.pages.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExchangeReportApi for FakeExchange {
        async fn find_report(&self, _display_name: &str) -> Result<Option<String>, AdapterError> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            Ok(self.existing_report.clone())
        }

        async fn create_report(
            &self,
            request: &ExchangeReportRequest,
        ) -> Result<String, AdapterError> {
            assert_eq!(request.display_name, "2025-07-14 Exchange Report");
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok("networks/1/reports/77".to_string())
        }

        async fn run_report(&self, report_id: &str) -> Result<String, AdapterError> {
            self.runs.lock().unwrap().push(report_id.to_string());
            Ok("operations/op-1".to_string())
        }

        async fn poll_operation(
            &self,
            _operation: &str,
        ) -> Result<PollStatus<String>, AdapterError> {
            let seen = self.polls.fetch_add(1, Ordering::SeqCst);
            match self.ready_after {
                Some(after) if seen >= after => Ok(PollStatus::Ready("res-9".to_string())),
                _ => Ok(PollStatus::Pending),
            }
        }

        async fn fetch_rows_page(
            &self,
            _report_id: &str,
            result_id: &str,
            page_size: u32,
            page_token: Option<String>,
        ) -> Result<Page<JsonValue, String>, AdapterError> {
            assert_eq!(result_id, "res-9");
            assert_eq!(page_size, 1000);
            self.pages.fetch_add(1, Ordering::SeqCst);
            if self.endless_pages {
                return Ok(Page {
                    rows: vec![exchange_row("google", 1.0, 1, 10)],
                    next: Some("more".to_string()),
                });
            }
            Ok(match page_token.as_deref() {
                None => Page {
                    rows: vec![exchange_row("google", 10.0, 2, 1000)],
                    next: Some("page-2".to_string()),
                },
                Some("page-2") => Page {
                    rows: vec![exchange_row("", 5.0, 1, 1000)],
                    next: None,
                },
                Some(other) => panic!("unexpected token {other}"),
            })
        }
    }

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 14).unwrap()
    }

    fn settings(max_attempts: u32, max_pages: usize) -> ExchangeJobSettings {
        ExchangeJobSettings {
            poll: instant_poll(max_attempts),
            paging: no_pause(max_pages),
            page_size: 1000,
            custom_dimension_key_ids: vec![11, 12],
        }
    }

    #[tokio::test]
    async fn completes_and_persists_summary_and_sources() {
        let dir = tempdir().expect("tempdir");
        let wh = warehouse();
        let api = Arc::new(FakeExchange {
            ready_after: Some(1),
            ..Default::default()
        });
        let mut job = ExchangeJob::new(
            api.clone(),
            deps(dir.path(), ReportKind::Exchange, &wh, false),
            settings(5, 10),
            run_date(),
        );

        let outcome = drive(&mut job).await.expect("job");
        let JobOutcome::Completed { rows_fetched, truncated, summary, .. } = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(rows_fetched, 2);
        assert!(!truncated);
        assert_eq!(summary["total_revenue"], Cell::Float(15.0));
        assert_eq!(summary["total_clicks"], Cell::Int(3));
        assert_eq!(summary["average_ecpm"], Cell::Float(7.5));
        assert_eq!(
            summary["display_date"],
            Cell::Date(NaiveDate::from_ymd_opt(2025, 7, 13).unwrap())
        );
        assert_eq!(api.creates.load(Ordering::SeqCst), 1);
        assert_eq!(api.polls.load(Ordering::SeqCst), 2);

        let sources = wh.rows(EXCHANGE_BY_SOURCE_TABLE);
        assert_eq!(sources.len(), 2);
        let not_set = sources
            .iter()
            .find(|r| r["source"] == Cell::Str("(not set)".into()))
            .expect("sentinel group");
        assert_eq!(not_set["revenue"], Cell::Float(5.0));
        assert_eq!(wh.rows(EXCHANGE_SUMMARY_TABLE).len(), 1);

        let checkpoint = checkpoint_store(dir.path(), ReportKind::Exchange)
            .load("2025-07-14")
            .await
            .expect("checkpoint");
        assert_eq!(checkpoint.status, Some(CheckpointStatus::Completed));
        assert_eq!(checkpoint.job_id(REPORT_SLOT), Some("networks/1/reports/77"));
        assert_eq!(checkpoint.job_id(RESULT_SLOT), Some("res-9"));
        assert!(dir.path().join("dumps/exchange/2025-07-13").is_dir());
    }

    #[tokio::test]
    async fn reported_dates_make_no_api_calls() {
        let dir = tempdir().expect("tempdir");
        let wh = warehouse();
        let api = Arc::new(FakeExchange {
            ready_after: Some(0),
            ..Default::default()
        });
        let mut first = ExchangeJob::new(
            api.clone(),
            deps(dir.path(), ReportKind::Exchange, &wh, false),
            settings(5, 10),
            run_date(),
        );
        drive(&mut first).await.expect("first run");
        let calls_after_first = api.calls();

        let mut second = ExchangeJob::new(
            api.clone(),
            deps(dir.path(), ReportKind::Exchange, &wh, false),
            settings(5, 10),
            run_date(),
        );
        let outcome = drive(&mut second).await.expect("second run");
        assert!(matches!(outcome, JobOutcome::AlreadyReported { .. }));
        assert_eq!(outcome.summary()["total_revenue"], Cell::Float(15.0));
        assert_eq!(api.calls(), calls_after_first);
        assert_eq!(wh.rows(EXCHANGE_SUMMARY_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn resume_skips_report_creation() {
        let dir = tempdir().expect("tempdir");
        let wh = warehouse();
        checkpoint_store(dir.path(), ReportKind::Exchange)
            .save("2025-07-14", &CheckpointPatch::new().job_id(REPORT_SLOT, "networks/1/reports/5"))
            .await
            .expect("seed checkpoint");

        let api = Arc::new(FakeExchange {
            ready_after: Some(0),
            ..Default::default()
        });
        let mut job = ExchangeJob::new(
            api.clone(),
            deps(dir.path(), ReportKind::Exchange, &wh, false),
            settings(5, 10),
            run_date(),
        );
        drive(&mut job).await.expect("job");

        assert_eq!(api.finds.load(Ordering::SeqCst), 0);
        assert_eq!(api.creates.load(Ordering::SeqCst), 0);
        assert_eq!(*api.runs.lock().unwrap(), vec!["networks/1/reports/5".to_string()]);
    }

    #[tokio::test]
    async fn existing_definition_is_reused() {
        let dir = tempdir().expect("tempdir");
        let wh = warehouse();
        let api = Arc::new(FakeExchange {
            existing_report: Some("networks/1/reports/3".to_string()),
            ready_after: Some(0),
            ..Default::default()
        });
        let mut job = ExchangeJob::new(
            api.clone(),
            deps(dir.path(), ReportKind::Exchange, &wh, false),
            settings(5, 10),
            run_date(),
        );
        drive(&mut job).await.expect("job");
        assert_eq!(api.creates.load(Ordering::SeqCst), 0);
        assert_eq!(*api.runs.lock().unwrap(), vec!["networks/1/reports/3".to_string()]);
    }

    #[tokio::test]
    async fn poll_exhaustion_fails_and_keeps_ids() {
        let dir = tempdir().expect("tempdir");
        let wh = warehouse();
        let api = Arc::new(FakeExchange::default());
        let mut job = ExchangeJob::new(
            api.clone(),
            deps(dir.path(), ReportKind::Exchange, &wh, false),
            settings(3, 10),
            run_date(),
        );

        let err = drive(&mut job).await.unwrap_err();
        assert!(matches!(err, JobError::Timeout { attempts: 3, .. }), "{err}");
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);

        let checkpoint = checkpoint_store(dir.path(), ReportKind::Exchange)
            .load("2025-07-14")
            .await
            .expect("checkpoint");
        assert_eq!(checkpoint.status, Some(CheckpointStatus::Failed));
        assert_eq!(checkpoint.job_id(REPORT_SLOT), Some("networks/1/reports/77"));
        assert_eq!(checkpoint.job_id(RESULT_SLOT), None);
        assert!(wh.rows(EXCHANGE_SUMMARY_TABLE).is_empty());
    }

    #[tokio::test]
    async fn page_ceiling_keeps_partial_rows() {
        let dir = tempdir().expect("tempdir");
        let wh = warehouse();
        let api = Arc::new(FakeExchange {
            ready_after: Some(0),
            endless_pages: true,
            ..Default::default()
        });
        let mut job = ExchangeJob::new(
            api.clone(),
            deps(dir.path(), ReportKind::Exchange, &wh, false),
            settings(5, 3),
            run_date(),
        );

        let outcome = drive(&mut job).await.expect("job");
        let JobOutcome::Completed { rows_fetched, truncated, .. } = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(rows_fetched, 3);
        assert!(truncated);
        assert_eq!(api.pages.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn force_rerun_ignores_existing_output_and_checkpoint() {
        let dir = tempdir().expect("tempdir");
        let wh = warehouse();
        let api = Arc::new(FakeExchange {
            ready_after: Some(0),
            ..Default::default()
        });
        let mut first = ExchangeJob::new(
            api.clone(),
            deps(dir.path(), ReportKind::Exchange, &wh, false),
            settings(5, 10),
            run_date(),
        );
        drive(&mut first).await.expect("first run");

        let mut forced = ExchangeJob::new(
            api.clone(),
            deps(dir.path(), ReportKind::Exchange, &wh, true),
            settings(5, 10),
            run_date(),
        );
        let outcome = drive(&mut forced).await.expect("forced run");
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        assert_eq!(api.creates.load(Ordering::SeqCst), 2);
        assert_eq!(wh.rows(EXCHANGE_SUMMARY_TABLE).len(), 2);
    }
}
