//! Traffic-quality job: a request and a response report over the same range,
//! each created (or reused), awaited, resolved to a download and fetched.

use std::sync::Arc;

use adrep_adapters::{
    find_ready_report, parse_quality_row, report_status, AdapterError, QualityFeed,
    QualityReportApi, QualityReportRequest,
};
use adrep_core::{CheckpointPatch, CheckpointStatus, QualityRecord, ReportKind};
use adrep_storage::{poll_until, PollError, PollPolicy, PollStatus};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use super::{CheckpointHandle, JobDeps, JobError, JobOutcome, ReportJob, Step};
use crate::aggregate::{aggregate_quality, top_groups, QualityAggregate, QualityTotals};
use crate::config::EtlConfig;
use crate::schema::{row, Cell, Row, QUALITY_BY_SOURCE_TABLE, QUALITY_SUMMARY_TABLE};
use crate::window::{filter_to_window, QualityWindow};

#[derive(Debug, Clone, PartialEq)]
pub struct QualityJobSettings {
    pub readiness: PollPolicy,
    pub report_hours: u32,
    pub report_suffix: String,
    pub tz: Tz,
}

impl QualityJobSettings {
    pub fn from_config(config: &EtlConfig) -> Result<Self, JobError> {
        Ok(Self {
            readiness: config.quality.readiness_policy(),
            report_hours: config.quality.report_hours,
            report_suffix: config.quality.report_suffix.clone(),
            tz: config.quality.tz()?,
        })
    }
}

#[derive(Debug)]
pub enum QualityState {
    Acquire(QualityFeed),
    AwaitReady(QualityFeed),
    ResolveMetadata(QualityFeed),
    Download,
    Aggregate {
        requests: Vec<JsonValue>,
        responses: Vec<JsonValue>,
    },
    Persist {
        aggregate: QualityAggregate,
        rows_fetched: usize,
    },
}

pub struct QualityJob {
    api: Arc<dyn QualityReportApi>,
    deps: JobDeps,
    settings: QualityJobSettings,
    window: QualityWindow,
}

impl QualityJob {
    pub fn new(
        api: Arc<dyn QualityReportApi>,
        deps: JobDeps,
        settings: QualityJobSettings,
        run_date: NaiveDate,
    ) -> Result<Self, JobError> {
        let window = QualityWindow::for_run(run_date, settings.tz)?;
        Ok(Self {
            api,
            deps,
            settings,
            window,
        })
    }

    pub fn window(&self) -> &QualityWindow {
        &self.window
    }

    pub fn report_name(&self, feed: QualityFeed) -> String {
        feed.report_name(
            self.settings.report_hours,
            self.window.start_key,
            self.window.end_key,
            &self.settings.report_suffix,
        )
    }

    fn recorded_id(checkpoint: &CheckpointHandle, slot: &str) -> Result<String, JobError> {
        checkpoint
            .job_id(slot)
            .map(str::to_string)
            .ok_or_else(|| JobError::Other(anyhow!("checkpoint has no `{slot}` id")))
    }

    async fn acquire(
        &self,
        feed: QualityFeed,
        checkpoint: &mut CheckpointHandle,
    ) -> Result<(), JobError> {
        let slot = feed.report_slot();
        if let Some(report_id) = checkpoint.job_id(slot) {
            info!(feed = slot, report_id, "report id from checkpoint");
            return Ok(());
        }

        let name = self.report_name(feed);
        let listings = self.api.list_reports().await?;
        if let Some(report_id) = find_ready_report(&listings, feed, &name) {
            info!(feed = slot, report_id = %report_id, name = %name, "reusing ready report");
            return checkpoint
                .record(CheckpointPatch::new().job_id(slot, report_id).ready(slot, true))
                .await;
        }

        let request = QualityReportRequest {
            feed,
            start: self.window.start_key,
            end: self.window.end_key,
            name,
        };
        let report_id = self.api.create_report(&request).await?;
        info!(feed = slot, report_id = %report_id, name = %request.name, "created report");
        checkpoint
            .record(CheckpointPatch::new().job_id(slot, report_id).ready(slot, false))
            .await
    }

    async fn await_ready(
        &self,
        feed: QualityFeed,
        checkpoint: &mut CheckpointHandle,
    ) -> Result<(), JobError> {
        let slot = feed.report_slot();
        if checkpoint.is_ready(slot) {
            return Ok(());
        }
        let report_id = Self::recorded_id(checkpoint, slot)?;

        let api = Arc::clone(&self.api);
        let what = format!("quality {slot} report {report_id}");
        let check = |attempt: u32| {
            let api = Arc::clone(&api);
            let report_id = report_id.clone();
            async move {
                match api.list_reports().await {
                    Ok(listings) => Ok::<_, AdapterError>(report_status(&listings, &report_id)),
                    Err(err) => {
                        warn!(
                            report_id = %report_id,
                            attempt,
                            error = %err,
                            "status check failed; still waiting"
                        );
                        Ok(PollStatus::Pending)
                    }
                }
            }
        };
        let polled: Result<(), AdapterError> =
            poll_until(&self.settings.readiness, &what, check).await;

        // The failed id stays in the checkpoint, so plain reruns hit the same report.
        match polled {
            Err(AdapterError::Poll(PollError::Failed { what, reason })) => {
                return Err(JobError::External(AdapterError::Poll(PollError::Failed {
                    what,
                    reason: format!("{reason}; rerun with --force to request a new report"),
                })));
            }
            other => other?,
        }

        checkpoint.record(CheckpointPatch::new().ready(slot, true)).await
    }

    async fn resolve_metadata(
        &self,
        feed: QualityFeed,
        checkpoint: &mut CheckpointHandle,
    ) -> Result<(), JobError> {
        let slot = feed.metadata_slot();
        if let Some(metadata_id) = checkpoint.job_id(slot) {
            info!(slot, metadata_id, "metadata id from checkpoint");
            return Ok(());
        }
        let report_id = Self::recorded_id(checkpoint, feed.report_slot())?;
        let metadata_id = self.api.report_metadata(&report_id).await?;
        info!(slot, report_id = %report_id, metadata_id = %metadata_id, "resolved report metadata");
        checkpoint.record(CheckpointPatch::new().job_id(slot, metadata_id)).await
    }

    async fn download(
        &self,
        feed: QualityFeed,
        checkpoint: &CheckpointHandle,
    ) -> Result<Vec<JsonValue>, JobError> {
        let metadata_id = Self::recorded_id(checkpoint, feed.metadata_slot())?;
        let rows = self.api.download(&metadata_id).await?;
        info!(feed = feed.api_type(), rows = rows.len(), "downloaded report rows");
        let report_id = checkpoint.job_id(feed.report_slot()).unwrap_or(metadata_id.as_str());
        self.deps
            .dump(ReportKind::Quality, feed.api_type(), self.window.start, report_id, &rows)
            .await;
        Ok(rows)
    }

    fn in_window(&self, feed: QualityFeed, rows: &[JsonValue]) -> Vec<QualityRecord> {
        let records: Vec<QualityRecord> = rows.iter().map(parse_quality_row).collect();
        let (kept, dropped) = filter_to_window(records, &self.window.filter, |r| r.timestamp);
        info!(
            feed = feed.api_type(),
            kept = kept.len(),
            dropped,
            window_start = %self.window.filter.start,
            window_end = %self.window.filter.end,
            "filtered rows to reporting window"
        );
        kept
    }

    fn persistable_rows(
        &self,
        aggregate: &QualityAggregate,
        checkpoint: &CheckpointHandle,
    ) -> Result<(Row, Vec<Row>), JobError> {
        let request_id = Self::recorded_id(checkpoint, QualityFeed::Request.report_slot())?;
        let response_id = Self::recorded_id(checkpoint, QualityFeed::Response.report_slot())?;
        let now = Utc::now();
        let hours = self.settings.report_hours;

        let metrics = |totals: &QualityTotals| -> [(&'static str, Cell); 9] {
            [
                ("total_requests", totals.requests.into()),
                ("total_responses", totals.responses.into()),
                ("drop_rate", totals.drop_rate().into()),
                ("good", totals.good.into()),
                ("good_rate", totals.good_rate().into()),
                ("bad", totals.bad.into()),
                ("bad_rate", totals.bad_rate().into()),
                ("warn", totals.warn.into()),
                ("warn_rate", totals.warn_rate().into()),
            ]
        };

        let mut summary = row([
            ("start_date", self.window.start_key.into()),
            ("end_date", self.window.end_key.into()),
            ("report_hours", hours.into()),
            ("request_report_id", request_id.as_str().into()),
            ("response_report_id", response_id.as_str().into()),
            ("request_report_name", self.report_name(QualityFeed::Request).into()),
            ("response_report_name", self.report_name(QualityFeed::Response).into()),
            ("status", CheckpointStatus::Completed.as_str().into()),
            ("created_at", now.into()),
            ("updated_at", now.into()),
            ("display_date", self.window.start.into()),
        ]);
        summary.extend(metrics(&aggregate.summary).map(|(k, v)| (k.to_string(), v)));

        let source_rows = aggregate
            .by_source
            .iter()
            .map(|(source, totals)| {
                let mut source_row = row([
                    ("start_date", self.window.start_key.into()),
                    ("end_date", self.window.end_key.into()),
                    ("report_hours", hours.into()),
                    ("request_report_id", request_id.as_str().into()),
                    ("response_report_id", response_id.as_str().into()),
                    ("source", source.as_str().into()),
                    ("created_at", now.into()),
                    ("display_date", self.window.start.into()),
                ]);
                source_row.extend(metrics(totals).map(|(k, v)| (k.to_string(), v)));
                source_row
            })
            .collect();
        Ok((summary, source_rows))
    }
}

fn next_after_ready(feed: QualityFeed) -> QualityState {
    match feed {
        QualityFeed::Request => QualityState::Acquire(QualityFeed::Response),
        QualityFeed::Response => QualityState::ResolveMetadata(QualityFeed::Request),
    }
}

fn next_after_metadata(feed: QualityFeed) -> QualityState {
    match feed {
        QualityFeed::Request => QualityState::ResolveMetadata(QualityFeed::Response),
        QualityFeed::Response => QualityState::Download,
    }
}

fn log_summary(key: &str, aggregate: &QualityAggregate) {
    let s = &aggregate.summary;
    info!(
        key,
        requests = s.requests,
        responses = s.responses,
        drop_rate = s.drop_rate(),
        good = s.good,
        bad = s.bad,
        warn = s.warn,
        good_rate = s.good_rate(),
        bad_rate = s.bad_rate(),
        warn_rate = s.warn_rate(),
        "quality summary"
    );
    for (source, requests) in top_groups(&aggregate.by_source, 5, |t| t.requests as f64) {
        info!(key, source = %source, requests, "top source by requests");
    }
}

#[async_trait]
impl ReportJob for QualityJob {
    type State = QualityState;

    fn kind(&self) -> ReportKind {
        ReportKind::Quality
    }

    fn report_key(&self) -> String {
        self.window.key()
    }

    fn deps(&self) -> &JobDeps {
        &self.deps
    }

    fn summary_location(&self) -> (&'static str, Cell) {
        (QUALITY_SUMMARY_TABLE, self.window.start_key.into())
    }

    fn start(&self) -> QualityState {
        QualityState::Acquire(QualityFeed::Request)
    }

    fn state_name(state: &QualityState) -> &'static str {
        match state {
            QualityState::Acquire(QualityFeed::Request) => "acquire_request",
            QualityState::Acquire(QualityFeed::Response) => "acquire_response",
            QualityState::AwaitReady(QualityFeed::Request) => "await_request",
            QualityState::AwaitReady(QualityFeed::Response) => "await_response",
            QualityState::ResolveMetadata(QualityFeed::Request) => "resolve_request_metadata",
            QualityState::ResolveMetadata(QualityFeed::Response) => "resolve_response_metadata",
            QualityState::Download => "download",
            QualityState::Aggregate { .. } => "aggregate",
            QualityState::Persist { .. } => "persist",
        }
    }

    async fn advance(
        &mut self,
        state: QualityState,
        checkpoint: &mut CheckpointHandle,
    ) -> Result<Step<QualityState>, JobError> {
        let next = match state {
            QualityState::Acquire(feed) => {
                self.acquire(feed, checkpoint).await?;
                QualityState::AwaitReady(feed)
            }
            QualityState::AwaitReady(feed) => {
                self.await_ready(feed, checkpoint).await?;
                next_after_ready(feed)
            }
            QualityState::ResolveMetadata(feed) => {
                self.resolve_metadata(feed, checkpoint).await?;
                next_after_metadata(feed)
            }
            QualityState::Download => QualityState::Aggregate {
                requests: self.download(QualityFeed::Request, checkpoint).await?,
                responses: self.download(QualityFeed::Response, checkpoint).await?,
            },
            QualityState::Aggregate { requests, responses } => {
                let rows_fetched = requests.len() + responses.len();
                let aggregate = aggregate_quality(
                    &self.in_window(QualityFeed::Request, &requests),
                    &self.in_window(QualityFeed::Response, &responses),
                );
                log_summary(&self.window.key(), &aggregate);
                QualityState::Persist {
                    aggregate,
                    rows_fetched,
                }
            }
            QualityState::Persist {
                aggregate,
                rows_fetched,
            } => {
                let (summary, source_rows) = self.persistable_rows(&aggregate, checkpoint)?;
                // The summary row marks the range as reported, so it goes last.
                if !source_rows.is_empty() {
                    self.deps
                        .warehouse
                        .insert_rows(QUALITY_BY_SOURCE_TABLE, &source_rows)
                        .await?;
                }
                self.deps
                    .warehouse
                    .insert_rows(QUALITY_SUMMARY_TABLE, std::slice::from_ref(&summary))
                    .await?;
                checkpoint
                    .record(CheckpointPatch::new().status(CheckpointStatus::Completed))
                    .await?;
                return Ok(Step::Done(JobOutcome::Completed {
                    kind: ReportKind::Quality,
                    report_key: self.window.key(),
                    rows_fetched,
                    truncated: false,
                    summary,
                }));
            }
        };
        Ok(Step::Next(next))
    }
}
