//! Web-analytics job. The upstream report is synchronous, so there is no
//! report id to remember; the checkpoint only tracks status and row count.

use std::sync::Arc;

use adrep_adapters::{parse_analytics_row, AnalyticsReportApi};
use adrep_core::{AnalyticsRecord, CheckpointPatch, CheckpointStatus, ReportKind};
use adrep_storage::{fetch_all_pages, Page, PageLimits};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use super::{CheckpointHandle, JobDeps, JobError, JobOutcome, ReportJob, Step};
use crate::aggregate::{aggregate_analytics, top_groups, AnalyticsAggregate, AnalyticsTotals};
use crate::config::EtlConfig;
use crate::schema::{
    row, Cell, Row, ANALYTICS_BY_MEDIUM_TABLE, ANALYTICS_BY_SOURCE_MEDIUM_TABLE,
    ANALYTICS_BY_SOURCE_TABLE, ANALYTICS_SUMMARY_TABLE,
};
use crate::window::AnalyticsWindow;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsJobSettings {
    pub paging: PageLimits,
    pub page_size: u64,
}

impl AnalyticsJobSettings {
    pub fn from_config(config: &EtlConfig) -> Self {
        Self {
            paging: config.page_limits(),
            page_size: config.analytics.page_size,
        }
    }
}

#[derive(Debug)]
pub enum AnalyticsState {
    Fetch,
    Aggregate { rows: Vec<JsonValue>, truncated: bool },
    Persist {
        aggregate: AnalyticsAggregate,
        rows_fetched: usize,
        truncated: bool,
    },
}

pub struct AnalyticsJob {
    api: Arc<dyn AnalyticsReportApi>,
    deps: JobDeps,
    settings: AnalyticsJobSettings,
    window: AnalyticsWindow,
}

/// Breakdown rows destined for one table.
struct Breakdown {
    table: &'static str,
    rows: Vec<Row>,
}

impl AnalyticsJob {
    pub fn new(
        api: Arc<dyn AnalyticsReportApi>,
        deps: JobDeps,
        settings: AnalyticsJobSettings,
        run_date: NaiveDate,
    ) -> Self {
        Self {
            api,
            deps,
            settings,
            window: AnalyticsWindow::for_run(run_date),
        }
    }

    async fn fetch(&self) -> Result<(Vec<JsonValue>, bool), JobError> {
        let api = Arc::clone(&self.api);
        let date = self.window.covered_date;
        let limit = self.settings.page_size.max(1);
        let fetch_page = |offset: Option<u64>| {
            let api = Arc::clone(&api);
            async move {
                let offset = offset.unwrap_or(0);
                let rows = api.run_report(date, limit, offset).await?;
                // A short page is the last one.
                let next = (rows.len() as u64 >= limit).then_some(offset + limit);
                Ok::<_, JobError>(Page { rows, next })
            }
        };
        let paged =
            fetch_all_pages("analytics report rows", self.settings.paging, fetch_page).await?;

        info!(
            date = %date,
            rows = paged.rows.len(),
            pages = paged.pages,
            truncated = paged.truncated,
            "analytics rows fetched"
        );
        self.deps
            .dump(ReportKind::Analytics, "rows", date, &self.window.key, &paged.rows)
            .await;
        Ok((paged.rows, paged.truncated))
    }

    fn group_row(
        &self,
        keys: &[(&'static str, &str)],
        totals: &AnalyticsTotals,
        now: DateTime<Utc>,
    ) -> Row {
        let mut out = row([
            ("report_date", self.window.covered_date.into()),
            ("sessions", totals.sessions.into()),
            ("revenue", totals.revenue.into()),
            ("ad_revenue", totals.ad_revenue.into()),
            ("created_at", now.into()),
            ("display_date", self.window.covered_date.into()),
        ]);
        for (column, value) in keys {
            out.insert(column.to_string(), (*value).into());
        }
        out
    }

    fn persistable_rows(&self, aggregate: &AnalyticsAggregate) -> (Row, Vec<Breakdown>) {
        let now = Utc::now();
        let s = &aggregate.summary;
        let summary = row([
            ("report_date", self.window.covered_date.into()),
            ("total_sessions", s.sessions.into()),
            ("total_revenue", s.revenue.into()),
            ("total_ad_revenue", s.ad_revenue.into()),
            ("total_events", s.events.into()),
            ("total_page_views", s.page_views.into()),
            ("total_engaged_sessions", s.engaged_sessions.into()),
            ("total_users", s.users.into()),
            ("status", CheckpointStatus::Completed.as_str().into()),
            ("created_at", now.into()),
            ("updated_at", now.into()),
            ("display_date", self.window.covered_date.into()),
        ]);

        let breakdowns = vec![
            Breakdown {
                table: ANALYTICS_BY_SOURCE_TABLE,
                rows: aggregate
                    .by_source
                    .iter()
                    .map(|(source, t)| self.group_row(&[("source", source.as_str())], t, now))
                    .collect(),
            },
            Breakdown {
                table: ANALYTICS_BY_MEDIUM_TABLE,
                rows: aggregate
                    .by_medium
                    .iter()
                    .map(|(medium, t)| self.group_row(&[("medium", medium.as_str())], t, now))
                    .collect(),
            },
            Breakdown {
                table: ANALYTICS_BY_SOURCE_MEDIUM_TABLE,
                rows: aggregate
                    .by_source_medium
                    .iter()
                    .map(|((source, medium), t)| {
                        let keys = [("source", source.as_str()), ("medium", medium.as_str())];
                        self.group_row(&keys, t, now)
                    })
                    .collect(),
            },
        ];
        (summary, breakdowns)
    }
}

fn log_summary(key: &str, aggregate: &AnalyticsAggregate) {
    let s = &aggregate.summary;
    info!(
        key,
        sessions = s.sessions,
        revenue = s.revenue,
        ad_revenue = s.ad_revenue,
        events = s.events,
        page_views = s.page_views,
        engaged_sessions = s.engaged_sessions,
        users = s.users,
        "analytics summary"
    );
    for (source, sessions) in top_groups(&aggregate.by_source, 5, |t| t.sessions as f64) {
        info!(key, source = %source, sessions, "top source by sessions");
    }
    for (medium, sessions) in top_groups(&aggregate.by_medium, 5, |t| t.sessions as f64) {
        info!(key, medium = %medium, sessions, "top medium by sessions");
    }
}

#[async_trait]
impl ReportJob for AnalyticsJob {
    type State = AnalyticsState;

    fn kind(&self) -> ReportKind {
        ReportKind::Analytics
    }

    fn report_key(&self) -> String {
        self.window.key.clone()
    }

    fn deps(&self) -> &JobDeps {
        &self.deps
    }

    fn summary_location(&self) -> (&'static str, Cell) {
        (ANALYTICS_SUMMARY_TABLE, Cell::Date(self.window.covered_date))
    }

    fn start(&self) -> AnalyticsState {
        AnalyticsState::Fetch
    }

    fn state_name(state: &AnalyticsState) -> &'static str {
        match state {
            AnalyticsState::Fetch => "fetch",
            AnalyticsState::Aggregate { .. } => "aggregate",
            AnalyticsState::Persist { .. } => "persist",
        }
    }

    async fn advance(
        &mut self,
        state: AnalyticsState,
        checkpoint: &mut CheckpointHandle,
    ) -> Result<Step<AnalyticsState>, JobError> {
        let next = match state {
            AnalyticsState::Fetch => {
                let (rows, truncated) = self.fetch().await?;
                AnalyticsState::Aggregate { rows, truncated }
            }
            AnalyticsState::Aggregate { rows, truncated } => {
                let records: Vec<AnalyticsRecord> = rows.iter().map(parse_analytics_row).collect();
                let aggregate = aggregate_analytics(&records);
                log_summary(&self.window.key, &aggregate);
                AnalyticsState::Persist {
                    aggregate,
                    rows_fetched: rows.len(),
                    truncated,
                }
            }
            AnalyticsState::Persist {
                aggregate,
                rows_fetched,
                truncated,
            } => {
                let (summary, breakdowns) = self.persistable_rows(&aggregate);
                for breakdown in breakdowns.iter().filter(|b| !b.rows.is_empty()) {
                    self.deps
                        .warehouse
                        .insert_rows(breakdown.table, &breakdown.rows)
                        .await?;
                }
                self.deps
                    .warehouse
                    .insert_rows(ANALYTICS_SUMMARY_TABLE, std::slice::from_ref(&summary))
                    .await?;
                checkpoint
                    .record(
                        CheckpointPatch::new()
                            .status(CheckpointStatus::Completed)
                            .row_count(rows_fetched as u64),
                    )
                    .await?;
                return Ok(Step::Done(JobOutcome::Completed {
                    kind: ReportKind::Analytics,
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
