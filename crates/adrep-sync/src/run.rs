//! Run driver: table setup, the three jobs in sequence, notification and the run brief.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use adrep_adapters::{
    AdManagerClient, AnalyticsApiClient, AnalyticsReportApi, ExchangeReportApi, QualityApiClient,
    QualityReportApi,
};
use adrep_core::ReportKind;
use adrep_storage::{
    DirectoryBucket, HttpFetcher, JsonFileCheckpointStore, ObjectStorage, RawDumpStore,
};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EtlConfig;
use crate::jobs::{
    drive, AnalyticsJob, AnalyticsJobSettings, ExchangeJob, ExchangeJobSettings, JobDeps, JobError,
    JobOutcome, QualityJob, QualityJobSettings, RawDumps,
};
use crate::notify::{NoopNotifier, Notifier, SlackNotifier};
use crate::schema::all_tables;
use crate::warehouse::{ensure_tables, ParquetWarehouse, WarehouseSink};

/// Notified as the only failure when the run cannot even prepare its tables.
pub const SETUP_FAILURE: &str = "unknown failure";

/// Everything the run talks to, built once from config.
#[derive(Clone)]
pub struct Collaborators {
    pub warehouse: Arc<dyn WarehouseSink>,
    pub exchange: Arc<dyn ExchangeReportApi>,
    pub quality: Arc<dyn QualityReportApi>,
    pub analytics: Arc<dyn AnalyticsReportApi>,
    pub notifier: Arc<dyn Notifier>,
    pub object_store: Option<Arc<dyn ObjectStorage>>,
}

impl Collaborators {
    /// Credentials of jobs that were not selected may be absent; those clients are never called.
    pub fn from_config(config: &EtlConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let exchange = AdManagerClient::new(
            http.clone(),
            config.exchange.api_base.clone(),
            config.exchange.network_code.clone().unwrap_or_default(),
            config.exchange.access_token.clone().unwrap_or_default(),
        );
        let quality = QualityApiClient::new(
            http.clone(),
            config.quality.api_base.clone(),
            config.quality.api_token.clone().unwrap_or_default(),
            config.quality.instance_id.unwrap_or_default(),
        );
        let analytics = AnalyticsApiClient::new(
            http,
            config.analytics.api_base.clone(),
            config.analytics.property_id.clone().unwrap_or_default(),
            config.analytics.access_token.clone().unwrap_or_default(),
        );

        let notifier: Arc<dyn Notifier> = match &config.slack_webhook_url {
            Some(url) => Arc::new(
                SlackNotifier::new(url.clone(), config.http_client_config().timeout)
                    .context("building notifier")?,
            ),
            None => Arc::new(NoopNotifier),
        };
        let object_store = config
            .object_store_dir
            .as_ref()
            .map(|dir| Arc::new(DirectoryBucket::new(dir.clone())) as Arc<dyn ObjectStorage>);

        Ok(Self {
            warehouse: Arc::new(ParquetWarehouse::new(config.warehouse_dir()?)),
            exchange: Arc::new(exchange),
            quality: Arc::new(quality),
            analytics: Arc::new(analytics),
            notifier,
            object_store,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub kind: ReportKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<ReportKind>,
    pub failed: Vec<FailedJob>,
    pub outcomes: Vec<JobOutcome>,
    pub reports_dir: Option<PathBuf>,
}

impl RunSummary {
    pub fn succeeded_names(&self) -> Vec<String> {
        self.succeeded.iter().map(|k| k.name().to_string()).collect()
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.kind.name().to_string()).collect()
    }
}

/// Create any missing warehouse table.
pub async fn init_warehouse(collab: &Collaborators) -> Result<usize> {
    let created = ensure_tables(collab.warehouse.as_ref(), &all_tables())
        .await
        .context("ensuring warehouse tables")?;
    info!(created, "warehouse tables ready");
    Ok(created)
}

/// Run the selected jobs in order. A failing job is recorded and the next one still runs;
/// only a failure to prepare the warehouse fails the run itself.
pub async fn run_all(
    config: &EtlConfig,
    collab: &Collaborators,
    kinds: &[ReportKind],
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let run_date = config.run_date(started_at.date_naive());
    info!(
        %run_id,
        %run_date,
        jobs = ?kinds,
        force_rerun = config.force_rerun,
        "starting report run"
    );

    if let Err(err) = init_warehouse(collab).await {
        error!(%run_id, error = %format!("{err:#}"), "warehouse setup failed");
        collab.notifier.notify(&[], &[SETUP_FAILURE.to_string()]).await;
        return Err(err);
    }

    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    let mut outcomes = Vec::new();
    for &kind in kinds {
        match run_job(config, collab, kind, run_date).await {
            Ok(outcome) => {
                succeeded.push(kind);
                outcomes.push(outcome);
            }
            Err(err) => {
                error!(
                    %run_id,
                    kind = %kind,
                    error = %err,
                    "job failed; continuing with the next one"
                );
                failed.push(FailedJob {
                    kind,
                    error: err.to_string(),
                });
            }
        }
    }

    let mut summary = RunSummary {
        run_id,
        run_date,
        started_at,
        finished_at: Utc::now(),
        succeeded,
        failed,
        outcomes,
        reports_dir: None,
    };
    collab
        .notifier
        .notify(&summary.succeeded_names(), &summary.failed_names())
        .await;

    if let Some(root) = &config.reports_dir {
        match write_reports(root, &summary).await {
            Ok(dir) => summary.reports_dir = Some(dir),
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run brief"),
        }
    }

    info!(
        %run_id,
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        "report run finished"
    );
    Ok(summary)
}

async fn run_job(
    config: &EtlConfig,
    collab: &Collaborators,
    kind: ReportKind,
    run_date: NaiveDate,
) -> Result<JobOutcome, JobError> {
    config.validate(&[kind])?;
    let deps = JobDeps {
        warehouse: Arc::clone(&collab.warehouse),
        checkpoints: Arc::new(JsonFileCheckpointStore::new(config.checkpoint_path(kind))),
        dumps: Some(RawDumps::new(
            RawDumpStore::new(config.dump_dir.clone()),
            collab.object_store.clone(),
            config.cleanup_local_files,
        )),
        force_rerun: config.force_rerun,
    };

    match kind {
        ReportKind::Exchange => {
            let settings = ExchangeJobSettings::from_config(config);
            let mut job = ExchangeJob::new(Arc::clone(&collab.exchange), deps, settings, run_date);
            drive(&mut job).await
        }
        ReportKind::Quality => {
            let settings = QualityJobSettings::from_config(config)?;
            let mut job = QualityJob::new(Arc::clone(&collab.quality), deps, settings, run_date)?;
            drive(&mut job).await
        }
        ReportKind::Analytics => {
            let settings = AnalyticsJobSettings::from_config(config);
            let mut job =
                AnalyticsJob::new(Arc::clone(&collab.analytics), deps, settings, run_date);
            drive(&mut job).await
        }
    }
}

/// Markdown brief plus the JSON summary under `<root>/<run_id>/`.
pub async fn write_reports(root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("daily_brief.md"), daily_brief(summary))
        .await
        .context("writing daily_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    Ok(reports_dir)
}

pub fn daily_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Ad Report Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Report date: {}", summary.run_date),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        String::new(),
        "## Jobs".to_string(),
    ];
    for outcome in &summary.outcomes {
        let line = match outcome {
            JobOutcome::Completed {
                kind,
                report_key,
                rows_fetched,
                truncated,
                ..
            } => {
                let note = if *truncated { " (page ceiling reached)" } else { "" };
                format!("- {kind} `{report_key}`: completed, {rows_fetched} rows fetched{note}")
            }
            JobOutcome::AlreadyReported { kind, report_key, .. } => {
                format!("- {kind} `{report_key}`: already reported")
            }
        };
        lines.push(line);
    }
    for failure in &summary.failed {
        lines.push(format!("- {}: failed: {}", failure.kind, failure.error));
    }
    lines.push(String::new());
    lines.join("\n")
}
