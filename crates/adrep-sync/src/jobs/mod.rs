//! Report jobs as explicit state machines.
//!
//! Every job follows the same outer shape, driven by [`drive`]:
//!
//! 1. its window is resolved when the job is built;
//! 2. the warehouse is asked for an existing summary row, and a hit ends the
//!    run without touching the upstream API (unless forced);
//! 3. the checkpoint is opened (or reset when forced) and marked PROCESSING;
//! 4. [`ReportJob::advance`] is called until it returns [`Step::Done`].
//!
//! Each state first consults the checkpoint and skips work that already
//! happened. Any error after step 3 marks the checkpoint FAILED and is
//! returned; ids and flags recorded so far stay in place for the next run.

pub mod analytics;
pub mod exchange;
pub mod quality;

use std::fmt;
use std::sync::Arc;

use adrep_adapters::AdapterError;
use adrep_core::{Checkpoint, CheckpointPatch, CheckpointStatus, ReportKind};
use adrep_storage::{
    dated_object_path, upload_best_effort, CheckpointStore, ObjectStorage, PollError, RawDumpStore,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::schema::{Cell, Row};
use crate::warehouse::{WarehouseError, WarehouseSink};

pub use analytics::{AnalyticsJob, AnalyticsJobSettings, AnalyticsState};
pub use exchange::{ExchangeJob, ExchangeJobSettings, ExchangeState};
pub use quality::{QualityJob, QualityJobSettings, QualityState};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("transient upstream failure: {0}")]
    TransientExternal(#[source] AdapterError),
    #[error("upstream failure: {0}")]
    External(#[source] AdapterError),
    #[error("{what} timed out after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },
    #[error(transparent)]
    ConfigurationMissing(#[from] ConfigError),
    #[error("warehouse rejected rows: {0}")]
    PartialWriteFailure(#[source] WarehouseError),
    #[error("warehouse: {0}")]
    Warehouse(#[source] WarehouseError),
    #[error("checkpoint store: {0:#}")]
    Checkpoint(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<AdapterError> for JobError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Poll(PollError::Timeout { what, attempts }) => {
                JobError::Timeout { what, attempts }
            }
            err if err.is_transient() => JobError::TransientExternal(err),
            err => JobError::External(err),
        }
    }
}

impl From<WarehouseError> for JobError {
    fn from(err: WarehouseError) -> Self {
        match err {
            err @ WarehouseError::PartialWrite { .. } => JobError::PartialWriteFailure(err),
            err => JobError::Warehouse(err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        kind: ReportKind,
        report_key: String,
        rows_fetched: usize,
        /// Pagination stopped at the page ceiling.
        truncated: bool,
        summary: Row,
    },
    /// A summary row already existed; `existing` is that stored row.
    AlreadyReported {
        kind: ReportKind,
        report_key: String,
        existing: Row,
    },
}

impl JobOutcome {
    pub fn kind(&self) -> ReportKind {
        match self {
            JobOutcome::Completed { kind, .. } | JobOutcome::AlreadyReported { kind, .. } => *kind,
        }
    }

    pub fn report_key(&self) -> &str {
        match self {
            JobOutcome::Completed { report_key, .. }
            | JobOutcome::AlreadyReported { report_key, .. } => report_key,
        }
    }

    pub fn summary(&self) -> &Row {
        match self {
            JobOutcome::Completed { summary, .. } => summary,
            JobOutcome::AlreadyReported { existing, .. } => existing,
        }
    }
}

pub enum Step<S> {
    Next(S),
    Done(JobOutcome),
}

/// Raw-row dumps plus their best-effort upload. Never fails a job.
#[derive(Clone)]
pub struct RawDumps {
    store: RawDumpStore,
    bucket: Option<Arc<dyn ObjectStorage>>,
    cleanup_local: bool,
}

impl RawDumps {
    pub fn new(
        store: RawDumpStore,
        bucket: Option<Arc<dyn ObjectStorage>>,
        cleanup_local: bool,
    ) -> Self {
        Self {
            store,
            bucket,
            cleanup_local,
        }
    }

    pub async fn record(
        &self,
        kind: ReportKind,
        label: &str,
        date: NaiveDate,
        report_id: &str,
        rows: &[JsonValue],
    ) {
        let dump = match self.store.dump_rows(kind, label, date, report_id, rows).await {
            Ok(dump) => dump,
            Err(err) => {
                warn!(kind = %kind, label, error = %err, "could not write raw dump; continuing");
                return;
            }
        };
        info!(
            kind = %kind,
            label,
            rows = rows.len(),
            path = %dump.relative_path.display(),
            deduplicated = dump.deduplicated,
            "raw rows dumped"
        );
        if let Some(bucket) = &self.bucket {
            let destination = dated_object_path(date, &dump.file_name);
            upload_best_effort(
                bucket.as_ref(),
                &dump.absolute_path,
                &destination,
                self.cleanup_local,
            )
            .await;
        }
    }
}

/// Collaborators every job needs besides its report API.
#[derive(Clone)]
pub struct JobDeps {
    pub warehouse: Arc<dyn WarehouseSink>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub dumps: Option<RawDumps>,
    pub force_rerun: bool,
}

impl JobDeps {
    pub(crate) async fn dump(
        &self,
        kind: ReportKind,
        label: &str,
        date: NaiveDate,
        report_id: &str,
        rows: &[JsonValue],
    ) {
        if let Some(dumps) = &self.dumps {
            dumps.record(kind, label, date, report_id, rows).await;
        }
    }
}

/// The open checkpoint of a running job. Every `record` is persisted before it returns.
pub struct CheckpointHandle {
    store: Arc<dyn CheckpointStore>,
    current: Checkpoint,
}

impl CheckpointHandle {
    pub async fn open(
        store: Arc<dyn CheckpointStore>,
        key: &str,
        force_rerun: bool,
    ) -> Result<Self, JobError> {
        if force_rerun {
            let fresh = Checkpoint::fresh(key, Utc::now());
            store.replace(&fresh).await.map_err(JobError::Checkpoint)?;
            info!(key, "force rerun; checkpoint reset");
            return Ok(Self { store, current: fresh });
        }

        match store.load(key).await {
            Some(existing) => info!(
                key,
                status = ?existing.status,
                job_ids = ?existing.job_ids,
                ready = ?existing.ready,
                "resuming from checkpoint"
            ),
            None => info!(key, "no checkpoint; starting fresh"),
        }
        let current = store
            .save(key, &CheckpointPatch::new().status(CheckpointStatus::Processing))
            .await
            .map_err(JobError::Checkpoint)?;
        Ok(Self { store, current })
    }

    pub fn current(&self) -> &Checkpoint {
        &self.current
    }

    pub fn job_id(&self, slot: &str) -> Option<&str> {
        self.current.job_id(slot)
    }

    pub fn is_ready(&self, slot: &str) -> bool {
        self.current.is_ready(slot)
    }

    pub async fn record(&mut self, patch: CheckpointPatch) -> Result<(), JobError> {
        self.current = self
            .store
            .save(&self.current.report_key, &patch)
            .await
            .map_err(JobError::Checkpoint)?;
        Ok(())
    }
}

#[async_trait]
pub trait ReportJob: Send {
    type State: Send;

    fn kind(&self) -> ReportKind;
    fn report_key(&self) -> String;
    fn deps(&self) -> &JobDeps;
    /// Table and partition value holding this run's summary row once completed.
    fn summary_location(&self) -> (&'static str, Cell);
    fn start(&self) -> Self::State;
    fn state_name(state: &Self::State) -> &'static str;

    /// Perform one state's work and name the next state.
    async fn advance(&mut self, state: Self::State, checkpoint: &mut CheckpointHandle)
        -> Result<Step<Self::State>, JobError>;
}

pub async fn drive<J: ReportJob>(job: &mut J) -> Result<JobOutcome, JobError> {
    let kind = job.kind();
    let key = job.report_key();
    let deps = job.deps().clone();
    info!(kind = %kind, key = %key, force_rerun = deps.force_rerun, "starting report job");

    if !deps.force_rerun {
        let (table, partition) = job.summary_location();
        let stored = deps.warehouse.query(table, &partition, 1).await?;
        if let Some(existing) = stored.into_iter().next() {
            info!(kind = %kind, key = %key, table, "already reported; skipping");
            return Ok(JobOutcome::AlreadyReported {
                kind,
                report_key: key,
                existing,
            });
        }
    }

    let mut checkpoint =
        CheckpointHandle::open(Arc::clone(&deps.checkpoints), &key, deps.force_rerun).await?;
    let mut state = job.start();
    loop {
        let name = J::state_name(&state);
        debug!(kind = %kind, key = %key, state = name, "advancing");
        match job.advance(state, &mut checkpoint).await {
            Ok(Step::Next(next)) => state = next,
            Ok(Step::Done(outcome)) => {
                info!(kind = %kind, key = %key, "report job completed");
                return Ok(outcome);
            }
            Err(err) => {
                error!(kind = %kind, key = %key, state = name, error = %err, "report job failed");
                if let Err(save_err) = checkpoint
                    .record(CheckpointPatch::new().status(CheckpointStatus::Failed))
                    .await
                {
                    error!(
                        kind = %kind,
                        key = %key,
                        error = %save_err,
                        "could not mark checkpoint FAILED"
                    );
                }
                return Err(err);
            }
        }
    }
}

impl fmt::Debug for JobDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDeps")
            .field("dumps", &self.dumps.is_some())
            .field("force_rerun", &self.force_rerun)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use adrep_storage::FetchError;

    #[test]
    fn adapter_errors_map_onto_the_job_taxonomy() {
        let timeout = JobError::from(AdapterError::Poll(PollError::Timeout {
            what: "exchange report run".into(),
            attempts: 60,
        }));
        assert!(matches!(timeout, JobError::Timeout { attempts: 60, .. }));

        let transient = JobError::from(AdapterError::from(FetchError::HttpStatus {
            status: 503,
            url: "https://reports.example".into(),
            body: String::new(),
        }));
        assert!(matches!(transient, JobError::TransientExternal(_)));

        let permanent = JobError::from(AdapterError::from(FetchError::HttpStatus {
            status: 403,
            url: "https://reports.example".into(),
            body: String::new(),
        }));
        assert!(matches!(permanent, JobError::External(_)));
    }

    #[test]
    fn partial_writes_keep_their_own_variant() {
        let err = JobError::from(WarehouseError::PartialWrite {
            table: "t".into(),
            written: 1,
            failures: Vec::new(),
        });
        assert!(matches!(err, JobError::PartialWriteFailure(_)));
        assert!(matches!(
            JobError::from(WarehouseError::UnknownTable("t".into())),
            JobError::Warehouse(_)
        ));
    }
}
