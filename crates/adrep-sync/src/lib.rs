//! Report ETL: windows, aggregation, the warehouse sink and the three report jobs.

pub mod aggregate;
pub mod config;
pub mod jobs;
pub mod notify;
pub mod run;
pub mod schema;
pub mod warehouse;
pub mod window;

pub use config::{ConfigError, EtlConfig};
pub use jobs::{drive, JobDeps, JobError, JobOutcome, ReportJob};
pub use notify::{NoopNotifier, Notifier, SlackNotifier};
pub use run::{init_warehouse, run_all, Collaborators, FailedJob, RunSummary};
pub use warehouse::{ParquetWarehouse, WarehouseError, WarehouseSink};

pub const CRATE_NAME: &str = "adrep-sync";
