use std::path::PathBuf;

use adrep_core::ReportKind;
use adrep_sync::{init_warehouse, run_all, Collaborators, EtlConfig};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adrep")]
#[command(about = "Daily ad report ETL: exchange revenue, traffic quality and web analytics")]
struct Cli {
    /// YAML config file; environment variables are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run as if today were this date (YYYY-MM-DD).
    #[arg(long, global = true)]
    report_date: Option<NaiveDate>,

    /// Ignore stored summaries and checkpoints and start fresh.
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the report jobs.
    Run {
        /// Run a single job (exchange, quality or analytics).
        #[arg(long)]
        only: Option<ReportKind>,
    },
    /// Create missing warehouse tables.
    Init,
}

fn load_config(cli: &Cli) -> Result<EtlConfig> {
    let mut config = match &cli.config {
        Some(path) => EtlConfig::from_yaml_file(path)?,
        None => EtlConfig::from_env()?,
    };
    if cli.report_date.is_some() {
        config.report_date = cli.report_date;
    }
    config.force_rerun |= cli.force;
    Ok(config)
}

/// Settings every command shares. Per-job credentials are checked by each job so one
/// missing token only fails that job.
fn preflight(config: &EtlConfig) -> Result<()> {
    config.warehouse_dir().context("validating configuration")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run { only: None }) {
        Commands::Run { only } => {
            let kinds: Vec<ReportKind> = match only {
                Some(kind) => vec![kind],
                None => ReportKind::ALL.to_vec(),
            };
            preflight(&config)?;
            let collab = Collaborators::from_config(&config)?;

            let summary = run_all(&config, &collab, &kinds).await?;
            println!(
                "run complete: run_id={} date={} succeeded=[{}] failed=[{}]{}",
                summary.run_id,
                summary.run_date,
                summary.succeeded_names().join(","),
                summary.failed_names().join(","),
                summary
                    .reports_dir
                    .as_ref()
                    .map(|dir| format!(" reports={}", dir.display()))
                    .unwrap_or_default()
            );
        }
        Commands::Init => {
            preflight(&config)?;
            let collab = Collaborators::from_config(&config)?;
            let created = init_warehouse(&collab).await?;
            println!("warehouse ready: {created} tables created");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_job_credentials_do_not_block_the_run() {
        let config = EtlConfig {
            warehouse_dir: Some(PathBuf::from("/tmp/adrep-warehouse")),
            ..EtlConfig::default()
        };
        assert!(config.validate(&ReportKind::ALL).is_err());
        preflight(&config).expect("only the warehouse is required up front");
    }

    #[test]
    fn missing_warehouse_fails_before_any_job() {
        let err = preflight(&EtlConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("validating configuration"));
    }
}
