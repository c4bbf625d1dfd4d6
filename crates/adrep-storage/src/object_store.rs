//! Object storage upload for raw dumps. Uploads are best-effort.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use tokio::fs;
use tracing::{info, warn};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Copy `local` to `destination` and return the stored object's URI.
    async fn upload(&self, local: &Path, destination: &str) -> anyhow::Result<String>;
}

/// A bucket backed by a local directory (mounted bucket or test fixture).
#[derive(Debug, Clone)]
pub struct DirectoryBucket {
    root: PathBuf,
}

impl DirectoryBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStorage for DirectoryBucket {
    async fn upload(&self, local: &Path, destination: &str) -> anyhow::Result<String> {
        let target = self.root.join(destination.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating bucket directory {}", parent.display()))?;
        }
        fs::copy(local, &target).await.with_context(|| {
            format!("copying {} -> {}", local.display(), target.display())
        })?;
        Ok(format!("file://{}", target.display()))
    }
}

/// `YYYY/MM/<file_name>` for the month of `date`.
pub fn dated_object_path(date: NaiveDate, file_name: &str) -> String {
    format!("{:04}/{:02}/{file_name}", date.year(), date.month())
}

/// Upload and optionally delete the local copy. Never fails; returns whether the upload landed.
pub async fn upload_best_effort(
    storage: &dyn ObjectStorage,
    local: &Path,
    destination: &str,
    cleanup_local: bool,
) -> bool {
    match storage.upload(local, destination).await {
        Ok(uri) => {
            info!(local = %local.display(), uri = %uri, "uploaded raw dump");
            if cleanup_local {
                if let Err(err) = fs::remove_file(local).await {
                    warn!(local = %local.display(), error = %err, "could not remove local dump");
                }
            }
            true
        }
        Err(err) => {
            warn!(
                local = %local.display(),
                destination,
                error = %err,
                "object upload failed; continuing"
            );
            false
        }
    }
}
