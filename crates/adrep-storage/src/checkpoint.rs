//! Checkpoint persistence: one JSON document per job type, one entry per report key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use adrep_core::{Checkpoint, CheckpointPatch};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the record for `key`. Unreadable or corrupt storage yields `None`
    /// so the job starts over instead of crashing.
    async fn load(&self, key: &str) -> Option<Checkpoint>;

    /// Merge `patch` into the stored record for `key` and return the result.
    async fn save(&self, key: &str, patch: &CheckpointPatch) -> anyhow::Result<Checkpoint>;

    /// Overwrite the record for `checkpoint.report_key` wholesale.
    async fn replace(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;
}

/// `{ "<report key>": { ...checkpoint fields, "updatedAt": "<rfc3339>" } }` on local disk.
#[derive(Debug)]
pub struct JsonFileCheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_entries(&self) -> anyhow::Result<BTreeMap<String, JsonValue>> {
        match fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing checkpoint file {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err)
                .with_context(|| format!("reading checkpoint file {}", self.path.display())),
        }
    }

    /// Entries for a write. A file that no longer parses is moved aside first.
    async fn entries_for_write(&self) -> anyhow::Result<BTreeMap<String, JsonValue>> {
        match self.read_entries().await {
            Ok(entries) => Ok(entries),
            Err(err) if fs::try_exists(&self.path).await.unwrap_or(false) => {
                let aside = self.path.with_extension(format!(
                    "corrupt-{}.json",
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "checkpoint file unreadable; starting a new one"
                );
                fs::rename(&self.path, &aside).await.with_context(|| {
                    format!("moving corrupt checkpoint file to {}", aside.display())
                })?;
                Ok(BTreeMap::new())
            }
            Err(err) => Err(err),
        }
    }

    async fn write_entries(&self, entries: &BTreeMap<String, JsonValue>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
        }

        let bytes = serde_json::to_vec_pretty(entries).context("serializing checkpoints")?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string());
        let temp_path = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp checkpoint file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp checkpoint file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp checkpoint file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp checkpoint {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn load(&self, key: &str) -> Option<Checkpoint> {
        let entries = match self.read_entries().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "ignoring unreadable checkpoint file"
                );
                return None;
            }
        };
        let raw = entries.get(key)?.clone();
        match serde_json::from_value::<Checkpoint>(raw) {
            Ok(checkpoint) => {
                info!(key, status = ?checkpoint.status, "loaded checkpoint");
                Some(checkpoint)
            }
            Err(err) => {
                warn!(key, error = %err, "ignoring malformed checkpoint entry");
                None
            }
        }
    }

    async fn save(&self, key: &str, patch: &CheckpointPatch) -> anyhow::Result<Checkpoint> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.entries_for_write().await?;

        let mut checkpoint = entries
            .get(key)
            .and_then(|raw| serde_json::from_value::<Checkpoint>(raw.clone()).ok())
            .unwrap_or_else(|| Checkpoint::new(key));
        let rejected = checkpoint.apply(patch, Utc::now());
        for slot in rejected {
            warn!(key, slot = %slot, "external job id already recorded; keeping the original");
        }

        let value = serde_json::to_value(&checkpoint).context("serializing checkpoint")?;
        entries.insert(key.to_string(), value);
        self.write_entries(&entries).await?;
        debug!(key, path = %self.path.display(), "checkpoint saved");
        Ok(checkpoint)
    }

    async fn replace(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.entries_for_write().await?;

        let mut record = checkpoint.clone();
        record.updated_at = Some(Utc::now());
        let value = serde_json::to_value(&record).context("serializing checkpoint")?;
        entries.insert(record.report_key.clone(), value);
        self.write_entries(&entries).await?;
        info!(key = %record.report_key, "checkpoint replaced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrep_core::CheckpointStatus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileCheckpointStore::new(dir.path().join("exchange-checkpoint.json"));
        assert!(store.load("2025-07-14").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_degrades_to_start_over() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("quality-checkpoint.json");
        std::fs::write(&path, "{ not json").expect("write");
        let store = JsonFileCheckpointStore::new(&path);

        assert!(store.load("20250712").await.is_none());

        let saved = store
            .save("20250712", &CheckpointPatch::new().status(CheckpointStatus::Processing))
            .await
            .expect("save after corruption");
        assert_eq!(saved.status, Some(CheckpointStatus::Processing));
        assert!(store.load("20250712").await.is_some());

        let moved_aside = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(moved_aside);
    }

    #[tokio::test]
    async fn overlapping_saves_merge_per_field() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileCheckpointStore::new(dir.path().join("state").join("cp.json"));

        store
            .save("2025-07-14", &CheckpointPatch::new().status(CheckpointStatus::Processing))
            .await
            .expect("first");
        let first = store.load("2025-07-14").await.expect("first load");
        store
            .save("2025-07-14", &CheckpointPatch::new().job_id("report", "r-1"))
            .await
            .expect("second");
        store
            .save(
                "2025-07-14",
                &CheckpointPatch::new()
                    .job_id("report", "r-1")
                    .job_id("result", "res-9"),
            )
            .await
            .expect("third");

        let loaded = store.load("2025-07-14").await.expect("loaded");
        assert_eq!(loaded.status, Some(CheckpointStatus::Processing));
        assert_eq!(loaded.job_id("report"), Some("r-1"));
        assert_eq!(loaded.job_id("result"), Some("res-9"));
        assert!(loaded.updated_at >= first.updated_at);
        assert_eq!(loaded.created_at, first.created_at);
    }

    #[tokio::test]
    async fn keys_are_partitioned() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileCheckpointStore::new(dir.path().join("cp.json"));
        store
            .save("2025-07-13", &CheckpointPatch::new().status(CheckpointStatus::Completed))
            .await
            .expect("save 13");
        store
            .save("2025-07-14", &CheckpointPatch::new().status(CheckpointStatus::Failed))
            .await
            .expect("save 14");

        assert_eq!(
            store.load("2025-07-13").await.and_then(|c| c.status),
            Some(CheckpointStatus::Completed)
        );
        assert_eq!(
            store.load("2025-07-14").await.and_then(|c| c.status),
            Some(CheckpointStatus::Failed)
        );

        let text = std::fs::read_to_string(store.path()).expect("read");
        let raw: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert!(raw["2025-07-13"]["updatedAt"].is_string());
    }

    #[tokio::test]
    async fn replace_discards_previous_job_ids() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileCheckpointStore::new(dir.path().join("cp.json"));
        store
            .save("2025-07-14", &CheckpointPatch::new().job_id("report", "old"))
            .await
            .expect("save");

        store
            .replace(&Checkpoint::fresh("2025-07-14", Utc::now()))
            .await
            .expect("replace");

        let loaded = store.load("2025-07-14").await.expect("loaded");
        assert_eq!(loaded.job_id("report"), None);
        assert_eq!(loaded.status, Some(CheckpointStatus::Processing));
    }
}
