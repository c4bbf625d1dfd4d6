//! Raw report dumps written next to each run for audit and replay.

use std::path::{Path, PathBuf};

use adrep_core::ReportKind;
use anyhow::Context;
use chrono::NaiveDate;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredDump {
    pub content_hash: String,
    pub file_name: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct RawDumpStore {
    root: PathBuf,
}

impl RawDumpStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn dump_file_name(
        kind: ReportKind,
        label: &str,
        report_date: NaiveDate,
        content_hash: &str,
    ) -> String {
        let short_hash = &content_hash[..content_hash.len().min(12)];
        format!(
            "{}-{}-{}-{short_hash}.json",
            kind.name(),
            label,
            report_date.format("%Y-%m-%d")
        )
    }

    /// Write `{ metadata: { reportDate, reportId }, data: { rows } }` for one fetch.
    pub async fn dump_rows(
        &self,
        kind: ReportKind,
        label: &str,
        report_date: NaiveDate,
        report_id: &str,
        rows: &[JsonValue],
    ) -> anyhow::Result<StoredDump> {
        let document = json!({
            "metadata": {
                "reportDate": report_date.format("%Y-%m-%d").to_string(),
                "reportId": report_id,
            },
            "data": { "rows": rows },
        });
        let bytes = serde_json::to_vec_pretty(&document).context("serializing raw dump")?;
        let content_hash = Self::sha256_hex(&bytes);
        let file_name = Self::dump_file_name(kind, label, report_date, &content_hash);
        let relative_path = PathBuf::from(kind.name())
            .join(report_date.format("%Y-%m-%d").to_string())
            .join(&file_name);
        self.store_bytes(content_hash, file_name, relative_path, &bytes).await
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    async fn store_bytes(
        &self,
        content_hash: String,
        file_name: String,
        relative_path: PathBuf,
        bytes: &[u8],
    ) -> anyhow::Result<StoredDump> {
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating dump directory {}", parent.display()))?;

        let stored = |deduplicated| StoredDump {
            content_hash: content_hash.clone(),
            file_name: file_name.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking dump path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp dump file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp dump file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp dump file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp dump {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dump_names_are_stable() {
        let hash = RawDumpStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let date = NaiveDate::from_ymd_opt(2025, 7, 14).unwrap();
        assert_eq!(
            RawDumpStore::dump_file_name(ReportKind::Exchange, "raw", date, &hash),
            "exchange-raw-2025-07-14-b94d27b9934d.json"
        );
    }

    #[tokio::test]
    async fn identical_dumps_deduplicate() {
        let dir = tempdir().expect("tempdir");
        let store = RawDumpStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 7, 13).unwrap();
        let rows = vec![json!({"sessionSource": "google", "sessions": "4"})];

        let first = store
            .dump_rows(ReportKind::Analytics, "raw", date, "", &rows)
            .await
            .expect("first dump");
        let second = store
            .dump_rows(ReportKind::Analytics, "raw", date, "", &rows)
            .await
            .expect("second dump");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);

        let bytes = std::fs::read(&first.absolute_path).expect("read");
        let written: JsonValue = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(written["metadata"]["reportDate"], "2025-07-13");
        assert_eq!(written["data"]["rows"][0]["sessionSource"], "google");
    }
}
