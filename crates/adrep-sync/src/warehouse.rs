//! Append-only warehouse sink.
//!
//! [`ParquetWarehouse`] keeps one directory per table with a `_schema.json`
//! and one parquet file per insert and partition:
//! `<root>/<table>/<partition_column>=<value>/part-<uuid>.parquet`.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use arrow_array::{
    Array, ArrayRef, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::schema::{Cell, Column, ColumnType, Row, TableSchema};

/// Day number of 1970-01-01 counted from 0001-01-01 as day 1.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;
const UTC_ZONE: &str = "UTC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table `{0}` does not exist")]
    UnknownTable(String),
    #[error("{table}: {written} rows written, {} rejected", .failures.len())]
    PartialWrite {
        table: String,
        written: usize,
        failures: Vec<RowFailure>,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[async_trait]
pub trait WarehouseSink: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError>;

    async fn create_table(&self, schema: &TableSchema) -> Result<(), WarehouseError>;

    /// Append `rows`. Rows that fail the table schema are reported through
    /// [`WarehouseError::PartialWrite`] after the valid ones are stored.
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<usize, WarehouseError>;

    /// Up to `limit` rows whose partition column equals `partition`, newest `created_at` first.
    async fn query(
        &self,
        table: &str,
        partition: &Cell,
        limit: usize,
    ) -> Result<Vec<Row>, WarehouseError>;
}

/// Create every table in `schemas` that does not exist yet. Returns how many were created.
pub async fn ensure_tables(
    sink: &dyn WarehouseSink,
    schemas: &[TableSchema],
) -> Result<usize, WarehouseError> {
    let mut created = 0;
    for schema in schemas {
        if sink.table_exists(&schema.name).await? {
            debug!(table = %schema.name, "table exists");
            continue;
        }
        sink.create_table(schema).await?;
        info!(table = %schema.name, version = schema.version, "created table");
        created += 1;
    }
    Ok(created)
}

#[derive(Debug, Clone)]
pub struct ParquetWarehouse {
    root: PathBuf,
}

impl ParquetWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn schema_path(&self, table: &str) -> PathBuf {
        self.table_dir(table).join("_schema.json")
    }

    async fn load_schema(&self, table: &str) -> Result<TableSchema, WarehouseError> {
        let path = self.schema_path(table);
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(WarehouseError::UnknownTable(table.to_string()))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("reading {}", path.display()))
                .into()),
        }
    }
}

#[async_trait]
impl WarehouseSink for ParquetWarehouse {
    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        Ok(fs::try_exists(self.schema_path(table))
            .await
            .with_context(|| format!("checking table {table}"))?)
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<(), WarehouseError> {
        let dir = self.table_dir(&schema.name);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let bytes = serde_json::to_vec_pretty(schema).context("serializing table schema")?;
        let path = self.schema_path(&schema.name);
        let temp_path = dir.join(format!("._schema.{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))?;
        Ok(())
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<usize, WarehouseError> {
        let schema = self.load_schema(table).await?;

        let mut failures = Vec::new();
        let mut partitions: BTreeMap<String, Vec<&Row>> = BTreeMap::new();
        for (index, row) in rows.iter().enumerate() {
            let placed = schema.check_row(row).and_then(|()| {
                schema.partition_of(row).ok_or_else(|| {
                    format!(
                        "partition column `{}` has no usable value",
                        schema.partition_column
                    )
                })
            });
            match placed {
                Ok(partition) => partitions.entry(partition).or_default().push(row),
                Err(reason) => failures.push(RowFailure { index, reason }),
            }
        }

        let mut written = 0;
        for (partition, batch_rows) in &partitions {
            let dir = self
                .table_dir(table)
                .join(format!("{}={partition}", schema.partition_column));
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
            let batch = record_batch(&schema, batch_rows)?;
            let path = write_parquet(&dir, &format!("part-{}.parquet", Uuid::new_v4()), batch)?;
            debug!(
                table,
                partition = %partition,
                rows = batch_rows.len(),
                path = %path.display(),
                "wrote partition file"
            );
            written += batch_rows.len();
        }

        if !failures.is_empty() {
            warn!(
                table,
                written,
                rejected = failures.len(),
                first = %failures[0].reason,
                "rows rejected by schema"
            );
            return Err(WarehouseError::PartialWrite {
                table: table.to_string(),
                written,
                failures,
            });
        }
        info!(table, rows = written, "inserted rows");
        Ok(written)
    }

    async fn query(
        &self,
        table: &str,
        partition: &Cell,
        limit: usize,
    ) -> Result<Vec<Row>, WarehouseError> {
        let schema = self.load_schema(table).await?;
        let Some(label) = partition.partition_label() else {
            return Ok(Vec::new());
        };
        let dir = self
            .table_dir(table)
            .join(format!("{}={label}", schema.partition_column));

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("listing {}", dir.display()))
                    .into())
            }
        };

        let mut rows = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.starts_with("part-") && name.ends_with(".parquet")) {
                continue;
            }
            rows.extend(read_parquet_rows(&schema, &entry.path())?);
        }

        rows.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
        rows.truncate(limit);
        Ok(rows)
    }
}

fn created_at(row: &Row) -> Option<DateTime<Utc>> {
    match row.get("created_at") {
        Some(Cell::Timestamp(at)) => Some(*at),
        _ => None,
    }
}

fn arrow_type(kind: ColumnType) -> DataType {
    match kind {
        ColumnType::Date => DataType::Date32,
        ColumnType::String => DataType::Utf8,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC_ZONE.into())),
    }
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn date_from_days(days: i32) -> anyhow::Result<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
        .ok_or_else(|| anyhow!("date32 value {days} out of range"))
}

fn column_array(column: &Column, rows: &[&Row]) -> ArrayRef {
    let cells = rows.iter().map(|row| row.get(&column.name));
    match column.kind {
        ColumnType::Date => Arc::new(Date32Array::from(
            cells
                .map(|cell| match cell {
                    Some(Cell::Date(d)) => Some(days_since_epoch(*d)),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::String => Arc::new(StringArray::from(
            cells
                .map(|cell| match cell {
                    Some(Cell::Str(s)) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Int64 => Arc::new(Int64Array::from(
            cells
                .map(|cell| match cell {
                    Some(Cell::Int(v)) => Some(*v),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Float64 => Arc::new(Float64Array::from(
            cells
                .map(|cell| match cell {
                    Some(Cell::Float(v)) => Some(*v),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(
                cells
                    .map(|cell| match cell {
                        Some(Cell::Timestamp(at)) => Some(at.timestamp_micros()),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )
            .with_timezone(UTC_ZONE),
        ),
    }
}

fn record_batch(schema: &TableSchema, rows: &[&Row]) -> anyhow::Result<RecordBatch> {
    let fields = schema
        .columns
        .iter()
        .map(|c| ArrowField::new(c.name.as_str(), arrow_type(c.kind), !c.required))
        .collect::<Vec<_>>();
    let arrays = schema
        .columns
        .iter()
        .map(|c| column_array(c, rows))
        .collect::<Vec<_>>();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .with_context(|| format!("building {} record batch", schema.name))
}

/// Write `batch` under a temp name and rename it into place.
fn write_parquet(dir: &Path, file_name: &str, batch: RecordBatch) -> anyhow::Result<PathBuf> {
    let path = dir.join(file_name);
    let temp_path = dir.join(format!(".{file_name}.tmp"));
    let file = File::create(&temp_path)
        .with_context(|| format!("creating {}", temp_path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", temp_path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", temp_path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", temp_path.display()))?;
    std::fs::rename(&temp_path, &path)
        .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))?;
    Ok(path)
}

fn downcast<'a, T: 'static>(array: &'a dyn Array, column: &str) -> anyhow::Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("column `{column}` has unexpected type {:?}", array.data_type()))
}

fn cell_at(array: &dyn Array, column: &Column, index: usize) -> anyhow::Result<Cell> {
    if array.is_null(index) {
        return Ok(Cell::Null);
    }
    let name = column.name.as_str();
    Ok(match column.kind {
        ColumnType::Date => {
            Cell::Date(date_from_days(downcast::<Date32Array>(array, name)?.value(index))?)
        }
        ColumnType::String => {
            Cell::Str(downcast::<StringArray>(array, name)?.value(index).to_string())
        }
        ColumnType::Int64 => Cell::Int(downcast::<Int64Array>(array, name)?.value(index)),
        ColumnType::Float64 => Cell::Float(downcast::<Float64Array>(array, name)?.value(index)),
        ColumnType::Timestamp => {
            let micros = downcast::<TimestampMicrosecondArray>(array, name)?.value(index);
            Cell::Timestamp(
                DateTime::from_timestamp_micros(micros)
                    .ok_or_else(|| anyhow!("timestamp {micros} out of range in `{name}`"))?,
            )
        }
    })
}

/// Columns missing from an older file are left out of its rows.
fn read_parquet_rows(schema: &TableSchema, path: &Path) -> anyhow::Result<Vec<Row>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("opening parquet reader {}", path.display()))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("reading record batch {}", path.display()))?;
        let mut batch_rows = vec![Row::new(); batch.num_rows()];
        for column in &schema.columns {
            let Some(array) = batch.column_by_name(&column.name) else {
                continue;
            };
            for (index, row) in batch_rows.iter_mut().enumerate() {
                row.insert(column.name.clone(), cell_at(array.as_ref(), column, index)?);
            }
        }
        rows.extend(batch_rows);
    }
    Ok(rows)
}

/// In-memory sink for orchestrator tests.
#[cfg(test)]
pub(crate) mod memory {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryWarehouse {
        tables: Mutex<BTreeMap<String, (TableSchema, Vec<Row>)>>,
        pub queries: AtomicUsize,
    }

    impl MemoryWarehouse {
        pub fn with_tables(schemas: Vec<TableSchema>) -> Self {
            let warehouse = Self::default();
            {
                let mut tables = warehouse.tables.lock().unwrap();
                for schema in schemas {
                    tables.insert(schema.name.clone(), (schema, Vec::new()));
                }
            }
            warehouse
        }

        pub fn rows(&self, table: &str) -> Vec<Row> {
            self.tables
                .lock()
                .unwrap()
                .get(table)
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default()
        }

        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WarehouseSink for MemoryWarehouse {
        async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
            Ok(self.tables.lock().unwrap().contains_key(table))
        }

        async fn create_table(&self, schema: &TableSchema) -> Result<(), WarehouseError> {
            self.tables
                .lock()
                .unwrap()
                .entry(schema.name.clone())
                .or_insert_with(|| (schema.clone(), Vec::new()));
            Ok(())
        }

        async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<usize, WarehouseError> {
            let mut tables = self.tables.lock().unwrap();
            let (schema, stored) = tables
                .get_mut(table)
                .ok_or_else(|| WarehouseError::UnknownTable(table.to_string()))?;
            let mut failures = Vec::new();
            let mut written = 0;
            for (index, row) in rows.iter().enumerate() {
                match schema.check_row(row) {
                    Ok(()) => {
                        stored.push(row.clone());
                        written += 1;
                    }
                    Err(reason) => failures.push(RowFailure { index, reason }),
                }
            }
            if failures.is_empty() {
                Ok(written)
            } else {
                Err(WarehouseError::PartialWrite {
                    table: table.to_string(),
                    written,
                    failures,
                })
            }
        }

        async fn query(
            &self,
            table: &str,
            partition: &Cell,
            limit: usize,
        ) -> Result<Vec<Row>, WarehouseError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let tables = self.tables.lock().unwrap();
            let (schema, stored) = tables
                .get(table)
                .ok_or_else(|| WarehouseError::UnknownTable(table.to_string()))?;
            Ok(stored
                .iter()
                .filter(|row| row.get(&schema.partition_column) == Some(partition))
                .take(limit)
                .cloned()
                .collect())
        }
    }
}
