//! Warehouse cell/row model and the fixed table schemas.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const EXCHANGE_SUMMARY_TABLE: &str = "exchange_report_summaries";
pub const EXCHANGE_BY_SOURCE_TABLE: &str = "exchange_revenue_by_source";
pub const QUALITY_SUMMARY_TABLE: &str = "quality_report_summaries";
pub const QUALITY_BY_SOURCE_TABLE: &str = "quality_source_metrics";
pub const ANALYTICS_SUMMARY_TABLE: &str = "analytics_report_summaries";
pub const ANALYTICS_BY_SOURCE_TABLE: &str = "analytics_source_metrics";
pub const ANALYTICS_BY_MEDIUM_TABLE: &str = "analytics_medium_metrics";
pub const ANALYTICS_BY_SOURCE_MEDIUM_TABLE: &str = "analytics_source_and_medium_metrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Date,
    String,
    Int64,
    Float64,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub version: u32,
    pub partition_column: String,
    pub columns: Vec<Column>,
}

/// One warehouse value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Date(NaiveDate),
    Str(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

impl Cell {
    pub fn matches(&self, kind: ColumnType) -> bool {
        matches!(
            (self, kind),
            (Cell::Date(_), ColumnType::Date)
                | (Cell::Str(_), ColumnType::String)
                | (Cell::Int(_), ColumnType::Int64)
                | (Cell::Float(_), ColumnType::Float64)
                | (Cell::Timestamp(_), ColumnType::Timestamp)
        )
    }

    /// Directory-safe rendering for partition values.
    pub fn partition_label(&self) -> Option<String> {
        match self {
            Cell::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Cell::Int(n) => Some(n.to_string()),
            Cell::Str(s) if !s.is_empty() && !s.contains(['/', '\\']) && s != "." && s != ".." => {
                Some(s.clone())
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Float(v) => Some(*v),
            Cell::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<NaiveDate> for Cell {
    fn from(value: NaiveDate) -> Self {
        Cell::Date(value)
    }
}

impl From<DateTime<Utc>> for Cell {
    fn from(value: DateTime<Utc>) -> Self {
        Cell::Timestamp(value)
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Str(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Str(value.to_string())
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<u64> for Cell {
    fn from(value: u64) -> Self {
        Cell::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<u32> for Cell {
    fn from(value: u32) -> Self {
        Cell::Int(i64::from(value))
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Cell::Null)
    }
}

pub type Row = BTreeMap<String, Cell>;

pub fn row<const N: usize>(cells: [(&str, Cell); N]) -> Row {
    cells.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Why `row` cannot be stored in this table, if it cannot.
    pub fn check_row(&self, row: &Row) -> Result<(), String> {
        if let Some(unknown) = row.keys().find(|name| self.column(name).is_none()) {
            return Err(format!("unknown column `{unknown}`"));
        }
        for column in &self.columns {
            match row.get(&column.name) {
                None | Some(Cell::Null) if column.required => {
                    return Err(format!("required column `{}` is null", column.name));
                }
                None | Some(Cell::Null) => {}
                Some(cell) if !cell.matches(column.kind) => {
                    return Err(format!(
                        "column `{}` expects {:?}, got {cell:?}",
                        column.name, column.kind
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn partition_of(&self, row: &Row) -> Option<String> {
        row.get(&self.partition_column).and_then(Cell::partition_label)
    }
}

fn col(name: &str, kind: ColumnType, required: bool) -> Column {
    Column {
        name: name.to_string(),
        kind,
        required,
    }
}

fn table(name: &str, partition_column: &str, columns: Vec<Column>) -> TableSchema {
    TableSchema {
        name: name.to_string(),
        version: 1,
        partition_column: partition_column.to_string(),
        columns,
    }
}

use ColumnType::{Date, Float64, Int64, String as Text, Timestamp};

fn audit_columns(with_updated_at: bool) -> Vec<Column> {
    let mut columns = vec![col("created_at", Timestamp, true)];
    if with_updated_at {
        columns.push(col("updated_at", Timestamp, true));
    }
    columns.push(col("display_date", Date, false));
    columns
}

fn quality_metric_columns() -> Vec<Column> {
    vec![
        col("total_requests", Int64, false),
        col("total_responses", Int64, false),
        col("drop_rate", Float64, false),
        col("good", Int64, false),
        col("good_rate", Float64, false),
        col("bad", Int64, false),
        col("bad_rate", Float64, false),
        col("warn", Int64, false),
        col("warn_rate", Float64, false),
    ]
}

fn analytics_group_columns(keys: &[&str]) -> Vec<Column> {
    let mut columns = vec![col("report_date", Date, true)];
    columns.extend(keys.iter().map(|key| col(key, Text, true)));
    columns.extend([
        col("sessions", Int64, false),
        col("revenue", Float64, false),
        col("ad_revenue", Float64, false),
    ]);
    columns.extend(audit_columns(false));
    columns
}

pub fn exchange_summary_schema() -> TableSchema {
    let mut columns = vec![
        col("report_date", Date, true),
        col("report_id", Text, true),
        col("total_revenue", Float64, false),
        col("total_exchange_revenue", Float64, false),
        col("total_ad_server_revenue", Float64, false),
        col("total_clicks", Int64, false),
        col("total_impressions", Int64, false),
        col("total_viewable_impressions", Int64, false),
        col("total_ad_requests", Int64, false),
        col("average_ecpm", Float64, false),
        col("average_ctr", Float64, false),
        col("status", Text, true),
    ];
    columns.extend(audit_columns(true));
    table(EXCHANGE_SUMMARY_TABLE, "report_date", columns)
}

pub fn exchange_by_source_schema() -> TableSchema {
    let mut columns = vec![
        col("report_date", Date, true),
        col("report_id", Text, true),
        col("source", Text, true),
        col("revenue", Float64, false),
        col("exchange_revenue", Float64, false),
        col("ad_server_revenue", Float64, false),
        col("clicks", Int64, false),
        col("impressions", Int64, false),
        col("ad_requests", Int64, false),
    ];
    columns.extend(audit_columns(false));
    table(EXCHANGE_BY_SOURCE_TABLE, "report_date", columns)
}

pub fn quality_summary_schema() -> TableSchema {
    let mut columns = vec![
        col("start_date", Int64, true),
        col("end_date", Int64, true),
        col("report_hours", Int64, true),
        col("request_report_id", Text, true),
        col("response_report_id", Text, true),
        col("request_report_name", Text, true),
        col("response_report_name", Text, true),
    ];
    columns.extend(quality_metric_columns());
    columns.push(col("status", Text, true));
    columns.extend(audit_columns(true));
    table(QUALITY_SUMMARY_TABLE, "start_date", columns)
}

pub fn quality_by_source_schema() -> TableSchema {
    let mut columns = vec![
        col("start_date", Int64, true),
        col("end_date", Int64, true),
        col("report_hours", Int64, true),
        col("request_report_id", Text, true),
        col("response_report_id", Text, true),
        col("source", Text, true),
    ];
    columns.extend(quality_metric_columns());
    columns.extend(audit_columns(false));
    table(QUALITY_BY_SOURCE_TABLE, "start_date", columns)
}

pub fn analytics_summary_schema() -> TableSchema {
    let mut columns = vec![
        col("report_date", Date, true),
        col("total_sessions", Int64, false),
        col("total_revenue", Float64, false),
        col("total_ad_revenue", Float64, false),
        col("total_events", Int64, false),
        col("total_page_views", Int64, false),
        col("total_engaged_sessions", Int64, false),
        col("total_users", Int64, false),
        col("status", Text, true),
    ];
    columns.extend(audit_columns(true));
    table(ANALYTICS_SUMMARY_TABLE, "report_date", columns)
}

pub fn analytics_by_source_schema() -> TableSchema {
    table(ANALYTICS_BY_SOURCE_TABLE, "report_date", analytics_group_columns(&["source"]))
}

pub fn analytics_by_medium_schema() -> TableSchema {
    table(ANALYTICS_BY_MEDIUM_TABLE, "report_date", analytics_group_columns(&["medium"]))
}

pub fn analytics_by_source_medium_schema() -> TableSchema {
    table(
        ANALYTICS_BY_SOURCE_MEDIUM_TABLE,
        "report_date",
        analytics_group_columns(&["source", "medium"]),
    )
}

pub fn all_tables() -> Vec<TableSchema> {
    vec![
        exchange_summary_schema(),
        exchange_by_source_schema(),
        quality_summary_schema(),
        quality_by_source_schema(),
        analytics_summary_schema(),
        analytics_by_source_schema(),
        analytics_by_medium_schema(),
        analytics_by_source_medium_schema(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 14, 6, 0, 0).unwrap()
    }

    #[test]
    fn every_table_has_audit_columns_and_a_partition() {
        let tables = all_tables();
        assert_eq!(tables.len(), 8);
        for schema in &tables {
            let created = schema.column("created_at").expect("created_at");
            assert!(created.required);
            assert_eq!(created.kind, Timestamp);
            assert!(schema.column(&schema.partition_column).expect("partition").required);
        }
        assert!(exchange_summary_schema().column("updated_at").is_some());
        assert!(exchange_by_source_schema().column("updated_at").is_none());
    }

    #[test]
    fn rows_are_checked_against_the_schema() {
        let schema = analytics_by_source_schema();
        let day = NaiveDate::from_ymd_opt(2025, 7, 13).unwrap();
        let good = row([
            ("report_date", day.into()),
            ("source", "google".into()),
            ("sessions", 10u64.into()),
            ("revenue", 2.5f64.into()),
            ("created_at", now().into()),
        ]);
        assert!(schema.check_row(&good).is_ok());
        assert_eq!(schema.partition_of(&good).as_deref(), Some("2025-07-13"));

        let mut missing = good.clone();
        missing.remove("source");
        assert!(schema.check_row(&missing).unwrap_err().contains("source"));

        let mut wrong_type = good.clone();
        wrong_type.insert("sessions".into(), Cell::Str("ten".into()));
        assert!(schema.check_row(&wrong_type).unwrap_err().contains("sessions"));

        let mut extra = good;
        extra.insert("bogus".into(), Cell::Null);
        assert!(schema.check_row(&extra).unwrap_err().contains("bogus"));
    }

    #[test]
    fn cells_serialize_as_plain_json() {
        let value = serde_json::to_value(row([
            ("a", Cell::Null),
            ("b", 3u32.into()),
            ("c", NaiveDate::from_ymd_opt(2025, 7, 13).into()),
        ]))
        .unwrap();
        assert_eq!(value, serde_json::json!({ "a": null, "b": 3, "c": "2025-07-13" }));
    }
}
