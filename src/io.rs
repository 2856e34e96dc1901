//! CSV boundary for tables. Empty cells are missing values.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::entity::parse_period;
use crate::table::{Column, Table, TableError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Number,
    Date,
}

/// Per-column type hints; unhinted columns are inferred cell by cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvSchema {
    pub columns: BTreeMap<String, ColumnType>,
}

impl CsvSchema {
    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }
}

#[derive(Debug, Error)]
pub enum TableIoError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to parse column {column} row {row} value '{value}'")]
    ParseField {
        column: String,
        row: usize,
        value: String,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

pub fn read_csv_table(path: &Path, schema: &CsvSchema) -> Result<Table, TableIoError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let hints: Vec<Option<ColumnType>> = headers
        .iter()
        .map(|name| schema.columns.get(name).copied())
        .collect();

    let mut columns: Vec<Vec<Value>> = vec![Vec::new(); headers.len()];
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        parse_record(&record, &headers, &hints, row, &mut columns)?;
    }

    let table = Table::new(
        headers
            .iter()
            .zip(columns)
            .map(|(name, values)| Column::new(name, values))
            .collect(),
    )?;

    info!(
        component = "io",
        event = "io.csv.read",
        path = %path.display(),
        rows = table.num_rows(),
        columns = table.num_columns()
    );

    Ok(table)
}

fn parse_record(
    record: &StringRecord,
    headers: &StringRecord,
    hints: &[Option<ColumnType>],
    row: usize,
    columns: &mut [Vec<Value>],
) -> Result<(), TableIoError> {
    for (idx, (name, hint)) in headers.iter().zip(hints).enumerate() {
        let raw = record.get(idx).unwrap_or_default();
        columns[idx].push(parse_cell(raw, *hint).ok_or_else(|| TableIoError::ParseField {
            column: name.to_string(),
            row,
            value: raw.to_string(),
        })?);
    }
    Ok(())
}

fn parse_cell(raw: &str, hint: Option<ColumnType>) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(Value::Null);
    }
    match hint {
        Some(ColumnType::Text) => Some(Value::text(trimmed)),
        Some(ColumnType::Number) => trimmed.parse::<f64>().ok().map(Value::number),
        Some(ColumnType::Date) => parse_period(trimmed).map(Value::Date),
        None => Some(infer_cell(trimmed)),
    }
}

fn infer_cell(trimmed: &str) -> Value {
    if let Ok(v) = trimmed.parse::<f64>() {
        return Value::number(v);
    }
    // Compact `yyyyMMdd` cells stay numbers here; period columns convert them.
    if let Some(d) = parse_period(trimmed) {
        return Value::Date(d);
    }
    Value::text(trimmed)
}

/// Writes through a temporary sibling file and renames it into place.
pub fn write_csv_table(path: &Path, table: &Table) -> Result<(), TableIoError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "table.csv".to_string());
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut writer = csv::Writer::from_path(&tmp_path)?;
        writer.write_record(table.column_names())?;
        for row in 0..table.num_rows() {
            writer.write_record(table.row(row).iter().map(|v| v.to_string()))?;
        }
        writer.flush().map_err(|source| TableIoError::Io {
            path: tmp_path.clone(),
            source,
        })?;
    }

    fs::rename(&tmp_path, path).map_err(|source| TableIoError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!(
        component = "io",
        event = "io.csv.written",
        path = %path.display(),
        rows = table.num_rows(),
        columns = table.num_columns()
    );

    Ok(())
}
