//! Entity-key and reporting-period normalization.
//!
//! Rules implemented:
//! - entity keys are 9-digit zero-padded SIREN strings
//! - 14-digit SIRET inputs reduce to their leading SIREN
//! - monthly periods are truncated to the first day of their month

use std::fmt;

use chrono::{Datelike, Months, NaiveDate};
use thiserror::Error;

use crate::table::{Table, TableError, Value};

pub const ENTITY_KEY_LEN: usize = 9;
const SIRET_LEN: usize = 14;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EntityKeyError {
    #[error("invalid entity key: {0:?}")]
    InvalidKey(String),
    #[error("entity key has {0} digits, expected at most 14")]
    TooLong(usize),
    #[error("column {column} row {row}: {source}")]
    Row {
        column: String,
        row: usize,
        #[source]
        source: Box<EntityKeyError>,
    },
    #[error("invalid period in column {column} row {row}: {value:?}")]
    InvalidPeriod {
        column: String,
        row: usize,
        value: String,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

pub fn parse_entity_key(input: &str) -> Result<EntityKey, EntityKeyError> {
    let trimmed = input.trim();
    // Float-formatted ids ("123456789.0") show up when a numeric column was exported as text.
    let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EntityKeyError::InvalidKey(input.to_string()));
    }

    match digits.len() {
        n if n <= ENTITY_KEY_LEN => Ok(EntityKey(format!(
            "{:0>width$}",
            digits,
            width = ENTITY_KEY_LEN
        ))),
        // A SIRET read as a number loses the leading zeros of its SIREN.
        n if n <= SIRET_LEN => {
            let siret = format!("{:0>width$}", digits, width = SIRET_LEN);
            Ok(EntityKey(siret[..ENTITY_KEY_LEN].to_string()))
        }
        n => Err(EntityKeyError::TooLong(n)),
    }
}

pub fn normalize_entity_key(value: &Value) -> Result<EntityKey, EntityKeyError> {
    match value {
        Value::Text(raw) => parse_entity_key(raw),
        Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 => {
            parse_entity_key(&format!("{n:.0}"))
        }
        other => Err(EntityKeyError::InvalidKey(other.to_string())),
    }
}

/// Derives a table whose `column` holds normalized keys; missing keys stay missing.
pub fn normalize_entity_column(table: &Table, column: &str) -> Result<Table, EntityKeyError> {
    let values = table
        .values(column)?
        .iter()
        .enumerate()
        .map(|(row, value)| match value {
            Value::Null => Ok(Value::Null),
            other => normalize_entity_key(other)
                .map(|key| Value::Text(key.0))
                .map_err(|source| EntityKeyError::Row {
                    column: column.to_string(),
                    row,
                    source: Box::new(source),
                }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(table.with_column(column, values)?)
}

pub fn truncate_to_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    truncate_to_month(date)
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

pub fn parse_period(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    // Compact `yyyyMMdd` form used by the tax declaration extracts.
    if trimmed.len() == 8 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let year = trimmed[..4].parse().ok()?;
        let month = trimmed[4..6].parse().ok()?;
        let day = trimmed[6..].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    None
}

/// Reads a period cell: dates as-is, `YYYY-MM-DD` or `yyyyMMdd` text, and
/// compact `yyyyMMdd` integers (CSV inference reads those as numbers).
pub fn period_from_value(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Date(d) => Some(*d),
        Value::Text(raw) => parse_period(raw),
        Value::Number(n) if n.fract() == 0.0 && (10_000_000.0..100_000_000.0).contains(n) => {
            parse_period(&format!("{n:.0}"))
        }
        _ => None,
    }
}

fn parse_period_column(
    table: &Table,
    column: &str,
    adjust: fn(NaiveDate) -> NaiveDate,
) -> Result<Table, EntityKeyError> {
    let values = table
        .values(column)?
        .iter()
        .enumerate()
        .map(|(row, value)| match value {
            Value::Null => Ok(Value::Null),
            other => period_from_value(other)
                .map(|d| Value::Date(adjust(d)))
                .ok_or_else(|| EntityKeyError::InvalidPeriod {
                    column: column.to_string(),
                    row,
                    value: other.to_string(),
                }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(table.with_column(column, values)?)
}

/// Parses every period and truncates it to its month start.
pub fn truncate_period_column(table: &Table, column: &str) -> Result<Table, EntityKeyError> {
    parse_period_column(table, column, truncate_to_month)
}

/// Parses dates without truncation, for exact fiscal bounds.
pub fn parse_date_column(table: &Table, column: &str) -> Result<Table, EntityKeyError> {
    parse_period_column(table, column, |d| d)
}
