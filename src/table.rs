//! In-memory columnar table shared by every alignment stage.
//!
//! Tables are never mutated in place: each operation derives a new table so a
//! pipeline run can be replayed from its raw inputs.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    /// Non-finite results collapse to `Null` so they never reach a model.
    pub fn number(value: f64) -> Self {
        if value.is_finite() {
            Self::Number(value)
        } else {
            Self::Null
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Date(_) => "date",
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Number(_) => 1,
            Self::Text(_) => 2,
            Self::Date(_) => 3,
        }
    }

    /// Total order used for grouping and tie-breaking.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::number(value)
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::Null, Self::number)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Composite partition key with a total order.
#[derive(Debug, Clone)]
pub struct GroupKey(pub Vec<Value>);

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupKey {}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = a.total_cmp(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<all>");
        }
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub key: GroupKey,
    /// Row indices in input order.
    pub rows: Vec<usize>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("duplicate column: {0}")]
    DuplicateColumn(String),
    #[error("column {column} has {actual} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("column {column} row {row} in group {group}: expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        row: usize,
        group: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("column {column} row {row} in group {group}: missing value")]
    MissingKey {
        column: String,
        row: usize,
        group: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self, TableError> {
        let mut seen = HashSet::new();
        let expected = columns.first().map(|c| c.values.len()).unwrap_or(0);
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(TableError::DuplicateColumn(column.name.clone()));
            }
            if column.values.len() != expected {
                return Err(TableError::LengthMismatch {
                    column: column.name.clone(),
                    expected,
                    actual: column.values.len(),
                });
            }
        }
        Ok(Self { columns })
    }

    /// Builds a table from row-major data, mostly useful for fixtures.
    pub fn from_rows(names: &[&str], rows: Vec<Vec<Value>>) -> Result<Self, TableError> {
        let mut columns: Vec<Column> = names
            .iter()
            .map(|name| Column::new(*name, Vec::with_capacity(rows.len())))
            .collect();
        for row in rows {
            if row.len() != names.len() {
                return Err(TableError::LengthMismatch {
                    column: "<row>".to_string(),
                    expected: names.len(),
                    actual: row.len(),
                });
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.values.push(value);
            }
        }
        Self::new(columns)
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Result<&Column, TableError> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| TableError::UnknownColumn(name.to_string()))
    }

    pub fn values(&self, name: &str) -> Result<&[Value], TableError> {
        Ok(&self.column(name)?.values)
    }

    pub fn value(&self, row: usize, name: &str) -> Result<&Value, TableError> {
        let values = self.values(name)?;
        values.get(row).ok_or(TableError::LengthMismatch {
            column: name.to_string(),
            expected: row + 1,
            actual: values.len(),
        })
    }

    pub fn row(&self, row: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c.values[row]).collect()
    }

    /// Returns a new table with `name` set to `values`, replacing any existing column.
    pub fn with_column(&self, name: &str, values: Vec<Value>) -> Result<Self, TableError> {
        if !self.columns.is_empty() && values.len() != self.num_rows() {
            return Err(TableError::LengthMismatch {
                column: name.to_string(),
                expected: self.num_rows(),
                actual: values.len(),
            });
        }
        let mut columns = self.columns.clone();
        match columns.iter_mut().find(|c| c.name == name) {
            Some(existing) => existing.values = values,
            None => columns.push(Column::new(name, values)),
        }
        Ok(Self { columns })
    }

    pub fn select(&self, names: &[&str]) -> Result<Self, TableError> {
        let columns = names
            .iter()
            .map(|name| self.column(name).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(columns)
    }

    pub fn drop_columns(&self, names: &[&str]) -> Self {
        let columns = self
            .columns
            .iter()
            .filter(|c| !names.contains(&c.name.as_str()))
            .cloned()
            .collect();
        Self { columns }
    }

    pub fn rename_column(&self, from: &str, to: &str) -> Result<Self, TableError> {
        self.column(from)?;
        if from != to && self.has_column(to) {
            return Err(TableError::DuplicateColumn(to.to_string()));
        }
        let mut columns = self.columns.clone();
        for column in &mut columns {
            if column.name == from {
                column.name = to.to_string();
            }
        }
        Ok(Self { columns })
    }

    /// Gathers rows by index, in the order given.
    pub fn take(&self, indices: &[usize]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                let values = indices.iter().map(|&i| c.values[i].clone()).collect();
                Column::new(c.name.clone(), values)
            })
            .collect();
        Self { columns }
    }

    /// Splits rows into partitions ordered by key. No keys means one partition
    /// spanning all rows.
    pub fn partition_by(&self, keys: &[&str]) -> Result<Vec<Partition>, TableError> {
        let key_columns = keys
            .iter()
            .map(|k| self.values(k))
            .collect::<Result<Vec<_>, _>>()?;

        let mut groups: BTreeMap<GroupKey, Vec<usize>> = BTreeMap::new();
        for row in 0..self.num_rows() {
            let key = GroupKey(key_columns.iter().map(|c| c[row].clone()).collect());
            groups.entry(key).or_default().push(row);
        }

        Ok(groups
            .into_iter()
            .map(|(key, rows)| Partition { key, rows })
            .collect())
    }

    /// Orders one partition's rows by (date, input position).
    pub fn sort_partition_by_date(
        &self,
        partition: &Partition,
        column: &str,
    ) -> Result<Vec<(NaiveDate, usize)>, TableError> {
        let values = self.values(column)?;
        let mut ordered = Vec::with_capacity(partition.rows.len());
        for &row in &partition.rows {
            match &values[row] {
                Value::Date(d) => ordered.push((*d, row)),
                Value::Null => {
                    return Err(TableError::MissingKey {
                        column: column.to_string(),
                        row,
                        group: partition.key.to_string(),
                    })
                }
                other => {
                    return Err(TableError::TypeMismatch {
                        column: column.to_string(),
                        row,
                        group: partition.key.to_string(),
                        expected: "date",
                        found: other.type_name(),
                    })
                }
            }
        }
        ordered.sort();
        Ok(ordered)
    }

    /// A column is numeric when every non-missing value is a number.
    pub fn is_numeric_column(&self, name: &str) -> Result<bool, TableError> {
        Ok(self
            .values(name)?
            .iter()
            .all(|v| matches!(v, Value::Null | Value::Number(_))))
    }
}
