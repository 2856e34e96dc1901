//! Duplicate resolution by data-quality score.
//!
//! For every group sharing the key columns exactly one row survives: the one
//! with the lowest null ratio, ties going to the earliest input row. Survivors
//! keep their input order, so resolving twice is the same as resolving once.

use thiserror::Error;
use tracing::info;

use crate::table::{Table, TableError, Value};

#[derive(Debug, Error, PartialEq)]
pub enum DedupError {
    #[error("group key column {0} is missing")]
    MissingKeyColumn(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Fraction of missing values; lower is better.
pub fn quality_score<'a>(values: impl IntoIterator<Item = &'a Value>) -> f64 {
    let mut total = 0usize;
    let mut nulls = 0usize;
    for value in values {
        total += 1;
        if value.is_null() {
            nulls += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        nulls as f64 / total as f64
    }
}

pub fn resolve(table: &Table, group_keys: &[&str]) -> Result<Table, DedupError> {
    let score_columns: Vec<&str> = table
        .column_names()
        .into_iter()
        .filter(|name| !group_keys.contains(name))
        .collect();
    resolve_with_score_columns(table, group_keys, &score_columns)
}

pub fn resolve_with_score_columns(
    table: &Table,
    group_keys: &[&str],
    score_columns: &[&str],
) -> Result<Table, DedupError> {
    for key in group_keys {
        if !table.has_column(key) {
            return Err(DedupError::MissingKeyColumn((*key).to_string()));
        }
    }
    let scored = score_columns
        .iter()
        .map(|name| table.values(name))
        .collect::<Result<Vec<_>, _>>()?;

    let partitions = table.partition_by(group_keys)?;
    let mut survivors = Vec::with_capacity(partitions.len());
    for partition in &partitions {
        let best = partition
            .rows
            .iter()
            .copied()
            .map(|row| (quality_score(scored.iter().map(|col| &col[row])), row))
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        if let Some((_, row)) = best {
            survivors.push(row);
        }
    }
    survivors.sort_unstable();

    info!(
        component = "dedup",
        event = "dedup.resolve.finish",
        keys = ?group_keys,
        input_rows = table.num_rows(),
        output_rows = survivors.len(),
        dropped_rows = table.num_rows() - survivors.len()
    );

    Ok(table.take(&survivors))
}
