//! Fiscal-exercise alignment and year-over-year growth.
//!
//! Entry rows match the exercise whose half-open `[start, end)` interval
//! contains their period. Entries with no containing exercise fall back to
//! year equality against the exercise end date, the entry year coming from,
//! in order: the year-end date column, the year label column, or the period
//! shifted by a fixed day offset and moved to its month end.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ContainmentConfig, GrowthConfig};
use crate::dedup::{quality_score, resolve, DedupError};
use crate::entity::{last_day_of_month, period_from_value};
use crate::table::{GroupKey, Table, TableError, Value};

#[derive(Debug, Error, PartialEq)]
pub enum ContainmentError {
    #[error("column {column} is missing from the {table} table")]
    MissingColumn { column: String, table: &'static str },
    #[error("exercise column {0} collides with an entry column")]
    ColumnCollision(String),
    #[error("column {column} row {row} in group {group} holds a {found}, expected a date")]
    NonDateValue {
        column: String,
        row: usize,
        group: String,
        found: &'static str,
    },
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Copy)]
struct Exercise {
    row: usize,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

impl Exercise {
    fn contains(&self, period: NaiveDate) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= period && period < end,
            _ => false,
        }
    }
}

pub fn containment_join(
    entries: &Table,
    exercises: &Table,
    cfg: &ContainmentConfig,
) -> Result<Table, ContainmentError> {
    require_column(entries, &cfg.entity_column, "entries")?;
    require_column(entries, &cfg.period_column, "entries")?;
    for column in [&cfg.entity_column, &cfg.start_column, &cfg.end_column] {
        require_column(exercises, column, "exercises")?;
    }

    let exercise_columns: Vec<&str> = exercises
        .column_names()
        .into_iter()
        .filter(|name| *name != cfg.entity_column)
        .collect();
    for name in &exercise_columns {
        if entries.has_column(name) {
            return Err(ContainmentError::ColumnCollision((*name).to_string()));
        }
    }
    let feature_columns: Vec<&[Value]> = exercise_columns
        .iter()
        .filter(|name| **name != cfg.start_column && **name != cfg.end_column)
        .map(|name| exercises.values(name))
        .collect::<Result<_, _>>()?;

    let by_entity = index_exercises(exercises, cfg)?;
    let periods = entries.values(&cfg.period_column)?;
    let entities = entries.values(&cfg.entity_column)?;

    let mut picked: Vec<Option<usize>> = Vec::with_capacity(entries.num_rows());
    let mut fallback_matches = 0usize;
    for row in 0..entries.num_rows() {
        let key = GroupKey(vec![entities[row].clone()]);
        let period = match &periods[row] {
            Value::Date(d) => *d,
            Value::Null => {
                picked.push(None);
                continue;
            }
            other => {
                return Err(ContainmentError::NonDateValue {
                    column: cfg.period_column.clone(),
                    row,
                    group: key.to_string(),
                    found: other.type_name(),
                })
            }
        };
        let Some(candidates) = by_entity.get(&key) else {
            picked.push(None);
            continue;
        };

        let mut matching: Vec<usize> = candidates
            .iter()
            .filter(|ex| ex.contains(period))
            .map(|ex| ex.row)
            .collect();
        if matching.is_empty() {
            let year = entry_year(entries, row, period, cfg);
            matching = candidates
                .iter()
                .filter(|ex| ex.end.is_some_and(|end| end.year() == year))
                .map(|ex| ex.row)
                .collect();
            if !matching.is_empty() {
                fallback_matches += 1;
            }
        }

        // Same order as the duplicate resolver: null ratio, then input position.
        let best = matching
            .into_iter()
            .map(|ex| (quality_score(feature_columns.iter().map(|col| &col[ex])), ex))
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, ex)| ex);
        picked.push(best);
    }

    let mut out = entries.clone();
    for name in &exercise_columns {
        let source = exercises.values(name)?;
        let values = picked
            .iter()
            .map(|ex| ex.map_or(Value::Null, |ex| source[ex].clone()))
            .collect();
        out = out.with_column(name, values)?;
    }

    let matched = picked.iter().filter(|p| p.is_some()).count();
    if matched < entries.num_rows() {
        warn!(
            component = "containment",
            event = "containment.join.unmatched",
            unmatched_rows = entries.num_rows() - matched
        );
    }
    info!(
        component = "containment",
        event = "containment.join.finish",
        entry_rows = entries.num_rows(),
        exercise_rows = exercises.num_rows(),
        matched_rows = matched,
        fallback_matches = fallback_matches
    );

    Ok(out)
}

fn index_exercises(
    exercises: &Table,
    cfg: &ContainmentConfig,
) -> Result<BTreeMap<GroupKey, Vec<Exercise>>, ContainmentError> {
    let starts = exercises.values(&cfg.start_column)?;
    let ends = exercises.values(&cfg.end_column)?;
    let mut inverted = 0usize;
    let mut index = BTreeMap::new();

    for partition in exercises.partition_by(&[cfg.entity_column.as_str()])? {
        let mut list = Vec::with_capacity(partition.rows.len());
        for &row in &partition.rows {
            let start = date_or_null(&starts[row], &cfg.start_column, row, &partition.key)?;
            let end = date_or_null(&ends[row], &cfg.end_column, row, &partition.key)?;
            if let (Some(s), Some(e)) = (start, end) {
                if s >= e {
                    inverted += 1;
                    continue;
                }
            }
            list.push(Exercise { row, start, end });
        }
        index.insert(partition.key, list);
    }

    if inverted > 0 {
        warn!(
            component = "containment",
            event = "containment.exercise.inverted_interval",
            count = inverted
        );
    }
    Ok(index)
}

fn date_or_null(
    value: &Value,
    column: &str,
    row: usize,
    group: &GroupKey,
) -> Result<Option<NaiveDate>, ContainmentError> {
    match value {
        Value::Date(d) => Ok(Some(*d)),
        Value::Null => Ok(None),
        other => Err(ContainmentError::NonDateValue {
            column: column.to_string(),
            row,
            group: group.to_string(),
            found: other.type_name(),
        }),
    }
}

fn entry_year(entries: &Table, row: usize, period: NaiveDate, cfg: &ContainmentConfig) -> i32 {
    let cell = |column: &Option<String>| {
        column
            .as_deref()
            .and_then(|name| entries.value(row, name).ok())
    };

    if let Some(d) = cell(&cfg.year_end_column).and_then(period_from_value) {
        return d.year();
    }

    match cell(&cfg.year_label_column) {
        Some(Value::Number(n)) if n.fract() == 0.0 => return *n as i32,
        Some(Value::Text(raw)) => {
            if let Ok(year) = raw.trim().parse::<i32>() {
                return year;
            }
        }
        _ => {}
    }

    let shifted = period
        .checked_add_signed(ChronoDuration::days(cfg.fallback_day_offset_days))
        .unwrap_or(period);
    last_day_of_month(shifted).year()
}

/// Appends `{prefix}{column}` growth rates between each exercise and the one
/// `rank_offset` dense ranks before it within the same entity.
pub fn yoy_growth(exercises: &Table, cfg: &GrowthConfig) -> Result<Table, ContainmentError> {
    require_column(exercises, &cfg.entity_column, "exercises")?;
    require_column(exercises, &cfg.start_column, "exercises")?;

    let deduped = resolve(
        exercises,
        &[cfg.entity_column.as_str(), cfg.start_column.as_str()],
    )?;

    let key_columns = [&cfg.entity_column, &cfg.start_column, &cfg.end_column];
    let mut feature_columns = Vec::new();
    for name in deduped.column_names() {
        if key_columns.iter().any(|k| k.as_str() == name) {
            continue;
        }
        if deduped.is_numeric_column(name)? {
            feature_columns.push(name);
        }
    }
    for name in &feature_columns {
        let output = format!("{}{name}", cfg.output_prefix);
        if deduped.has_column(&output) {
            return Err(ContainmentError::ColumnCollision(output));
        }
    }

    let offset = cfg.rank_offset as usize;
    let mut previous: Vec<Option<usize>> = vec![None; deduped.num_rows()];
    let mut paired = 0usize;
    for partition in deduped.partition_by(&[cfg.entity_column.as_str()])? {
        let starts = deduped.values(&cfg.start_column)?;
        let mut ordered = Vec::with_capacity(partition.rows.len());
        for &row in &partition.rows {
            // Exercises without a start date are never ranked.
            let start = date_or_null(&starts[row], &cfg.start_column, row, &partition.key)?;
            if let Some(start) = start {
                ordered.push((start, row));
            }
        }
        ordered.sort();

        // Starts are unique per entity after resolution, so the dense rank of
        // each distinct start is its position among the distinct starts.
        let mut by_rank: Vec<usize> = Vec::with_capacity(ordered.len());
        let mut last_start = None;
        for &(start, row) in &ordered {
            if last_start != Some(start) {
                by_rank.push(row);
                last_start = Some(start);
            }
        }
        for rank in offset..by_rank.len() {
            previous[by_rank[rank]] = Some(by_rank[rank - offset]);
            paired += 1;
        }
    }

    let mut out = deduped.clone();
    for name in &feature_columns {
        let values = deduped.values(name)?;
        let growth = previous
            .iter()
            .enumerate()
            .map(|(row, prev)| match prev {
                Some(prev) => growth_rate(&values[row], &values[*prev]),
                None => Value::Null,
            })
            .collect();
        out = out.with_column(&format!("{}{name}", cfg.output_prefix), growth)?;
    }

    info!(
        component = "containment",
        event = "growth.finish",
        input_rows = exercises.num_rows(),
        output_rows = out.num_rows(),
        paired_rows = paired,
        rank_offset = cfg.rank_offset,
        growth_columns = feature_columns.len()
    );

    Ok(out)
}

/// `(current - previous) / previous`, missing whenever an operand is missing
/// or the previous value is zero.
pub fn growth_rate(current: &Value, previous: &Value) -> Value {
    match (current.as_f64(), previous.as_f64()) {
        (Some(cur), Some(prev)) if prev != 0.0 => Value::number((cur - prev) / prev),
        _ => Value::Null,
    }
}

fn require_column(table: &Table, column: &str, side: &'static str) -> Result<(), ContainmentError> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(ContainmentError::MissingColumn {
            column: column.to_string(),
            table: side,
        })
    }
}
