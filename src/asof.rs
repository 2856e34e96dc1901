//! Nearest-key, tolerance-bounded as-of join.
//!
//! Each group (by the `by` columns) is scanned in `on` order. Every right-hand
//! value column is carried independently: only rows where that column is
//! present are candidates, so a sparse right row never masks an older value.
//!
//! Tie-break order is (`on`, input position): among right rows sharing an `on`
//! value the one with the highest input position wins, in both directions.
//! `nearest` prefers the backward candidate on equal distance.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{AsofDirection, AsofJoinConfig};
use crate::table::{GroupKey, Partition, Table, TableError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

impl fmt::Display for JoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Left => "left",
            Self::Right => "right",
        })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AsofJoinError {
    #[error("`on` column {column} is missing from the {side} table")]
    MissingOnColumn { column: String, side: JoinSide },
    #[error("`by` column {column} is missing from the {side} table")]
    MissingByColumn { column: String, side: JoinSide },
    #[error("right column {0} collides with a left column")]
    ColumnCollision(String),
    #[error("{side} `on` column {column} row {row} in group {group} holds a {found}, expected a date")]
    NonDateKey {
        column: String,
        side: JoinSide,
        group: String,
        row: usize,
        found: &'static str,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    on: NaiveDate,
    row: usize,
}

pub fn asof_join(
    left: &Table,
    right: &Table,
    cfg: &AsofJoinConfig,
) -> Result<Table, AsofJoinError> {
    let value_columns = validate_schema(left, right, cfg)?;

    info!(
        component = "asof",
        event = "asof.join.start",
        on = %cfg.on,
        by = ?cfg.by,
        direction = %cfg.direction,
        tolerance_days = ?cfg.tolerance_days,
        left_rows = left.num_rows(),
        right_rows = right.num_rows(),
        value_columns = value_columns.len()
    );

    let by: Vec<&str> = cfg.by.iter().map(String::as_str).collect();
    let right_groups: BTreeMap<GroupKey, Vec<usize>> = right
        .partition_by(&by)?
        .into_iter()
        .map(|p| (p.key, p.rows))
        .collect();

    let mut outputs: Vec<Vec<Value>> =
        vec![vec![Value::Null; left.num_rows()]; value_columns.len()];
    let mut matched_rows = vec![false; left.num_rows()];
    let mut group_count = 0usize;

    for left_part in left.partition_by(&by)? {
        group_count += 1;
        let left_ordered = ordered_keys(left, &left_part, &cfg.on, JoinSide::Left)?;
        let Some(right_rows) = right_groups.get(&left_part.key) else {
            debug!(
                component = "asof",
                event = "asof.group.no_right_rows",
                group = %left_part.key,
                left_rows = left_part.rows.len()
            );
            continue;
        };
        let right_part = Partition {
            key: left_part.key.clone(),
            rows: right_rows.clone(),
        };
        let right_ordered = ordered_keys(right, &right_part, &cfg.on, JoinSide::Right)?;

        for (out_idx, column) in value_columns.iter().enumerate() {
            let values = right.values(column)?;
            let candidates: Vec<(NaiveDate, usize)> = right_ordered
                .iter()
                .copied()
                .filter(|(_, row)| !values[*row].is_null())
                .collect();

            let picked = match cfg.direction {
                AsofDirection::Backward => scan_backward(&left_ordered, &candidates),
                AsofDirection::Forward => scan_forward(&left_ordered, &candidates),
                AsofDirection::Nearest => {
                    let backward = scan_backward(&left_ordered, &candidates);
                    let forward = scan_forward(&left_ordered, &candidates);
                    left_ordered
                        .iter()
                        .zip(backward.into_iter().zip(forward))
                        .map(|(&(on, _), (b, f))| pick_nearest(on, b, f))
                        .collect()
                }
            };

            for (&(on, left_row), candidate) in left_ordered.iter().zip(picked) {
                let Some(candidate) = candidate else {
                    continue;
                };
                if !within_tolerance(on, candidate.on, cfg.tolerance_days) {
                    continue;
                }
                outputs[out_idx][left_row] = values[candidate.row].clone();
                matched_rows[left_row] = true;
            }
        }
    }

    let mut out = left.clone();
    for (column, values) in value_columns.iter().zip(outputs) {
        out = out.with_column(column, values)?;
    }

    let matched = matched_rows.iter().filter(|m| **m).count();
    info!(
        component = "asof",
        event = "asof.join.finish",
        groups = group_count,
        output_rows = out.num_rows(),
        matched_rows = matched,
        unmatched_rows = left.num_rows() - matched
    );

    Ok(out)
}

fn validate_schema(
    left: &Table,
    right: &Table,
    cfg: &AsofJoinConfig,
) -> Result<Vec<String>, AsofJoinError> {
    for (table, side) in [(left, JoinSide::Left), (right, JoinSide::Right)] {
        if !table.has_column(&cfg.on) {
            return Err(AsofJoinError::MissingOnColumn {
                column: cfg.on.clone(),
                side,
            });
        }
        for by in &cfg.by {
            if !table.has_column(by) {
                return Err(AsofJoinError::MissingByColumn {
                    column: by.clone(),
                    side,
                });
            }
        }
    }

    let mut value_columns = Vec::new();
    for name in right.column_names() {
        if name == cfg.on || cfg.by.iter().any(|b| b == name) {
            continue;
        }
        if left.has_column(name) {
            return Err(AsofJoinError::ColumnCollision(name.to_string()));
        }
        value_columns.push(name.to_string());
    }
    Ok(value_columns)
}

/// Rows with a missing `on` value are dropped from the scan: on the left they
/// keep missing right columns, on the right they are never candidates.
fn ordered_keys(
    table: &Table,
    partition: &Partition,
    on: &str,
    side: JoinSide,
) -> Result<Vec<(NaiveDate, usize)>, AsofJoinError> {
    let values = table.values(on)?;
    let mut ordered = Vec::with_capacity(partition.rows.len());
    for &row in &partition.rows {
        match &values[row] {
            Value::Date(d) => ordered.push((*d, row)),
            Value::Null => {}
            other => {
                return Err(AsofJoinError::NonDateKey {
                    column: on.to_string(),
                    side,
                    group: partition.key.to_string(),
                    row,
                    found: other.type_name(),
                })
            }
        }
    }
    ordered.sort();
    Ok(ordered)
}

/// Carries the last candidate with `on <= left.on` forward through the partition.
fn scan_backward(
    left: &[(NaiveDate, usize)],
    right: &[(NaiveDate, usize)],
) -> Vec<Option<Candidate>> {
    let mut out = Vec::with_capacity(left.len());
    let mut carried = None;
    let mut next = 0;
    for &(on, _) in left {
        while next < right.len() && right[next].0 <= on {
            carried = Some(Candidate {
                on: right[next].0,
                row: right[next].1,
            });
            next += 1;
        }
        out.push(carried);
    }
    out
}

/// Carries the earliest candidate with `on >= left.on` backward through the partition.
fn scan_forward(
    left: &[(NaiveDate, usize)],
    right: &[(NaiveDate, usize)],
) -> Vec<Option<Candidate>> {
    let mut out = vec![None; left.len()];
    let mut carried: Option<Candidate> = None;
    let mut next = right.len();
    for (idx, &(on, _)) in left.iter().enumerate().rev() {
        while next > 0 && right[next - 1].0 >= on {
            next -= 1;
            let (right_on, row) = right[next];
            // Equal keys arrive highest position first; keep that one.
            if carried.map_or(true, |c| right_on < c.on) {
                carried = Some(Candidate { on: right_on, row });
            }
        }
        out[idx] = carried;
    }
    out
}

fn pick_nearest(
    on: NaiveDate,
    backward: Option<Candidate>,
    forward: Option<Candidate>,
) -> Option<Candidate> {
    match (backward, forward) {
        (Some(b), Some(f)) => {
            if distance_days(on, f.on) < distance_days(on, b.on) {
                Some(f)
            } else {
                Some(b)
            }
        }
        (b, f) => b.or(f),
    }
}

fn distance_days(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days().abs()
}

fn within_tolerance(on: NaiveDate, matched: NaiveDate, tolerance_days: Option<u32>) -> bool {
    tolerance_days.map_or(true, |tol| distance_days(on, matched) <= i64::from(tol))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, m, day).unwrap()
    }

    #[test]
    fn backward_scan_takes_last_of_equal_keys() {
        let left = vec![(d(5, 10), 0)];
        let right = vec![(d(5, 1), 3), (d(5, 1), 7), (d(5, 20), 1)];
        let out = scan_backward(&left, &right);
        assert_eq!(out, vec![Some(Candidate { on: d(5, 1), row: 7 })]);
    }

    #[test]
    fn forward_scan_takes_last_of_equal_keys() {
        let left = vec![(d(5, 1), 0), (d(5, 10), 1)];
        let right = vec![(d(5, 1), 2), (d(5, 20), 4), (d(5, 20), 9)];
        let out = scan_forward(&left, &right);
        assert_eq!(
            out,
            vec![
                Some(Candidate { on: d(5, 1), row: 2 }),
                Some(Candidate { on: d(5, 20), row: 9 }),
            ]
        );
    }

    #[test]
    fn nearest_ties_go_backward() {
        let b = Some(Candidate { on: d(5, 5), row: 0 });
        let f = Some(Candidate { on: d(5, 15), row: 1 });
        assert_eq!(pick_nearest(d(5, 10), b, f), b);
        assert_eq!(pick_nearest(d(5, 11), b, f), f);
        assert_eq!(pick_nearest(d(5, 11), None, f), f);
    }
}
