//! Missing-value filling after alignment and window derivation.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::FillStrategy;
use crate::table::{Table, TableError, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImputationRule {
    /// Nearest later value in the same entity partition; never looks backward.
    Bfill,
    Constant(f64),
    Mean,
    Median,
}

impl From<FillStrategy> for ImputationRule {
    fn from(strategy: FillStrategy) -> Self {
        match strategy {
            FillStrategy::Bfill => Self::Bfill,
            FillStrategy::Mean => Self::Mean,
            FillStrategy::Median => Self::Median,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum BackfillError {
    #[error("column {column} row {row} holds a {found}, expected a number for {rule} imputation")]
    NonNumeric {
        column: String,
        row: usize,
        rule: &'static str,
        found: &'static str,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

pub fn backfill(
    table: &Table,
    entity_column: &str,
    period_column: &str,
    columns: &[&str],
    rule: ImputationRule,
) -> Result<Table, BackfillError> {
    if columns.is_empty() {
        return Ok(table.clone());
    }
    for column in columns {
        table.column(column)?;
    }

    let mut out = table.clone();
    let mut filled = 0usize;
    match rule {
        ImputationRule::Bfill => {
            let partitions = table.partition_by(&[entity_column])?;
            let mut orders = Vec::with_capacity(partitions.len());
            for partition in &partitions {
                orders.push(table.sort_partition_by_date(partition, period_column)?);
            }
            for column in columns {
                let mut values = table.values(column)?.to_vec();
                for ordered in &orders {
                    let mut next: Option<Value> = None;
                    for &(_, row) in ordered.iter().rev() {
                        if values[row].is_null() {
                            if let Some(v) = &next {
                                values[row] = v.clone();
                                filled += 1;
                            }
                        } else {
                            next = Some(values[row].clone());
                        }
                    }
                }
                out = out.with_column(column, values)?;
            }
        }
        ImputationRule::Constant(fill) => {
            for column in columns {
                let (values, n) = fill_nulls(table.values(column)?, &Value::number(fill));
                filled += n;
                out = out.with_column(column, values)?;
            }
        }
        ImputationRule::Mean | ImputationRule::Median => {
            for column in columns {
                let present = numeric_values(table.values(column)?, column, rule)?;
                let Some(stat) = column_statistic(present, rule) else {
                    warn!(
                        component = "backfill",
                        event = "backfill.column.all_missing",
                        column = *column,
                        rule = rule_name(rule)
                    );
                    continue;
                };
                let (values, n) = fill_nulls(table.values(column)?, &Value::number(stat));
                filled += n;
                out = out.with_column(column, values)?;
            }
        }
    }

    info!(
        component = "backfill",
        event = "backfill.finish",
        rule = rule_name(rule),
        columns = ?columns,
        filled_values = filled
    );

    Ok(out)
}

/// Fills each configured column with its default value.
pub fn impute_defaults(
    table: &Table,
    defaults: &BTreeMap<String, f64>,
) -> Result<Table, BackfillError> {
    let mut out = table.clone();
    let mut filled = 0usize;
    for (column, value) in defaults {
        let (values, n) = fill_nulls(out.values(column)?, &Value::number(*value));
        filled += n;
        out = out.with_column(column, values)?;
    }

    info!(
        component = "backfill",
        event = "backfill.defaults.finish",
        columns = defaults.len(),
        filled_values = filled
    );

    Ok(out)
}

fn fill_nulls(values: &[Value], fill: &Value) -> (Vec<Value>, usize) {
    let mut filled = 0;
    let out = values
        .iter()
        .map(|v| {
            if v.is_null() {
                filled += 1;
                fill.clone()
            } else {
                v.clone()
            }
        })
        .collect();
    (out, filled)
}

fn numeric_values(
    values: &[Value],
    column: &str,
    rule: ImputationRule,
) -> Result<Vec<f64>, BackfillError> {
    let mut out = Vec::with_capacity(values.len());
    for (row, value) in values.iter().enumerate() {
        match value {
            Value::Null => {}
            Value::Number(v) => out.push(*v),
            other => {
                return Err(BackfillError::NonNumeric {
                    column: column.to_string(),
                    row,
                    rule: rule_name(rule),
                    found: other.type_name(),
                })
            }
        }
    }
    Ok(out)
}

fn column_statistic(mut present: Vec<f64>, rule: ImputationRule) -> Option<f64> {
    if present.is_empty() {
        return None;
    }
    match rule {
        ImputationRule::Median => {
            present.sort_by(f64::total_cmp);
            let mid = present.len() / 2;
            if present.len() % 2 == 0 {
                Some((present[mid - 1] + present[mid]) / 2.0)
            } else {
                Some(present[mid])
            }
        }
        _ => Some(present.iter().sum::<f64>() / present.len() as f64),
    }
}

fn rule_name(rule: ImputationRule) -> &'static str {
    match rule {
        ImputationRule::Bfill => "bfill",
        ImputationRule::Constant(_) => "constant",
        ImputationRule::Mean => "mean",
        ImputationRule::Median => "median",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn month(m: u32) -> Value {
        Value::Date(NaiveDate::from_ymd_opt(2021, m, 1).unwrap())
    }

    fn sample() -> Table {
        // Rows deliberately out of period order.
        Table::from_rows(
            &["siren", "periode", "x"],
            vec![
                vec!["a".into(), month(3), 3.0.into()],
                vec!["a".into(), month(1), Value::Null],
                vec!["a".into(), month(2), Value::Null],
                vec!["a".into(), month(4), Value::Null],
                vec!["b".into(), month(1), Value::Null],
                vec!["b".into(), month(2), 7.0.into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn bfill_uses_later_values_within_entity_only() {
        let out = backfill(&sample(), "siren", "periode", &["x"], ImputationRule::Bfill).unwrap();
        assert_eq!(
            out.values("x").unwrap(),
            &[
                Value::Number(3.0),
                Value::Number(3.0),
                Value::Number(3.0),
                Value::Null,
                Value::Number(7.0),
                Value::Number(7.0),
            ]
        );
    }

    #[test]
    fn bfill_is_idempotent() {
        let once = backfill(&sample(), "siren", "periode", &["x"], ImputationRule::Bfill).unwrap();
        let twice = backfill(&once, "siren", "periode", &["x"], ImputationRule::Bfill).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn mean_median_and_constant_are_column_wide() {
        let mean = backfill(&sample(), "siren", "periode", &["x"], ImputationRule::Mean).unwrap();
        assert_eq!(mean.values("x").unwrap()[1], Value::Number(5.0));

        let median =
            backfill(&sample(), "siren", "periode", &["x"], ImputationRule::Median).unwrap();
        assert_eq!(median.values("x").unwrap()[3], Value::Number(5.0));

        let constant =
            backfill(&sample(), "", "", &["x"], ImputationRule::Constant(0.0)).unwrap();
        assert_eq!(constant.values("x").unwrap()[4], Value::Number(0.0));
    }

    #[test]
    fn all_missing_column_stays_missing_under_mean() {
        let table = Table::from_rows(&["x"], vec![vec![Value::Null], vec![Value::Null]]).unwrap();
        let out = backfill(&table, "", "", &["x"], ImputationRule::Mean).unwrap();
        assert_eq!(out, table);
    }

    #[test]
    fn defaults_fill_named_columns() {
        let mut defaults = BTreeMap::new();
        defaults.insert("x".to_string(), -1.0);
        let out = impute_defaults(&sample(), &defaults).unwrap();
        assert_eq!(out.values("x").unwrap()[1], Value::Number(-1.0));
        assert!(impute_defaults(&sample(), &BTreeMap::from([("y".to_string(), 1.0)])).is_err());
    }
}
