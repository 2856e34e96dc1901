//! Row-wise features computed from a value and its own lagged history.
//!
//! Each feature reads lag columns produced by the window stage, so the
//! history it compares against follows the same observed-row semantics.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::table::{Table, TableError, Value};
use crate::window::{WindowOp, WindowSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivedFeature {
    /// `feature - feature_lag{horizon}m`.
    HorizonDelta {
        feature: String,
        horizon: u32,
        output: String,
    },
    /// Average monthly change of `sum(numerators) / denominator` over `horizon`
    /// observed rows. A zero denominator yields a missing value.
    AvgDeltaPerSize {
        numerators: Vec<String>,
        denominator: String,
        horizon: u32,
        output: String,
    },
}

impl DerivedFeature {
    /// Paydex days compared with twelve months earlier.
    pub fn paydex_yoy() -> Self {
        Self::HorizonDelta {
            feature: "paydex_nb_jours".to_string(),
            horizon: 12,
            output: "paydex_yoy".to_string(),
        }
    }

    /// Social debt per employee, averaged over the last three months.
    pub fn avg_delta_debt_per_size() -> Self {
        Self::AvgDeltaPerSize {
            numerators: vec![
                "montant_part_ouvriere".to_string(),
                "montant_part_patronale".to_string(),
            ],
            denominator: "effectif".to_string(),
            horizon: 3,
            output: "avg_delta_dette_par_effectif".to_string(),
        }
    }

    pub fn output(&self) -> &str {
        match self {
            Self::HorizonDelta { output, .. } | Self::AvgDeltaPerSize { output, .. } => output,
        }
    }

    fn horizon(&self) -> u32 {
        match self {
            Self::HorizonDelta { horizon, .. } | Self::AvgDeltaPerSize { horizon, .. } => *horizon,
        }
    }

    /// Lag specs whose outputs this feature reads.
    pub fn required_lags(&self) -> Vec<WindowSpec> {
        let features: Vec<&String> = match self {
            Self::HorizonDelta { feature, .. } => vec![feature],
            Self::AvgDeltaPerSize { numerators, .. } => numerators.iter().collect(),
        };
        features
            .into_iter()
            .map(|feature| WindowSpec::new(feature.clone(), self.horizon(), WindowOp::Lag))
            .collect()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DerivedError {
    #[error("derived feature {0} needs a horizon > 0")]
    ZeroHorizon(String),
    #[error("derived feature {0} needs at least one numerator")]
    NoNumerators(String),
    #[error("derived output column {0} already exists")]
    OutputCollision(String),
    #[error("column {column} row {row} holds a {found}, expected a number")]
    NonNumeric {
        column: String,
        row: usize,
        found: &'static str,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

pub fn derive_features(table: &Table, features: &[DerivedFeature]) -> Result<Table, DerivedError> {
    let mut out = table.clone();
    for feature in features {
        if feature.horizon() == 0 {
            return Err(DerivedError::ZeroHorizon(feature.output().to_string()));
        }
        if out.has_column(feature.output()) {
            return Err(DerivedError::OutputCollision(feature.output().to_string()));
        }
        let values = match feature {
            DerivedFeature::HorizonDelta {
                feature, horizon, ..
            } => {
                let current = numbers(&out, feature)?;
                let past = numbers(&out, &lag_name(feature, *horizon))?;
                current
                    .iter()
                    .zip(&past)
                    .map(|(cur, prev)| match (cur, prev) {
                        (Some(cur), Some(prev)) => Value::number(cur - prev),
                        _ => Value::Null,
                    })
                    .collect()
            }
            DerivedFeature::AvgDeltaPerSize {
                numerators,
                denominator,
                horizon,
                output,
            } => {
                if numerators.is_empty() {
                    return Err(DerivedError::NoNumerators(output.clone()));
                }
                let size = numbers(&out, denominator)?;
                let current = summed(&out, numerators.iter().map(String::clone))?;
                let past = summed(&out, numerators.iter().map(|n| lag_name(n, *horizon)))?;
                (0..out.num_rows())
                    .map(|row| match (current[row], past[row], size[row]) {
                        (Some(cur), Some(prev), Some(size)) => {
                            Value::number((cur / size - prev / size) / f64::from(*horizon))
                        }
                        _ => Value::Null,
                    })
                    .collect()
            }
        };
        out = out.with_column(feature.output(), values)?;
    }

    info!(
        component = "derived",
        event = "derived.features.finish",
        rows = out.num_rows(),
        derived_columns = features.len()
    );

    Ok(out)
}

fn lag_name(feature: &str, horizon: u32) -> String {
    WindowSpec::new(feature, horizon, WindowOp::Lag).output_name()
}

fn numbers(table: &Table, column: &str) -> Result<Vec<Option<f64>>, DerivedError> {
    table
        .values(column)?
        .iter()
        .enumerate()
        .map(|(row, value)| match value {
            Value::Null => Ok(None),
            Value::Number(v) => Ok(Some(*v)),
            other => Err(DerivedError::NonNumeric {
                column: column.to_string(),
                row,
                found: other.type_name(),
            }),
        })
        .collect()
}

/// Row-wise sum, missing as soon as one operand is missing.
fn summed(
    table: &Table,
    columns: impl Iterator<Item = String>,
) -> Result<Vec<Option<f64>>, DerivedError> {
    let mut total = vec![Some(0.0); table.num_rows()];
    for column in columns {
        for (acc, value) in total.iter_mut().zip(numbers(table, &column)?) {
            *acc = (*acc).zip(value).map(|(a, v)| a + v);
        }
    }
    Ok(total)
}
