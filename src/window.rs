//! Per-entity lag, difference and moving-average features.
//!
//! Horizons count observed rows in the entity's own period order, not calendar
//! months: a gap in observations compresses the effective calendar distance.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::TimeAggregationConfig;
use crate::table::{Table, TableError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowOp {
    Lag,
    Diff,
    MovingAverage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub feature: String,
    pub horizon: u32,
    pub op: WindowOp,
}

impl WindowSpec {
    pub fn new(feature: impl Into<String>, horizon: u32, op: WindowOp) -> Self {
        Self {
            feature: feature.into(),
            horizon,
            op,
        }
    }

    pub fn output_name(&self) -> String {
        let kind = match self.op {
            WindowOp::Lag => "lag",
            WindowOp::Diff => "diff",
            WindowOp::MovingAverage => "mean",
        };
        format!("{}_{kind}{}m", self.feature, self.horizon)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum WindowError {
    #[error("window horizon for {feature} must be > 0")]
    ZeroHorizon { feature: String },
    #[error("window output column {0} already exists")]
    OutputCollision(String),
    #[error("feature {feature} row {row} in group {group} holds a {found}, expected a number")]
    NonNumericFeature {
        feature: String,
        row: usize,
        group: String,
        found: &'static str,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Expands the configured horizons in a stable order: lags, diffs, then means,
/// each by feature name and ascending horizon.
pub fn window_specs_from_config(cfg: &TimeAggregationConfig) -> Vec<WindowSpec> {
    let mut specs = Vec::new();
    for (op, by_feature) in [
        (WindowOp::Lag, &cfg.lag),
        (WindowOp::Diff, &cfg.diff),
        (WindowOp::MovingAverage, &cfg.mean),
    ] {
        for (feature, horizons) in by_feature {
            let mut horizons = horizons.clone();
            horizons.sort_unstable();
            horizons.dedup();
            for horizon in horizons {
                specs.push(WindowSpec::new(feature.clone(), horizon, op));
            }
        }
    }
    specs
}

/// Trailing history of one feature within one entity partition.
#[derive(Debug, Clone)]
struct FeatureRolling {
    history: VecDeque<Option<f64>>,
    capacity: usize,
}

impl FeatureRolling {
    fn new(max_horizon: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_horizon + 1),
            capacity: max_horizon + 1,
        }
    }

    fn push(&mut self, value: Option<f64>) {
        self.history.push_back(value);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    fn current(&self) -> Option<f64> {
        self.history.back().copied().flatten()
    }

    fn lag(&self, h: usize) -> Option<f64> {
        if self.history.len() <= h {
            return None;
        }
        self.history[self.history.len() - 1 - h]
    }

    fn diff(&self, h: usize) -> Option<f64> {
        Some(self.current()? - self.lag(h)?)
    }

    fn moving_average(&self, h: usize) -> Option<f64> {
        let start = self.history.len().saturating_sub(h);
        let present: Vec<f64> = self.history.range(start..).filter_map(|v| *v).collect();
        if present.is_empty() {
            return None;
        }
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }

    fn eval(&self, spec: &WindowSpec) -> Option<f64> {
        let h = spec.horizon as usize;
        match spec.op {
            WindowOp::Lag => self.lag(h),
            WindowOp::Diff => self.diff(h),
            WindowOp::MovingAverage => self.moving_average(h),
        }
    }
}

pub fn window_features(
    table: &Table,
    entity_column: &str,
    period_column: &str,
    specs: &[WindowSpec],
) -> Result<Table, WindowError> {
    if specs.is_empty() {
        return Ok(table.clone());
    }
    let mut max_horizon: BTreeMap<&str, usize> = BTreeMap::new();
    for spec in specs {
        if spec.horizon == 0 {
            return Err(WindowError::ZeroHorizon {
                feature: spec.feature.clone(),
            });
        }
        if table.has_column(&spec.output_name()) {
            return Err(WindowError::OutputCollision(spec.output_name()));
        }
        table.column(&spec.feature)?;
        let entry = max_horizon.entry(spec.feature.as_str()).or_insert(0);
        *entry = (*entry).max(spec.horizon as usize);
    }

    let mut outputs: Vec<Vec<Value>> = vec![vec![Value::Null; table.num_rows()]; specs.len()];
    let partitions = table.partition_by(&[entity_column])?;

    for partition in &partitions {
        let ordered = table.sort_partition_by_date(partition, period_column)?;
        let mut rolling: BTreeMap<&str, FeatureRolling> = max_horizon
            .iter()
            .map(|(feature, h)| (*feature, FeatureRolling::new(*h)))
            .collect();

        for &(_, row) in &ordered {
            for (feature, state) in rolling.iter_mut() {
                let value = match table.value(row, feature)? {
                    Value::Null => None,
                    Value::Number(v) => Some(*v),
                    other => {
                        return Err(WindowError::NonNumericFeature {
                            feature: (*feature).to_string(),
                            row,
                            group: partition.key.to_string(),
                            found: other.type_name(),
                        })
                    }
                };
                state.push(value);
            }
            for (idx, spec) in specs.iter().enumerate() {
                let state = &rolling[spec.feature.as_str()];
                outputs[idx][row] = Value::from(state.eval(spec));
            }
        }
    }

    let mut out = table.clone();
    for (spec, values) in specs.iter().zip(outputs) {
        out = out.with_column(&spec.output_name(), values)?;
    }

    info!(
        component = "window",
        event = "window.features.finish",
        partitions = partitions.len(),
        rows = out.num_rows(),
        derived_columns = specs.len()
    );

    Ok(out)
}
