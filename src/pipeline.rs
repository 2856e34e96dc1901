//! End-to-end temporal alignment run: normalize, join, resolve duplicates,
//! impute, derive window and row-wise features, then backfill the derived
//! columns.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::asof::{asof_join, AsofJoinError};
use crate::backfill::{backfill, impute_defaults, BackfillError, ImputationRule};
use crate::config::{validate_pipeline_config, ConfigError, JoinMode, PipelineConfig};
use crate::containment::{containment_join, yoy_growth, ContainmentError};
use crate::dedup::{resolve, DedupError};
use crate::derived::{derive_features, DerivedError, DerivedFeature};
use crate::entity::{
    normalize_entity_column, parse_date_column, truncate_period_column, EntityKeyError,
};
use crate::table::Table;
use crate::window::{window_features, window_specs_from_config, WindowError, WindowOp};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    Config(#[from] ConfigError),
    #[error("normalize stage failed: {0}")]
    Normalize(#[from] EntityKeyError),
    #[error("asof join stage failed: {0}")]
    AsofJoin(#[from] AsofJoinError),
    #[error("containment join stage failed: {0}")]
    Containment(#[from] ContainmentError),
    #[error("dedup stage failed: {0}")]
    Dedup(#[from] DedupError),
    #[error("window stage failed: {0}")]
    Window(#[from] WindowError),
    #[error("derive stage failed: {0}")]
    Derive(#[from] DerivedError),
    #[error("backfill stage failed: {0}")]
    Backfill(#[from] BackfillError),
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub rows: usize,
    pub columns: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub left_rows: usize,
    pub right_rows: usize,
    pub stages: Vec<StageReport>,
    pub output_rows: usize,
    pub output_columns: usize,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub table: Table,
    pub report: PipelineReport,
}

pub fn run_pipeline(
    left: &Table,
    right: &Table,
    cfg: &PipelineConfig,
) -> Result<PipelineOutput, PipelineError> {
    validate_pipeline_config(cfg)?;

    info!(
        component = "pipeline",
        event = "pipeline.start",
        join_mode = ?cfg.join_mode,
        left_rows = left.num_rows(),
        right_rows = right.num_rows()
    );

    let mut stages = Vec::new();
    let entity = cfg.entity_column.as_str();
    let period = cfg.period_column.as_str();

    let (left_norm, right_norm) = normalize_inputs(left, right, cfg)?;
    record_stage(&mut stages, "normalize", &left_norm);

    let joined = match cfg.join_mode {
        JoinMode::Asof => asof_join(&left_norm, &right_norm, &cfg.asof)?,
        JoinMode::Containment => {
            let exercises = match &cfg.growth {
                Some(growth) => {
                    let grown = yoy_growth(&right_norm, growth)?;
                    record_stage(&mut stages, "growth", &grown);
                    grown
                }
                None => right_norm,
            };
            containment_join(&left_norm, &exercises, &cfg.containment)?
        }
    };
    record_stage(&mut stages, "join", &joined);

    let resolved = resolve(&joined, &[entity, period])?;
    record_stage(&mut stages, "dedup", &resolved);

    let mut imputed = impute_defaults(&resolved, &cfg.imputation.fill_default_values)?;
    for (column, strategy) in &cfg.imputation.fill_imputation_strategy {
        imputed = backfill(&imputed, entity, period, &[column.as_str()], (*strategy).into())?;
    }
    record_stage(&mut stages, "impute", &imputed);

    let mut specs = window_specs_from_config(&cfg.time_aggregation);
    for lag in cfg.derived.iter().flat_map(DerivedFeature::required_lags) {
        if !specs.contains(&lag) {
            specs.push(lag);
        }
    }
    let mut windowed = window_features(&imputed, entity, period, &specs)?;
    record_stage(&mut stages, "window", &windowed);

    if !cfg.derived.is_empty() {
        windowed = derive_features(&windowed, &cfg.derived)?;
        record_stage(&mut stages, "derive", &windowed);
    }

    let derived: Vec<String> = specs
        .iter()
        .filter(|spec| matches!(spec.op, WindowOp::Lag | WindowOp::Diff))
        .map(|spec| spec.output_name())
        .chain(cfg.derived.iter().map(|f| f.output().to_string()))
        .collect();
    let derived: Vec<&str> = derived.iter().map(String::as_str).collect();
    let rule = ImputationRule::from(cfg.imputation.lag_fill_strategy);
    let table = backfill(&windowed, entity, period, &derived, rule)?;
    record_stage(&mut stages, "backfill", &table);

    let fingerprint = schema_fingerprint(&table);
    let report = PipelineReport {
        left_rows: left.num_rows(),
        right_rows: right.num_rows(),
        stages,
        output_rows: table.num_rows(),
        output_columns: table.num_columns(),
        fingerprint,
    };

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        output_rows = report.output_rows,
        output_columns = report.output_columns,
        fingerprint = %report.fingerprint
    );

    Ok(PipelineOutput { table, report })
}

/// Entity keys are normalized on both sides and entry periods truncated to
/// the month. Exercise bounds keep their exact day.
fn normalize_inputs(
    left: &Table,
    right: &Table,
    cfg: &PipelineConfig,
) -> Result<(Table, Table), PipelineError> {
    let mut left = normalize_entity_column(left, &cfg.entity_column)?;
    left = truncate_period_column(&left, &cfg.period_column)?;

    let right = match cfg.join_mode {
        JoinMode::Asof => {
            let mut right = right.clone();
            if right.has_column(&cfg.entity_column) {
                right = normalize_entity_column(&right, &cfg.entity_column)?;
            }
            if cfg.asof.on != cfg.period_column {
                left = truncate_period_column(&left, &cfg.asof.on)?;
            }
            truncate_period_column(&right, &cfg.asof.on)?
        }
        JoinMode::Containment => {
            let containment = &cfg.containment;
            let mut right = normalize_entity_column(right, &containment.entity_column)?;
            right = parse_date_column(&right, &containment.start_column)?;
            parse_date_column(&right, &containment.end_column)?
        }
    };

    Ok((left, right))
}

fn record_stage(stages: &mut Vec<StageReport>, stage: &str, table: &Table) {
    info!(
        component = "pipeline",
        event = "pipeline.stage.finish",
        stage,
        rows = table.num_rows(),
        columns = table.num_columns()
    );
    stages.push(StageReport {
        stage: stage.to_string(),
        rows: table.num_rows(),
        columns: table.num_columns(),
    });
}

/// SHA-256 over the ordered column names, hex encoded.
pub fn schema_fingerprint(table: &Table) -> String {
    let mut hasher = Sha256::new();
    hasher.update("columns:");
    for name in table.column_names() {
        hasher.update(name.as_bytes());
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}

pub fn assert_schema_compatible(
    expected_fingerprint: &str,
    table: &Table,
) -> Result<(), PipelineError> {
    let actual = schema_fingerprint(table);
    if expected_fingerprint != actual {
        return Err(PipelineError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual,
        });
    }
    Ok(())
}
