//! Temporal alignment of company records.
//!
//! - as-of joins of monthly entries against sparse dated sources
//! - fiscal-exercise containment joins with year-over-year growth
//! - duplicate resolution by data quality
//! - per-entity lag, difference and moving-average features
//! - row-wise derived features and cumulative payment history
//! - missing-value backfill and imputation

mod asof;
mod backfill;
mod config;
mod containment;
mod dedup;
mod derived;
mod entity;
mod io;
mod observability;
mod payment;
mod pipeline;
mod table;
mod window;

pub use asof::{asof_join, AsofJoinError, JoinSide};
pub use backfill::{backfill, impute_defaults, BackfillError, ImputationRule};
pub use config::{
    load_pipeline_config, parse_pipeline_config, validate_pipeline_config, AsofDirection,
    AsofJoinConfig, ConfigError, ContainmentConfig, FillStrategy, GrowthConfig, ImputationConfig,
    JoinMode, PipelineConfig, TimeAggregationConfig, DEFAULT_FALLBACK_DAY_OFFSET,
    DEFAULT_GROWTH_RANK_OFFSET,
};
pub use containment::{containment_join, growth_rate, yoy_growth, ContainmentError};
pub use dedup::{quality_score, resolve, resolve_with_score_columns, DedupError};
pub use derived::{derive_features, DerivedError, DerivedFeature};
pub use entity::{
    last_day_of_month, normalize_entity_column, normalize_entity_key, parse_date_column,
    parse_entity_key, parse_period, period_from_value, truncate_period_column, truncate_to_month,
    EntityKey, EntityKeyError, ENTITY_KEY_LEN,
};
pub use io::{read_csv_table, write_csv_table, ColumnType, CsvSchema, TableIoError};
pub use observability::{
    apply_log_overrides, init_logging, log_inputs_loaded, log_output_written, log_run_start,
    logging_config_from_env, logging_subscriber, LogFormat, LoggingConfig, LoggingInitError,
    LOG_FILTER_ENV, LOG_FORMAT_ENV,
};
pub use payment::{
    payment_cumulative, PaymentConfig, PaymentError, CUMULATIVE_AMOUNT_COLUMN,
    PAYMENT_COUNT_COLUMN,
};
pub use pipeline::{
    assert_schema_compatible, run_pipeline, schema_fingerprint, PipelineError, PipelineOutput,
    PipelineReport, StageReport,
};
pub use table::{Column, GroupKey, Partition, Table, TableError, Value};
pub use window::{window_features, window_specs_from_config, WindowError, WindowOp, WindowSpec};
