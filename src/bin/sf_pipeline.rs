use std::path::PathBuf;

use sf_align::{
    assert_schema_compatible, init_logging, load_pipeline_config, log_inputs_loaded,
    log_output_written, log_run_start, logging_config_from_env, read_csv_table, run_pipeline,
    write_csv_table, ColumnType, CsvSchema, JoinMode, PipelineConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = optional_path("SF_PIPELINE_CONFIG");
    let cfg = match &config_path {
        Some(path) => load_pipeline_config(path)?,
        None => PipelineConfig::default(),
    };
    let logging_cfg = logging_config_from_env(&cfg.logging)?;
    init_logging(&logging_cfg)?;
    log_run_start(&logging_cfg, &cfg, config_path.as_deref());

    let left_path = required_path("SF_PIPELINE_LEFT")?;
    let right_path = required_path("SF_PIPELINE_RIGHT")?;
    let output_path = required_path("SF_PIPELINE_OUTPUT")?;

    // Entity keys keep their leading zeros when read as text.
    let left_schema = CsvSchema::default().with_column(&cfg.entity_column, ColumnType::Text);
    let right_entity = match cfg.join_mode {
        JoinMode::Asof => &cfg.entity_column,
        JoinMode::Containment => &cfg.containment.entity_column,
    };
    let right_schema = CsvSchema::default().with_column(right_entity, ColumnType::Text);

    let left = read_csv_table(&left_path, &left_schema)?;
    let right = read_csv_table(&right_path, &right_schema)?;
    log_inputs_loaded(&left_path, &right_path, left.num_rows(), right.num_rows());

    let output = run_pipeline(&left, &right, &cfg)?;
    if let Ok(expected) = std::env::var("SF_PIPELINE_EXPECTED_FINGERPRINT") {
        assert_schema_compatible(expected.trim(), &output.table)?;
    }

    write_csv_table(&output_path, &output.table)?;
    let report_path = optional_path("SF_PIPELINE_REPORT");
    if let Some(path) = &report_path {
        std::fs::write(path, serde_json::to_vec_pretty(&output.report)?)?;
    }
    log_output_written(&output_path, report_path.as_deref(), &output.report.fingerprint);

    Ok(())
}

fn optional_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

fn required_path(key: &str) -> Result<PathBuf, String> {
    optional_path(key).ok_or_else(|| format!("{key} must be set"))
}
