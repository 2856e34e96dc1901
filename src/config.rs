//! Engine configuration passed explicitly to every stage.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::derived::DerivedFeature;
use crate::observability::LoggingConfig;

pub const DEFAULT_FALLBACK_DAY_OFFSET: i64 = 392;
pub const DEFAULT_GROWTH_RANK_OFFSET: u32 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown as-of direction: {0:?} (expected backward, forward or nearest)")]
    UnknownDirection(String),
    #[error("unknown fill strategy: {0:?} (expected bfill, mean or median)")]
    UnknownStrategy(String),
    #[error("unknown join mode: {0:?} (expected asof or containment)")]
    UnknownJoinMode(String),
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum AsofDirection {
    #[default]
    Backward,
    Forward,
    Nearest,
}

impl FromStr for AsofDirection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backward" => Ok(Self::Backward),
            "forward" => Ok(Self::Forward),
            "nearest" => Ok(Self::Nearest),
            _ => Err(ConfigError::UnknownDirection(s.to_string())),
        }
    }
}

impl TryFrom<String> for AsofDirection {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for AsofDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Backward => "backward",
            Self::Forward => "forward",
            Self::Nearest => "nearest",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum FillStrategy {
    #[default]
    Bfill,
    Mean,
    Median,
}

impl FromStr for FillStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bfill" => Ok(Self::Bfill),
            "mean" => Ok(Self::Mean),
            "median" => Ok(Self::Median),
            _ => Err(ConfigError::UnknownStrategy(s.to_string())),
        }
    }
}

impl TryFrom<String> for FillStrategy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum JoinMode {
    #[default]
    Asof,
    Containment,
}

impl FromStr for JoinMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asof" => Ok(Self::Asof),
            "containment" => Ok(Self::Containment),
            _ => Err(ConfigError::UnknownJoinMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for JoinMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsofJoinConfig {
    pub on: String,
    pub by: Vec<String>,
    pub tolerance_days: Option<u32>,
    pub direction: AsofDirection,
}

impl Default for AsofJoinConfig {
    fn default() -> Self {
        Self {
            on: "periode".to_string(),
            by: vec!["siren".to_string()],
            tolerance_days: None,
            direction: AsofDirection::Backward,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainmentConfig {
    pub entity_column: String,
    pub period_column: String,
    pub start_column: String,
    pub end_column: String,
    /// Authoritative accounting year-end date carried by entry rows.
    pub year_end_column: Option<String>,
    /// Alternative year label carried by entry rows.
    pub year_label_column: Option<String>,
    pub fallback_day_offset_days: i64,
}

impl Default for ContainmentConfig {
    fn default() -> Self {
        Self {
            entity_column: "siren".to_string(),
            period_column: "periode".to_string(),
            start_column: "date_deb_exercice".to_string(),
            end_column: "date_fin_exercice".to_string(),
            year_end_column: Some("arrete_bilan_diane".to_string()),
            year_label_column: Some("exercice_diane".to_string()),
            fallback_day_offset_days: DEFAULT_FALLBACK_DAY_OFFSET,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthConfig {
    pub entity_column: String,
    pub start_column: String,
    pub end_column: String,
    /// Dense-rank distance between paired exercises; historical outputs pair
    /// rank `r` with `r - 2`.
    pub rank_offset: u32,
    pub output_prefix: String,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            entity_column: "siren".to_string(),
            start_column: "date_deb_exercice".to_string(),
            end_column: "date_fin_exercice".to_string(),
            rank_offset: DEFAULT_GROWTH_RANK_OFFSET,
            output_prefix: "tac_1y_".to_string(),
        }
    }
}

/// Horizons in months, keyed by base feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeAggregationConfig {
    pub lag: BTreeMap<String, Vec<u32>>,
    pub diff: BTreeMap<String, Vec<u32>>,
    pub mean: BTreeMap<String, Vec<u32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationConfig {
    pub fill_default_values: BTreeMap<String, f64>,
    pub fill_imputation_strategy: BTreeMap<String, FillStrategy>,
    /// Applied to lag and diff outputs after the window stage.
    pub lag_fill_strategy: FillStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub entity_column: String,
    pub period_column: String,
    pub join_mode: JoinMode,
    pub asof: AsofJoinConfig,
    pub containment: ContainmentConfig,
    pub growth: Option<GrowthConfig>,
    pub time_aggregation: TimeAggregationConfig,
    /// Computed after the window stage; their lag inputs are added automatically.
    pub derived: Vec<DerivedFeature>,
    pub imputation: ImputationConfig,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            entity_column: "siren".to_string(),
            period_column: "periode".to_string(),
            join_mode: JoinMode::Asof,
            asof: AsofJoinConfig::default(),
            containment: ContainmentConfig::default(),
            growth: None,
            time_aggregation: TimeAggregationConfig::default(),
            derived: Vec::new(),
            imputation: ImputationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let cfg = parse_pipeline_config(&raw)?;

    info!(
        component = "config",
        event = "config.loaded",
        path = %path.display(),
        join_mode = ?cfg.join_mode,
        direction = %cfg.asof.direction,
        tolerance_days = ?cfg.asof.tolerance_days
    );

    Ok(cfg)
}

pub fn parse_pipeline_config(raw: &str) -> Result<PipelineConfig, ConfigError> {
    let cfg: PipelineConfig = serde_json::from_str(raw)?;
    validate_pipeline_config(&cfg)?;
    Ok(cfg)
}

pub fn validate_pipeline_config(cfg: &PipelineConfig) -> Result<(), ConfigError> {
    require_name("entity_column", &cfg.entity_column)?;
    require_name("period_column", &cfg.period_column)?;

    require_name("asof.on", &cfg.asof.on)?;
    let mut seen = HashSet::new();
    for by in &cfg.asof.by {
        require_name("asof.by", by)?;
        if !seen.insert(by.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "asof.by entries must be unique ({by})"
            )));
        }
        if *by == cfg.asof.on {
            return Err(ConfigError::Invalid(format!(
                "asof.by must not contain the `on` column ({by})"
            )));
        }
    }

    let containment = &cfg.containment;
    require_name("containment.entity_column", &containment.entity_column)?;
    require_name("containment.period_column", &containment.period_column)?;
    require_name("containment.start_column", &containment.start_column)?;
    require_name("containment.end_column", &containment.end_column)?;
    if cfg.join_mode == JoinMode::Containment {
        // Normalization rewrites the top-level columns the joiner then reads.
        for (field, joined, top) in [
            ("entity_column", &containment.entity_column, &cfg.entity_column),
            ("period_column", &containment.period_column, &cfg.period_column),
        ] {
            if joined != top {
                return Err(ConfigError::Invalid(format!(
                    "containment.{field} ({joined}) must match {field} ({top})"
                )));
            }
        }
    }

    if let Some(growth) = &cfg.growth {
        require_name("growth.entity_column", &growth.entity_column)?;
        require_name("growth.start_column", &growth.start_column)?;
        if growth.rank_offset == 0 {
            return Err(ConfigError::Invalid(
                "growth.rank_offset must be > 0".to_string(),
            ));
        }
        require_name("growth.output_prefix", &growth.output_prefix)?;
        if cfg.join_mode == JoinMode::Containment
            && growth.entity_column != containment.entity_column
        {
            return Err(ConfigError::Invalid(format!(
                "growth.entity_column ({}) must match containment.entity_column ({})",
                growth.entity_column, containment.entity_column
            )));
        }
    }

    let mut outputs = HashSet::new();
    for feature in &cfg.derived {
        require_name("derived.output", feature.output())?;
        if !outputs.insert(feature.output()) {
            return Err(ConfigError::Invalid(format!(
                "derived output {} is configured twice",
                feature.output()
            )));
        }
        if feature.required_lags().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "derived feature {} has no input columns",
                feature.output()
            )));
        }
        for spec in feature.required_lags() {
            require_name("derived input", &spec.feature)?;
            if spec.horizon == 0 {
                return Err(ConfigError::Invalid(format!(
                    "derived feature {} horizon must be > 0",
                    feature.output()
                )));
            }
        }
    }

    require_name("logging.filter", &cfg.logging.filter)?;

    for (kind, horizons) in [
        ("lag", &cfg.time_aggregation.lag),
        ("diff", &cfg.time_aggregation.diff),
        ("mean", &cfg.time_aggregation.mean),
    ] {
        for (feature, values) in horizons {
            require_name(kind, feature)?;
            let mut seen = HashSet::new();
            for horizon in values {
                if *horizon == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "{kind} horizon for {feature} must be > 0"
                    )));
                }
                if !seen.insert(*horizon) {
                    return Err(ConfigError::Invalid(format!(
                        "{kind} horizons for {feature} must be unique"
                    )));
                }
            }
        }
    }

    for (column, value) in &cfg.imputation.fill_default_values {
        require_name("fill_default_values", column)?;
        if !value.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "default value for {column} must be finite"
            )));
        }
    }

    Ok(())
}

fn require_name(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn direction_and_strategy_names_parse_case_insensitively() {
        assert_eq!("Nearest".parse::<AsofDirection>().unwrap(), AsofDirection::Nearest);
        assert_eq!(" BFILL ".parse::<FillStrategy>().unwrap(), FillStrategy::Bfill);
        assert_eq!("containment".parse::<JoinMode>().unwrap(), JoinMode::Containment);
        assert!(matches!(
            "sideways".parse::<AsofDirection>().unwrap_err(),
            ConfigError::UnknownDirection(_)
        ));
        assert!(matches!(
            "ffill".parse::<FillStrategy>().unwrap_err(),
            ConfigError::UnknownStrategy(_)
        ));
    }

    #[test]
    fn parses_full_config_with_defaults_for_missing_sections() {
        let cfg = parse_pipeline_config(
            r#"{
                "asof": {
                    "on": "periode",
                    "by": ["siren"],
                    "tolerance_days": 90,
                    "direction": "nearest"
                },
                "time_aggregation": {"lag": {"ca": [1, 3]}, "mean": {"effectif": [6]}},
                "imputation": {"fill_imputation_strategy": {"ratio": "median"}}
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.asof.direction, AsofDirection::Nearest);
        assert_eq!(cfg.asof.tolerance_days, Some(90));
        assert_eq!(cfg.time_aggregation.lag["ca"], vec![1, 3]);
        assert_eq!(
            cfg.imputation.fill_imputation_strategy["ratio"],
            FillStrategy::Median
        );
        assert_eq!(cfg.imputation.lag_fill_strategy, FillStrategy::Bfill);
        assert_eq!(cfg.containment.fallback_day_offset_days, 392);
        assert_eq!(cfg.join_mode, JoinMode::Asof);
    }

    #[test]
    fn malformed_direction_fails_before_any_data_is_read() {
        let err = parse_pipeline_config(r#"{"asof": {"direction": "sideways"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("sideways"));

        let err =
            parse_pipeline_config(r#"{"imputation": {"lag_fill_strategy": "zero"}}"#).unwrap_err();
        assert!(err.to_string().contains("zero"));
    }

    #[test]
    fn rejects_zero_horizon_and_zero_rank_offset() {
        let mut cfg = PipelineConfig::default();
        cfg.time_aggregation.lag.insert("ca".to_string(), vec![0]);
        assert!(matches!(
            validate_pipeline_config(&cfg).unwrap_err(),
            ConfigError::Invalid(_)
        ));

        let cfg = PipelineConfig {
            growth: Some(GrowthConfig {
                rank_offset: 0,
                ..GrowthConfig::default()
            }),
            ..PipelineConfig::default()
        };
        assert!(validate_pipeline_config(&cfg).is_err());
    }

    #[test]
    fn rejects_by_containing_on() {
        let cfg = PipelineConfig {
            asof: AsofJoinConfig {
                by: vec!["periode".to_string()],
                ..AsofJoinConfig::default()
            },
            ..PipelineConfig::default()
        };
        assert!(validate_pipeline_config(&cfg).is_err());
    }

    #[test]
    fn containment_columns_must_match_the_normalized_ones() {
        let mut cfg = PipelineConfig {
            join_mode: JoinMode::Containment,
            ..PipelineConfig::default()
        };
        cfg.containment.period_column = "date_arrete".to_string();
        let err = validate_pipeline_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("containment.period_column"));

        cfg.containment.period_column = cfg.period_column.clone();
        cfg.containment.entity_column = "siret".to_string();
        assert!(validate_pipeline_config(&cfg).is_err());

        // As-of runs never read the containment section.
        cfg.join_mode = JoinMode::Asof;
        assert!(validate_pipeline_config(&cfg).is_ok());

        let cfg = PipelineConfig {
            join_mode: JoinMode::Containment,
            growth: Some(GrowthConfig {
                entity_column: "siret".to_string(),
                ..GrowthConfig::default()
            }),
            ..PipelineConfig::default()
        };
        assert!(validate_pipeline_config(&cfg).is_err());
    }

    #[test]
    fn derived_and_logging_sections_parse_and_validate() {
        let cfg = parse_pipeline_config(
            r#"{
                "derived": [
                    {"kind": "horizon_delta", "feature": "paydex_nb_jours",
                     "horizon": 12, "output": "paydex_yoy"}
                ],
                "logging": {"filter": "sf_align=debug", "format": "json"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.derived, vec![DerivedFeature::paydex_yoy()]);
        assert_eq!(cfg.logging.filter, "sf_align=debug");

        let twice = PipelineConfig {
            derived: vec![DerivedFeature::paydex_yoy(), DerivedFeature::paydex_yoy()],
            ..PipelineConfig::default()
        };
        assert!(validate_pipeline_config(&twice).is_err());

        let no_inputs = PipelineConfig {
            derived: vec![DerivedFeature::AvgDeltaPerSize {
                numerators: Vec::new(),
                denominator: "effectif".to_string(),
                horizon: 3,
                output: "x".to_string(),
            }],
            ..PipelineConfig::default()
        };
        assert!(validate_pipeline_config(&no_inputs).is_err());
    }

    #[test]
    fn loads_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"join_mode": "containment", "growth": {{}}}}"#).unwrap();
        let cfg = load_pipeline_config(file.path()).unwrap();
        assert_eq!(cfg.join_mode, JoinMode::Containment);
        assert_eq!(cfg.growth.unwrap().rank_offset, DEFAULT_GROWTH_RANK_OFFSET);
    }
}
