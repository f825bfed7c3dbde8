use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cox::{NewtonOptions, TieMethod};
use crate::data::OutcomeKind;
use crate::prediction_error::ResamplingScheme;

/// Number of resampling repetitions used by the published analysis.
pub const DEFAULT_REPETITIONS: usize = 1000;
/// Number of cross-validation folds used by the published analysis.
pub const DEFAULT_FOLDS: usize = 10;
/// Last month of the time-dependent AUC grid.
pub const DEFAULT_AUC_HORIZON: u32 = 44;
/// Default upper bound on Brier-score evaluation times, in months.
pub const DEFAULT_MAX_TIME: f64 = 44.0;
pub const DEFAULT_SEED: u64 = 20_130_325;
/// Largest seed that TOML, whose integers are signed 64-bit, can persist.
pub const MAX_SEED: u64 = i64::MAX as u64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Column holding one outcome's follow-up time and event flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeColumns {
    pub time: String,
    pub event: String,
    /// Latest time, in months, at which prediction error is evaluated.
    pub max_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub release_age: String,
    pub dacc: String,
    /// Optional binary dACC median-split column. Derived from `dacc` when absent.
    pub dacc_group: String,
    pub violent: OutcomeColumns,
    pub nonviolent: OutcomeColumns,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            release_age: "release_age".to_string(),
            dacc: "dacc".to_string(),
            dacc_group: "dacc_group".to_string(),
            violent: OutcomeColumns {
                time: "time_violent".to_string(),
                event: "event_violent".to_string(),
                max_time: DEFAULT_MAX_TIME,
            },
            nonviolent: OutcomeColumns {
                time: "time_nonviolent".to_string(),
                event: "event_nonviolent".to_string(),
                max_time: DEFAULT_MAX_TIME,
            },
        }
    }
}

impl ColumnConfig {
    pub fn outcome(&self, kind: OutcomeKind) -> &OutcomeColumns {
        match kind {
            OutcomeKind::Violent => &self.violent,
            OutcomeKind::Nonviolent => &self.nonviolent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResamplingConfig {
    pub repetitions: usize,
    pub folds: usize,
    pub seed: u64,
    pub schemes: Vec<ResamplingScheme>,
}

impl Default for ResamplingConfig {
    fn default() -> Self {
        Self {
            repetitions: DEFAULT_REPETITIONS,
            folds: DEFAULT_FOLDS,
            seed: DEFAULT_SEED,
            schemes: vec![ResamplingScheme::CrossValidation, ResamplingScheme::Bootstrap632Plus],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AucConfig {
    pub repetitions: usize,
    pub folds: usize,
    /// AUC is evaluated at every integer month `1..=horizon`.
    pub horizon: u32,
}

impl Default for AucConfig {
    fn default() -> Self {
        Self {
            repetitions: DEFAULT_REPETITIONS,
            folds: DEFAULT_FOLDS,
            horizon: DEFAULT_AUC_HORIZON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoxConfig {
    pub ties: TieMethod,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for CoxConfig {
    fn default() -> Self {
        let newton = NewtonOptions::default();
        Self {
            ties: TieMethod::Efron,
            max_iterations: newton.max_iterations,
            tolerance: newton.tolerance,
        }
    }
}

impl CoxConfig {
    pub fn newton_options(&self) -> NewtonOptions {
        NewtonOptions {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            ties: self.ties,
        }
    }
}

/// Complete configuration for one analysis run, persisted as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub columns: ColumnConfig,
    pub resampling: ResamplingConfig,
    pub auc: AucConfig,
    pub cox: CoxConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            output_dir: PathBuf::from("results"),
            columns: ColumnConfig::default(),
            resampling: ResamplingConfig::default(),
            auc: AucConfig::default(),
            cox: CoxConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Loads a configuration from a TOML file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resampling.repetitions == 0 || self.auc.repetitions == 0 {
            return Err(ConfigError::Invalid(
                "repetitions must be at least 1".to_string(),
            ));
        }
        if self.resampling.folds < 2 || self.auc.folds < 2 {
            return Err(ConfigError::Invalid(
                "cross-validation needs at least 2 folds".to_string(),
            ));
        }
        if self.resampling.seed > MAX_SEED {
            return Err(ConfigError::Invalid(format!(
                "seed must be at most {MAX_SEED} to be stored with cached results, got {}",
                self.resampling.seed
            )));
        }
        if self.auc.horizon == 0 {
            return Err(ConfigError::Invalid(
                "AUC horizon must be at least one month".to_string(),
            ));
        }
        for kind in OutcomeKind::ALL {
            let max_time = self.columns.outcome(kind).max_time;
            if !max_time.is_finite() || max_time <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "max_time for the {kind} outcome must be positive, got {max_time}"
                )));
            }
        }
        if self.cox.max_iterations == 0 || !(self.cox.tolerance > 0.0) {
            return Err(ConfigError::Invalid(
                "Cox fitting needs a positive iteration limit and tolerance".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_published_run() {
        let config = AnalysisConfig::default();
        assert_eq!(config.resampling.repetitions, 1000);
        assert_eq!(config.resampling.folds, 10);
        assert_eq!(config.auc.horizon, 44);
        assert_eq!(config.cox.ties, TieMethod::Efron);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("analysis.toml");
        let mut config = AnalysisConfig::default();
        config.resampling.repetitions = 25;
        config.columns.violent.max_time = 36.0;
        config.resampling.schemes = vec![ResamplingScheme::Bootstrap632Plus];
        config.save(&path).expect("save config");

        let loaded = AnalysisConfig::load(&path).expect("load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[auc]\nhorizon = 24\n").expect("write config");
        let loaded = AnalysisConfig::load(&path).expect("load config");
        assert_eq!(loaded.auc.horizon, 24);
        assert_eq!(loaded.auc.folds, DEFAULT_FOLDS);
        assert_eq!(loaded.columns, ColumnConfig::default());
    }

    #[test]
    fn largest_storable_seed_round_trips() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("seeded.toml");
        let mut config = AnalysisConfig::default();
        config.resampling.seed = MAX_SEED;
        config.validate().expect("i64::MAX is storable");
        config.save(&path).expect("save config");
        assert_eq!(AnalysisConfig::load(&path).expect("load").resampling.seed, MAX_SEED);
    }

    #[test]
    fn rejects_seed_beyond_toml_range() {
        let mut config = AnalysisConfig::default();
        config.resampling.seed = MAX_SEED + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.resampling.seed = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_single_fold() {
        let mut config = AnalysisConfig::default();
        config.resampling.folds = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
