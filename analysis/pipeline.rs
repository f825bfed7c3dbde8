//! One outcome, end to end.
//!
//! `run_outcome` is called once per outcome with nothing shared between calls
//! except read-only inputs. Resampled estimates go through the result cache.

use crate::cache::{CacheError, CacheKey, CachedEstimate, ResultCache};
use crate::config::{AnalysisConfig, ConfigError};
use crate::cox::{CoxError, FittedCox, ModelVariant, fit_cox};
use crate::data::{DataError, OutcomeData, OutcomeKind, SubjectTable};
use crate::discrimination::{
    DiscriminationError, DiscriminationResult, DiscriminationSettings, estimate_discrimination,
};
use crate::export::{
    ExportError, discrimination_summary, log_rank_summary, prediction_error_summary,
    write_auc_table, write_coefficient_table, write_error_table, write_survival_table,
};
use crate::kaplan_meier::{
    LogRankTest, SurvivalCurve, SurvivalCurveError, kaplan_meier, kaplan_meier_by_group,
    log_rank_test,
};
use crate::prediction_error::{
    PredictionErrorError, PredictionErrorResult, PredictionErrorSettings, ResamplingScheme,
    estimate_prediction_error,
};
use crate::progress::ResamplingProgress;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to load subject data: {0}")]
    Data(#[from] DataError),
    #[error("Survival curve estimation failed: {0}")]
    SurvivalCurve(#[from] SurvivalCurveError),
    #[error("Cox model fitting failed: {0}")]
    Cox(#[from] CoxError),
    #[error("Prediction-error estimation failed: {0}")]
    PredictionError(#[from] PredictionErrorError),
    #[error("AUC estimation failed: {0}")]
    Discrimination(#[from] DiscriminationError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which parts of the analysis `run_outcome` performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stages {
    pub prediction_error: bool,
    pub discrimination: bool,
}

impl Stages {
    pub const ALL: Stages = Stages {
        prediction_error: true,
        discrimination: true,
    };
}

#[derive(Debug, Clone)]
pub struct SurvivalCurves {
    pub overall: SurvivalCurve,
    pub by_group: BTreeMap<u8, SurvivalCurve>,
    /// Absent when every subject falls in the same dACC group.
    pub log_rank: Option<LogRankTest>,
}

#[derive(Debug, Clone)]
pub struct OutcomeReport {
    pub outcome: OutcomeKind,
    pub num_subjects: usize,
    pub num_events: usize,
    pub curves: SurvivalCurves,
    pub fits: Vec<FittedCox>,
    pub prediction_error: Vec<PredictionErrorResult>,
    pub discrimination: Option<DiscriminationResult>,
}

pub fn survival_curves(data: &OutcomeData) -> Result<SurvivalCurves, PipelineError> {
    let time = data.time.view();
    let event = data.event.view();
    let overall = kaplan_meier(time, event)?;
    let by_group = kaplan_meier_by_group(time, event, data.dacc_group.view())?;
    let log_rank = if by_group.len() == 2 {
        Some(log_rank_test(time, event, data.dacc_group.view())?)
    } else {
        None
    };
    Ok(SurvivalCurves {
        overall,
        by_group,
        log_rank,
    })
}

/// Fits the Age, dACC and Age+dACC models to the full sample.
pub fn fit_models(
    data: &OutcomeData,
    config: &AnalysisConfig,
) -> Result<Vec<FittedCox>, PipelineError> {
    let options = config.cox.newton_options();
    ModelVariant::ALL
        .iter()
        .map(|&variant| fit_cox(data, variant, &options).map_err(PipelineError::from))
        .collect()
}

pub fn prediction_error(
    data: &OutcomeData,
    config: &AnalysisConfig,
    scheme: ResamplingScheme,
    cache: &ResultCache,
    progress: &dyn ResamplingProgress,
) -> Result<PredictionErrorResult, PipelineError> {
    config.validate()?;
    let settings = PredictionErrorSettings {
        scheme,
        repetitions: config.resampling.repetitions,
        folds: config.resampling.folds,
        seed: config.resampling.seed,
        max_time: config.columns.outcome(data.kind).max_time,
        newton: config.cox.newton_options(),
    };
    let key = CacheKey {
        outcome: data.kind,
        estimate: CachedEstimate::PredictionError(scheme),
        repetitions: settings.repetitions,
        seed: settings.seed,
    };
    cache.get_or_compute(
        &key,
        |stored: &PredictionErrorResult| stored.computed_with(&settings),
        || estimate_prediction_error(data, &settings, progress).map_err(PipelineError::from),
    )
}

pub fn discrimination(
    data: &OutcomeData,
    config: &AnalysisConfig,
    cache: &ResultCache,
    progress: &dyn ResamplingProgress,
) -> Result<DiscriminationResult, PipelineError> {
    config.validate()?;
    let settings = DiscriminationSettings {
        repetitions: config.auc.repetitions,
        folds: config.auc.folds,
        seed: config.resampling.seed,
        horizon: config.auc.horizon,
        newton: config.cox.newton_options(),
    };
    let key = CacheKey {
        outcome: data.kind,
        estimate: CachedEstimate::Discrimination,
        repetitions: settings.repetitions,
        seed: settings.seed,
    };
    cache.get_or_compute(
        &key,
        |stored: &DiscriminationResult| stored.computed_with(&settings),
        || estimate_discrimination(data, &settings, progress).map_err(PipelineError::from),
    )
}

/// Runs every requested stage of the analysis for a single outcome.
pub fn run_outcome(
    table: &SubjectTable,
    kind: OutcomeKind,
    config: &AnalysisConfig,
    stages: Stages,
    cache: &ResultCache,
    progress: &dyn ResamplingProgress,
) -> Result<OutcomeReport, PipelineError> {
    let data = table.outcome(kind)?;
    log::info!(
        "Analysing {}: {} subjects, {} events",
        kind.describe(),
        data.len(),
        data.num_events()
    );

    let curves = survival_curves(&data)?;
    let fits = fit_models(&data, config)?;

    let prediction_error = if stages.prediction_error {
        config
            .resampling
            .schemes
            .iter()
            .map(|&scheme| prediction_error(&data, config, scheme, cache, progress))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        Vec::new()
    };
    let discrimination = if stages.discrimination {
        Some(discrimination(&data, config, cache, progress)?)
    } else {
        None
    };

    Ok(OutcomeReport {
        outcome: kind,
        num_subjects: data.len(),
        num_events: data.num_events(),
        curves,
        fits,
        prediction_error,
        discrimination,
    })
}

fn group_name(group: u8) -> &'static str {
    if group == 1 { "high" } else { "low" }
}

/// `<dir>/<outcome>_<name>`, the naming shared by every table this crate writes.
pub fn output_path(dir: &Path, outcome: OutcomeKind, name: &str) -> PathBuf {
    dir.join(format!("{}_{name}", outcome.label()))
}

impl SurvivalCurves {
    /// Writes the overall curve and one curve per dACC group.
    pub fn write(&self, dir: &Path, outcome: OutcomeKind) -> Result<Vec<PathBuf>, PipelineError> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(1 + self.by_group.len());
        let path = output_path(dir, outcome, "km_overall.tsv");
        write_survival_table(&path, &self.overall)?;
        written.push(path);
        for (&group, curve) in &self.by_group {
            let path = output_path(dir, outcome, &format!("km_dacc_{}.tsv", group_name(group)));
            write_survival_table(&path, curve)?;
            written.push(path);
        }
        Ok(written)
    }
}

pub fn write_fits(
    dir: &Path,
    outcome: OutcomeKind,
    fits: &[FittedCox],
) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(dir)?;
    let path = output_path(dir, outcome, "cox.tsv");
    write_coefficient_table(&path, fits)?;
    Ok(path)
}

pub fn write_prediction_error(
    dir: &Path,
    result: &PredictionErrorResult,
) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(dir)?;
    let path = output_path(
        dir,
        result.outcome,
        &format!("error_{}.tsv", result.scheme.label()),
    );
    write_error_table(&path, result)?;
    Ok(path)
}

pub fn write_discrimination(
    dir: &Path,
    result: &DiscriminationResult,
) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(dir)?;
    let path = output_path(dir, result.outcome, "auc.tsv");
    write_auc_table(&path, result)?;
    Ok(path)
}

/// One line per fitted model: hazard ratio and p-value of each term.
pub fn fit_summary(fit: &FittedCox) -> String {
    let terms = fit
        .coefficient_summary()
        .iter()
        .map(|c| {
            format!(
                "{} HR {:.3} (p = {:.4})",
                c.predictor.name(),
                c.hazard_ratio,
                c.p_value
            )
        })
        .join(", ");
    let lr = fit.likelihood_ratio();
    format!(
        "Cox {}: {} [LR chi-square {:.2} on {} df, p = {:.4}]",
        fit.variant,
        terms,
        lr.statistic,
        lr.df,
        lr.p_value
    )
}

impl OutcomeReport {
    /// Human-readable summary lines, each stating its evaluation horizon.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{}: {} subjects, {} events",
            self.outcome.describe(),
            self.num_subjects,
            self.num_events
        )];
        if let Some(test) = &self.curves.log_rank {
            lines.push(log_rank_summary(test));
        }
        lines.extend(self.fits.iter().map(fit_summary));
        lines.extend(self.prediction_error.iter().map(prediction_error_summary));
        if let Some(result) = &self.discrimination {
            lines.push(discrimination_summary(result));
        }
        lines
    }

    /// Writes all tables for this outcome into `dir`, returning the paths written.
    pub fn write(&self, dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        let mut written = self.curves.write(dir, self.outcome)?;
        written.push(write_fits(dir, self.outcome, &self.fits)?);
        for result in &self.prediction_error {
            written.push(write_prediction_error(dir, result)?);
        }
        if let Some(result) = &self.discrimination {
            written.push(write_discrimination(dir, result)?);
        }

        let path = output_path(dir, self.outcome, "summary.txt");
        fs::write(&path, self.summary_lines().join("\n") + "\n")?;
        written.push(path);
        Ok(written)
    }
}

/// Loads the subject table named by `input` with the configured columns.
pub fn load_table(input: &Path, config: &AnalysisConfig) -> Result<SubjectTable, PipelineError> {
    Ok(crate::data::load_subject_table(input, &config.columns)?)
}
