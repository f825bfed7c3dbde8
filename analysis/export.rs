use crate::cox::FittedCox;
use crate::discrimination::DiscriminationResult;
use crate::kaplan_meier::{LogRankTest, SurvivalCurve};
use crate::prediction_error::{BenchmarkModel, PredictionErrorResult, ResamplingScheme};
use csv::{Writer, WriterBuilder};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write table: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error while writing table: {0}")]
    Io(#[from] std::io::Error),
    #[error("result has no error curve for the {0} model")]
    MissingCurve(&'static str),
}

fn tsv_writer(path: &Path) -> Result<Writer<File>, ExportError> {
    Ok(WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?)
}

fn fmt_value(value: f64) -> String {
    format!("{value:.10}")
}

/// Two-column `time`/`survival` table starting at `(0, 1)`.
pub fn write_survival_table(path: &Path, curve: &SurvivalCurve) -> Result<(), ExportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(["time", "survival"])?;
    for (time, survival) in curve.points() {
        wtr.write_record([fmt_value(time), fmt_value(survival)])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Mean error of the Age and Age+dACC models at each evaluation time up to the cutoff.
pub fn write_error_table(path: &Path, result: &PredictionErrorResult) -> Result<(), ExportError> {
    let age = result
        .curve(BenchmarkModel::Age)
        .ok_or(ExportError::MissingCurve(BenchmarkModel::Age.label()))?;
    let combined = result
        .curve(BenchmarkModel::AgeDacc)
        .ok_or(ExportError::MissingCurve(BenchmarkModel::AgeDacc.label()))?;

    let mut wtr = tsv_writer(path)?;
    wtr.write_record(["time", "age", "age_dacc"])?;
    for k in 0..result.times_within_cutoff() {
        wtr.write_record([
            fmt_value(result.times[k]),
            fmt_value(age[k]),
            fmt_value(combined[k]),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_coefficient_table(path: &Path, fits: &[FittedCox]) -> Result<(), ExportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "model",
        "predictor",
        "coef",
        "hazard_ratio",
        "std_err",
        "z",
        "p_value",
        "loglik",
        "events",
    ])?;
    for fit in fits {
        for summary in fit.coefficient_summary() {
            wtr.write_record([
                fit.variant.label().to_string(),
                summary.predictor.name().to_string(),
                fmt_value(summary.estimate),
                fmt_value(summary.hazard_ratio),
                fmt_value(summary.std_err),
                fmt_value(summary.z),
                format!("{:.6e}", summary.p_value),
                fmt_value(fit.log_likelihood),
                fit.num_events.to_string(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_auc_table(path: &Path, result: &DiscriminationResult) -> Result<(), ExportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(["estimator", "age", "age_dacc", "relative_improvement"])?;
    for entry in &result.variants {
        wtr.write_record([
            entry.variant.label().to_string(),
            fmt_value(entry.age),
            fmt_value(entry.age_dacc),
            fmt_value(entry.relative_improvement()),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn prediction_error_summary(result: &PredictionErrorResult) -> String {
    let scheme = match result.scheme {
        ResamplingScheme::CrossValidation => "cross-validated",
        ResamplingScheme::Bootstrap632Plus => ".632+ bootstrap",
    };
    let improvement = result
        .relative_improvement()
        .map_or_else(|| "n/a".to_string(), |value| format!("{:.2}%", 100.0 * value));
    let mut summary = format!(
        "Improvement in {scheme} prediction error (integrated Brier score up to month {}, {} of {} repetitions) for {}: {improvement}",
        result.cutoff,
        result.included,
        result.repetitions,
        result.outcome.describe(),
    );
    if result.excluded > 0 {
        summary.push_str(&format!(
            " [{} repetitions excluded after failed fits]",
            result.excluded
        ));
    }
    summary
}

pub fn discrimination_summary(result: &DiscriminationResult) -> String {
    let mut lines = vec![format!(
        "Improvement in time-dependent AUC (integrated up to month {}, {} repetitions of {}-fold cross-validation) for {}:",
        result.horizon,
        result.included,
        result.folds,
        result.outcome.describe()
    )];
    for entry in &result.variants {
        lines.push(format!(
            "  {:<15} {:.4} -> {:.4}  ({:+.2}%)",
            entry.variant.label(),
            entry.age,
            entry.age_dacc,
            100.0 * entry.relative_improvement()
        ));
    }
    lines.join("\n")
}

pub fn log_rank_summary(test: &LogRankTest) -> String {
    format!(
        "Log-rank test, dACC group {} vs {}: chi-square = {:.3} on 1 df, p = {:.4}",
        test.groups[0], test.groups[1], test.statistic, test.p_value
    )
}
