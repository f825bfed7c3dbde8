//! Resampled prediction error of the benchmark models.
//!
//! Every repetition refits all models on resampled training data and scores the
//! held-out subjects with the censoring-adjusted Brier score. Repetitions run in
//! parallel; their curves are collected in repetition order and summed
//! sequentially, so a fixed seed reproduces the aggregate exactly.

use crate::brier::{
    brier_curve, brier_residuals, cutoff_time, evaluation_times, integrated_brier,
    no_information_curve,
};
use crate::cox::{CoxError, FittedCox, ModelVariant, NewtonOptions, fit_cox};
use crate::data::{OutcomeData, OutcomeKind};
use crate::kaplan_meier::{SurvivalCurve, SurvivalCurveError, censoring_distribution, kaplan_meier};
use crate::progress::{ResamplingProgress, ResamplingStage};
use crate::resample::{Partition, ResampleError, bootstrap, k_fold, repetition_rng};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingScheme {
    CrossValidation,
    Bootstrap632Plus,
}

impl ResamplingScheme {
    /// Short tag used in file names.
    pub fn label(self) -> &'static str {
        match self {
            Self::CrossValidation => "cv",
            Self::Bootstrap632Plus => "boot632plus",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::CrossValidation => "cross-validation",
            Self::Bootstrap632Plus => ".632+ bootstrap",
        }
    }

    fn stage(self) -> ResamplingStage {
        match self {
            Self::CrossValidation => ResamplingStage::CrossValidatedBrier,
            Self::Bootstrap632Plus => ResamplingStage::BootstrapBrier,
        }
    }
}

impl fmt::Display for ResamplingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Models scored for prediction error: a covariate-free Kaplan-Meier reference and the Cox variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkModel {
    Reference,
    Age,
    Dacc,
    AgeDacc,
}

impl BenchmarkModel {
    pub const ALL: [BenchmarkModel; 4] = [
        BenchmarkModel::Reference,
        BenchmarkModel::Age,
        BenchmarkModel::Dacc,
        BenchmarkModel::AgeDacc,
    ];

    pub fn cox_variant(self) -> Option<ModelVariant> {
        match self {
            Self::Reference => None,
            Self::Age => Some(ModelVariant::Age),
            Self::Dacc => Some(ModelVariant::Dacc),
            Self::AgeDacc => Some(ModelVariant::AgeDacc),
        }
    }

    pub fn label(self) -> &'static str {
        match self.cox_variant() {
            Some(variant) => variant.label(),
            None => "Reference",
        }
    }
}

/// Which side of a split had no events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    Training,
    HeldOut,
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Training => "training",
            Self::HeldOut => "held-out",
        })
    }
}

#[derive(Debug, Error)]
pub enum PredictionErrorError {
    #[error("repetition {repetition}, fold {fold}: the {role} partition contains no events")]
    DegenerateFold {
        repetition: usize,
        fold: usize,
        role: PartitionRole,
    },
    #[error("all {repetitions} repetitions were excluded because model fitting failed")]
    AllExcluded { repetitions: usize },
    #[error("no evaluation time lies within the common follow-up of {limit}")]
    NoEvaluationTimes { limit: f64 },
    #[error(transparent)]
    Resample(#[from] ResampleError),
    #[error(transparent)]
    SurvivalCurve(#[from] SurvivalCurveError),
    #[error("Cox fit failed: {0}")]
    Cox(#[from] CoxError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionErrorSettings {
    pub scheme: ResamplingScheme,
    pub repetitions: usize,
    pub folds: usize,
    pub seed: u64,
    /// Latest evaluation time considered.
    pub max_time: f64,
    pub newton: NewtonOptions,
}

/// Mean error curve of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelErrorCurve {
    pub model: BenchmarkModel,
    pub error: Vec<f64>,
    /// Error of the model fitted and scored on the full sample (.632+ only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparent: Option<Vec<f64>>,
    /// Error when predictions and outcomes are paired at random (.632+ only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_information: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionErrorResult {
    pub outcome: OutcomeKind,
    pub scheme: ResamplingScheme,
    pub repetitions: usize,
    /// Cross-validation folds; carried but not meaningful for the bootstrap.
    #[serde(default)]
    pub folds: usize,
    pub seed: u64,
    /// Latest evaluation time requested. Zero in artifacts that predate it,
    /// which never matches a valid configuration.
    #[serde(default)]
    pub max_time: f64,
    pub included: usize,
    pub excluded: usize,
    /// Largest evaluation time covered by every held-out partition.
    pub cutoff: f64,
    pub times: Vec<f64>,
    pub curves: Vec<ModelErrorCurve>,
}

impl PredictionErrorResult {
    /// Whether this result was produced under `settings`. Cox options are not recorded.
    pub fn computed_with(&self, settings: &PredictionErrorSettings) -> bool {
        let folds_agree =
            self.scheme == ResamplingScheme::Bootstrap632Plus || self.folds == settings.folds;
        self.scheme == settings.scheme
            && self.repetitions == settings.repetitions
            && self.seed == settings.seed
            && self.max_time == settings.max_time
            && folds_agree
    }

    pub fn curve(&self, model: BenchmarkModel) -> Option<&[f64]> {
        self.curves
            .iter()
            .find(|curve| curve.model == model)
            .map(|curve| curve.error.as_slice())
    }

    /// Number of leading evaluation times at or before the cutoff.
    pub fn times_within_cutoff(&self) -> usize {
        self.times.iter().take_while(|&&t| t <= self.cutoff).count()
    }

    pub fn integrated_brier(&self, model: BenchmarkModel) -> Option<f64> {
        self.curve(model)
            .and_then(|curve| integrated_brier(&self.times, curve, self.cutoff))
    }

    /// `(IBS_Age - IBS_Age+dACC) / IBS_Age`, undefined when the Age score is zero.
    pub fn relative_improvement(&self) -> Option<f64> {
        let age = self
            .integrated_brier(BenchmarkModel::Age)
            .filter(|&age| age > 0.0)?;
        let combined = self.integrated_brier(BenchmarkModel::AgeDacc)?;
        Some((age - combined) / age)
    }
}

enum FittedBenchmark {
    Reference(SurvivalCurve),
    Cox(FittedCox),
}

impl FittedBenchmark {
    fn fit(
        model: BenchmarkModel,
        data: &OutcomeData,
        options: &NewtonOptions,
    ) -> Result<Self, PredictionErrorError> {
        Ok(match model.cox_variant() {
            Some(variant) => FittedBenchmark::Cox(fit_cox(data, variant, options)?),
            None => FittedBenchmark::Reference(kaplan_meier(data.time.view(), data.event.view())?),
        })
    }

    fn predict(&self, data: &OutcomeData, times: &[f64]) -> Array2<f64> {
        match self {
            FittedBenchmark::Reference(curve) => {
                let row: Vec<f64> = times.iter().map(|&t| curve.survival_at(t)).collect();
                Array2::from_shape_fn((data.len(), times.len()), |(_, k)| row[k])
            }
            FittedBenchmark::Cox(fit) => fit.predict_survival(data.covariates.view(), times),
        }
    }
}

fn fit_all(
    data: &OutcomeData,
    options: &NewtonOptions,
) -> Result<Vec<FittedBenchmark>, PredictionErrorError> {
    BenchmarkModel::ALL
        .iter()
        .map(|&model| FittedBenchmark::fit(model, data, options))
        .collect()
}

enum RepetitionOutcome {
    Completed {
        /// Models × evaluation times.
        errors: Array2<f64>,
        /// Smallest maximum held-out time across this repetition's partitions.
        horizon: f64,
    },
    Excluded(CoxError),
}

struct RepetitionContext<'a> {
    data: &'a OutcomeData,
    times: &'a [f64],
    censoring: &'a SurvivalCurve,
    settings: &'a PredictionErrorSettings,
}

fn split_partition(
    data: &OutcomeData,
    partition: &Partition,
    repetition: usize,
    fold: usize,
) -> Result<(OutcomeData, OutcomeData), PredictionErrorError> {
    let train = data.subset(&partition.train);
    let test = data.subset(&partition.test);
    for (role, part) in [(PartitionRole::Training, &train), (PartitionRole::HeldOut, &test)] {
        if part.num_events() == 0 {
            return Err(PredictionErrorError::DegenerateFold {
                repetition,
                fold,
                role,
            });
        }
    }
    Ok((train, test))
}

/// Fits all models on `train` and sums the residuals of `test`. The inner error
/// is a fit failure that excludes the repetition.
fn score_partition(
    ctx: &RepetitionContext<'_>,
    train: &OutcomeData,
    test: &OutcomeData,
) -> Result<Result<Array2<f64>, CoxError>, PredictionErrorError> {
    let fitted = match fit_all(train, &ctx.settings.newton) {
        Ok(fitted) => fitted,
        Err(PredictionErrorError::Cox(err)) if err.excludes_repetition() => return Ok(Err(err)),
        Err(err) => return Err(err),
    };
    let mut sums = Array2::<f64>::zeros((fitted.len(), ctx.times.len()));
    for (m, model) in fitted.iter().enumerate() {
        let survival = model.predict(test, ctx.times);
        let residuals = brier_residuals(
            test.time.view(),
            test.event.view(),
            survival.view(),
            ctx.times,
            ctx.censoring,
        );
        sums.row_mut(m).assign(&residuals.sum_axis(Axis(0)));
    }
    Ok(Ok(sums))
}

fn cross_validation_repetition(
    ctx: &RepetitionContext<'_>,
    repetition: usize,
) -> Result<RepetitionOutcome, PredictionErrorError> {
    let mut rng = repetition_rng(ctx.settings.seed, repetition);
    let folds = k_fold(ctx.data.len(), ctx.settings.folds, &mut rng)?;
    let mut totals = Array2::<f64>::zeros((BenchmarkModel::ALL.len(), ctx.times.len()));
    let mut horizon = f64::INFINITY;
    for (fold, partition) in folds.iter().enumerate() {
        let (train, test) = split_partition(ctx.data, partition, repetition + 1, fold + 1)?;
        horizon = horizon.min(test.max_time());
        match score_partition(ctx, &train, &test)? {
            Ok(sums) => totals += &sums,
            Err(err) => return Ok(RepetitionOutcome::Excluded(err)),
        }
    }
    totals /= ctx.data.len() as f64;
    Ok(RepetitionOutcome::Completed {
        errors: totals,
        horizon,
    })
}

fn bootstrap_repetition(
    ctx: &RepetitionContext<'_>,
    repetition: usize,
) -> Result<RepetitionOutcome, PredictionErrorError> {
    let mut rng = repetition_rng(ctx.settings.seed, repetition);
    let partition = bootstrap(ctx.data.len(), &mut rng)?;
    let (train, test) = split_partition(ctx.data, &partition, repetition + 1, 1)?;
    Ok(match score_partition(ctx, &train, &test)? {
        Ok(sums) => RepetitionOutcome::Completed {
            errors: sums / test.len() as f64,
            horizon: test.max_time(),
        },
        Err(err) => RepetitionOutcome::Excluded(err),
    })
}

/// .632+ combination of apparent, out-of-bag and no-information error at one time.
fn combine_632_plus(apparent: f64, bootcv: f64, no_information: f64) -> f64 {
    let err1 = bootcv.min(no_information);
    let overfit = if err1 > apparent && no_information > apparent {
        (err1 - apparent) / (no_information - apparent)
    } else {
        0.0
    };
    let weight = 0.632 / (1.0 - 0.368 * overfit);
    (1.0 - weight) * apparent + weight * err1
}

pub fn estimate_prediction_error(
    data: &OutcomeData,
    settings: &PredictionErrorSettings,
    progress: &dyn ResamplingProgress,
) -> Result<PredictionErrorResult, PredictionErrorError> {
    let times = evaluation_times(data, settings.max_time);
    let censoring = censoring_distribution(data.time.view(), data.event.view())?;
    let ctx = RepetitionContext {
        data,
        times: &times,
        censoring: &censoring,
        settings,
    };
    let stage = settings.scheme.stage();

    log::info!(
        "Estimating {} prediction error for {} ({} repetitions, {} evaluation times)",
        settings.scheme,
        data.kind.describe(),
        settings.repetitions,
        times.len()
    );
    progress.on_stage_start(stage, settings.repetitions);
    let outcomes: Vec<Result<RepetitionOutcome, PredictionErrorError>> = (0..settings.repetitions)
        .into_par_iter()
        .map(|repetition| {
            let outcome = match settings.scheme {
                ResamplingScheme::CrossValidation => cross_validation_repetition(&ctx, repetition),
                ResamplingScheme::Bootstrap632Plus => bootstrap_repetition(&ctx, repetition),
            };
            progress.on_repetition_finish(stage);
            outcome
        })
        .collect();
    progress.on_stage_finish(stage);

    let mut totals = Array2::<f64>::zeros((BenchmarkModel::ALL.len(), times.len()));
    let mut horizon = f64::INFINITY;
    let mut included = 0;
    let mut excluded = 0;
    for (repetition, outcome) in outcomes.into_iter().enumerate() {
        match outcome? {
            RepetitionOutcome::Completed {
                errors,
                horizon: repetition_horizon,
            } => {
                totals += &errors;
                horizon = horizon.min(repetition_horizon);
                included += 1;
            }
            RepetitionOutcome::Excluded(err) => {
                log::warn!(
                    "Repetition {} of {} excluded: {err}",
                    repetition + 1,
                    settings.repetitions
                );
                excluded += 1;
            }
        }
    }
    if included == 0 {
        return Err(PredictionErrorError::AllExcluded {
            repetitions: settings.repetitions,
        });
    }
    let mean = totals / included as f64;

    let limit = horizon.min(settings.max_time);
    let cutoff = cutoff_time(&times, limit).ok_or(PredictionErrorError::NoEvaluationTimes { limit })?;

    let curves = match settings.scheme {
        ResamplingScheme::CrossValidation => BenchmarkModel::ALL
            .iter()
            .zip(mean.rows())
            .map(|(&model, row)| ModelErrorCurve {
                model,
                error: row.to_vec(),
                apparent: None,
                no_information: None,
            })
            .collect(),
        ResamplingScheme::Bootstrap632Plus => {
            let fitted = fit_all(data, &settings.newton)?;
            BenchmarkModel::ALL
                .iter()
                .zip(fitted.iter())
                .zip(mean.rows())
                .map(|((&model, fit), bootcv)| {
                    let survival = fit.predict(data, &times);
                    let (time, event) = (data.time.view(), data.event.view());
                    let apparent = brier_curve(time, event, survival.view(), &times, &censoring);
                    let noinf =
                        no_information_curve(time, event, survival.view(), &times, &censoring);
                    let error: Array1<f64> = Array1::from_shape_fn(times.len(), |k| {
                        combine_632_plus(apparent[k], bootcv[k], noinf[k])
                    });
                    ModelErrorCurve {
                        model,
                        error: error.to_vec(),
                        apparent: Some(apparent.to_vec()),
                        no_information: Some(noinf.to_vec()),
                    }
                })
                .collect()
        }
    };

    let result = PredictionErrorResult {
        outcome: data.kind,
        scheme: settings.scheme,
        repetitions: settings.repetitions,
        folds: settings.folds,
        seed: settings.seed,
        max_time: settings.max_time,
        included,
        excluded,
        cutoff,
        times,
        curves,
    };
    if let Some(improvement) = result.relative_improvement() {
        log::info!(
            "{} {}: integrated Brier score improvement {:.2}% up to month {}",
            data.kind.describe(),
            settings.scheme,
            100.0 * improvement,
            cutoff
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SubjectTable;
    use crate::progress::NoopResamplingProgress;
    use approx::assert_abs_diff_eq;

    #[test]
    fn no_overfit_gives_plain_632_weighting() {
        // Err1 below the apparent error: R = 0 and w = 0.632.
        let combined = combine_632_plus(0.2, 0.15, 0.3);
        assert_abs_diff_eq!(combined, 0.368 * 0.2 + 0.632 * 0.15, epsilon = 1e-12);
    }

    #[test]
    fn full_overfit_uses_out_of_bag_error() {
        // Err1 equals the no-information error: R = 1 and w = 1.
        let combined = combine_632_plus(0.1, 0.4, 0.25);
        assert_abs_diff_eq!(combined, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn partial_overfit_interpolates() {
        let (app, boot, noinf) = (0.1, 0.2, 0.3);
        let r: f64 = 0.5;
        let w = 0.632 / (1.0 - 0.368 * r);
        assert_abs_diff_eq!(
            combine_632_plus(app, boot, noinf),
            (1.0 - w) * app + w * boot,
            epsilon = 1e-12
        );
    }

    #[test]
    fn benchmark_labels_follow_variants() {
        assert_eq!(BenchmarkModel::Reference.label(), "Reference");
        assert_eq!(BenchmarkModel::AgeDacc.label(), "Age+dACC");
        assert_eq!(BenchmarkModel::Age.cox_variant(), Some(ModelVariant::Age));
    }

    #[test]
    fn relative_improvement_uses_integrated_scores() {
        let result = PredictionErrorResult {
            outcome: OutcomeKind::Violent,
            scheme: ResamplingScheme::CrossValidation,
            repetitions: 1,
            folds: 10,
            seed: 0,
            max_time: 44.0,
            included: 1,
            excluded: 0,
            cutoff: 2.0,
            times: vec![0.0, 1.0, 2.0],
            curves: vec![
                ModelErrorCurve {
                    model: BenchmarkModel::Age,
                    error: vec![0.0, 0.2, 0.5],
                    apparent: None,
                    no_information: None,
                },
                ModelErrorCurve {
                    model: BenchmarkModel::AgeDacc,
                    error: vec![0.0, 0.1, 0.5],
                    apparent: None,
                    no_information: None,
                },
            ],
        };
        assert_eq!(result.times_within_cutoff(), 3);
        assert_abs_diff_eq!(result.integrated_brier(BenchmarkModel::Age).unwrap(), 0.1);
        assert_abs_diff_eq!(result.relative_improvement().unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn zero_cutoff_leaves_scores_undefined() {
        let result = PredictionErrorResult {
            outcome: OutcomeKind::Violent,
            scheme: ResamplingScheme::CrossValidation,
            repetitions: 1,
            folds: 10,
            seed: 0,
            max_time: 44.0,
            included: 1,
            excluded: 0,
            cutoff: 0.0,
            times: vec![0.0],
            curves: vec![ModelErrorCurve {
                model: BenchmarkModel::Age,
                error: vec![0.0],
                apparent: None,
                no_information: None,
            }],
        };
        assert_eq!(result.integrated_brier(BenchmarkModel::Age), None);
        assert_eq!(result.relative_improvement(), None);
    }

    /// Twenty subjects failing at months `1..=20`, with dACC unrelated to time.
    fn cohort(release_age: Vec<f64>, event: Vec<bool>) -> OutcomeData {
        let n = release_age.len();
        let time: Vec<f64> = (1..=n).map(|t| t as f64).collect();
        let dacc: Vec<f64> = (0..n).map(|i| ((i * 7) % 11) as f64 / 10.0 - 0.5).collect();
        SubjectTable::from_columns(release_age, dacc, None, Some((time, event)), None)
            .expect("table")
            .outcome(OutcomeKind::Violent)
            .expect("violent")
    }

    fn mixed_ages() -> Vec<f64> {
        (0..20).map(|i| ((i * 3) % 7) as f64).collect()
    }

    const OLDER: usize = 9;

    /// Mostly events; subject 9 is the only one with a nonzero age.
    fn single_older_subject() -> OutcomeData {
        let mut release_age = vec![0.0; 20];
        release_age[OLDER] = 1.0;
        let event = (0..20).map(|i| i != 15 && i != 18).collect();
        cohort(release_age, event)
    }

    fn settings(scheme: ResamplingScheme, repetitions: usize) -> PredictionErrorSettings {
        PredictionErrorSettings {
            scheme,
            repetitions,
            folds: 5,
            seed: 11,
            max_time: 30.0,
            newton: NewtonOptions::default(),
        }
    }

    #[test]
    fn fold_without_events_aborts_the_estimate() {
        // One event cannot cover five folds.
        let event = (0..20).map(|i| i == 4).collect();
        let data = cohort(mixed_ages(), event);
        let settings = settings(ResamplingScheme::CrossValidation, 3);

        let first = k_fold(data.len(), settings.folds, &mut repetition_rng(settings.seed, 0))
            .expect("folds");
        let expected_role = if first[0].test.contains(&4) {
            PartitionRole::Training
        } else {
            PartitionRole::HeldOut
        };

        let err = estimate_prediction_error(&data, &settings, &NoopResamplingProgress)
            .expect_err("degenerate fold");
        match err {
            PredictionErrorError::DegenerateFold {
                repetition,
                fold,
                role,
            } => {
                assert_eq!(repetition, 1);
                assert_eq!(fold, 1);
                assert_eq!(role, expected_role);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failed_fits_exclude_only_their_repetitions() {
        // Bootstrap samples that miss the older subject have a constant age
        // column, so the Age fit is singular there and nowhere else.
        let data = single_older_subject();
        let settings = settings(ResamplingScheme::Bootstrap632Plus, 30);
        let expected_excluded = (0..settings.repetitions)
            .filter(|&r| {
                let partition = bootstrap(data.len(), &mut repetition_rng(settings.seed, r))
                    .expect("bootstrap");
                !partition.train.contains(&OLDER)
            })
            .count();
        assert!(expected_excluded > 0 && expected_excluded < settings.repetitions);

        let result = estimate_prediction_error(&data, &settings, &NoopResamplingProgress)
            .expect("estimate");
        assert_eq!(result.excluded, expected_excluded);
        assert!(result.included > 0);
        assert_eq!(result.included + result.excluded, settings.repetitions);
        assert!(result.relative_improvement().is_some());
    }

    #[test]
    fn every_repetition_failing_is_an_error() {
        // Each cross-validation repetition holds the older subject out once.
        let data = single_older_subject();
        let settings = settings(ResamplingScheme::CrossValidation, 3);
        let err = estimate_prediction_error(&data, &settings, &NoopResamplingProgress)
            .expect_err("all excluded");
        assert!(matches!(
            err,
            PredictionErrorError::AllExcluded { repetitions: 3 }
        ));
    }

    #[test]
    fn limit_before_the_first_event_has_no_cutoff() {
        let data = cohort(mixed_ages(), vec![true; 20]);
        let settings = PredictionErrorSettings {
            max_time: 0.5,
            ..settings(ResamplingScheme::CrossValidation, 2)
        };
        let err = estimate_prediction_error(&data, &settings, &NoopResamplingProgress)
            .expect_err("nothing to integrate");
        assert!(matches!(
            err,
            PredictionErrorError::NoEvaluationTimes { limit } if limit == 0.5
        ));
    }
}
