use crate::auc::{AucError, AucFold, AucVariant, integrated_auc, time_dependent_auc};
use crate::cox::{CoxError, FittedCox, ModelVariant, NewtonOptions, fit_cox};
use crate::data::{OutcomeData, OutcomeKind};
use crate::kaplan_meier::{SurvivalCurveError, censoring_distribution, kaplan_meier};
use crate::prediction_error::PartitionRole;
use crate::progress::{ResamplingProgress, ResamplingStage};
use crate::resample::{ResampleError, repetition_rng, stratified_k_fold};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Models compared for discrimination, in column order of the per-fold results.
const COMPARED: [ModelVariant; 2] = [ModelVariant::Age, ModelVariant::AgeDacc];

#[derive(Debug, Error)]
pub enum DiscriminationError {
    #[error("repetition {repetition}, fold {fold}: the {role} partition contains no events")]
    DegenerateFold {
        repetition: usize,
        fold: usize,
        role: PartitionRole,
    },
    #[error("repetition {repetition}, fold {fold}: {variant} AUC is undefined at every time up to the horizon")]
    Undefined {
        repetition: usize,
        fold: usize,
        variant: AucVariant,
    },
    #[error("all {repetitions} repetitions were excluded because model fitting failed")]
    AllExcluded { repetitions: usize },
    #[error(transparent)]
    Resample(#[from] ResampleError),
    #[error(transparent)]
    SurvivalCurve(#[from] SurvivalCurveError),
    #[error(transparent)]
    Auc(#[from] AucError),
    #[error("Cox fit failed: {0}")]
    Cox(#[from] CoxError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscriminationSettings {
    pub repetitions: usize,
    pub folds: usize,
    pub seed: u64,
    /// AUC is evaluated at every integer month `1..=horizon`.
    pub horizon: u32,
    pub newton: NewtonOptions,
}

impl DiscriminationSettings {
    pub fn grid(&self) -> Vec<f64> {
        (1..=self.horizon).map(f64::from).collect()
    }
}

/// Mean integrated AUC of the two compared models under one estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantAuc {
    pub variant: AucVariant,
    pub age: f64,
    pub age_dacc: f64,
}

impl VariantAuc {
    /// `(AUC_Age+dACC - AUC_Age) / AUC_Age`.
    pub fn relative_improvement(&self) -> f64 {
        (self.age_dacc - self.age) / self.age
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminationResult {
    pub outcome: OutcomeKind,
    pub repetitions: usize,
    pub folds: usize,
    pub seed: u64,
    pub horizon: u32,
    pub included: usize,
    pub excluded: usize,
    pub variants: Vec<VariantAuc>,
}

impl DiscriminationResult {
    /// Whether this result was produced under `settings`. Cox options are not recorded.
    pub fn computed_with(&self, settings: &DiscriminationSettings) -> bool {
        self.repetitions == settings.repetitions
            && self.folds == settings.folds
            && self.seed == settings.seed
            && self.horizon == settings.horizon
    }

    pub fn variant(&self, variant: AucVariant) -> Option<&VariantAuc> {
        self.variants.iter().find(|entry| entry.variant == variant)
    }
}

enum RepetitionOutcome {
    /// Sum over folds of integrated AUC, estimators × compared models.
    Completed(Array2<f64>),
    Excluded(CoxError),
}

struct FoldPredictions {
    marker: Array1<f64>,
    survival: Array2<f64>,
    own: Array1<f64>,
}

fn predict(fit: &FittedCox, test: &OutcomeData, grid: &[f64]) -> FoldPredictions {
    let marker = fit.linear_predictor(test.covariates.view());
    let survival = fit.predict_survival(test.covariates.view(), grid);
    let own = Array1::from_shape_fn(test.len(), |i| fit.survival(marker[i], test.time[i]));
    FoldPredictions {
        marker,
        survival,
        own,
    }
}

fn run_repetition(
    data: &OutcomeData,
    settings: &DiscriminationSettings,
    grid: &[f64],
    repetition: usize,
) -> Result<RepetitionOutcome, DiscriminationError> {
    let mut rng = repetition_rng(settings.seed, repetition);
    let folds = stratified_k_fold(data.time.view(), settings.folds, &mut rng)?;
    let mut sums = Array2::<f64>::zeros((AucVariant::ALL.len(), COMPARED.len()));

    for (fold_index, partition) in folds.iter().enumerate() {
        let fold = fold_index + 1;
        let train = data.subset(&partition.train);
        let test = data.subset(&partition.test);
        for (role, part) in [(PartitionRole::Training, &train), (PartitionRole::HeldOut, &test)] {
            if part.num_events() == 0 {
                return Err(DiscriminationError::DegenerateFold {
                    repetition: repetition + 1,
                    fold,
                    role,
                });
            }
        }

        let training_censoring = censoring_distribution(train.time.view(), train.event.view())?;
        let held_out_survival = kaplan_meier(test.time.view(), test.event.view())?;

        for (m, &variant) in COMPARED.iter().enumerate() {
            let fit = match fit_cox(&train, variant, &settings.newton) {
                Ok(fit) => fit,
                Err(err) if err.excludes_repetition() => {
                    return Ok(RepetitionOutcome::Excluded(err));
                }
                Err(err) => return Err(err.into()),
            };
            let predictions = predict(&fit, &test, grid);
            let auc_fold = AucFold {
                time: test.time.view(),
                event: test.event.view(),
                marker: predictions.marker.view(),
                survival: predictions.survival.view(),
                survival_at_own_time: predictions.own.view(),
                training_censoring: &training_censoring,
                held_out_survival: &held_out_survival,
            };
            for (v, &estimator) in AucVariant::ALL.iter().enumerate() {
                let curve = time_dependent_auc(estimator, &auc_fold, grid)?;
                let summary = integrated_auc(grid, &curve, &held_out_survival).ok_or(
                    DiscriminationError::Undefined {
                        repetition: repetition + 1,
                        fold,
                        variant: estimator,
                    },
                )?;
                sums[[v, m]] += summary;
            }
        }
    }
    Ok(RepetitionOutcome::Completed(sums))
}

/// Repeated stratified cross-validation of the four time-dependent AUC estimators.
pub fn estimate_discrimination(
    data: &OutcomeData,
    settings: &DiscriminationSettings,
    progress: &dyn ResamplingProgress,
) -> Result<DiscriminationResult, DiscriminationError> {
    let grid = settings.grid();
    let stage = ResamplingStage::CrossValidatedAuc;
    log::info!(
        "Estimating time-dependent AUC for {} ({} repetitions of {}-fold cross-validation, horizon {} months)",
        data.kind.describe(),
        settings.repetitions,
        settings.folds,
        settings.horizon
    );

    progress.on_stage_start(stage, settings.repetitions);
    let outcomes: Vec<Result<RepetitionOutcome, DiscriminationError>> = (0..settings.repetitions)
        .into_par_iter()
        .map(|repetition| {
            let outcome = run_repetition(data, settings, &grid, repetition);
            progress.on_repetition_finish(stage);
            outcome
        })
        .collect();
    progress.on_stage_finish(stage);

    let mut totals = Array2::<f64>::zeros((AucVariant::ALL.len(), COMPARED.len()));
    let mut included = 0;
    let mut excluded = 0;
    for (repetition, outcome) in outcomes.into_iter().enumerate() {
        match outcome? {
            RepetitionOutcome::Completed(sums) => {
                totals += &sums;
                included += 1;
            }
            RepetitionOutcome::Excluded(err) => {
                log::warn!(
                    "AUC repetition {} of {} excluded: {err}",
                    repetition + 1,
                    settings.repetitions
                );
                excluded += 1;
            }
        }
    }
    if included == 0 {
        return Err(DiscriminationError::AllExcluded {
            repetitions: settings.repetitions,
        });
    }
    let means = totals / (included * settings.folds) as f64;

    let variants: Vec<VariantAuc> = AucVariant::ALL
        .iter()
        .zip(means.rows())
        .map(|(&variant, row)| VariantAuc {
            variant,
            age: row[0],
            age_dacc: row[1],
        })
        .collect();
    for entry in &variants {
        log::info!(
            "{} {}: AUC {:.3} -> {:.3} ({:+.2}%) up to month {}",
            data.kind.describe(),
            entry.variant,
            entry.age,
            entry.age_dacc,
            100.0 * entry.relative_improvement(),
            settings.horizon
        );
    }

    Ok(DiscriminationResult {
        outcome: data.kind,
        repetitions: settings.repetitions,
        folds: settings.folds,
        seed: settings.seed,
        horizon: settings.horizon,
        included,
        excluded,
        variants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SubjectTable;
    use crate::progress::NoopResamplingProgress;
    use approx::assert_abs_diff_eq;

    #[test]
    fn grid_covers_every_month() {
        let settings = DiscriminationSettings {
            repetitions: 1,
            folds: 10,
            seed: 0,
            horizon: 44,
            newton: NewtonOptions::default(),
        };
        let grid = settings.grid();
        assert_eq!(grid.len(), 44);
        assert_eq!(grid[0], 1.0);
        assert_eq!(grid[43], 44.0);
    }

    #[test]
    fn improvement_is_relative_to_age() {
        let entry = VariantAuc {
            variant: AucVariant::Uno,
            age: 0.6,
            age_dacc: 0.66,
        };
        assert_abs_diff_eq!(entry.relative_improvement(), 0.1, epsilon = 1e-12);
    }

    /// Twenty subjects observed at months `first..first + 20`, dACC unrelated to time.
    fn cohort(first: f64, release_age: Vec<f64>, event: Vec<bool>) -> OutcomeData {
        let n = release_age.len();
        let time: Vec<f64> = (0..n).map(|i| first + i as f64).collect();
        let dacc: Vec<f64> = (0..n).map(|i| ((i * 7) % 11) as f64 / 10.0 - 0.5).collect();
        SubjectTable::from_columns(release_age, dacc, None, Some((time, event)), None)
            .expect("table")
            .outcome(OutcomeKind::Violent)
            .expect("violent")
    }

    fn mixed_ages() -> Vec<f64> {
        (0..20).map(|i| ((i * 3) % 7) as f64).collect()
    }

    fn settings(horizon: u32) -> DiscriminationSettings {
        DiscriminationSettings {
            repetitions: 3,
            folds: 5,
            seed: 5,
            horizon,
            newton: NewtonOptions::default(),
        }
    }

    #[test]
    fn fold_without_events_aborts_the_estimate() {
        let event = (0..20).map(|i| i == 12).collect();
        let data = cohort(1.0, mixed_ages(), event);
        let settings = settings(20);

        let mut rng = repetition_rng(settings.seed, 0);
        let first = stratified_k_fold(data.time.view(), settings.folds, &mut rng).expect("folds");
        let expected_role = if first[0].test.contains(&12) {
            PartitionRole::Training
        } else {
            PartitionRole::HeldOut
        };

        let err = estimate_discrimination(&data, &settings, &NoopResamplingProgress)
            .expect_err("degenerate fold");
        match err {
            DiscriminationError::DegenerateFold {
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
    fn constant_training_age_excludes_every_repetition() {
        // The fold holding subject 9 out leaves an all-zero age column behind.
        let mut release_age = vec![0.0; 20];
        release_age[9] = 1.0;
        let event = (0..20).map(|i| i != 15 && i != 18).collect();
        let data = cohort(1.0, release_age, event);
        let err = estimate_discrimination(&data, &settings(20), &NoopResamplingProgress)
            .expect_err("all excluded");
        assert!(matches!(
            err,
            DiscriminationError::AllExcluded { repetitions: 3 }
        ));
    }

    #[test]
    fn horizon_before_every_event_is_undefined() {
        // Held-out survival stays at one over the grid, so no AUC carries weight.
        let data = cohort(2.0, mixed_ages(), vec![true; 20]);
        let err = estimate_discrimination(&data, &settings(1), &NoopResamplingProgress)
            .expect_err("undefined");
        match err {
            DiscriminationError::Undefined {
                repetition,
                fold,
                variant,
            } => {
                assert_eq!(repetition, 1);
                assert_eq!(fold, 1);
                assert_eq!(variant, AucVariant::Uno);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
