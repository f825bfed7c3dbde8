//! Cox proportional-hazards fitting for the three fixed predictor sets.
//!
//! Coefficients maximize the partial likelihood by Newton-Raphson starting from
//! zero, with covariates centered at their training means. The fitted model keeps
//! a baseline cumulative hazard so it can predict survival for new subjects.

mod baseline;
mod newton;
mod working;

pub use baseline::BaselineHazard;
pub use newton::{NewtonError, NewtonOptions, NewtonResult, NewtonStatus, run_newton};
pub use working::{PartialLikelihood, TieMethod, WorkingModel, WorkingState};

use crate::data::{DACC_COLUMN, OutcomeData, RELEASE_AGE_COLUMN};
use crate::linalg::{FaerCholesky, FaerLinalgError};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::erf::erfc;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoxError {
    #[error("cannot fit a Cox model to an empty sample")]
    Empty,
    #[error("the sample contains no events")]
    NoEvents,
    #[error("information matrix is singular: {0}")]
    Singular(FaerLinalgError),
    #[error("log-likelihood became non-finite at iteration {iteration}")]
    NonFinite { iteration: usize },
    #[error("step halving found no improvement at iteration {iteration}")]
    StepHalvingExhausted { iteration: usize },
    #[error("Newton-Raphson did not converge within {iterations} iterations")]
    NotConverged { iterations: usize },
}

impl CoxError {
    /// Fit failures that drop a resampling repetition rather than aborting the run.
    pub fn excludes_repetition(&self) -> bool {
        matches!(
            self,
            CoxError::Singular(_)
                | CoxError::NonFinite { .. }
                | CoxError::StepHalvingExhausted { .. }
                | CoxError::NotConverged { .. }
        )
    }
}

impl From<NewtonError> for CoxError {
    fn from(err: NewtonError) -> Self {
        match err {
            NewtonError::Factorization(inner) => CoxError::Singular(inner),
            NewtonError::NonFinite { iteration } => CoxError::NonFinite { iteration },
            NewtonError::StepHalvingExhausted { iteration } => {
                CoxError::StepHalvingExhausted { iteration }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predictor {
    ReleaseAge,
    Dacc,
}

impl Predictor {
    pub fn column(self) -> usize {
        match self {
            Predictor::ReleaseAge => RELEASE_AGE_COLUMN,
            Predictor::Dacc => DACC_COLUMN,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Predictor::ReleaseAge => "release_age",
            Predictor::Dacc => "dacc",
        }
    }
}

/// The fixed predictor sets compared by the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    Age,
    Dacc,
    AgeDacc,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 3] = [ModelVariant::Age, ModelVariant::Dacc, ModelVariant::AgeDacc];

    pub fn predictors(self) -> &'static [Predictor] {
        match self {
            ModelVariant::Age => &[Predictor::ReleaseAge],
            ModelVariant::Dacc => &[Predictor::Dacc],
            ModelVariant::AgeDacc => &[Predictor::ReleaseAge, Predictor::Dacc],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModelVariant::Age => "Age",
            ModelVariant::Dacc => "dACC",
            ModelVariant::AgeDacc => "Age+dACC",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSummary {
    pub predictor: Predictor,
    pub estimate: f64,
    pub hazard_ratio: f64,
    pub std_err: f64,
    pub z: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodRatioTest {
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

/// A Cox model fitted to one training sample. Immutable once built.
#[derive(Debug, Clone)]
pub struct FittedCox {
    pub variant: ModelVariant,
    pub coefficients: Array1<f64>,
    pub means: Array1<f64>,
    pub covariance: Array2<f64>,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub iterations: usize,
    pub num_subjects: usize,
    pub num_events: usize,
    pub baseline: BaselineHazard,
}

fn select_columns(covariates: ArrayView2<'_, f64>, predictors: &[Predictor]) -> Array2<f64> {
    let columns: Vec<usize> = predictors.iter().map(|p| p.column()).collect();
    covariates.select(Axis(1), &columns)
}

pub fn fit_cox(
    data: &OutcomeData,
    variant: ModelVariant,
    options: &NewtonOptions,
) -> Result<FittedCox, CoxError> {
    if data.is_empty() {
        return Err(CoxError::Empty);
    }
    let num_events = data.num_events();
    if num_events == 0 {
        return Err(CoxError::NoEvents);
    }

    let mut design = select_columns(data.covariates.view(), variant.predictors());
    let means = design
        .mean_axis(Axis(0))
        .ok_or(CoxError::Empty)?;
    design -= &means;

    let p = design.ncols();
    let mut likelihood =
        PartialLikelihood::new(design.clone(), data.time.view(), data.event.view(), options.ties);
    let result = run_newton(&mut likelihood, Array1::zeros(p), options)?;
    if result.status == NewtonStatus::MaxIterations {
        return Err(CoxError::NotConverged {
            iterations: result.iterations,
        });
    }

    let covariance = result
        .information
        .cholesky(Side::Lower)
        .map_err(CoxError::Singular)?
        .inverse();
    let eta = design.dot(&result.beta);
    let baseline =
        BaselineHazard::estimate(data.time.view(), data.event.view(), eta.view(), options.ties);

    Ok(FittedCox {
        variant,
        coefficients: result.beta,
        means,
        covariance,
        log_likelihood: result.log_likelihood,
        null_log_likelihood: result.initial_log_likelihood,
        iterations: result.iterations,
        num_subjects: data.len(),
        num_events,
        baseline,
    })
}

impl FittedCox {
    /// Centered linear predictor for each row of an `n × 2` covariate matrix.
    pub fn linear_predictor(&self, covariates: ArrayView2<'_, f64>) -> Array1<f64> {
        let mut design = select_columns(covariates, self.variant.predictors());
        design -= &self.means;
        design.dot(&self.coefficients)
    }

    pub fn survival(&self, linear_predictor: f64, t: f64) -> f64 {
        (-self.baseline.cumulative_at(t) * linear_predictor.exp()).exp()
    }

    /// Predicted survival, one row per subject and one column per time.
    pub fn predict_survival(&self, covariates: ArrayView2<'_, f64>, times: &[f64]) -> Array2<f64> {
        let lp = self.linear_predictor(covariates);
        let hazards: Vec<f64> = times.iter().map(|&t| self.baseline.cumulative_at(t)).collect();
        Array2::from_shape_fn((lp.len(), times.len()), |(i, k)| {
            (-hazards[k] * lp[i].exp()).exp()
        })
    }

    pub fn coefficient_summary(&self) -> Vec<CoefficientSummary> {
        self.variant
            .predictors()
            .iter()
            .enumerate()
            .map(|(k, &predictor)| {
                let estimate = self.coefficients[k];
                let std_err = self.covariance[[k, k]].sqrt();
                let z = estimate / std_err;
                CoefficientSummary {
                    predictor,
                    estimate,
                    hazard_ratio: estimate.exp(),
                    std_err,
                    z,
                    p_value: erfc(z.abs() / std::f64::consts::SQRT_2),
                }
            })
            .collect()
    }

    pub fn likelihood_ratio(&self) -> LikelihoodRatioTest {
        let df = self.coefficients.len();
        let statistic = (2.0 * (self.log_likelihood - self.null_log_likelihood)).max(0.0);
        let p_value = ChiSquared::new(df as f64)
            .map(|dist| dist.sf(statistic))
            .unwrap_or(f64::NAN);
        LikelihoodRatioTest {
            statistic,
            df,
            p_value,
        }
    }
}
