use super::working::{TieMethod, WorkingModel, WorkingState};
use crate::linalg::{FaerCholesky, FaerLinalgError};
use faer::Side;
use ndarray::{Array1, Array2};
use thiserror::Error;

/// Halvings attempted before a step that lowers the likelihood is abandoned.
const MAX_STEP_HALVINGS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonOptions {
    pub max_iterations: usize,
    /// Convergence when the relative change in log-likelihood drops below this.
    pub tolerance: f64,
    pub ties: TieMethod,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tolerance: 1e-9,
            ties: TieMethod::Efron,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewtonStatus {
    Converged,
    MaxIterations,
}

#[derive(Debug, Clone)]
pub struct NewtonResult {
    pub beta: Array1<f64>,
    pub log_likelihood: f64,
    pub initial_log_likelihood: f64,
    pub gradient: Array1<f64>,
    pub information: Array2<f64>,
    pub status: NewtonStatus,
    pub iterations: usize,
}

#[derive(Debug, Error)]
pub enum NewtonError {
    #[error("information matrix is not positive definite: {0}")]
    Factorization(#[from] FaerLinalgError),
    #[error("log-likelihood became non-finite at iteration {iteration}")]
    NonFinite { iteration: usize },
    #[error("no step along the Newton direction raised the log-likelihood at iteration {iteration}")]
    StepHalvingExhausted { iteration: usize },
}

fn relative_change(previous: f64, current: f64) -> f64 {
    let scale = current.abs().max(f64::MIN_POSITIVE);
    (current - previous).abs() / scale
}

/// Maximizes the model's log-likelihood by Newton-Raphson with step halving.
pub fn run_newton<M: WorkingModel>(
    model: &mut M,
    mut beta: Array1<f64>,
    options: &NewtonOptions,
) -> Result<NewtonResult, NewtonError> {
    let mut state = model.update(&beta);
    if !state.log_likelihood.is_finite() {
        return Err(NewtonError::NonFinite { iteration: 0 });
    }
    let initial_log_likelihood = state.log_likelihood;

    for iteration in 1..=options.max_iterations {
        let factor = state.information.cholesky(Side::Lower)?;
        let mut step = factor.solve_vec(&state.gradient);

        let mut candidate = &beta + &step;
        let mut next = model.update(&candidate);
        let mut halvings = 0;
        while !next.log_likelihood.is_finite() || next.log_likelihood < state.log_likelihood {
            if halvings == MAX_STEP_HALVINGS {
                return Err(if next.log_likelihood.is_finite() {
                    NewtonError::StepHalvingExhausted { iteration }
                } else {
                    NewtonError::NonFinite { iteration }
                });
            }
            step *= 0.5;
            candidate = &beta + &step;
            next = model.update(&candidate);
            halvings += 1;
        }

        let change = relative_change(state.log_likelihood, next.log_likelihood);
        log::debug!(
            "newton iteration {iteration}: loglik {:.6} (relative change {change:.3e}, {halvings} halvings)",
            next.log_likelihood
        );
        beta = candidate;
        state = next;

        if change < options.tolerance {
            return Ok(finish(beta, state, initial_log_likelihood, NewtonStatus::Converged, iteration));
        }
    }

    Ok(finish(
        beta,
        state,
        initial_log_likelihood,
        NewtonStatus::MaxIterations,
        options.max_iterations,
    ))
}

fn finish(
    beta: Array1<f64>,
    state: WorkingState,
    initial_log_likelihood: f64,
    status: NewtonStatus,
    iterations: usize,
) -> NewtonResult {
    NewtonResult {
        beta,
        log_likelihood: state.log_likelihood,
        initial_log_likelihood,
        gradient: state.gradient,
        information: state.information,
        status,
        iterations,
    }
}
