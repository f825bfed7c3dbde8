//! Time-dependent (cumulative/dynamic) AUC estimators for right-censored data.
//!
//! All four estimators score how often a subject with an event by time `t`
//! carries a higher marker than a subject still event-free at `t`. They differ
//! in how subjects whose status at `t` is unknown are handled.

use crate::kaplan_meier::SurvivalCurve;
use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AucError {
    #[error("{name} has {found} entries but {expected} were expected")]
    LengthMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AucVariant {
    Uno,
    HungChiang,
    SongZhou,
    ChamblessDiao,
}

impl AucVariant {
    pub const ALL: [AucVariant; 4] = [
        AucVariant::Uno,
        AucVariant::HungChiang,
        AucVariant::SongZhou,
        AucVariant::ChamblessDiao,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Uno => "Uno",
            Self::HungChiang => "Hung-Chiang",
            Self::SongZhou => "Song-Zhou",
            Self::ChamblessDiao => "Chambless-Diao",
        }
    }
}

impl fmt::Display for AucVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Held-out data of one fold together with the fitted model's predictions for it.
pub struct AucFold<'a> {
    pub time: ArrayView1<'a, f64>,
    pub event: ArrayView1<'a, bool>,
    /// Linear predictor; higher means higher risk.
    pub marker: ArrayView1<'a, f64>,
    /// Model survival `S_i(t_k | x)` per held-out subject and grid time.
    pub survival: ArrayView2<'a, f64>,
    /// Model survival at each subject's own observed time, `S_i(T_i | x)`.
    pub survival_at_own_time: ArrayView1<'a, f64>,
    /// Censoring distribution estimated on the training partition.
    pub training_censoring: &'a SurvivalCurve,
    /// Kaplan-Meier curve of the held-out partition.
    pub held_out_survival: &'a SurvivalCurve,
}

impl AucFold<'_> {
    fn validate(&self, grid_len: usize) -> Result<(), AucError> {
        let n = self.time.len();
        let checks = [
            ("event", self.event.len()),
            ("marker", self.marker.len()),
            ("survival rows", self.survival.nrows()),
            ("survival_at_own_time", self.survival_at_own_time.len()),
        ];
        for (name, found) in checks {
            if found != n {
                return Err(AucError::LengthMismatch {
                    name,
                    expected: n,
                    found,
                });
            }
        }
        if self.survival.ncols() != grid_len {
            return Err(AucError::LengthMismatch {
                name: "survival columns",
                expected: grid_len,
                found: self.survival.ncols(),
            });
        }
        Ok(())
    }
}

/// 1 when the case outranks the control, one half on a tie.
fn concordance(case_marker: f64, control_marker: f64) -> f64 {
    if case_marker > control_marker {
        1.0
    } else if case_marker == control_marker {
        0.5
    } else {
        0.0
    }
}

fn inverse_or_zero(probability: f64) -> f64 {
    if probability > 0.0 { 1.0 / probability } else { 0.0 }
}

fn uno(fold: &AucFold<'_>, t: f64) -> Option<f64> {
    let n = fold.time.len();
    let controls: Vec<usize> = (0..n).filter(|&j| fold.time[j] > t).collect();
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for i in (0..n).filter(|&i| fold.event[i] && fold.time[i] <= t) {
        let weight = inverse_or_zero(fold.training_censoring.survival_before(fold.time[i]));
        let wins: f64 = controls
            .iter()
            .map(|&j| concordance(fold.marker[i], fold.marker[j]))
            .sum();
        numerator += weight * wins;
        denominator += weight * controls.len() as f64;
    }
    (denominator > 0.0).then(|| numerator / denominator)
}

fn hung_chiang(fold: &AucFold<'_>, t: f64) -> Option<f64> {
    let n = fold.time.len();
    let survival = fold.held_out_survival.survival_at(t);
    let spread = survival * (1.0 - survival);
    let control_weight = inverse_or_zero(fold.training_censoring.survival_at(t));
    if spread <= 0.0 || control_weight == 0.0 {
        return None;
    }
    let controls: Vec<usize> = (0..n).filter(|&j| fold.time[j] > t).collect();
    let mut numerator = 0.0;
    for i in (0..n).filter(|&i| fold.event[i] && fold.time[i] <= t) {
        let case_weight = inverse_or_zero(fold.training_censoring.survival_before(fold.time[i]));
        let wins: f64 = controls
            .iter()
            .map(|&j| concordance(fold.marker[i], fold.marker[j]))
            .sum();
        numerator += case_weight * control_weight * wins;
    }
    let n2 = (n * n) as f64;
    Some((numerator / n2 / spread).clamp(0.0, 1.0))
}

/// AUC from per-subject case probabilities `p_i`: sum of `p_i (1 - p_j) c_ij` over
/// ordered pairs, normalized by the sum of `p_i (1 - p_j)`.
fn weighted_pairs(marker: ArrayView1<'_, f64>, case_probability: &[f64]) -> Option<f64> {
    let n = marker.len();
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for i in 0..n {
        if case_probability[i] == 0.0 {
            continue;
        }
        for j in 0..n {
            if i == j {
                continue;
            }
            let weight = case_probability[i] * (1.0 - case_probability[j]);
            numerator += weight * concordance(marker[i], marker[j]);
            denominator += weight;
        }
    }
    (denominator > 0.0).then(|| numerator / denominator)
}

fn song_zhou(fold: &AucFold<'_>, k: usize, t: f64) -> Option<f64> {
    let probabilities: Vec<f64> = (0..fold.time.len())
        .map(|i| {
            if fold.time[i] > t {
                0.0
            } else if fold.event[i] {
                1.0
            } else {
                // Censored before t: chance of failing in (T_i, t] given survival to T_i.
                let at_censoring = fold.survival_at_own_time[i];
                if at_censoring > 0.0 {
                    (1.0 - fold.survival[[i, k]] / at_censoring).clamp(0.0, 1.0)
                } else {
                    1.0
                }
            }
        })
        .collect();
    weighted_pairs(fold.marker, &probabilities)
}

fn chambless_diao(fold: &AucFold<'_>, k: usize) -> Option<f64> {
    let probabilities: Vec<f64> = fold
        .survival
        .column(k)
        .iter()
        .map(|s| 1.0 - s)
        .collect();
    weighted_pairs(fold.marker, &probabilities)
}

/// AUC at each grid time. `None` where the estimator is undefined, for
/// instance when no case or no control exists at that time.
pub fn time_dependent_auc(
    variant: AucVariant,
    fold: &AucFold<'_>,
    grid: &[f64],
) -> Result<Vec<Option<f64>>, AucError> {
    fold.validate(grid.len())?;
    Ok(grid
        .iter()
        .enumerate()
        .map(|(k, &t)| match variant {
            AucVariant::Uno => uno(fold, t),
            AucVariant::HungChiang => hung_chiang(fold, t),
            AucVariant::SongZhou => song_zhou(fold, k, t),
            AucVariant::ChamblessDiao => chambless_diao(fold, k),
        })
        .collect())
}

/// Summary AUC weighting each defined `AUC(t_k)` by the Kaplan-Meier mass
/// `S(t_{k-1}) - S(t_k)`, renormalized over the defined grid points.
pub fn integrated_auc(grid: &[f64], auc: &[Option<f64>], survival: &SurvivalCurve) -> Option<f64> {
    let mut previous = 1.0;
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (&t, value) in grid.iter().zip(auc) {
        let current = survival.survival_at(t);
        let weight = previous - current;
        previous = current;
        if let Some(value) = value {
            weighted += weight * value;
            total_weight += weight;
        }
    }
    (total_weight > 0.0).then(|| weighted / total_weight)
}
