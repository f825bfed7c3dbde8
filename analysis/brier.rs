//! Censoring-adjusted Brier score.
//!
//! Each subject's squared error at time `t` is weighted by the inverse probability
//! of remaining uncensored, estimated by the reverse Kaplan-Meier curve `G`:
//! subjects with an event by `t` weigh `S(t|x)^2 / G(T-)`, subjects still at
//! risk weigh `(1 - S(t|x))^2 / G(t)`, and subjects censored before `t`
//! contribute zero.

use crate::data::OutcomeData;
use crate::kaplan_meier::SurvivalCurve;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// `{0}` together with the distinct event times up to `max_time`.
pub fn evaluation_times(data: &OutcomeData, max_time: f64) -> Vec<f64> {
    let mut times = vec![0.0];
    times.extend(data.event_times().into_iter().filter(|&t| t <= max_time));
    times
}

/// Case and control IPCW weights of one subject at time `t`.
fn ipcw_weights(time: f64, event: bool, t: f64, censoring: &SurvivalCurve) -> (f64, f64) {
    if time <= t {
        if event {
            (1.0 / censoring.survival_before(time), 0.0)
        } else {
            (0.0, 0.0)
        }
    } else {
        (0.0, 1.0 / censoring.survival_at(t))
    }
}

/// Weighted squared residuals, one row per subject and one column per evaluation time.
pub fn brier_residuals(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, bool>,
    survival: ArrayView2<'_, f64>,
    times: &[f64],
    censoring: &SurvivalCurve,
) -> Array2<f64> {
    Array2::from_shape_fn((time.len(), times.len()), |(i, k)| {
        let s = survival[[i, k]];
        let (case, control) = ipcw_weights(time[i], event[i], times[k], censoring);
        case * s * s + control * (1.0 - s) * (1.0 - s)
    })
}

/// Mean Brier score at each evaluation time.
pub fn brier_curve(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, bool>,
    survival: ArrayView2<'_, f64>,
    times: &[f64],
    censoring: &SurvivalCurve,
) -> Array1<f64> {
    brier_residuals(time, event, survival, times, censoring)
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(times.len()))
}

/// Error when predictions are paired with outcomes at random: every prediction
/// is scored against every subject's observed status.
pub fn no_information_curve(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, bool>,
    survival: ArrayView2<'_, f64>,
    times: &[f64],
    censoring: &SurvivalCurve,
) -> Array1<f64> {
    let n = time.len() as f64;
    Array1::from_shape_fn(times.len(), |k| {
        let (case_sum, control_sum) = (0..time.len())
            .map(|j| ipcw_weights(time[j], event[j], times[k], censoring))
            .fold((0.0, 0.0), |acc, w| (acc.0 + w.0, acc.1 + w.1));
        let column = survival.column(k);
        let squared = column.iter().map(|s| s * s).sum::<f64>();
        let complement = column.iter().map(|s| (1.0 - s) * (1.0 - s)).sum::<f64>();
        (squared * case_sum + complement * control_sum) / (n * n)
    })
}

/// Largest positive evaluation time not exceeding `limit`.
///
/// The time origin alone spans no interval, so a grid with nothing past zero
/// has no cutoff.
pub fn cutoff_time(times: &[f64], limit: f64) -> Option<f64> {
    times.iter().copied().filter(|&t| t > 0.0 && t <= limit).last()
}

/// Right-continuous step integral of `curve` over `[0, cutoff]`, divided by `cutoff`.
///
/// `None` when the cutoff is not positive.
pub fn integrated_brier(times: &[f64], curve: &[f64], cutoff: f64) -> Option<f64> {
    if cutoff.is_nan() || cutoff <= 0.0 {
        return None;
    }
    let mut area = 0.0;
    for (k, (&t, &value)) in times.iter().zip(curve).enumerate() {
        if t >= cutoff {
            break;
        }
        let next = times.get(k + 1).copied().unwrap_or(cutoff).min(cutoff);
        area += value * (next - t);
    }
    Some(area / cutoff)
}
