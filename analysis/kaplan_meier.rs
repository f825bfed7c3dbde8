use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SurvivalCurveError {
    #[error("survival curve requested for an empty sample")]
    Empty,
    #[error("time has {time} entries but event has {event}")]
    LengthMismatch { time: usize, event: usize },
    #[error("time {0} is not a finite non-negative number")]
    InvalidTime(f64),
    #[error("log-rank test needs exactly two groups, found {0}")]
    GroupCount(usize),
    #[error("log-rank variance is zero; no events occur while both groups are at risk")]
    DegenerateVariance,
}

/// One distinct observed time of a Kaplan-Meier curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurvivalStep {
    pub time: f64,
    pub n_risk: usize,
    pub n_event: usize,
    pub n_censor: usize,
    pub survival: f64,
    /// Greenwood standard error of `survival`.
    pub std_err: f64,
}

/// Right-continuous, non-increasing step function starting at S(0) = 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurvivalCurve {
    steps: Vec<SurvivalStep>,
}

impl SurvivalCurve {
    pub fn steps(&self) -> &[SurvivalStep] {
        &self.steps
    }

    /// S(t): survival including any drop at exactly `t`.
    pub fn survival_at(&self, t: f64) -> f64 {
        let idx = self.steps.partition_point(|step| step.time <= t);
        if idx == 0 {
            1.0
        } else {
            self.steps[idx - 1].survival
        }
    }

    /// S(t-): survival just before `t`.
    pub fn survival_before(&self, t: f64) -> f64 {
        let idx = self.steps.partition_point(|step| step.time < t);
        if idx == 0 {
            1.0
        } else {
            self.steps[idx - 1].survival
        }
    }

    /// `(time, survival)` pairs beginning at `(0, 1)`, one per distinct observed time.
    pub fn points(&self) -> Vec<(f64, f64)> {
        let mut points = Vec::with_capacity(self.steps.len() + 1);
        points.push((0.0, 1.0));
        points.extend(self.steps.iter().map(|step| (step.time, step.survival)));
        points
    }

    /// First time at which survival drops to one half or below.
    pub fn median_survival(&self) -> Option<f64> {
        self.steps
            .iter()
            .find(|step| step.survival <= 0.5)
            .map(|step| step.time)
    }

    pub fn final_survival(&self) -> f64 {
        self.steps.last().map_or(1.0, |step| step.survival)
    }
}

fn validate(time: ArrayView1<'_, f64>, event: ArrayView1<'_, bool>) -> Result<(), SurvivalCurveError> {
    if time.len() != event.len() {
        return Err(SurvivalCurveError::LengthMismatch {
            time: time.len(),
            event: event.len(),
        });
    }
    if time.is_empty() {
        return Err(SurvivalCurveError::Empty);
    }
    if let Some(&bad) = time.iter().find(|t| !t.is_finite() || **t < 0.0) {
        return Err(SurvivalCurveError::InvalidTime(bad));
    }
    Ok(())
}

fn sorted_order(time: ArrayView1<'_, f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..time.len()).collect();
    order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));
    order
}

/// Product-limit estimate of the survival function.
pub fn kaplan_meier(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, bool>,
) -> Result<SurvivalCurve, SurvivalCurveError> {
    validate(time, event)?;
    let order = sorted_order(time);
    let n = order.len();

    let mut steps = Vec::new();
    let mut at_risk = n;
    let mut survival = 1.0_f64;
    let mut greenwood = 0.0_f64;
    let mut i = 0;
    while i < n {
        let t = time[order[i]];
        let mut deaths = 0usize;
        let mut censored = 0usize;
        let mut j = i;
        while j < n && time[order[j]] == t {
            if event[order[j]] {
                deaths += 1;
            } else {
                censored += 1;
            }
            j += 1;
        }

        if deaths > 0 {
            let n_t = at_risk as f64;
            let d_t = deaths as f64;
            survival *= 1.0 - d_t / n_t;
            if at_risk > deaths {
                greenwood += d_t / (n_t * (n_t - d_t));
            }
        }
        let std_err = if survival > 0.0 {
            survival * greenwood.sqrt()
        } else {
            0.0
        };
        steps.push(SurvivalStep {
            time: t,
            n_risk: at_risk,
            n_event: deaths,
            n_censor: censored,
            survival,
            std_err,
        });

        at_risk -= deaths + censored;
        i = j;
    }

    Ok(SurvivalCurve { steps })
}

/// Reverse Kaplan-Meier: the survival function of the censoring time, G(t) = P(C > t).
pub fn censoring_distribution(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, bool>,
) -> Result<SurvivalCurve, SurvivalCurveError> {
    let censored = event.mapv(|e| !e);
    kaplan_meier(time, censored.view())
}

/// One Kaplan-Meier curve per distinct group label.
pub fn kaplan_meier_by_group(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, bool>,
    groups: ArrayView1<'_, u8>,
) -> Result<BTreeMap<u8, SurvivalCurve>, SurvivalCurveError> {
    validate(time, event)?;
    if groups.len() != time.len() {
        return Err(SurvivalCurveError::LengthMismatch {
            time: time.len(),
            event: groups.len(),
        });
    }
    let mut members: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    for (idx, &g) in groups.iter().enumerate() {
        members.entry(g).or_default().push(idx);
    }
    let mut curves = BTreeMap::new();
    for (group, indices) in members {
        let group_time: ndarray::Array1<f64> = indices.iter().map(|&i| time[i]).collect();
        let group_event: ndarray::Array1<bool> = indices.iter().map(|&i| event[i]).collect();
        curves.insert(group, kaplan_meier(group_time.view(), group_event.view())?);
    }
    Ok(curves)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRankTest {
    /// Group labels in ascending order.
    pub groups: [u8; 2],
    pub observed: [f64; 2],
    pub expected: [f64; 2],
    pub statistic: f64,
    pub p_value: f64,
}

/// Two-sample log-rank test with one degree of freedom.
pub fn log_rank_test(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, bool>,
    groups: ArrayView1<'_, u8>,
) -> Result<LogRankTest, SurvivalCurveError> {
    validate(time, event)?;
    let mut labels: Vec<u8> = groups.to_vec();
    labels.sort_unstable();
    labels.dedup();
    if labels.len() != 2 {
        return Err(SurvivalCurveError::GroupCount(labels.len()));
    }
    let second = labels[1];

    let order = sorted_order(time);
    let n = order.len();
    let mut at_risk = n as f64;
    let mut at_risk_second = groups.iter().filter(|&&g| g == second).count() as f64;
    let mut observed_second = 0.0;
    let mut expected_second = 0.0;
    let mut total_events = 0.0;
    let mut variance = 0.0;

    let mut i = 0;
    while i < n {
        let t = time[order[i]];
        let mut deaths = 0.0;
        let mut deaths_second = 0.0;
        let mut leaving = 0.0;
        let mut leaving_second = 0.0;
        let mut j = i;
        while j < n && time[order[j]] == t {
            let idx = order[j];
            let in_second = groups[idx] == second;
            if event[idx] {
                deaths += 1.0;
                if in_second {
                    deaths_second += 1.0;
                }
            }
            leaving += 1.0;
            if in_second {
                leaving_second += 1.0;
            }
            j += 1;
        }

        if deaths > 0.0 {
            let share = at_risk_second / at_risk;
            observed_second += deaths_second;
            expected_second += deaths * share;
            total_events += deaths;
            if at_risk > 1.0 {
                variance += deaths * share * (1.0 - share) * (at_risk - deaths) / (at_risk - 1.0);
            }
        }

        at_risk -= leaving;
        at_risk_second -= leaving_second;
        i = j;
    }

    if variance <= 0.0 {
        return Err(SurvivalCurveError::DegenerateVariance);
    }
    let statistic = (observed_second - expected_second).powi(2) / variance;
    let p_value = ChiSquared::new(1.0)
        .map(|dist| dist.sf(statistic))
        .unwrap_or(f64::NAN);

    Ok(LogRankTest {
        groups: [labels[0], second],
        observed: [total_events - observed_second, observed_second],
        expected: [total_events - expected_second, expected_second],
        statistic,
        p_value,
    })
}
