use super::working::{TieMethod, blocks_descending};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Cumulative baseline hazard H0(t) at the centered covariate mean, stepping at event times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineHazard {
    times: Vec<f64>,
    cumulative: Vec<f64>,
}

impl BaselineHazard {
    pub fn estimate(
        time: ArrayView1<'_, f64>,
        event: ArrayView1<'_, bool>,
        eta: ArrayView1<'_, f64>,
        ties: TieMethod,
    ) -> Self {
        let mut increments: Vec<(f64, f64)> = Vec::new();
        let mut risk_sum = 0.0;
        for block in blocks_descending(time) {
            let mut deaths = 0usize;
            let mut death_risk = 0.0;
            for &row in &block.rows {
                let risk = eta[row].exp();
                risk_sum += risk;
                if event[row] {
                    deaths += 1;
                    death_risk += risk;
                }
            }
            if deaths == 0 {
                continue;
            }
            let d = deaths as f64;
            let increment = match ties {
                TieMethod::Breslow => d / risk_sum,
                TieMethod::Efron => (0..deaths)
                    .map(|r| 1.0 / (risk_sum - (r as f64 / d) * death_risk))
                    .sum(),
            };
            increments.push((block.time, increment));
        }
        increments.reverse();

        let mut times = Vec::with_capacity(increments.len());
        let mut cumulative = Vec::with_capacity(increments.len());
        let mut total = 0.0;
        for (t, increment) in increments {
            total += increment;
            times.push(t);
            cumulative.push(total);
        }
        Self { times, cumulative }
    }

    /// Right-continuous H0(t); zero before the first event time.
    pub fn cumulative_at(&self, t: f64) -> f64 {
        let idx = self.times.partition_point(|&s| s <= t);
        if idx == 0 { 0.0 } else { self.cumulative[idx - 1] }
    }

    pub fn event_times(&self) -> &[f64] {
        &self.times
    }
}
