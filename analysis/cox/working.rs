use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Approximation of the partial likelihood when several subjects fail at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieMethod {
    #[default]
    Efron,
    Breslow,
}

/// Log partial likelihood with its gradient and observed information at one iterate.
#[derive(Debug, Clone)]
pub struct WorkingState {
    pub log_likelihood: f64,
    pub gradient: Array1<f64>,
    pub information: Array2<f64>,
}

pub trait WorkingModel {
    fn update(&mut self, beta: &Array1<f64>) -> WorkingState;
}

/// Subjects sharing one observed time, listed by row index.
#[derive(Debug, Clone)]
pub(crate) struct TimeBlock {
    pub time: f64,
    pub rows: Vec<usize>,
}

/// Groups rows by observed time, latest time first.
pub(crate) fn blocks_descending(time: ArrayView1<'_, f64>) -> Vec<TimeBlock> {
    let mut order: Vec<usize> = (0..time.len()).collect();
    order.sort_by(|&a, &b| time[b].total_cmp(&time[a]));
    let mut blocks: Vec<TimeBlock> = Vec::new();
    for idx in order {
        match blocks.last_mut() {
            Some(block) if block.time == time[idx] => block.rows.push(idx),
            _ => blocks.push(TimeBlock {
                time: time[idx],
                rows: vec![idx],
            }),
        }
    }
    blocks
}

/// Cox partial likelihood over a centered design matrix.
pub struct PartialLikelihood {
    design: Array2<f64>,
    event: Array1<bool>,
    blocks: Vec<TimeBlock>,
    ties: TieMethod,
}

impl PartialLikelihood {
    pub fn new(
        design: Array2<f64>,
        time: ArrayView1<'_, f64>,
        event: ArrayView1<'_, bool>,
        ties: TieMethod,
    ) -> Self {
        Self {
            blocks: blocks_descending(time),
            design,
            event: event.to_owned(),
            ties,
        }
    }
}

fn add_outer(target: &mut Array2<f64>, x: ArrayView1<'_, f64>, scale: f64) {
    let p = x.len();
    for a in 0..p {
        for b in 0..p {
            target[[a, b]] += scale * x[a] * x[b];
        }
    }
}

impl WorkingModel for PartialLikelihood {
    fn update(&mut self, beta: &Array1<f64>) -> WorkingState {
        let p = beta.len();
        let eta = self.design.dot(beta);

        let mut log_likelihood = 0.0;
        let mut gradient = Array1::<f64>::zeros(p);
        let mut information = Array2::<f64>::zeros((p, p));

        // Risk-set sums grow as the sweep moves backwards in time.
        let mut s0 = 0.0;
        let mut s1 = Array1::<f64>::zeros(p);
        let mut s2 = Array2::<f64>::zeros((p, p));

        for block in &self.blocks {
            let mut deaths = 0usize;
            let mut d0 = 0.0;
            let mut d1 = Array1::<f64>::zeros(p);
            let mut d2 = Array2::<f64>::zeros((p, p));

            for &row in &block.rows {
                let x = self.design.row(row);
                let risk = eta[row].exp();
                s0 += risk;
                s1.scaled_add(risk, &x);
                add_outer(&mut s2, x, risk);
                if self.event[row] {
                    deaths += 1;
                    d0 += risk;
                    d1.scaled_add(risk, &x);
                    add_outer(&mut d2, x, risk);
                    log_likelihood += eta[row];
                    gradient += &x;
                }
            }
            if deaths == 0 {
                continue;
            }

            let d = deaths as f64;
            let fractions: Vec<f64> = match self.ties {
                TieMethod::Breslow => vec![0.0; deaths],
                TieMethod::Efron => (0..deaths).map(|r| r as f64 / d).collect(),
            };
            for fraction in fractions {
                let a0 = s0 - fraction * d0;
                let a1 = &s1 - &(&d1 * fraction);
                let a2 = &s2 - &(&d2 * fraction);
                log_likelihood -= a0.ln();
                gradient.scaled_add(-1.0 / a0, &a1);
                information.scaled_add(1.0 / a0, &a2);
                add_outer(&mut information, a1.view(), -1.0 / (a0 * a0));
            }
        }

        WorkingState {
            log_likelihood,
            gradient,
            information,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    #[test]
    fn blocks_group_equal_times_latest_first() {
        let time = array![2.0, 5.0, 2.0, 1.0];
        let blocks = blocks_descending(time.view());
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].time, 5.0);
        assert_eq!(blocks[1].rows, vec![0, 2]);
    }

    #[test]
    fn null_log_likelihood_without_ties() {
        // At beta = 0 the log partial likelihood is -sum ln(n_risk) over events.
        let time = array![1.0, 2.0, 3.0, 4.0];
        let event = array![true, false, true, true];
        let design = Array2::from_shape_vec((4, 1), vec![0.5, -0.5, 1.0, -1.0]).expect("shape");
        let mut model = PartialLikelihood::new(design, time.view(), event.view(), TieMethod::Efron);
        let state = model.update(&array![0.0]);
        let expected = -(4.0_f64.ln() + 2.0_f64.ln() + 1.0_f64.ln());
        assert_abs_diff_eq!(state.log_likelihood, expected, epsilon = 1e-12);
    }

    #[test]
    fn efron_shrinks_tied_risk_sets() {
        let time = array![1.0, 1.0, 2.0, 3.0];
        let event = array![true, true, true, false];
        let design = Array2::from_shape_vec((4, 1), vec![0.2, -0.3, 0.4, -0.3]).expect("shape");
        let beta = array![0.7];

        let mut efron =
            PartialLikelihood::new(design.clone(), time.view(), event.view(), TieMethod::Efron);
        let mut breslow =
            PartialLikelihood::new(design, time.view(), event.view(), TieMethod::Breslow);
        let e = efron.update(&beta);
        let b = breslow.update(&beta);
        assert!(e.log_likelihood > b.log_likelihood);

        // Null model with a tied pair of deaths among 4: Efron gives -ln 4 - ln 3 - ln 2.
        let e0 = efron.update(&array![0.0]);
        assert_abs_diff_eq!(
            e0.log_likelihood,
            -(4.0_f64.ln() + 3.0_f64.ln() + 2.0_f64.ln()),
            epsilon = 1e-12
        );
        let b0 = breslow.update(&array![0.0]);
        assert_abs_diff_eq!(
            b0.log_likelihood,
            -(2.0 * 4.0_f64.ln() + 2.0_f64.ln()),
            epsilon = 1e-12
        );
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let time = array![3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        let event = array![true, true, false, true, true, false, true, true];
        let design = Array2::from_shape_vec(
            (8, 2),
            vec![
                0.1, 1.0, -0.4, 0.3, 0.8, -1.2, 0.0, 0.5, -0.9, -0.1, 1.1, 0.7, 0.3, -0.6, -1.0,
                0.2,
            ],
        )
        .expect("shape");
        let mut model = PartialLikelihood::new(design, time.view(), event.view(), TieMethod::Efron);
        let beta = array![0.3, -0.2];
        let state = model.update(&beta);
        let h = 1e-6;
        for k in 0..2 {
            let mut up = beta.clone();
            up[k] += h;
            let mut down = beta.clone();
            down[k] -= h;
            let numeric =
                (model.update(&up).log_likelihood - model.update(&down).log_likelihood) / (2.0 * h);
            assert_abs_diff_eq!(state.gradient[k], numeric, epsilon = 1e-6);

            let grad_up = model.update(&up).gradient;
            let grad_down = model.update(&down).gradient;
            for j in 0..2 {
                let numeric_info = -(grad_up[j] - grad_down[j]) / (2.0 * h);
                assert_abs_diff_eq!(state.information[[j, k]], numeric_info, epsilon = 1e-5);
            }
        }
    }
}
