use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};
use rearrest::config::AnalysisConfig;
use rearrest::data::SubjectTable;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Columns of a simulated cohort, in input-file order.
pub struct Cohort {
    pub release_age: Vec<f64>,
    pub dacc: Vec<f64>,
    pub violent: (Vec<f64>, Vec<bool>),
    pub nonviolent: (Vec<f64>, Vec<bool>),
}

/// Follow-up in whole months, administratively censored by month 44.
/// Low dACC raises the hazard of both outcomes, sharply so for violent crimes.
pub fn simulate_cohort(subjects: usize, seed: u64) -> Cohort {
    let mut rng = StdRng::seed_from_u64(seed);
    let activity = Normal::new(0.0, 1.0).expect("valid normal");
    let mut cohort = Cohort {
        release_age: Vec::with_capacity(subjects),
        dacc: Vec::with_capacity(subjects),
        violent: (Vec::with_capacity(subjects), Vec::with_capacity(subjects)),
        nonviolent: (Vec::with_capacity(subjects), Vec::with_capacity(subjects)),
    };
    for _ in 0..subjects {
        let age: f64 = rng.gen_range(18.0..60.0);
        let dacc = activity.sample(&mut rng);
        let censoring = rng.gen_range(12.0..44.0);
        for (dacc_effect, outcome) in [(-1.2, &mut cohort.violent), (-0.6, &mut cohort.nonviolent)] {
            let rate = 0.04 * (-0.03 * (age - 35.0) + dacc_effect * dacc).exp();
            let failure: f64 = Exp::new(rate).expect("positive rate").sample(&mut rng);
            let observed = failure.min(censoring).ceil().clamp(1.0, 44.0);
            outcome.0.push(observed);
            outcome.1.push(failure <= censoring);
        }
        cohort.release_age.push(age);
        cohort.dacc.push(dacc);
    }
    cohort
}

impl Cohort {
    pub fn table(&self) -> SubjectTable {
        SubjectTable::from_columns(
            self.release_age.clone(),
            self.dacc.clone(),
            None,
            Some(self.violent.clone()),
            Some(self.nonviolent.clone()),
        )
        .expect("simulated cohort is valid")
    }

    /// Writes the cohort with the default column names.
    pub fn write_tsv(&self, path: &Path) {
        let mut text = String::from(
            "release_age\tdacc\ttime_violent\tevent_violent\ttime_nonviolent\tevent_nonviolent\n",
        );
        for i in 0..self.release_age.len() {
            writeln!(
                text,
                "{:.2}\t{:.4}\t{}\t{}\t{}\t{}",
                self.release_age[i],
                self.dacc[i],
                self.violent.0[i],
                u8::from(self.violent.1[i]),
                self.nonviolent.0[i],
                u8::from(self.nonviolent.1[i]),
            )
            .expect("format row");
        }
        fs::write(path, text).expect("write cohort");
    }
}

/// Default configuration shrunk to a handful of repetitions.
pub fn quick_config(dir: &Path) -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    config.resampling.repetitions = 4;
    config.auc.repetitions = 2;
    config.cache_dir = dir.join("cache");
    config.output_dir = dir.join("results");
    config
}
