use std::fmt;

/// Resampling stages reported while estimating prediction error and discrimination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResamplingStage {
    CrossValidatedBrier,
    BootstrapBrier,
    CrossValidatedAuc,
}

impl ResamplingStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::CrossValidatedBrier => "cross-validated Brier score",
            Self::BootstrapBrier => ".632+ bootstrap Brier score",
            Self::CrossValidatedAuc => "cross-validated time-dependent AUC",
        }
    }
}

impl fmt::Display for ResamplingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for per-repetition progress. Repetitions finish on worker threads,
/// so implementations take `&self` and must be shareable.
pub trait ResamplingProgress: Sync {
    fn on_stage_start(&self, stage: ResamplingStage, total_repetitions: usize) {
        let _ = (stage, total_repetitions);
    }
    fn on_repetition_finish(&self, stage: ResamplingStage) {
        let _ = stage;
    }
    fn on_stage_finish(&self, stage: ResamplingStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopResamplingProgress;

impl ResamplingProgress for NoopResamplingProgress {}
