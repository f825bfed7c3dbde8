use crate::data::OutcomeKind;
use crate::prediction_error::ResamplingScheme;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to read or write cached result: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse cached result: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize result for caching: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("missing cached artifact '{}' and recomputation is disabled", .0.display())]
    Missing(PathBuf),
    #[error(
        "cached artifact '{}' was computed with different settings and recomputation is disabled",
        .0.display()
    )]
    Stale(PathBuf),
}

/// How stored results are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Load when present, otherwise compute and store.
    #[default]
    Use,
    /// Always compute and overwrite.
    Refresh,
    /// Load or fail; never compute.
    Require,
}

/// Which resampled estimate an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CachedEstimate {
    PredictionError(ResamplingScheme),
    Discrimination,
}

impl CachedEstimate {
    pub fn label(self) -> &'static str {
        match self {
            Self::PredictionError(scheme) => scheme.label(),
            Self::Discrimination => "auc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub outcome: OutcomeKind,
    pub estimate: CachedEstimate,
    pub repetitions: usize,
    pub seed: u64,
}

impl CacheKey {
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_seed{}.toml",
            self.outcome.label(),
            self.estimate.label(),
            self.repetitions,
            self.seed
        )
    }
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    mode: CacheMode,
}

impl ResultCache {
    pub fn new(dir: impl Into<PathBuf>, mode: CacheMode) -> Self {
        Self {
            dir: dir.into(),
            mode,
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn load<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(toml::from_str(&text)?))
    }

    /// Writes atomically: the artifact is staged next to its final path and renamed.
    pub fn store<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<PathBuf, CacheError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(key);
        let staging = path.with_extension("toml.partial");
        let text = toml::to_string_pretty(value)?;
        {
            let mut writer = BufWriter::new(fs::File::create(&staging)?);
            writer.write_all(text.as_bytes())?;
            writer.flush()?;
        }
        fs::rename(&staging, &path)?;
        Ok(path)
    }

    /// Returns the stored value for `key` when `is_current` accepts it, otherwise
    /// computes and stores a fresh one as the mode allows.
    pub fn get_or_compute<T, E, A, F>(
        &self,
        key: &CacheKey,
        is_current: A,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        A: FnOnce(&T) -> bool,
        F: FnOnce() -> Result<T, E>,
    {
        if self.mode != CacheMode::Refresh {
            if let Some(value) = self.load(key)? {
                let path = self.path(key);
                if is_current(&value) {
                    log::info!("Loaded cached result from {}", path.display());
                    return Ok(value);
                }
                if self.mode == CacheMode::Require {
                    return Err(CacheError::Stale(path).into());
                }
                log::warn!(
                    "Cached result at {} was computed with different settings; recomputing",
                    path.display()
                );
            }
        }
        if self.mode == CacheMode::Require {
            return Err(CacheError::Missing(self.path(key)).into());
        }
        let value = compute()?;
        let path = self.store(key, &value)?;
        log::info!("Cached result at {}", path.display());
        Ok(value)
    }
}
