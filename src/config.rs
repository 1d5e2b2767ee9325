//! Batch pipeline configuration.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TubError};

/// Configuration for [`crate::batch::BatchGenerator`]. Missing fields in a
/// JSON file fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Sample rows at random (with replacement) instead of in order.
    pub shuffle: bool,
    /// Share of rows that go to the training sequence on a split.
    pub train_fraction: f64,
    /// Fixed seed for reproducible runs; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            shuffle: true,
            train_fraction: 0.8,
            seed: None,
        }
    }
}

impl BatchConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_slice(&fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TubError::InvalidConfiguration(
                "batch_size must be positive".into(),
            ));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(TubError::InvalidConfiguration(format!(
                "train_fraction must be in (0, 1), got {}",
                self.train_fraction
            )));
        }
        Ok(())
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}
