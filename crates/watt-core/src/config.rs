//! Runtime configuration for the balancing core.
//!
//! Four knobs, loaded from a TOML file or defaulted. Everything else
//! the algorithm needs comes from the platform at init time.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Tuning options consumed by the balancing core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalanceConfig {
    /// Measurement-window multiples a sample set must span before it
    /// is declared stable.
    pub stability_factor: f64,
    /// Control loop cadence in seconds. The tick boundary busy-waits
    /// until this interval has elapsed.
    pub wait_interval_sec: f64,
    /// Minimum runtime-ring occupancy before stability can be declared.
    pub min_num_samples: usize,
    /// Fraction of the remaining headroom removed per reduction trial
    /// (α in `limit ← limit − α·(limit − floor)`).
    pub reduction_step_fraction: f64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            stability_factor: 3.0,
            wait_interval_sec: 0.005,
            min_num_samples: 5,
            reduction_step_fraction: 0.25,
        }
    }
}

impl BalanceConfig {
    /// Load from a TOML file. Missing keys fall back to defaults;
    /// unknown keys are rejected.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        let config: BalanceConfig =
            toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the algorithm cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if !(self.stability_factor >= 1.0) {
            return Err(CoreError::Config(format!(
                "stability_factor must be >= 1.0, got {}",
                self.stability_factor
            )));
        }
        if !(self.wait_interval_sec > 0.0) {
            return Err(CoreError::Config(format!(
                "wait_interval_sec must be positive, got {}",
                self.wait_interval_sec
            )));
        }
        if self.min_num_samples == 0 {
            return Err(CoreError::Config(
                "min_num_samples must be at least 1".to_string(),
            ));
        }
        if !(self.reduction_step_fraction > 0.0 && self.reduction_step_fraction < 1.0) {
            return Err(CoreError::Config(format!(
                "reduction_step_fraction must be in (0, 1), got {}",
                self.reduction_step_fraction
            )));
        }
        Ok(())
    }
}
