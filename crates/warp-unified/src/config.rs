//! Configuration for unified containers

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Container and engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifiedConfig {
    /// Capacity multiplier applied when a push or insert finds the container full
    pub growth_factor: usize,

    /// Capacity used when growing from zero
    pub initial_capacity: usize,

    /// Flush device-authoritative data to host when the engine is dropped
    pub flush_on_drop: bool,

    /// Element count from which CPU algorithm kernels run in parallel
    pub parallel_threshold: usize,
}

impl Default for UnifiedConfig {
    fn default() -> Self {
        Self {
            growth_factor: 2,
            initial_capacity: 1,
            flush_on_drop: true,
            parallel_threshold: 4096,
        }
    }
}

impl UnifiedConfig {
    /// Set growth factor
    pub fn with_growth_factor(mut self, factor: usize) -> Self {
        self.growth_factor = factor;
        self
    }

    /// Set initial capacity
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Enable or disable the drop-time flush
    pub fn with_flush_on_drop(mut self, flush: bool) -> Self {
        self.flush_on_drop = flush;
        self
    }

    /// Set parallel threshold
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Parse from TOML, filling missing keys with defaults
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.growth_factor < 2 {
            return Err(Error::InvalidConfig(format!(
                "growth_factor must be >= 2, got {}",
                self.growth_factor
            )));
        }
        if self.initial_capacity == 0 {
            return Err(Error::InvalidConfig(
                "initial_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Capacity to grow to when `current` is full
    pub(crate) fn next_capacity(&self, current: usize) -> usize {
        if current == 0 {
            self.initial_capacity
        } else {
            current.saturating_mul(self.growth_factor)
        }
    }
}
