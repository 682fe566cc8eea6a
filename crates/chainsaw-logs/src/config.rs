//! Pipeline configuration.
//!
//! [`PipelineConfig`] is the TOML file format; [`StoreConfig`] and
//! [`DispatchConfig`] are the validated runtime settings derived from it.

use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Default bounded capacity of a store
pub const DEFAULT_BUFFER_SIZE: usize = 5000;

/// Default dispatch interval
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Shortest dispatch interval honoured by default
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 250;

/// Default routing expression: one destination per host and application
pub const DEFAULT_ROUTING_EXPRESSION: &str = "PROP.hostname - PROP.application";

/// Interval added per responsiveness level
pub const DEFAULT_RESPONSIVENESS_STEP_MS: u64 = 1000;

/// Subtracted from `level * step`
pub const DEFAULT_RESPONSIVENESS_OFFSET_MS: u64 = 750;

/// Default utilisation warnings, as fractions of capacity
pub const DEFAULT_WARNING_THRESHOLDS: [f64; 2] = [0.75, 1.0];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Buffer size must be a positive integer")]
    InvalidCapacity,

    #[error("Warning threshold {0} is outside (0, 1]")]
    InvalidThreshold(f64),

    #[error("Dispatch interval must be positive")]
    InvalidInterval,
}

/// Eviction policy of a store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capacity {
    /// Drop the oldest record once this many are retained
    Bounded(NonZeroUsize),
    /// Retain everything
    Unbounded,
}

impl Capacity {
    /// Bounded capacity, or `None` for zero
    pub fn bounded(size: usize) -> Option<Self> {
        NonZeroUsize::new(size).map(Self::Bounded)
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Bounded(size) => Some(size.get()),
            Self::Unbounded => None,
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, Self::Bounded(_))
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self::bounded(DEFAULT_BUFFER_SIZE).unwrap_or(Self::Unbounded)
    }
}

/// Identity sequence for records that arrive without one.
///
/// Clones share one sequence, so every store built from clones of the same
/// [`StoreConfig`] hands out distinct identities.
#[derive(Clone, Debug, Default)]
pub struct IdentityCounter(Arc<AtomicU64>);

impl IdentityCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identity, starting at 1
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether another handle draws from the same sequence
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }

    /// Restart the sequence unless it is shared. Returns whether it restarted.
    pub fn restart_if_exclusive(&self) -> bool {
        if self.is_shared() {
            return false;
        }
        self.0.store(0, Ordering::Relaxed);
        true
    }
}

impl PartialEq for IdentityCounter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Runtime settings of one store
#[derive(Clone, Debug, PartialEq)]
pub struct StoreConfig {
    pub capacity: Capacity,
    /// Fractions of capacity that trigger a warning, ascending
    pub warning_thresholds: Vec<f64>,
    /// Shared by every store created from a clone of this config
    pub identities: IdentityCounter,
}

impl StoreConfig {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn with_warning_thresholds(mut self, thresholds: Vec<f64>) -> Self {
        self.warning_thresholds = thresholds;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: Capacity::default(),
            warning_thresholds: DEFAULT_WARNING_THRESHOLDS.to_vec(),
            identities: IdentityCounter::new(),
        }
    }
}

/// Runtime settings of a dispatch queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Pause between dispatch cycles
    pub interval: Duration,
    /// Floor applied to `interval`
    pub min_interval: Duration,
    /// Field expression naming each record's destination. Delivery pauses
    /// while this is `None`.
    pub routing_expression: Option<String>,
    /// Mapping between responsiveness levels and intervals
    pub responsiveness: ResponsivenessScale,
}

impl DispatchConfig {
    /// Interval after applying the floor
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(self.min_interval)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_routing_expression(mut self, expression: impl Into<String>) -> Self {
        self.routing_expression = Some(expression.into());
        self
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            min_interval: Duration::from_millis(DEFAULT_MIN_INTERVAL_MS),
            routing_expression: Some(DEFAULT_ROUTING_EXPRESSION.to_string()),
            responsiveness: ResponsivenessScale::default(),
        }
    }
}

/// Maps a coarse responsiveness setting (1 = most responsive) to a dispatch
/// interval: `level * step - offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponsivenessScale {
    pub step: Duration,
    pub offset: Duration,
}

impl ResponsivenessScale {
    pub fn interval_for(&self, level: u32) -> Duration {
        (self.step * level).saturating_sub(self.offset)
    }

    /// Inverse of [`interval_for`](Self::interval_for), rounding down
    pub fn level_for(&self, interval: Duration) -> u32 {
        if self.step.as_millis() == 0 {
            return 0;
        }
        ((interval + self.offset).as_millis() / self.step.as_millis()) as u32
    }
}

impl Default for ResponsivenessScale {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(DEFAULT_RESPONSIVENESS_STEP_MS),
            offset: Duration::from_millis(DEFAULT_RESPONSIVENESS_OFFSET_MS),
        }
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// Top-level configuration file
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dispatch: DispatchSection,
    pub store: StoreSection,
}

/// `[dispatch]` section
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub interval_ms: u64,
    pub min_interval_ms: u64,
    pub routing_expression: Option<String>,
    /// When set, overrides `interval_ms` through the responsiveness scale
    pub responsiveness: Option<u32>,
    pub responsiveness_step_ms: u64,
    pub responsiveness_offset_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            routing_expression: Some(DEFAULT_ROUTING_EXPRESSION.to_string()),
            responsiveness: None,
            responsiveness_step_ms: DEFAULT_RESPONSIVENESS_STEP_MS,
            responsiveness_offset_ms: DEFAULT_RESPONSIVENESS_OFFSET_MS,
        }
    }
}

/// `[store]` section
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub cyclic: bool,
    pub buffer_size: usize,
    pub warning_thresholds: Vec<f64>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            cyclic: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            warning_thresholds: DEFAULT_WARNING_THRESHOLDS.to_vec(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.store_config()?;
        config.dispatch_config()?;
        Ok(config)
    }

    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        let capacity = if self.store.cyclic {
            Capacity::bounded(self.store.buffer_size).ok_or(ConfigError::InvalidCapacity)?
        } else {
            Capacity::Unbounded
        };

        let mut thresholds = self.store.warning_thresholds.clone();
        if let Some(bad) = thresholds.iter().find(|t| !(**t > 0.0 && **t <= 1.0)) {
            return Err(ConfigError::InvalidThreshold(*bad));
        }
        thresholds.sort_by(f64::total_cmp);
        thresholds.dedup();

        Ok(StoreConfig {
            capacity,
            warning_thresholds: thresholds,
            identities: IdentityCounter::new(),
        })
    }

    pub fn dispatch_config(&self) -> Result<DispatchConfig, ConfigError> {
        let responsiveness = ResponsivenessScale {
            step: Duration::from_millis(self.dispatch.responsiveness_step_ms),
            offset: Duration::from_millis(self.dispatch.responsiveness_offset_ms),
        };
        let interval = match self.dispatch.responsiveness {
            Some(level) => responsiveness.interval_for(level),
            None => Duration::from_millis(self.dispatch.interval_ms),
        };
        if interval.is_zero() {
            return Err(ConfigError::InvalidInterval);
        }
        Ok(DispatchConfig {
            interval,
            min_interval: Duration::from_millis(self.dispatch.min_interval_ms),
            responsiveness,
            routing_expression: self
                .dispatch
                .routing_expression
                .clone()
                .filter(|expr| !expr.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        let store = config.store_config().unwrap();
        assert_eq!(store.capacity.limit(), Some(DEFAULT_BUFFER_SIZE));
        assert_eq!(store.warning_thresholds, vec![0.75, 1.0]);

        let dispatch = config.dispatch_config().unwrap();
        assert_eq!(dispatch.effective_interval(), Duration::from_millis(1000));
        assert_eq!(
            dispatch.routing_expression.as_deref(),
            Some(DEFAULT_ROUTING_EXPRESSION)
        );
    }

    #[test]
    fn test_sections() {
        let text = r#"
[dispatch]
interval_ms = 100
routing_expression = "LOGGER"

[store]
cyclic = false
warning_thresholds = [1.0, 0.5]
"#;
        let config = PipelineConfig::from_toml(text).unwrap();
        let store = config.store_config().unwrap();
        assert_eq!(store.capacity, Capacity::Unbounded);
        assert_eq!(store.warning_thresholds, vec![0.5, 1.0]);

        // The floor still applies
        let dispatch = config.dispatch_config().unwrap();
        assert_eq!(dispatch.effective_interval(), Duration::from_millis(250));
        assert_eq!(dispatch.routing_expression.as_deref(), Some("LOGGER"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            PipelineConfig::from_toml("[store]\nbuffer_size = 0"),
            Err(ConfigError::InvalidCapacity)
        ));
        assert!(matches!(
            PipelineConfig::from_toml("[store]\nwarning_thresholds = [1.5]"),
            Err(ConfigError::InvalidThreshold(_))
        ));
        assert!(matches!(
            PipelineConfig::from_toml("[dispatch]\ninterval_ms = 0"),
            Err(ConfigError::InvalidInterval)
        ));
        assert!(matches!(
            PipelineConfig::from_toml("[store\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_blank_routing_expression_pauses_delivery() {
        let config = PipelineConfig::from_toml("[dispatch]\nrouting_expression = \"  \"").unwrap();
        assert_eq!(config.dispatch_config().unwrap().routing_expression, None);
    }

    #[test]
    fn test_responsiveness_scale() {
        let scale = ResponsivenessScale::default();
        assert_eq!(scale.interval_for(1), Duration::from_millis(250));
        assert_eq!(scale.interval_for(3), Duration::from_millis(2250));
        assert_eq!(scale.level_for(Duration::from_millis(2250)), 3);
    }

    #[test]
    fn test_sub_millisecond_step_does_not_divide_by_zero() {
        let scale = ResponsivenessScale {
            step: Duration::from_micros(500),
            offset: Duration::ZERO,
        };
        assert_eq!(scale.level_for(Duration::from_millis(10)), 0);
    }

    #[test]
    fn test_responsiveness_overrides_interval() {
        let text = "[dispatch]\ninterval_ms = 100\nresponsiveness = 2";
        let dispatch = PipelineConfig::from_toml(text).unwrap().dispatch_config().unwrap();
        assert_eq!(dispatch.interval, Duration::from_millis(1250));

        // Level 0 maps to a zero interval
        assert!(matches!(
            PipelineConfig::from_toml("[dispatch]\nresponsiveness = 0"),
            Err(ConfigError::InvalidInterval)
        ));
    }

    #[test]
    fn test_identity_counter_shared_by_clones() {
        let config = StoreConfig::default();
        let other = config.clone();
        assert_eq!(config.identities.next(), 1);
        assert_eq!(other.identities.next(), 2);
        assert!(!config.identities.restart_if_exclusive());

        drop(other);
        assert!(config.identities.restart_if_exclusive());
        assert_eq!(config.identities.next(), 1);
        assert_ne!(config.identities, StoreConfig::default().identities);
    }
}
