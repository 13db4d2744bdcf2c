//! Stub heap configuration

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{StubError, StubResult};

/// Configuration for the stub heap and its live-stub registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StubHeapConfig {
    /// Initial capacity of the live-stub registry (default: 64)
    pub initial_registry_capacity: usize,
    /// Filter conservative roots by the registered code bounds (default: true)
    pub range_filter: bool,
    /// Cross-check every registry entry on each pass (default: false)
    pub verify_registry: bool,
    /// Log a summary after each collection pass (default: true)
    pub log_cycles: bool,
}

impl Default for StubHeapConfig {
    fn default() -> Self {
        StubHeapConfig {
            initial_registry_capacity: defaults::DEFAULT_REGISTRY_CAPACITY,
            range_filter: defaults::DEFAULT_RANGE_FILTER,
            verify_registry: defaults::DEFAULT_VERIFY_REGISTRY,
            log_cycles: defaults::DEFAULT_LOG_CYCLES,
        }
    }
}

impl StubHeapConfig {
    /// Parse a configuration from a TOML fragment
    ///
    /// Missing keys fall back to their defaults.
    pub fn from_toml(source: &str) -> StubResult<Self> {
        let config: StubHeapConfig =
            toml::from_str(source).map_err(|e| StubError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that all values are in range
    pub fn validate(&self) -> StubResult<()> {
        if self.initial_registry_capacity > defaults::MAX_REGISTRY_CAPACITY {
            return Err(StubError::InvalidConfig(format!(
                "initial_registry_capacity {} exceeds {}",
                self.initial_registry_capacity,
                defaults::MAX_REGISTRY_CAPACITY
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StubHeapConfig::default();
        assert_eq!(config.initial_registry_capacity, 64);
        assert!(config.range_filter);
        assert!(!config.verify_registry);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = StubHeapConfig::from_toml("verify_registry = true\n").unwrap();
        assert!(config.verify_registry);
        assert!(config.range_filter);
        assert_eq!(config.initial_registry_capacity, 64);
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        let err = StubHeapConfig::from_toml("initial_registry_capacity = 4294967296").unwrap_err();
        assert!(matches!(err, StubError::InvalidConfig(_)));

        let err = StubHeapConfig::from_toml("range_filter = \"yes\"").unwrap_err();
        assert!(matches!(err, StubError::InvalidConfig(_)));
    }
}
