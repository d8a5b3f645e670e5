//! Engine configuration.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Files are read once, at engine construction.

use std::path::Path;

use gridcalc_storage::StorageConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// When dirty cells are recalculated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationMode {
    /// After every edit.
    #[default]
    Automatic,
    /// Only on an explicit recalculation call.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub parallel_calculation: bool,
    pub max_worker_threads: usize,
    /// Per-cell evaluation time limit in milliseconds.
    pub calculation_timeout_ms: u64,
    /// Capacity of the AST, optimization and result caches.
    pub formula_cache_size: usize,
    /// Largest range a single reference may span.
    pub max_range_cells: u64,
    /// Minimum cells in one dependency level before it is evaluated in parallel.
    pub parallel_threshold: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            parallel_calculation: true,
            max_worker_threads: 4,
            calculation_timeout_ms: 30_000,
            formula_cache_size: 10_000,
            max_range_cells: 100_000,
            parallel_threshold: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub performance: PerformanceConfig,
    pub calculation_mode: CalculationMode,
}

impl EngineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&text),
            "json" => Self::from_json_str(&text),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate().map_err(ConfigError::Invalid)?;
        let perf = &self.performance;
        if perf.max_worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "performance.max_worker_threads must be positive".to_string(),
            ));
        }
        if perf.formula_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "performance.formula_cache_size must be positive".to_string(),
            ));
        }
        if perf.calculation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "performance.calculation_timeout_ms must be positive".to_string(),
            ));
        }
        if perf.max_range_cells == 0 {
            return Err(ConfigError::Invalid(
                "performance.max_range_cells must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.performance.formula_cache_size, 10_000);
        assert_eq!(config.storage.cell_cache_size, 100_000);
        assert_eq!(config.calculation_mode, CalculationMode::Automatic);
    }

    #[test]
    fn test_partial_yaml() {
        let config = EngineConfig::from_yaml_str(
            "calculation_mode: manual\nperformance:\n  max_worker_threads: 2\n",
        )
        .unwrap();
        assert_eq!(config.calculation_mode, CalculationMode::Manual);
        assert_eq!(config.performance.max_worker_threads, 2);
        assert!(config.performance.parallel_calculation);
    }

    #[test]
    fn test_json_and_validation() {
        let config =
            EngineConfig::from_json_str(r#"{"storage": {"compression_level": 3}}"#).unwrap();
        assert_eq!(config.storage.compression_level, 3);

        let err = EngineConfig::from_json_str(r#"{"performance": {"max_worker_threads": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_yaml_str("storage:\n  min_compression_ratio: 1.5\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
