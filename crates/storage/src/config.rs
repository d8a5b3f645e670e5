use serde::{Deserialize, Serialize};

/// Storage tuning knobs. Read once when a [`crate::StorageEngine`] is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Capacity of the lazy loader's LRU of loaded cells (default: 100,000).
    pub cell_cache_size: usize,
    /// Hot cells kept in the sparse matrix before eviction (default: 1,000,000).
    pub max_cells_in_memory: usize,
    /// Mirror writes into the lazy loader and evict under pressure (default: true).
    pub lazy_loading_enabled: bool,
    /// Compress evicted cell values (default: true).
    pub compression_enabled: bool,
    /// Codec effort, 0-9 (default: 6).
    pub compression_level: u32,
    /// Compressed output is kept only below this size ratio (default: 0.9).
    pub min_compression_ratio: f64,
    /// Writes between memory-pressure checks (default: 1,000).
    pub pressure_check_interval: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cell_cache_size: 100_000,
            max_cells_in_memory: 1_000_000,
            lazy_loading_enabled: true,
            compression_enabled: true,
            compression_level: 6,
            min_compression_ratio: 0.9,
            pressure_check_interval: 1_000,
        }
    }
}

impl StorageConfig {
    /// Describe the first invalid setting, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.cell_cache_size == 0 {
            return Err("storage.cell_cache_size must be positive".to_string());
        }
        if self.max_cells_in_memory == 0 {
            return Err("storage.max_cells_in_memory must be positive".to_string());
        }
        if self.compression_level > 9 {
            return Err("storage.compression_level must be between 0 and 9".to_string());
        }
        if !(self.min_compression_ratio > 0.0 && self.min_compression_ratio <= 1.0) {
            return Err("storage.min_compression_ratio must be in (0, 1]".to_string());
        }
        if self.pressure_check_interval == 0 {
            return Err("storage.pressure_check_interval must be positive".to_string());
        }
        Ok(())
    }
}
