use std::path::PathBuf;

use gridcalc_dag::DagError;
use gridcalc_primitives::AddressError;
use gridcalc_storage::StorageError;

/// Structural failures surfaced to callers of the formula layer.
///
/// Evaluation problems (`#DIV/0!`, `#VALUE!`, ...) are values, not errors.
#[derive(Debug, thiserror::Error)]
pub enum FormulaError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error(transparent)]
    Dependency(#[from] DagError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl FormulaError {
    pub fn is_circular(&self) -> bool {
        matches!(
            self,
            FormulaError::Dependency(DagError::CircularDependency { .. })
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
