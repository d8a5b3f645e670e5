//! Storage error types.

use gridcalc_primitives::CellCoordinate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt {codec} data: {reason}")]
    Corrupt { codec: &'static str, reason: String },

    #[error("Stored cell {coordinate} could not be restored: {reason}")]
    CellRestore {
        coordinate: CellCoordinate,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;
