//! # gridcalc-storage
//!
//! Cell storage for large, mostly empty sheets.
//!
//! - [`SparseMatrix`]: hot cells, row map of column-sorted vectors
//! - [`LazyLoader`]: LRU of loaded cells over a compressed backing store
//! - [`CompressionManager`]: picks the smallest of several codecs per value
//! - [`StorageEngine`]: ties the tiers together behind [`CellStore`]

pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod lazy;
pub mod sparse;

use gridcalc_primitives::{Cell, CellCoordinate, CellRange};

pub use compression::{Codec, CodecUsage, CompressedBlob, CompressionManager, CompressionStats};
pub use config::StorageConfig;
pub use engine::{
    AccessCounters, MemoryUsage, OptimizeReport, Residency, StorageEngine, StorageStats,
};
pub use error::{Result, StorageError};
pub use lazy::{LazyLoader, LoadState, LoaderStats};
pub use sparse::{MatrixStats, RowMemory, SparseMatrix};

/// The sheet interface the evaluator and outer layers read and write through.
///
/// A store only holds cells. When a formula engine shares it, writes made
/// here do not reach the engine's dependency graph until the engine is told
/// about them (`FormulaEngine::notify_cell_changed`).
pub trait CellStore: Send + Sync {
    fn get_cell(&self, coord: CellCoordinate) -> Result<Option<Cell>>;

    fn set_cell(&self, coord: CellCoordinate, cell: Cell) -> Result<()>;

    /// Returns true when a cell was removed.
    fn delete_cell(&self, coord: CellCoordinate) -> bool;

    fn used_range(&self) -> Option<CellRange>;

    /// Stored cells inside `range` in row-major order.
    fn cells_in_range(&self, range: &CellRange) -> Result<Vec<(CellCoordinate, Cell)>>;
}
