//! Tiered storage engine.
//!
//! Hot cells live in the [`SparseMatrix`]. Every write is mirrored into the
//! [`LazyLoader`] backing store, and a memory-pressure check every
//! `pressure_check_interval` writes moves the least recently used hot cells
//! into the loader's LRU, from where they age into compressed form. Reads
//! that miss the matrix are served by the loader and promoted back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use gridcalc_primitives::{Cell, CellCoordinate, CellRange};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::compression::CompressionStats;
use crate::error::Result;
use crate::lazy::{LazyLoader, LoadState, LoaderStats};
use crate::sparse::{MatrixStats, SparseMatrix};
use crate::{CellStore, CompressionManager, StorageConfig};

/// Which tier holds a coordinate's live cell. Exactly one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Residency {
    /// In the sparse matrix.
    Hot,
    /// Loaded in the lazy loader's LRU.
    Cached,
    /// Serialized and compressed in the backing store.
    Evicted,
    Absent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccessCounters {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub hot_hits: u64,
    pub promotions: u64,
    pub misses: u64,
    pub pressure_checks: u64,
    pub pressure_evictions: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub hot_cells: usize,
    pub hot_bytes: usize,
    pub cached_cells: usize,
    pub cached_bytes: usize,
    pub stored_cells: usize,
    pub stored_bytes: usize,
}

impl MemoryUsage {
    pub fn total_bytes(&self) -> usize {
        self.hot_bytes + self.cached_bytes + self.stored_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageStats {
    pub cell_count: usize,
    pub access: AccessCounters,
    pub memory: MemoryUsage,
    pub matrix: MatrixStats,
    pub loader: LoaderStats,
    pub compression: CompressionStats,
}

/// Outcome of [`StorageEngine::optimize_memory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OptimizeReport {
    pub hot_evicted: usize,
    pub cache_evicted: usize,
}

#[derive(Debug)]
struct StorageInner {
    matrix: SparseMatrix,
    lazy: LazyLoader,
    // Recency of hot cells; keys mirror the matrix exactly.
    recency: LruCache<CellCoordinate, ()>,
    writes_since_check: u64,
    counters: AccessCounters,
}

impl StorageInner {
    fn insert_hot(&mut self, coord: CellCoordinate, cell: Cell) {
        self.matrix.insert(coord, cell);
        self.recency.put(coord, ());
    }

    fn remove_hot(&mut self, coord: &CellCoordinate) -> Option<Cell> {
        self.recency.pop(coord);
        self.matrix.remove(coord)
    }

    /// Move least recently used hot cells into the loader until `limit` remain.
    fn shrink_hot(&mut self, limit: usize) -> Result<usize> {
        let mut evicted = 0;
        while self.matrix.len() > limit {
            let Some((coord, ())) = self.recency.pop_lru() else {
                break;
            };
            if let Some(cell) = self.matrix.remove(&coord) {
                self.lazy.put(coord, cell)?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

#[derive(Debug)]
pub struct StorageEngine {
    config: StorageConfig,
    compression: Arc<CompressionManager>,
    inner: Mutex<StorageInner>,
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new(StorageConfig::default())
    }
}

impl StorageEngine {
    pub fn new(config: StorageConfig) -> Self {
        let compression = Arc::new(CompressionManager::from_config(&config));
        Self::with_compression(config, compression)
    }

    /// Build an engine sharing an existing compression manager.
    pub fn with_compression(config: StorageConfig, compression: Arc<CompressionManager>) -> Self {
        let lazy = LazyLoader::new(config.cell_cache_size, Arc::clone(&compression));
        Self {
            inner: Mutex::new(StorageInner {
                matrix: SparseMatrix::new(),
                lazy,
                recency: LruCache::unbounded(),
                writes_since_check: 0,
                counters: AccessCounters::default(),
            }),
            config,
            compression,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn compression(&self) -> &Arc<CompressionManager> {
        &self.compression
    }

    /// Read a cell, promoting it into the hot tier when found elsewhere.
    pub fn get_cell(&self, coord: CellCoordinate) -> Result<Option<Cell>> {
        let mut inner = self.inner.lock();
        inner.counters.reads += 1;

        if let Some(cell) = inner.matrix.get(&coord).cloned() {
            inner.recency.promote(&coord);
            inner.counters.hot_hits += 1;
            return Ok(Some(cell));
        }
        if !self.config.lazy_loading_enabled {
            inner.counters.misses += 1;
            return Ok(None);
        }

        match inner.lazy.take(&coord)? {
            Some(cell) => {
                inner.counters.promotions += 1;
                inner.insert_hot(coord, cell.clone());
                Ok(Some(cell))
            }
            None => {
                inner.counters.misses += 1;
                Ok(None)
            }
        }
    }

    pub fn set_cell(&self, coord: CellCoordinate, cell: Cell) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.config.lazy_loading_enabled {
            inner.lazy.store(coord, &cell)?;
        }
        inner.insert_hot(coord, cell);
        inner.counters.writes += 1;
        self.after_write(&mut inner)
    }

    /// Mutate a cell in place (loading it first if needed). Returns the
    /// updated cell, or `None` when the coordinate holds nothing.
    pub fn update_cell<F>(&self, coord: CellCoordinate, update: F) -> Result<Option<Cell>>
    where
        F: FnOnce(&mut Cell),
    {
        let Some(mut cell) = self.get_cell(coord)? else {
            return Ok(None);
        };
        update(&mut cell);
        self.set_cell(coord, cell.clone())?;
        Ok(Some(cell))
    }

    /// Remove a cell from every tier.
    pub fn delete_cell(&self, coord: CellCoordinate) -> bool {
        let mut inner = self.inner.lock();
        let hot = inner.remove_hot(&coord).is_some();
        let lazy = inner.lazy.remove(&coord);
        if hot || lazy {
            inner.counters.deletes += 1;
        }
        hot || lazy
    }

    pub fn residency(&self, coord: CellCoordinate) -> Residency {
        let inner = self.inner.lock();
        if inner.matrix.contains(&coord) {
            return Residency::Hot;
        }
        match inner.lazy.state(&coord) {
            Some(LoadState::Loaded) => Residency::Cached,
            Some(LoadState::Evicted) => Residency::Evicted,
            None => Residency::Absent,
        }
    }

    /// Number of distinct coordinates holding a cell.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        // Writes are mirrored, so with lazy loading on the loader holds
        // every hot coordinate too.
        if self.config.lazy_loading_enabled {
            inner.lazy.len()
        } else {
            inner.matrix.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bounding box of every stored cell, whichever tier holds it.
    pub fn used_range(&self) -> Option<CellRange> {
        let inner = self.inner.lock();
        match (inner.matrix.used_range(), inner.lazy.bounds()) {
            (Some(hot), Some(cold)) => Some(hot.union(&cold)),
            (hot, cold) => hot.or(cold),
        }
    }

    /// Cells inside `range` in row-major order. Cold cells are not promoted.
    pub fn cells_in_range(&self, range: &CellRange) -> Result<Vec<(CellCoordinate, Cell)>> {
        let inner = self.inner.lock();
        let mut found: BTreeMap<CellCoordinate, Cell> = inner
            .matrix
            .iter_range(range)
            .map(|(coord, cell)| (coord, cell.clone()))
            .collect();
        for coord in inner.lazy.coordinates_in_range(range) {
            if found.contains_key(&coord) {
                continue;
            }
            if let Some(cell) = inner.lazy.peek(&coord)? {
                found.insert(coord, cell);
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Delete every cell inside `range`, returning how many were removed.
    pub fn clear_range(&self, range: &CellRange) -> usize {
        let mut inner = self.inner.lock();
        let mut removed: BTreeSet<CellCoordinate> = BTreeSet::new();
        for coord in inner.matrix.clear_range(range) {
            inner.recency.pop(&coord);
            removed.insert(coord);
        }
        removed.extend(inner.lazy.clear_range(range));
        inner.counters.deletes += removed.len() as u64;
        removed.len()
    }

    /// Bring every cold cell in `range` into the hot tier.
    pub fn preload_range(&self, range: &CellRange) -> Result<usize> {
        let mut inner = self.inner.lock();
        let targets: Vec<CellCoordinate> = inner
            .lazy
            .coordinates_in_range(range)
            .filter(|coord| !inner.matrix.contains(coord))
            .collect();
        let mut loaded = 0;
        for coord in targets {
            if let Some(cell) = inner.lazy.take(&coord)? {
                inner.insert_hot(coord, cell);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Push every live cell in `range` down to compressed form.
    pub fn evict_range(&self, range: &CellRange) -> Result<usize> {
        if !self.config.lazy_loading_enabled {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        let hot: Vec<CellCoordinate> = inner.matrix.iter_range(range).map(|(coord, _)| coord).collect();
        for coord in &hot {
            if let Some(cell) = inner.remove_hot(coord) {
                inner.lazy.put(*coord, cell)?;
            }
        }
        let evicted = inner.lazy.evict_range(range)?;
        tracing::debug!(range = %range, evicted, "evicted range");
        Ok(evicted)
    }

    /// Halve the hot tier and the loader cache.
    pub fn optimize_memory(&self) -> Result<OptimizeReport> {
        if !self.config.lazy_loading_enabled {
            return Ok(OptimizeReport::default());
        }
        let mut inner = self.inner.lock();
        let hot_limit = (inner.matrix.len() / 2).min(self.config.max_cells_in_memory);
        let hot_evicted = inner.shrink_hot(hot_limit)?;
        let cache_evicted = inner.lazy.force_gc()?;
        tracing::info!(hot_evicted, cache_evicted, "optimized storage memory");
        Ok(OptimizeReport {
            hot_evicted,
            cache_evicted,
        })
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let inner = self.inner.lock();
        Self::memory_of(&inner)
    }

    pub fn statistics(&self) -> StorageStats {
        let cell_count = self.len();
        let inner = self.inner.lock();
        StorageStats {
            cell_count,
            access: inner.counters,
            memory: Self::memory_of(&inner),
            matrix: inner.matrix.statistics(),
            loader: inner.lazy.statistics(),
            compression: self.compression.statistics(),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.matrix.clear();
        inner.recency.clear();
        inner.lazy.clear();
        inner.writes_since_check = 0;
    }

    fn memory_of(inner: &StorageInner) -> MemoryUsage {
        MemoryUsage {
            hot_cells: inner.matrix.len(),
            hot_bytes: inner.matrix.memory_usage(),
            cached_cells: inner.lazy.cached_len(),
            cached_bytes: inner.lazy.cached_bytes(),
            stored_cells: inner.lazy.stored_len(),
            stored_bytes: inner.lazy.stored_bytes(),
        }
    }

    fn after_write(&self, inner: &mut StorageInner) -> Result<()> {
        if !self.config.lazy_loading_enabled {
            return Ok(());
        }
        inner.writes_since_check += 1;
        if inner.writes_since_check < self.config.pressure_check_interval {
            return Ok(());
        }
        inner.writes_since_check = 0;
        inner.counters.pressure_checks += 1;

        let evicted = inner.shrink_hot(self.config.max_cells_in_memory)?;
        if evicted > 0 {
            inner.counters.pressure_evictions += evicted as u64;
            tracing::debug!(
                evicted,
                hot = inner.matrix.len(),
                limit = self.config.max_cells_in_memory,
                "memory pressure eviction"
            );
        }
        Ok(())
    }
}

impl CellStore for StorageEngine {
    fn get_cell(&self, coord: CellCoordinate) -> Result<Option<Cell>> {
        StorageEngine::get_cell(self, coord)
    }

    fn set_cell(&self, coord: CellCoordinate, cell: Cell) -> Result<()> {
        StorageEngine::set_cell(self, coord, cell)
    }

    fn delete_cell(&self, coord: CellCoordinate) -> bool {
        StorageEngine::delete_cell(self, coord)
    }

    fn used_range(&self) -> Option<CellRange> {
        StorageEngine::used_range(self)
    }

    fn cells_in_range(&self, range: &CellRange) -> Result<Vec<(CellCoordinate, Cell)>> {
        StorageEngine::cells_in_range(self, range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcalc_primitives::Value;

    fn coord(a1: &str) -> CellCoordinate {
        CellCoordinate::from_a1(a1).unwrap()
    }

    fn tight_engine() -> StorageEngine {
        StorageEngine::new(StorageConfig {
            cell_cache_size: 2,
            max_cells_in_memory: 2,
            pressure_check_interval: 1,
            ..StorageConfig::default()
        })
    }

    #[test]
    fn test_write_then_read_hot() {
        let engine = StorageEngine::default();
        engine.set_cell(coord("A1"), Cell::with_value(3.0)).unwrap();
        assert_eq!(engine.residency(coord("A1")), Residency::Hot);
        let cell = engine.get_cell(coord("A1")).unwrap().unwrap();
        assert_eq!(cell.value(), &Value::Number(3.0));
        assert_eq!(engine.statistics().access.hot_hits, 1);
    }

    #[test]
    fn test_pressure_moves_cells_down_the_tiers() {
        let engine = tight_engine();
        for row in 1..=6 {
            engine
                .set_cell(coord(&format!("A{row}")), Cell::with_value(f64::from(row)))
                .unwrap();
        }
        let usage = engine.memory_usage();
        assert_eq!(usage.hot_cells, 2);
        assert_eq!(usage.cached_cells, 2);
        assert_eq!(engine.residency(coord("A1")), Residency::Evicted);
        assert_eq!(engine.residency(coord("A6")), Residency::Hot);
        assert_eq!(engine.len(), 6);
    }

    #[test]
    fn test_evicted_read_is_promoted() {
        let engine = tight_engine();
        for row in 1..=6 {
            engine
                .set_cell(coord(&format!("A{row}")), Cell::with_value(f64::from(row)))
                .unwrap();
        }
        let cell = engine.get_cell(coord("A1")).unwrap().unwrap();
        assert_eq!(cell.value(), &Value::Number(1.0));
        assert_eq!(engine.residency(coord("A1")), Residency::Hot);
        assert_eq!(engine.statistics().access.promotions, 1);
    }

    #[test]
    fn test_delete_clears_every_tier() {
        let engine = tight_engine();
        for row in 1..=6 {
            engine
                .set_cell(coord(&format!("A{row}")), Cell::with_value(f64::from(row)))
                .unwrap();
        }
        assert!(engine.delete_cell(coord("A1")));
        assert!(engine.delete_cell(coord("A6")));
        assert!(!engine.delete_cell(coord("Z9")));
        assert_eq!(engine.residency(coord("A1")), Residency::Absent);
        assert_eq!(engine.get_cell(coord("A1")).unwrap(), None);
        assert_eq!(engine.len(), 4);
    }

    #[test]
    fn test_update_cell_mirrors_change() {
        let engine = tight_engine();
        engine.set_cell(coord("B2"), Cell::with_formula("=1+1")).unwrap();
        engine
            .update_cell(coord("B2"), |cell| cell.set_computed_value(Value::Number(2.0)))
            .unwrap();
        engine.evict_range(&CellRange::from_a1("B2").unwrap()).unwrap();
        assert_eq!(engine.residency(coord("B2")), Residency::Evicted);

        let cell = engine.get_cell(coord("B2")).unwrap().unwrap();
        assert_eq!(cell.value(), &Value::Number(2.0));
        assert_eq!(cell.formula(), Some("=1+1"));
    }

    #[test]
    fn test_lazy_loading_disabled_keeps_everything_hot() {
        let engine = StorageEngine::new(StorageConfig {
            lazy_loading_enabled: false,
            max_cells_in_memory: 1,
            pressure_check_interval: 1,
            ..StorageConfig::default()
        });
        engine.set_cell(coord("A1"), Cell::with_value(1.0)).unwrap();
        engine.set_cell(coord("A2"), Cell::with_value(2.0)).unwrap();
        assert_eq!(engine.memory_usage().hot_cells, 2);
        assert_eq!(engine.memory_usage().stored_cells, 0);
    }
}
