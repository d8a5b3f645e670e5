//! Lazy loading of cold cells.
//!
//! Loaded cells sit in a strict LRU bounded by `cell_cache_size`. When the
//! LRU overflows, its least recently used cell is written back to the
//! backing store (value compressed by the [`CompressionManager`]) before the
//! live object is dropped. Reading an evicted cell decompresses it on demand
//! and puts it back into the LRU.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use gridcalc_primitives::{Cell, CellCoordinate, CellRange, Value};
use lru::LruCache;
use serde::Serialize;

use crate::compression::CompressedBlob;
use crate::error::{Result, StorageError};
use crate::CompressionManager;

/// Where the lazy loader currently holds a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    /// Live object in the LRU.
    Loaded,
    /// Serialized and compressed in the backing store only.
    Evicted,
}

/// A cell whose value is held compressed; the shell keeps everything else.
#[derive(Debug, Clone)]
struct StoredCell {
    shell: Cell,
    value: CompressedBlob,
}

impl StoredCell {
    fn memory_bytes(&self) -> usize {
        self.shell.memory_size() + self.value.compressed_size()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    /// Evicted cells decompressed back into the LRU.
    pub loads: u64,
    /// Reads served by the LRU.
    pub hits: u64,
    /// Reads for coordinates the loader does not hold.
    pub misses: u64,
    /// Cells written back and dropped from the LRU.
    pub evictions: u64,
    /// Serialized writes into the backing store.
    pub writes: u64,
}

#[derive(Debug)]
pub struct LazyLoader {
    cache: LruCache<CellCoordinate, Cell>,
    backing: BTreeMap<CellCoordinate, StoredCell>,
    /// Every coordinate held in either tier, row-major.
    index: BTreeSet<CellCoordinate>,
    /// Held coordinates per column, for bounding boxes.
    columns: BTreeMap<u32, usize>,
    compression: Arc<CompressionManager>,
    stats: LoaderStats,
}

impl LazyLoader {
    pub fn new(capacity: usize, compression: Arc<CompressionManager>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            backing: BTreeMap::new(),
            index: BTreeSet::new(),
            columns: BTreeMap::new(),
            compression,
            stats: LoaderStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    pub fn state(&self, coord: &CellCoordinate) -> Option<LoadState> {
        if self.cache.contains(coord) {
            Some(LoadState::Loaded)
        } else if self.backing.contains_key(coord) {
            Some(LoadState::Evicted)
        } else {
            None
        }
    }

    pub fn contains(&self, coord: &CellCoordinate) -> bool {
        self.index.contains(coord)
    }

    /// Number of distinct coordinates held in either tier.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bounding box of every held coordinate.
    pub fn bounds(&self) -> Option<CellRange> {
        let first = self.index.first()?;
        let last = self.index.last()?;
        let min_col = *self.columns.first_key_value()?.0;
        let max_col = *self.columns.last_key_value()?.0;
        Some(CellRange::new(
            CellCoordinate::new(first.row(), min_col).ok()?,
            CellCoordinate::new(last.row(), max_col).ok()?,
        ))
    }

    /// Number of live cells in the LRU.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Number of serialized cells in the backing store.
    pub fn stored_len(&self) -> usize {
        self.backing.len()
    }

    /// Bytes held by the backing store.
    pub fn stored_bytes(&self) -> usize {
        self.backing.values().map(StoredCell::memory_bytes).sum()
    }

    /// Bytes held by live cells in the LRU.
    pub fn cached_bytes(&self) -> usize {
        self.cache.iter().map(|(_, cell)| cell.memory_size()).sum()
    }

    pub fn statistics(&self) -> LoaderStats {
        self.stats
    }

    /// Hold a live cell, writing back whichever cell the LRU pushes out.
    pub fn put(&mut self, coord: CellCoordinate, cell: Cell) -> Result<()> {
        self.track(coord);
        if let Some((evicted_coord, evicted)) = self.cache.push(coord, cell) {
            if evicted_coord != coord {
                self.stash(evicted_coord, evicted)?;
                self.stats.evictions += 1;
            }
        }
        Ok(())
    }

    /// Mirror a cell into the backing store, dropping any stale live copy.
    pub fn store(&mut self, coord: CellCoordinate, cell: &Cell) -> Result<()> {
        self.cache.pop(&coord);
        self.backing.remove(&coord);
        self.stash(coord, cell.clone())
    }

    /// Read a cell, loading it into the LRU if it was evicted.
    pub fn get(&mut self, coord: &CellCoordinate) -> Result<Option<Cell>> {
        if let Some(cell) = self.cache.get(coord) {
            self.stats.hits += 1;
            return Ok(Some(cell.clone()));
        }
        let Some(stored) = self.backing.get(coord) else {
            self.stats.misses += 1;
            return Ok(None);
        };
        let cell = self.restore(*coord, stored)?;
        self.stats.loads += 1;
        self.put(*coord, cell.clone())?;
        Ok(Some(cell))
    }

    /// Hand the live cell to the caller, leaving only the serialized copy.
    pub fn take(&mut self, coord: &CellCoordinate) -> Result<Option<Cell>> {
        if let Some(cell) = self.cache.pop(coord) {
            self.stats.hits += 1;
            if !self.backing.contains_key(coord) {
                self.stash(*coord, cell.clone())?;
            }
            return Ok(Some(cell));
        }
        match self.backing.get(coord) {
            Some(stored) => {
                let cell = self.restore(*coord, stored)?;
                self.stats.loads += 1;
                Ok(Some(cell))
            }
            None => {
                self.stats.misses += 1;
                Ok(None)
            }
        }
    }

    /// Read without changing recency or load state.
    pub fn peek(&self, coord: &CellCoordinate) -> Result<Option<Cell>> {
        if let Some(cell) = self.cache.peek(coord) {
            return Ok(Some(cell.clone()));
        }
        self.backing
            .get(coord)
            .map(|stored| self.restore(*coord, stored))
            .transpose()
    }

    pub fn remove(&mut self, coord: &CellCoordinate) -> bool {
        let cached = self.cache.pop(coord).is_some();
        let stored = self.backing.remove(coord).is_some();
        self.untrack(coord);
        cached || stored
    }

    /// Write a loaded cell back and drop the live object.
    pub fn evict(&mut self, coord: &CellCoordinate) -> Result<bool> {
        let Some(cell) = self.cache.pop(coord) else {
            return Ok(false);
        };
        self.stash(*coord, cell)?;
        self.stats.evictions += 1;
        Ok(true)
    }

    pub fn evict_range(&mut self, range: &CellRange) -> Result<usize> {
        let targets: Vec<CellCoordinate> = self
            .coordinates_in_range(range)
            .filter(|coord| self.cache.contains(coord))
            .collect();
        for coord in &targets {
            self.evict(coord)?;
        }
        Ok(targets.len())
    }

    /// Load every evicted cell in `range` into the LRU.
    pub fn preload_range(&mut self, range: &CellRange) -> Result<usize> {
        let targets: Vec<CellCoordinate> = self
            .coordinates_in_range(range)
            .filter(|coord| !self.cache.contains(coord))
            .collect();
        for coord in &targets {
            self.get(coord)?;
        }
        Ok(targets.len())
    }

    /// Evict least recently used cells until the LRU is at most half full.
    pub fn force_gc(&mut self) -> Result<usize> {
        let target = self.capacity() / 2;
        let mut evicted = 0;
        while self.cache.len() > target {
            let Some((coord, cell)) = self.cache.pop_lru() else {
                break;
            };
            self.stash(coord, cell)?;
            evicted += 1;
        }
        self.stats.evictions += evicted as u64;
        tracing::debug!(evicted, remaining = self.cache.len(), "lazy loader gc");
        Ok(evicted)
    }

    /// Held coordinates inside `range`, row-major. Only the rows the range
    /// spans are visited.
    pub fn coordinates_in_range<'a>(
        &'a self,
        range: &'a CellRange,
    ) -> impl Iterator<Item = CellCoordinate> + 'a {
        self.index
            .range(range.start()..=range.end())
            .filter(|coord| range.contains(coord))
            .copied()
    }

    /// Cells in `range` without disturbing the LRU.
    pub fn cells_in_range(&self, range: &CellRange) -> Result<Vec<(CellCoordinate, Cell)>> {
        let mut out = Vec::new();
        for coord in self.coordinates_in_range(range) {
            if let Some(cell) = self.peek(&coord)? {
                out.push((coord, cell));
            }
        }
        Ok(out)
    }

    pub fn clear_range(&mut self, range: &CellRange) -> Vec<CellCoordinate> {
        let targets: Vec<CellCoordinate> = self.coordinates_in_range(range).collect();
        for coord in &targets {
            self.remove(coord);
        }
        targets
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.backing.clear();
        self.index.clear();
        self.columns.clear();
    }

    fn track(&mut self, coord: CellCoordinate) {
        if self.index.insert(coord) {
            *self.columns.entry(coord.col()).or_default() += 1;
        }
    }

    fn untrack(&mut self, coord: &CellCoordinate) {
        if !self.index.remove(coord) {
            return;
        }
        if let Some(count) = self.columns.get_mut(&coord.col()) {
            *count -= 1;
            if *count == 0 {
                self.columns.remove(&coord.col());
            }
        }
    }

    fn stash(&mut self, coord: CellCoordinate, mut cell: Cell) -> Result<()> {
        // An unchanged cell already has an up-to-date serialized copy.
        let current = self.backing.get(&coord).is_some_and(|stored| {
            stored.shell.version() == cell.version() && stored.shell.formula() == cell.formula()
        });
        if current {
            return Ok(());
        }
        let value = cell.swap_value(Value::default());
        let blob = self.compression.compress(&value)?;
        self.track(coord);
        self.backing.insert(
            coord,
            StoredCell {
                shell: cell,
                value: blob,
            },
        );
        self.stats.writes += 1;
        Ok(())
    }

    fn restore(&self, coord: CellCoordinate, stored: &StoredCell) -> Result<Cell> {
        let value = self
            .compression
            .decompress(&stored.value)
            .map_err(|e| StorageError::CellRestore {
                coordinate: coord,
                reason: e.to_string(),
            })?;
        let mut cell = stored.shell.clone();
        cell.swap_value(value);
        Ok(cell)
    }
}
