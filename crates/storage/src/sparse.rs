//! Row-oriented sparse matrix holding the hot cells.
//!
//! Rows live in a `BTreeMap`; each row keeps its cells in a vector sorted by
//! column so point lookups and range scans are binary searches.

use std::collections::BTreeMap;

use gridcalc_primitives::{Cell, CellCoordinate, CellRange};
use serde::Serialize;

/// Bookkeeping bytes charged per row (map entry plus vector header).
const ROW_OVERHEAD_BYTES: usize = 64;

#[derive(Debug, Default, Clone)]
struct SparseRow {
    cells: Vec<(u32, Cell)>,
}

impl SparseRow {
    fn position(&self, col: u32) -> Result<usize, usize> {
        self.cells.binary_search_by_key(&col, |(c, _)| *c)
    }

    /// Index bounds of columns within `[first, last]`.
    fn span(&self, first: u32, last: u32) -> (usize, usize) {
        let lo = self.cells.partition_point(|(c, _)| *c < first);
        let hi = self.cells.partition_point(|(c, _)| *c <= last);
        (lo, hi)
    }

    fn memory_bytes(&self) -> usize {
        ROW_OVERHEAD_BYTES
            + self.cells.capacity() * std::mem::size_of::<u32>()
            + self.cells.iter().map(|(_, cell)| cell.memory_size()).sum::<usize>()
    }
}

/// Memory usage for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowMemory {
    pub row: u32,
    pub cells: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MatrixStats {
    pub cell_count: usize,
    pub row_count: usize,
    pub memory_bytes: usize,
    /// Fraction of the used range actually occupied.
    pub density: f64,
    pub average_cells_per_row: f64,
}

#[derive(Debug, Default, Clone)]
pub struct SparseMatrix {
    rows: BTreeMap<u32, SparseRow>,
    len: usize,
}

impl SparseMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, coord: &CellCoordinate) -> Option<&Cell> {
        let row = self.rows.get(&coord.row())?;
        let idx = row.position(coord.col()).ok()?;
        Some(&row.cells[idx].1)
    }

    pub fn get_mut(&mut self, coord: &CellCoordinate) -> Option<&mut Cell> {
        let row = self.rows.get_mut(&coord.row())?;
        let idx = row.position(coord.col()).ok()?;
        Some(&mut row.cells[idx].1)
    }

    pub fn contains(&self, coord: &CellCoordinate) -> bool {
        self.get(coord).is_some()
    }

    /// Store a cell, returning the previous one at that coordinate.
    pub fn insert(&mut self, coord: CellCoordinate, cell: Cell) -> Option<Cell> {
        let row = self.rows.entry(coord.row()).or_default();
        match row.position(coord.col()) {
            Ok(idx) => Some(std::mem::replace(&mut row.cells[idx].1, cell)),
            Err(idx) => {
                row.cells.insert(idx, (coord.col(), cell));
                self.len += 1;
                None
            }
        }
    }

    pub fn remove(&mut self, coord: &CellCoordinate) -> Option<Cell> {
        let row = self.rows.get_mut(&coord.row())?;
        let idx = row.position(coord.col()).ok()?;
        let (_, cell) = row.cells.remove(idx);
        if row.cells.is_empty() {
            self.rows.remove(&coord.row());
        }
        self.len -= 1;
        Some(cell)
    }

    /// All cells in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (CellCoordinate, &Cell)> + '_ {
        self.rows.iter().flat_map(|(row, cells)| {
            cells
                .cells
                .iter()
                .filter_map(move |(col, cell)| Some((CellCoordinate::new(*row, *col).ok()?, cell)))
        })
    }

    /// Cells inside `range` in row-major order.
    pub fn iter_range(
        &self,
        range: &CellRange,
    ) -> impl Iterator<Item = (CellCoordinate, &Cell)> + '_ {
        let (first_col, last_col) = (range.start().col(), range.end().col());
        self.rows
            .range(range.start().row()..=range.end().row())
            .flat_map(move |(row, cells)| {
                let (lo, hi) = cells.span(first_col, last_col);
                cells.cells[lo..hi]
                    .iter()
                    .filter_map(move |(col, cell)| {
                        Some((CellCoordinate::new(*row, *col).ok()?, cell))
                    })
            })
    }

    /// Bounding box of every stored cell.
    pub fn used_range(&self) -> Option<CellRange> {
        let (&first_row, _) = self.rows.first_key_value()?;
        let (&last_row, _) = self.rows.last_key_value()?;
        let first_col = self.rows.values().filter_map(|r| r.cells.first()).map(|(c, _)| *c).min()?;
        let last_col = self.rows.values().filter_map(|r| r.cells.last()).map(|(c, _)| *c).max()?;
        Some(CellRange::new(
            CellCoordinate::new(first_row, first_col).ok()?,
            CellCoordinate::new(last_row, last_col).ok()?,
        ))
    }

    /// Remove every cell inside `range`, returning the removed coordinates.
    pub fn clear_range(&mut self, range: &CellRange) -> Vec<CellCoordinate> {
        let (first_col, last_col) = (range.start().col(), range.end().col());
        let mut removed = Vec::new();
        let mut emptied = Vec::new();

        for (row, cells) in self
            .rows
            .range_mut(range.start().row()..=range.end().row())
        {
            let (lo, hi) = cells.span(first_col, last_col);
            for (col, _) in cells.cells.drain(lo..hi) {
                if let Ok(coord) = CellCoordinate::new(*row, col) {
                    removed.push(coord);
                }
            }
            if cells.cells.is_empty() {
                emptied.push(*row);
            }
        }
        for row in emptied {
            self.rows.remove(&row);
        }
        self.len -= removed.len();
        removed
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.len = 0;
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.rows.values().map(SparseRow::memory_bytes).sum::<usize>()
    }

    pub fn row_memory(&self, row: u32) -> Option<RowMemory> {
        let cells = self.rows.get(&row)?;
        Some(RowMemory {
            row,
            cells: cells.cells.len(),
            bytes: cells.memory_bytes(),
        })
    }

    pub fn statistics(&self) -> MatrixStats {
        let density = self
            .used_range()
            .map(|r| self.len as f64 / r.cell_count() as f64)
            .unwrap_or(0.0);
        let average_cells_per_row = if self.rows.is_empty() {
            0.0
        } else {
            self.len as f64 / self.rows.len() as f64
        };
        MatrixStats {
            cell_count: self.len,
            row_count: self.rows.len(),
            memory_bytes: self.memory_usage(),
            density,
            average_cells_per_row,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcalc_primitives::Value;

    fn coord(a1: &str) -> CellCoordinate {
        CellCoordinate::from_a1(a1).unwrap()
    }

    fn matrix_with(cells: &[(&str, f64)]) -> SparseMatrix {
        let mut matrix = SparseMatrix::new();
        for (a1, n) in cells {
            matrix.insert(coord(a1), Cell::with_value(*n));
        }
        matrix
    }

    #[test]
    fn test_insert_get_replace_remove() {
        let mut matrix = SparseMatrix::new();
        assert!(matrix.insert(coord("C3"), Cell::with_value(1.0)).is_none());
        let previous = matrix.insert(coord("C3"), Cell::with_value(2.0)).unwrap();
        assert_eq!(previous.value(), &Value::Number(1.0));
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix.get(&coord("C3")).unwrap().value(), &Value::Number(2.0));

        assert!(matrix.remove(&coord("C3")).is_some());
        assert!(matrix.is_empty());
        assert_eq!(matrix.row_count(), 0);
    }

    #[test]
    fn test_columns_stay_sorted() {
        let matrix = matrix_with(&[("E1", 5.0), ("A1", 1.0), ("C1", 3.0)]);
        let order: Vec<String> = matrix.iter().map(|(c, _)| c.to_a1()).collect();
        assert_eq!(order, vec!["A1", "C1", "E1"]);
    }

    #[test]
    fn test_iter_range_uses_bounds() {
        let matrix = matrix_with(&[("A1", 1.0), ("B2", 2.0), ("C3", 3.0), ("D2", 4.0), ("B9", 5.0)]);
        let range = CellRange::from_a1("B1:C3").unwrap();
        let found: Vec<String> = matrix.iter_range(&range).map(|(c, _)| c.to_a1()).collect();
        assert_eq!(found, vec!["B2", "C3"]);
    }

    #[test]
    fn test_used_range_and_clear_range() {
        let mut matrix = matrix_with(&[("B2", 1.0), ("D7", 2.0), ("A5", 3.0)]);
        assert_eq!(matrix.used_range(), Some(CellRange::from_a1("A2:D7").unwrap()));

        let removed = matrix.clear_range(&CellRange::from_a1("A1:B5").unwrap());
        assert_eq!(removed, vec![coord("B2"), coord("A5")]);
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix.used_range(), Some(CellRange::from_a1("D7:D7").unwrap()));
    }

    #[test]
    fn test_memory_and_density() {
        let matrix = matrix_with(&[("A1", 1.0), ("B2", 2.0)]);
        let stats = matrix.statistics();
        assert_eq!(stats.cell_count, 2);
        assert_eq!(stats.row_count, 2);
        assert!((stats.density - 0.5).abs() < f64::EPSILON);
        assert_eq!(matrix.row_memory(0).unwrap().cells, 1);
        assert!(matrix.memory_usage() > 0);
    }
}
