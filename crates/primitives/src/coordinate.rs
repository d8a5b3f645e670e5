//! Cell coordinates, rectangular ranges and A1 notation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::AddressError;

/// Number of rows addressable in a sheet.
pub const MAX_ROWS: u32 = 1_048_576;
/// Number of columns addressable in a sheet.
pub const MAX_COLS: u32 = 16_384;

/// A zero-based cell position (e.g. `A1` is row 0, col 0).
///
/// Coordinates are always inside the grid; the only constructors validate
/// bounds. Ordering is row-major: `(row, col)` compared lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CellCoordinate {
    row: u32,
    col: u32,
}

impl CellCoordinate {
    /// Create a coordinate, rejecting positions outside the grid.
    pub fn new(row: u32, col: u32) -> Result<Self, AddressError> {
        if row >= MAX_ROWS {
            return Err(AddressError::RowOutOfBounds(row));
        }
        if col >= MAX_COLS {
            return Err(AddressError::ColumnOutOfBounds(col));
        }
        Ok(Self { row, col })
    }

    pub const fn row(&self) -> u32 {
        self.row
    }

    pub const fn col(&self) -> u32 {
        self.col
    }

    /// Parse from A1 notation (e.g., "A1", "$B$2", "xfd10")
    pub fn from_a1(s: &str) -> Result<Self, AddressError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AddressError::InvalidReference(
                "Empty A1 reference".to_string(),
            ));
        }

        let mut chars = trimmed.chars().peekable();

        // Optional $ for absolute column
        if matches!(chars.peek(), Some('$')) {
            chars.next();
        }

        let mut col_letters = String::new();
        while let Some(ch) = chars.peek().copied() {
            if ch.is_ascii_alphabetic() {
                col_letters.push(ch);
                chars.next();
            } else {
                break;
            }
        }

        if col_letters.is_empty() {
            return Err(AddressError::InvalidColumn(trimmed.to_string()));
        }

        // Optional $ for absolute row
        if matches!(chars.peek(), Some('$')) {
            chars.next();
        }

        let mut row_digits = String::new();
        while let Some(ch) = chars.peek().copied() {
            if ch.is_ascii_digit() {
                row_digits.push(ch);
                chars.next();
            } else {
                break;
            }
        }

        if row_digits.is_empty() || chars.peek().is_some() {
            return Err(AddressError::InvalidRow(trimmed.to_string()));
        }

        let row_num: u32 = row_digits
            .parse()
            .map_err(|_| AddressError::InvalidRow(row_digits.clone()))?;
        if row_num == 0 {
            return Err(AddressError::InvalidRow(row_digits));
        }

        let col = column_letters_to_index(&col_letters)?;
        Self::new(row_num - 1, col)
    }

    /// Convert to A1 notation
    pub fn to_a1(&self) -> String {
        format!("{}{}", column_index_to_letters(self.col), self.row + 1)
    }

    /// Shift by a signed offset, returning `None` when the result leaves the grid.
    pub fn offset(&self, rows: i64, cols: i64) -> Option<Self> {
        let row = u32::try_from(i64::from(self.row) + rows).ok()?;
        let col = u32::try_from(i64::from(self.col) + cols).ok()?;
        Self::new(row, col).ok()
    }
}

impl fmt::Display for CellCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

impl FromStr for CellCoordinate {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_a1(s)
    }
}

impl From<CellCoordinate> for String {
    fn from(coord: CellCoordinate) -> Self {
        coord.to_a1()
    }
}

impl TryFrom<String> for CellCoordinate {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_a1(&value)
    }
}

/// A rectangular block of cells (e.g., A1:B10).
///
/// Always normalized: `start` holds the minimum row and column, `end` the
/// maximum, so every operation can assume `start <= end` component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CellRange {
    start: CellCoordinate,
    end: CellCoordinate,
}

impl CellRange {
    /// Create a range spanning two corners in any order.
    pub fn new(a: CellCoordinate, b: CellCoordinate) -> Self {
        Self {
            start: CellCoordinate {
                row: a.row.min(b.row),
                col: a.col.min(b.col),
            },
            end: CellCoordinate {
                row: a.row.max(b.row),
                col: a.col.max(b.col),
            },
        }
    }

    /// A 1x1 range.
    pub fn single(coord: CellCoordinate) -> Self {
        Self {
            start: coord,
            end: coord,
        }
    }

    /// Every column of one row.
    pub fn entire_row(row: u32) -> Result<Self, AddressError> {
        Ok(Self::new(
            CellCoordinate::new(row, 0)?,
            CellCoordinate::new(row, MAX_COLS - 1)?,
        ))
    }

    /// Every row of one column.
    pub fn entire_column(col: u32) -> Result<Self, AddressError> {
        Ok(Self::new(
            CellCoordinate::new(0, col)?,
            CellCoordinate::new(MAX_ROWS - 1, col)?,
        ))
    }

    /// Parse `A1:B10`; a lone coordinate yields a single-cell range.
    pub fn from_a1(s: &str) -> Result<Self, AddressError> {
        let trimmed = s.trim();
        match trimmed.split_once(':') {
            Some((start, end)) => Ok(Self::new(
                CellCoordinate::from_a1(start)?,
                CellCoordinate::from_a1(end)?,
            )),
            None => CellCoordinate::from_a1(trimmed).map(Self::single),
        }
    }

    pub fn to_a1(&self) -> String {
        format!("{}:{}", self.start.to_a1(), self.end.to_a1())
    }

    pub const fn start(&self) -> CellCoordinate {
        self.start
    }

    pub const fn end(&self) -> CellCoordinate {
        self.end
    }

    pub fn row_count(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    pub fn col_count(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    /// Total number of cells (may exceed `u32` for whole-sheet ranges).
    pub fn cell_count(&self) -> u64 {
        u64::from(self.row_count()) * u64::from(self.col_count())
    }

    /// Check if a cell is within this range
    pub fn contains(&self, coord: &CellCoordinate) -> bool {
        coord.row >= self.start.row
            && coord.row <= self.end.row
            && coord.col >= self.start.col
            && coord.col <= self.end.col
    }

    /// Check if `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &CellRange) -> bool {
        self.contains(&other.start) && self.contains(&other.end)
    }

    pub fn intersects(&self, other: &CellRange) -> bool {
        self.start.row <= other.end.row
            && other.start.row <= self.end.row
            && self.start.col <= other.end.col
            && other.start.col <= self.end.col
    }

    /// The overlapping block, if any.
    pub fn intersection(&self, other: &CellRange) -> Option<CellRange> {
        if !self.intersects(other) {
            return None;
        }
        Some(CellRange {
            start: CellCoordinate {
                row: self.start.row.max(other.start.row),
                col: self.start.col.max(other.start.col),
            },
            end: CellCoordinate {
                row: self.end.row.min(other.end.row),
                col: self.end.col.min(other.end.col),
            },
        })
    }

    /// Smallest range covering both (bounding box).
    pub fn union(&self, other: &CellRange) -> CellRange {
        CellRange {
            start: CellCoordinate {
                row: self.start.row.min(other.start.row),
                col: self.start.col.min(other.start.col),
            },
            end: CellCoordinate {
                row: self.end.row.max(other.end.row),
                col: self.end.col.max(other.end.col),
            },
        }
    }

    /// Grow by `rows`/`cols` on every side, clamped to the grid.
    pub fn expand(&self, rows: u32, cols: u32) -> CellRange {
        CellRange {
            start: CellCoordinate {
                row: self.start.row.saturating_sub(rows),
                col: self.start.col.saturating_sub(cols),
            },
            end: CellCoordinate {
                row: self.end.row.saturating_add(rows).min(MAX_ROWS - 1),
                col: self.end.col.saturating_add(cols).min(MAX_COLS - 1),
            },
        }
    }

    /// Iterate over all coordinates in row-major order
    pub fn iter_rows(&self) -> RangeIter {
        RangeIter::new(*self, Traversal::RowMajor)
    }

    /// Iterate over all coordinates in column-major order
    pub fn iter_cols(&self) -> RangeIter {
        RangeIter::new(*self, Traversal::ColumnMajor)
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

impl FromStr for CellRange {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_a1(s)
    }
}

impl From<CellRange> for String {
    fn from(range: CellRange) -> Self {
        range.to_a1()
    }
}

impl TryFrom<String> for CellRange {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_a1(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Traversal {
    RowMajor,
    ColumnMajor,
}

/// Iterator over the coordinates of a [`CellRange`].
#[derive(Debug, Clone)]
pub struct RangeIter {
    range: CellRange,
    traversal: Traversal,
    next: Option<CellCoordinate>,
}

impl RangeIter {
    fn new(range: CellRange, traversal: Traversal) -> Self {
        Self {
            range,
            traversal,
            next: Some(range.start),
        }
    }
}

impl Iterator for RangeIter {
    type Item = CellCoordinate;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let (start, end) = (self.range.start, self.range.end);

        self.next = match self.traversal {
            Traversal::RowMajor if current.col < end.col => Some(CellCoordinate {
                row: current.row,
                col: current.col + 1,
            }),
            Traversal::RowMajor if current.row < end.row => Some(CellCoordinate {
                row: current.row + 1,
                col: start.col,
            }),
            Traversal::ColumnMajor if current.row < end.row => Some(CellCoordinate {
                row: current.row + 1,
                col: current.col,
            }),
            Traversal::ColumnMajor if current.col < end.col => Some(CellCoordinate {
                row: start.row,
                col: current.col + 1,
            }),
            _ => None,
        };

        Some(current)
    }
}

/// Convert column letters to a zero-based index ("A" -> 0, "AA" -> 26).
pub fn column_letters_to_index(col: &str) -> Result<u32, AddressError> {
    if col.is_empty() {
        return Err(AddressError::InvalidColumn(col.to_string()));
    }
    let mut result: u32 = 0;
    for ch in col.chars() {
        let upper = ch.to_ascii_uppercase();
        if !upper.is_ascii_uppercase() {
            return Err(AddressError::InvalidColumn(col.to_string()));
        }
        let value = u32::from(upper as u8 - b'A' + 1);
        result = result
            .checked_mul(26)
            .and_then(|v| v.checked_add(value))
            .filter(|v| *v <= MAX_COLS)
            .ok_or_else(|| AddressError::InvalidColumn(col.to_string()))?;
    }
    Ok(result - 1)
}

/// Convert a zero-based column index to letters (0 -> "A", 27 -> "AB").
pub fn column_index_to_letters(index: u32) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push((b'A' + rem) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}
