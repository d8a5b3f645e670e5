//! # gridcalc-primitives
//!
//! Core spreadsheet primitives shared by every gridcalc crate: cell
//! coordinates and ranges in A1 notation, the closed [`Value`] union with its
//! error values, and the stored [`Cell`].

pub mod cell;
pub mod coordinate;
pub mod value;

pub use cell::{Cell, CellFormat, CellState, CellType};
pub use coordinate::{
    column_index_to_letters, column_letters_to_index, CellCoordinate, CellRange, RangeIter,
    MAX_COLS, MAX_ROWS,
};
pub use value::{ErrorValue, Value};

/// Errors produced while building or parsing coordinates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid column: {0}")]
    InvalidColumn(String),
    #[error("Invalid row: {0}")]
    InvalidRow(String),
    #[error("Invalid reference: {0}")]
    InvalidReference(String),
    #[error("Row {0} is outside the sheet")]
    RowOutOfBounds(u32),
    #[error("Column {0} is outside the sheet")]
    ColumnOutOfBounds(u32),
}
