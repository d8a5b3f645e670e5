//! The stored unit of a sheet: value or formula, format, state and version.

use serde::{Deserialize, Serialize};

use crate::Value;

/// Calculation state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CellState {
    #[default]
    Clean,
    Dirty,
    Calculating,
    Error,
}

/// Coarse classification of what a cell holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    Empty,
    Number,
    Text,
    Boolean,
    Formula,
    Error,
    Array,
}

/// Presentation attributes. Every field is optional; absent means default.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CellFormat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f32>,
    pub bold: bool,
    pub italic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub border_style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<String>,
}

impl CellFormat {
    fn heap_size(&self) -> usize {
        [
            &self.font_family,
            &self.font_color,
            &self.background_color,
            &self.border_style,
            &self.number_format,
            &self.alignment,
        ]
        .iter()
        .map(|s| s.as_ref().map_or(0, String::capacity))
        .sum()
    }
}

/// A single cell.
///
/// Exactly one of value or formula is authoritative. For a formula cell the
/// value is the last computed result. Every mutation bumps `version`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cell {
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format: Option<CellFormat>,
    #[serde(default)]
    state: CellState,
    #[serde(default)]
    version: u64,
}

impl Cell {
    /// A plain value cell.
    pub fn with_value(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// A formula cell awaiting its first calculation.
    pub fn with_formula(formula: impl Into<String>) -> Self {
        Self {
            formula: Some(formula.into()),
            state: CellState::Dirty,
            ..Self::default()
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn formula(&self) -> Option<&str> {
        self.formula.as_deref()
    }

    pub fn format(&self) -> Option<&CellFormat> {
        self.format.as_ref()
    }

    pub fn state(&self) -> CellState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_formula(&self) -> bool {
        self.formula.is_some()
    }

    /// Replace the content with a literal value, dropping any formula.
    pub fn set_value(&mut self, value: impl Into<Value>) {
        self.value = value.into();
        self.formula = None;
        self.state = CellState::Clean;
        self.version += 1;
    }

    /// Replace the content with a formula; the old value stays until recalculated.
    pub fn set_formula(&mut self, formula: impl Into<String>) {
        self.formula = Some(formula.into());
        self.state = CellState::Dirty;
        self.version += 1;
    }

    /// Store the result of evaluating this cell's formula.
    pub fn set_computed_value(&mut self, value: Value) {
        self.state = if value.is_error() {
            CellState::Error
        } else {
            CellState::Clean
        };
        self.value = value;
        self.version += 1;
    }

    /// Exchange the stored value without touching formula, state or version.
    ///
    /// Storage tiers use this to hold a value in compressed form apart from
    /// the rest of the cell.
    pub fn swap_value(&mut self, value: Value) -> Value {
        std::mem::replace(&mut self.value, value)
    }

    pub fn set_state(&mut self, state: CellState) {
        self.state = state;
    }

    pub fn set_format(&mut self, format: Option<CellFormat>) {
        self.format = format;
        self.version += 1;
    }

    pub fn cell_type(&self) -> CellType {
        if self.formula.is_some() {
            return CellType::Formula;
        }
        match &self.value {
            Value::Number(_) => CellType::Number,
            Value::Text(s) if s.is_empty() => CellType::Empty,
            Value::Text(_) => CellType::Text,
            Value::Boolean(_) => CellType::Boolean,
            Value::Error(_) => CellType::Error,
            Value::Array(_) => CellType::Array,
        }
    }

    /// Approximate bytes held by this cell, inline size included.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.value.heap_size()
            + self.formula.as_ref().map_or(0, String::capacity)
            + self
                .format
                .as_ref()
                .map_or(0, |f| std::mem::size_of::<CellFormat>() + f.heap_size())
    }
}
