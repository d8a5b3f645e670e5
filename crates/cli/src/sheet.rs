//! Sheet description files.
//!
//! ```yaml
//! config:
//!   calculation_mode: manual
//! cells:
//!   A1: 1
//!   A2: 2
//!   B1: "=SUM(A1:A2)"
//! ```

use std::path::Path;

use anyhow::{bail, Context, Result};
use gridcalc_formulas::{CalculationMode, EngineConfig, FormulaEngine};
use gridcalc_primitives::{CellCoordinate, Value};
use indexmap::IndexMap;
use serde::Deserialize;

/// A cell's content as written in the file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CellInput {
    Number(f64),
    Boolean(bool),
    /// Formulas start with `=`; other text goes through value parsing.
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SheetFile {
    pub config: Option<EngineConfig>,
    /// Cells in file order.
    pub cells: IndexMap<String, CellInput>,
}

impl SheetFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sheet: {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let sheet = match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&text)
                .with_context(|| format!("Invalid YAML sheet: {}", path.display()))?,
            "json" => serde_json::from_str(&text)
                .with_context(|| format!("Invalid JSON sheet: {}", path.display()))?,
            other => bail!("Unsupported sheet format '{other}': expected .yaml, .yml or .json"),
        };
        Ok(sheet)
    }
}

/// Apply one `CELL` / input pair.
pub fn apply_input(engine: &FormulaEngine, cell: &str, input: &CellInput) -> Result<()> {
    let coord = CellCoordinate::from_a1(cell).with_context(|| format!("Invalid cell '{cell}'"))?;
    match input {
        CellInput::Number(n) => engine.set_cell_value(coord, Value::Number(*n)),
        CellInput::Boolean(b) => engine.set_cell_value(coord, Value::Boolean(*b)),
        CellInput::Text(text) => engine.set_cell_formula(coord, text),
    }
    .with_context(|| format!("Failed to set cell {cell}"))?;
    Ok(())
}

/// Build an engine and load every cell. Cells are entered in manual mode
/// and calculated once at the end, then the configured mode is restored.
pub fn build_engine(sheet: &SheetFile, config: EngineConfig) -> Result<FormulaEngine> {
    let mode = config.calculation_mode;
    let engine = FormulaEngine::new(EngineConfig {
        calculation_mode: CalculationMode::Manual,
        ..config
    })
    .context("Failed to create formula engine")?;

    for (cell, input) in &sheet.cells {
        apply_input(&engine, cell, input)?;
    }
    let stats = engine
        .recalculate_all()
        .context("Initial recalculation failed")?;
    tracing::info!(cells = sheet.cells.len(), calculated = stats.cells_calculated, "sheet loaded");
    engine
        .set_calculation_mode(mode)
        .context("Failed to restore calculation mode")?;
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_inputs() {
        let sheet: SheetFile =
            serde_yaml::from_str("cells:\n  A1: 2\n  A2: true\n  B1: \"=A1*2\"\n").expect("parse");
        assert_eq!(sheet.cells["A1"], CellInput::Number(2.0));
        assert_eq!(sheet.cells["A2"], CellInput::Boolean(true));
        assert_eq!(sheet.cells["B1"], CellInput::Text("=A1*2".into()));
        assert!(sheet.config.is_none());
    }

    #[test]
    fn test_build_engine_settles_out_of_order_cells() {
        let sheet: SheetFile = serde_json::from_str(
            r#"{"cells": {"C1": "=B1+1", "B1": "=A1*10", "A1": 3}}"#,
        )
        .expect("parse");
        let engine = build_engine(&sheet, EngineConfig::default()).expect("build");
        let c1 = CellCoordinate::from_a1("C1").expect("coordinate");
        assert_eq!(engine.get_value(c1).expect("read"), Value::Number(31.0));
        assert_eq!(engine.calculation_mode(), CalculationMode::Automatic);
    }

    #[test]
    fn test_bad_cell_reports_context() {
        let sheet: SheetFile =
            serde_yaml::from_str("cells:\n  A1: \"=B1\"\n  B1: \"=A1\"\n").expect("parse");
        let err = build_engine(&sheet, EngineConfig::default())
            .err()
            .expect("cycle must fail");
        assert_eq!(err.to_string(), "Failed to set cell B1");
    }
}
