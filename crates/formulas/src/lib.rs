//! # gridcalc-formulas
//!
//! Formula parsing, optimisation and evaluation, and the [`FormulaEngine`]
//! that keeps a sheet's formula cells consistent with their inputs.
//!
//! ```no_run
//! use gridcalc_formulas::{EngineConfig, FormulaEngine};
//! use gridcalc_primitives::CellCoordinate;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = FormulaEngine::new(EngineConfig::default())?;
//! engine.set_cell_value(CellCoordinate::from_a1("A1")?, 2.0)?;
//! let result = engine.set_cell_formula(CellCoordinate::from_a1("B1")?, "=A1*21")?;
//! assert_eq!(result.value.to_string(), "42");
//! # Ok(())
//! # }
//! ```

pub mod ast;
mod builtins;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod optimizer;
pub mod parser;

pub use ast::{AstNode, BinaryOperator, ComparisonOperator, LogicalOperator, UnaryOperator};
pub use cache::BoundedCache;
pub use config::{CalculationMode, EngineConfig, PerformanceConfig};
pub use engine::{
    CalculationResult, CompiledFormula, EngineStatistics, FormulaEngine, RecalculationStats,
};
pub use error::{ConfigError, FormulaError};
pub use evaluator::{EvaluationContext, Evaluator, EvaluatorStats, StoreResolver, ValueResolver};
pub use functions::{FunctionCategory, FunctionImpl, FunctionInfo, FunctionRegistry};
pub use optimizer::{OptimizationPass, OptimizationResult, Optimizer, OptimizerStats};
pub use parser::{
    parse_formula, try_parse_formula, FormulaParser, ParserStats, MAX_NESTING_DEPTH,
};
