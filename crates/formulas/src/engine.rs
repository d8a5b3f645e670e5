//! The formula engine: ties parser, optimizer, evaluator, dependency graph
//! and storage together.
//!
//! Edits update the graph atomically before anything is stored, so a
//! rejected formula leaves the sheet exactly as it was. Recalculation walks
//! the graph's dirty plan level by level; a level is written to storage
//! before the next one is evaluated.
//!
//! Writes made straight to the shared [`StorageEngine`] bypass the graph.
//! Report them with [`FormulaEngine::notify_cell_changed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gridcalc_dag::{Dependency, DependencyGraph, DependencyKind, GraphExport, GraphStatistics};
use gridcalc_primitives::{Cell, CellCoordinate, ErrorValue, Value};
use gridcalc_storage::{StorageEngine, StorageStats};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ast::AstNode;
use crate::config::{CalculationMode, EngineConfig};
use crate::error::FormulaError;
use crate::evaluator::{EvaluationContext, Evaluator, EvaluatorStats, StoreResolver};
use crate::functions::FunctionRegistry;
use crate::optimizer::{OptimizationPass, Optimizer, OptimizerStats};
use crate::parser::{FormulaParser, ParserStats};

pub type Result<T> = std::result::Result<T, FormulaError>;

/// A parsed, optimised formula ready for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFormula {
    pub text: String,
    /// The optimised tree.
    pub ast: AstNode,
    pub dependencies: Vec<Dependency>,
    pub is_volatile: bool,
    pub passes_applied: Vec<OptimizationPass>,
}

impl CompiledFormula {
    pub fn is_optimized(&self) -> bool {
        !self.passes_applied.is_empty()
    }
}

/// Outcome of an edit or a single-cell calculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationResult {
    pub coordinate: CellCoordinate,
    pub value: Value,
    pub calculation_time: Duration,
    pub dependencies: Vec<Dependency>,
    pub is_error: bool,
    pub error_message: Option<String>,
}

impl CalculationResult {
    fn new(
        coordinate: CellCoordinate,
        value: Value,
        calculation_time: Duration,
        dependencies: Vec<Dependency>,
    ) -> Self {
        let error_message = value.as_error().map(ToString::to_string);
        Self {
            coordinate,
            is_error: error_message.is_some(),
            error_message,
            value,
            calculation_time,
            dependencies,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecalculationStats {
    /// Formula cells evaluated in the pass.
    pub cells_calculated: usize,
    pub total_time: Duration,
    pub errors: usize,
    pub circular_references: usize,
    /// Evaluated formulas whose tree the optimizer changed.
    pub optimizations_applied: usize,
    pub cache_hits: u64,
    /// Cells evaluated on the worker pool.
    pub parallel_calculations: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct EngineCounters {
    formulas_set: u64,
    formulas_rejected: u64,
    recalculations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub formula_cells: usize,
    pub formulas_set: u64,
    pub formulas_rejected: u64,
    pub recalculations: u64,
    pub calculation_mode: CalculationMode,
    pub last_recalculation: RecalculationStats,
    pub graph: GraphStatistics,
    pub parser: ParserStats,
    pub optimizer: OptimizerStats,
    pub evaluator: EvaluatorStats,
    pub storage: StorageStats,
}

/// Clears the in-progress flag when a pass ends, including by error.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

pub struct FormulaEngine {
    config: EngineConfig,
    storage: Arc<StorageEngine>,
    registry: Arc<FunctionRegistry>,
    parser: FormulaParser,
    optimizer: Optimizer,
    evaluator: Evaluator,
    graph: Mutex<DependencyGraph>,
    compiled: Mutex<HashMap<CellCoordinate, Arc<CompiledFormula>>>,
    pool: Option<rayon::ThreadPool>,
    mode: Mutex<CalculationMode>,
    calculating: AtomicBool,
    last_stats: Mutex<RecalculationStats>,
    counters: Mutex<EngineCounters>,
}

impl FormulaEngine {
    /// Engine with its own storage and the builtin functions.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let storage = Arc::new(StorageEngine::new(config.storage.clone()));
        Self::with_parts(config, storage, Arc::new(FunctionRegistry::default()))
    }

    /// Engine over shared storage and a caller-supplied registry.
    pub fn with_parts(
        config: EngineConfig,
        storage: Arc<StorageEngine>,
        registry: Arc<FunctionRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let performance = &config.performance;
        let pool = if performance.parallel_calculation && performance.max_worker_threads > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(performance.max_worker_threads)
                    .thread_name(|i| format!("gridcalc-calc-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        let cache_size = performance.formula_cache_size;
        debug!(
            workers = performance.max_worker_threads,
            parallel = pool.is_some(),
            "formula engine created"
        );
        Ok(Self {
            parser: FormulaParser::new(cache_size),
            optimizer: Optimizer::new(Arc::clone(&registry), cache_size),
            evaluator: Evaluator::new(
                Arc::clone(&registry),
                cache_size,
                performance.max_range_cells,
            ),
            graph: Mutex::new(DependencyGraph::with_max_range_cells(
                performance.max_range_cells,
            )),
            compiled: Mutex::new(HashMap::new()),
            pool,
            mode: Mutex::new(config.calculation_mode),
            calculating: AtomicBool::new(false),
            last_stats: Mutex::new(RecalculationStats::default()),
            counters: Mutex::new(EngineCounters::default()),
            storage,
            registry,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Set a cell from user input. Text starting with `=` is a formula,
    /// anything else is stored as a value.
    ///
    /// Parse errors and circular dependencies are returned as errors and
    /// leave the graph and storage untouched.
    pub fn set_cell_formula(&self, coord: CellCoordinate, text: &str) -> Result<CalculationResult> {
        let formula = text.trim();
        if !formula.starts_with('=') {
            return self.set_cell_value(coord, Value::parse_input(text));
        }
        let text = formula;
        let started = Instant::now();
        let ast = match self.parser.try_parse(text) {
            Ok(ast) => ast,
            Err(err) => {
                warn!(cell = %coord, formula = text, error = %err, "rejected formula");
                self.counters.lock().formulas_rejected += 1;
                return Err(err);
            }
        };
        let dependencies = self.parser.dependencies(text);
        let is_volatile = ast.contains_volatile(&self.registry);
        let edges: Vec<(Dependency, DependencyKind)> = dependencies
            .iter()
            .map(|dep| {
                let kind = match dep {
                    Dependency::Cell(_) => DependencyKind::Direct,
                    Dependency::Range(_) => DependencyKind::Range,
                };
                (*dep, kind)
            })
            .collect();

        {
            let mut graph = self.graph.lock();
            if let Err(err) = graph.set_dependencies(coord, &edges) {
                drop(graph);
                warn!(cell = %coord, formula = text, error = %err, "rejected formula");
                self.counters.lock().formulas_rejected += 1;
                return Err(err.into());
            }
            graph.set_volatile(coord, is_volatile);
        }

        let optimization = self.optimizer.optimize(text, &ast);
        let compiled = Arc::new(CompiledFormula {
            text: text.to_string(),
            ast: optimization.optimized,
            dependencies: dependencies.clone(),
            is_volatile,
            passes_applied: optimization.passes_applied,
        });

        let mut cell = self.storage.get_cell(coord)?.unwrap_or_default();
        cell.set_formula(text);
        self.storage.set_cell(coord, cell)?;
        self.compiled.lock().insert(coord, Arc::clone(&compiled));
        self.invalidate_results(coord);

        let value = self.evaluate_compiled(coord, &compiled);
        self.store_result(coord, value.clone())?;
        self.graph.lock().mark_clean(coord);
        self.counters.lock().formulas_set += 1;
        debug!(cell = %coord, formula = text, value = %value, "formula set");

        self.recalculate_if_automatic()?;
        Ok(CalculationResult::new(
            coord,
            value,
            started.elapsed(),
            dependencies,
        ))
    }

    /// Store a literal value, replacing any formula in the cell.
    pub fn set_cell_value(
        &self,
        coord: CellCoordinate,
        value: impl Into<Value>,
    ) -> Result<CalculationResult> {
        let started = Instant::now();
        let value = value.into();
        self.compiled.lock().remove(&coord);
        {
            let mut graph = self.graph.lock();
            graph.clear_dependencies(coord);
            graph.set_volatile(coord, false);
        }

        let mut cell = self.storage.get_cell(coord)?.unwrap_or_default();
        cell.set_value(value.clone());
        self.storage.set_cell(coord, cell)?;
        self.invalidate_results(coord);
        {
            let mut graph = self.graph.lock();
            graph.mark_dirty(coord, true);
            graph.mark_clean(coord);
        }

        self.recalculate_if_automatic()?;
        Ok(CalculationResult::new(
            coord,
            value,
            started.elapsed(),
            Vec::new(),
        ))
    }

    /// Remove a cell. Its dependents become dirty and read it as empty.
    pub fn delete_cell(&self, coord: CellCoordinate) -> Result<bool> {
        self.compiled.lock().remove(&coord);
        self.invalidate_results(coord);
        {
            let mut graph = self.graph.lock();
            graph.mark_dirty(coord, true);
            graph.mark_clean(coord);
            graph.clear_dependencies(coord);
            graph.set_volatile(coord, false);
            if graph.dependents_of(coord).is_empty() {
                graph.remove_cell(coord);
            }
        }
        let removed = self.storage.delete_cell(coord);
        self.recalculate_if_automatic()?;
        Ok(removed)
    }

    /// Bring the graph up to date after `coord` was written directly
    /// through [`FormulaEngine::storage`], which the engine cannot observe.
    /// Dependents become dirty and, in automatic mode, are recalculated. A
    /// new formula found in the cell is compiled as if entered through
    /// [`FormulaEngine::set_cell_formula`].
    pub fn notify_cell_changed(&self, coord: CellCoordinate) -> Result<()> {
        let formula = self
            .storage
            .get_cell(coord)?
            .and_then(|cell| cell.formula().map(str::to_string));
        let compiled_text = self
            .compiled
            .lock()
            .get(&coord)
            .map(|compiled| compiled.text.clone());

        let is_formula = match formula {
            Some(text) if compiled_text.as_deref() != Some(text.as_str()) => {
                self.set_cell_formula(coord, &text)?;
                return Ok(());
            }
            Some(_) => true,
            None => {
                self.compiled.lock().remove(&coord);
                let mut graph = self.graph.lock();
                graph.clear_dependencies(coord);
                graph.set_volatile(coord, false);
                false
            }
        };

        self.invalidate_results(coord);
        {
            let mut graph = self.graph.lock();
            graph.mark_dirty(coord, true);
            if !is_formula {
                graph.mark_clean(coord);
            }
        }
        debug!(cell = %coord, "external change applied");
        self.recalculate_if_automatic()
    }

    pub fn get_cell(&self, coord: CellCoordinate) -> Result<Option<Cell>> {
        Ok(self.storage.get_cell(coord)?)
    }

    /// The cell's current value; empty cells read as `0`.
    pub fn get_value(&self, coord: CellCoordinate) -> Result<Value> {
        Ok(self
            .storage
            .get_cell(coord)?
            .map(|cell| cell.value().clone())
            .unwrap_or_default())
    }

    pub fn compiled_formula(&self, coord: CellCoordinate) -> Option<Arc<CompiledFormula>> {
        self.compiled.lock().get(&coord).cloned()
    }

    /// Evaluate one cell now and store the result. Value cells report
    /// their stored value.
    pub fn calculate_cell(&self, coord: CellCoordinate) -> Result<CalculationResult> {
        let started = Instant::now();
        let compiled = self.compiled.lock().get(&coord).cloned();
        let Some(compiled) = compiled else {
            let value = self.get_value(coord)?;
            return Ok(CalculationResult::new(
                coord,
                value,
                started.elapsed(),
                Vec::new(),
            ));
        };
        let value = self.evaluate_compiled(coord, &compiled);
        self.store_result(coord, value.clone())?;
        self.graph.lock().mark_clean(coord);
        Ok(CalculationResult::new(
            coord,
            value,
            started.elapsed(),
            compiled.dependencies.clone(),
        ))
    }

    /// Recalculate dirty cells and every volatile cell.
    pub fn recalculate_dirty(&self) -> Result<RecalculationStats> {
        self.run_pass(false)
    }

    /// Recalculate every formula cell.
    pub fn recalculate_all(&self) -> Result<RecalculationStats> {
        self.run_pass(true)
    }

    pub fn last_recalculation(&self) -> RecalculationStats {
        self.last_stats.lock().clone()
    }

    pub fn is_dirty(&self, coord: CellCoordinate) -> bool {
        self.graph.lock().is_dirty(coord)
    }

    pub fn dirty_cells(&self) -> Vec<CellCoordinate> {
        self.graph.lock().dirty_cells()
    }

    pub fn calculation_mode(&self) -> CalculationMode {
        *self.mode.lock()
    }

    /// Switch modes. Entering automatic mode recalculates pending cells.
    pub fn set_calculation_mode(&self, mode: CalculationMode) -> Result<()> {
        let previous = std::mem::replace(&mut *self.mode.lock(), mode);
        debug!(?previous, ?mode, "calculation mode changed");
        if previous == CalculationMode::Manual && mode == CalculationMode::Automatic {
            self.recalculate_dirty()?;
        }
        Ok(())
    }

    pub fn clear_caches(&self) {
        self.parser.clear_cache();
        self.optimizer.clear_cache();
        self.evaluator.clear_cache();
    }

    pub fn export_graph(&self) -> GraphExport {
        self.graph.lock().export()
    }

    pub fn statistics(&self) -> EngineStatistics {
        let counters = *self.counters.lock();
        EngineStatistics {
            formula_cells: self.compiled.lock().len(),
            formulas_set: counters.formulas_set,
            formulas_rejected: counters.formulas_rejected,
            recalculations: counters.recalculations,
            calculation_mode: self.calculation_mode(),
            last_recalculation: self.last_recalculation(),
            graph: self.graph.lock().statistics(),
            parser: self.parser.statistics(),
            optimizer: self.optimizer.statistics(),
            evaluator: self.evaluator.statistics(),
            storage: self.storage.statistics(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.performance.calculation_timeout_ms)
    }

    fn evaluate_compiled(&self, coord: CellCoordinate, compiled: &CompiledFormula) -> Value {
        let resolver = StoreResolver(self.storage.as_ref());
        let mut ctx = EvaluationContext::for_cell(&resolver, coord).with_timeout(self.timeout());
        self.evaluator.evaluate(&compiled.ast, &mut ctx)
    }

    fn store_result(&self, coord: CellCoordinate, value: Value) -> Result<()> {
        self.storage
            .update_cell(coord, |cell| cell.set_computed_value(value))?;
        Ok(())
    }

    /// Drop cached results of `coord` and everything that reads it.
    fn invalidate_results(&self, coord: CellCoordinate) {
        let mut cells = self.graph.lock().transitive_dependents(coord);
        cells.push(coord);
        self.evaluator.invalidate(&cells);
    }

    fn recalculate_if_automatic(&self) -> Result<()> {
        if self.calculation_mode() == CalculationMode::Automatic {
            self.recalculate_dirty()?;
        }
        Ok(())
    }

    fn run_pass(&self, everything: bool) -> Result<RecalculationStats> {
        if self.calculating.swap(true, AtomicOrdering::AcqRel) {
            debug!("recalculation already running; returning previous statistics");
            return Ok(self.last_recalculation());
        }
        let _pass = PassGuard(&self.calculating);
        let started = Instant::now();
        self.evaluator.clear_cache();
        let hits_before = self.evaluator.statistics().cache_hits;

        let formula_cells: Vec<CellCoordinate> = if everything {
            self.compiled.lock().keys().copied().collect()
        } else {
            Vec::new()
        };
        let batches = {
            let mut graph = self.graph.lock();
            let mut detached = Vec::new();
            for coord in formula_cells {
                if graph.contains(coord) {
                    graph.mark_dirty(coord, false);
                } else {
                    detached.push(coord);
                }
            }
            graph.mark_volatile_dirty();
            let mut batches = graph.recalculation_batches()?;
            // Formulas without any edges are absent from the graph.
            if !detached.is_empty() {
                detached.sort();
                batches.insert(0, detached);
            }
            batches
        };

        let mut stats = RecalculationStats::default();
        for batch in batches {
            let work: Vec<(CellCoordinate, Arc<CompiledFormula>)> = {
                let compiled = self.compiled.lock();
                batch
                    .iter()
                    .filter_map(|coord| compiled.get(coord).map(|f| (*coord, Arc::clone(f))))
                    .collect()
            };
            let parallel = self
                .pool
                .as_ref()
                .filter(|_| work.len() >= self.config.performance.parallel_threshold.max(2));
            let results: Vec<Value> = match parallel {
                Some(pool) => {
                    stats.parallel_calculations += work.len();
                    pool.install(|| {
                        work.par_iter()
                            .map(|(coord, formula)| self.evaluate_compiled(*coord, formula))
                            .collect()
                    })
                }
                None => work
                    .iter()
                    .map(|(coord, formula)| self.evaluate_compiled(*coord, formula))
                    .collect(),
            };

            for ((coord, formula), value) in work.iter().zip(results) {
                if let Value::Error(err) = &value {
                    stats.errors += 1;
                    if *err == ErrorValue::Circular {
                        stats.circular_references += 1;
                    }
                }
                if formula.is_optimized() {
                    stats.optimizations_applied += 1;
                }
                self.store_result(*coord, value)?;
                stats.cells_calculated += 1;
            }
            let mut graph = self.graph.lock();
            for coord in &batch {
                graph.mark_clean(*coord);
            }
        }

        stats.cache_hits = self
            .evaluator
            .statistics()
            .cache_hits
            .saturating_sub(hits_before);
        stats.total_time = started.elapsed();
        info!(
            cells = stats.cells_calculated,
            errors = stats.errors,
            parallel = stats.parallel_calculations,
            elapsed_ms = stats.total_time.as_millis() as u64,
            "recalculation finished"
        );
        *self.last_stats.lock() = stats.clone();
        self.counters.lock().recalculations += 1;
        Ok(stats)
    }
}
