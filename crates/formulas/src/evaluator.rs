//! AST evaluation.
//!
//! Evaluation never fails: every problem becomes a [`Value::Error`]. Cell
//! values come from a [`ValueResolver`], so the evaluator never recurses into
//! other formulas; the engine evaluates cells in dependency order instead.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gridcalc_primitives::{CellCoordinate, CellRange, ErrorValue, Value};
use gridcalc_storage::CellStore;
use parking_lot::Mutex;
use serde::Serialize;

use crate::ast::{AstNode, BinaryOperator, ComparisonOperator, LogicalOperator, UnaryOperator};
use crate::cache::BoundedCache;
use crate::functions::FunctionRegistry;
use crate::parser::MAX_NESTING_DEPTH;

/// Source of cell values during evaluation.
pub trait ValueResolver: Send + Sync {
    /// The value of one cell. Empty cells read as `Number(0)`.
    fn resolve(&self, coord: CellCoordinate) -> Value;

    /// Row-major grid of values covering `range`.
    fn resolve_range(&self, range: &CellRange) -> Vec<Vec<Value>> {
        let start = range.start();
        let end = range.end();
        (start.row()..=end.row())
            .map(|row| {
                (start.col()..=end.col())
                    .map(|col| match CellCoordinate::new(row, col) {
                        Ok(coord) => self.resolve(coord),
                        Err(err) => Value::Error(ErrorValue::Ref(err.to_string())),
                    })
                    .collect()
            })
            .collect()
    }
}

impl ValueResolver for HashMap<CellCoordinate, Value> {
    fn resolve(&self, coord: CellCoordinate) -> Value {
        self.get(&coord).cloned().unwrap_or_default()
    }
}

/// Reads values from a [`CellStore`].
pub struct StoreResolver<'a>(pub &'a dyn CellStore);

impl ValueResolver for StoreResolver<'_> {
    fn resolve(&self, coord: CellCoordinate) -> Value {
        match self.0.get_cell(coord) {
            Ok(Some(cell)) => cell.value().clone(),
            Ok(None) => Value::default(),
            Err(err) => Value::Error(ErrorValue::Ref(err.to_string())),
        }
    }

    fn resolve_range(&self, range: &CellRange) -> Vec<Vec<Value>> {
        let start = range.start();
        let mut grid =
            vec![vec![Value::default(); range.col_count() as usize]; range.row_count() as usize];
        match self.0.cells_in_range(range) {
            Ok(cells) => {
                for (coord, cell) in cells {
                    let row = (coord.row() - start.row()) as usize;
                    let col = (coord.col() - start.col()) as usize;
                    grid[row][col] = cell.value().clone();
                }
            }
            Err(err) => {
                let value = Value::Error(ErrorValue::Ref(err.to_string()));
                for row in &mut grid {
                    row.fill(value.clone());
                }
            }
        }
        grid
    }
}

/// Resolver with no cells, used for constant folding.
struct NoCells;

impl ValueResolver for NoCells {
    fn resolve(&self, _: CellCoordinate) -> Value {
        Value::default()
    }
}

/// Per-evaluation state.
pub struct EvaluationContext<'a> {
    resolver: &'a dyn ValueResolver,
    current_cell: Option<CellCoordinate>,
    call_stack: Vec<CellCoordinate>,
    volatile_functions: BTreeSet<String>,
    deadline: Option<Instant>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(resolver: &'a dyn ValueResolver) -> Self {
        Self {
            resolver,
            current_cell: None,
            call_stack: Vec::new(),
            volatile_functions: BTreeSet::new(),
            deadline: None,
        }
    }

    /// Context for evaluating the formula of `cell`; the cell starts on the call stack.
    pub fn for_cell(resolver: &'a dyn ValueResolver, cell: CellCoordinate) -> Self {
        let mut ctx = Self::new(resolver);
        ctx.current_cell = Some(cell);
        ctx.call_stack.push(cell);
        ctx
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn current_cell(&self) -> Option<CellCoordinate> {
        self.current_cell
    }

    pub fn push_cell(&mut self, coord: CellCoordinate) {
        self.call_stack.push(coord);
    }

    pub fn pop_cell(&mut self) -> Option<CellCoordinate> {
        self.call_stack.pop()
    }

    pub fn is_in_call_stack(&self, coord: &CellCoordinate) -> bool {
        self.call_stack.contains(coord)
    }

    /// Volatile functions called so far.
    pub fn volatile_functions(&self) -> &BTreeSet<String> {
        &self.volatile_functions
    }

    pub fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Evaluation stopped before producing a value.
enum Interrupt {
    TimedOut,
    TooDeep,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EvaluatorStats {
    pub evaluations: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub total_time: Duration,
    pub cached_results: usize,
}

/// Tree walker shared by the evaluator and constant folding.
struct Walker<'r> {
    registry: &'r FunctionRegistry,
    max_range_cells: u64,
}

impl Walker<'_> {
    /// Walk with panics downgraded to `#ERROR:` values.
    fn run(&self, ast: &AstNode, ctx: &mut EvaluationContext<'_>) -> Value {
        let depth = ctx.call_stack.len();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.walk(ast, ctx, 1)));
        ctx.call_stack.truncate(depth);
        match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(Interrupt::TimedOut)) => {
                tracing::warn!(cell = ?ctx.current_cell, "calculation timed out");
                Value::Error(ErrorValue::error("calculation timed out"))
            }
            Ok(Err(Interrupt::TooDeep)) => Value::Error(ErrorValue::error(format!(
                "formula nested too deeply (limit {MAX_NESTING_DEPTH})"
            ))),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "evaluation panicked".to_string());
                tracing::warn!(cell = ?ctx.current_cell, %message, "evaluation panicked");
                Value::Error(ErrorValue::error(message))
            }
        }
    }

    fn walk(
        &self,
        node: &AstNode,
        ctx: &mut EvaluationContext<'_>,
        depth: usize,
    ) -> Result<Value, Interrupt> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Interrupt::TooDeep);
        }
        if ctx.timed_out() {
            return Err(Interrupt::TimedOut);
        }
        let value = match node {
            AstNode::Literal(value) => value.clone(),
            AstNode::CellRef(coord) => {
                if ctx.is_in_call_stack(coord) {
                    return Ok(Value::Error(ErrorValue::Circular));
                }
                ctx.push_cell(*coord);
                let value = ctx.resolver.resolve(*coord);
                ctx.pop_cell();
                value
            }
            AstNode::RangeRef(range) => self.range(range, ctx),
            AstNode::FunctionCall { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let value = self.walk(arg, ctx, depth + 1)?;
                    values.push(match value {
                        Value::Array(_) => Value::Array(value.flatten()),
                        scalar => scalar,
                    });
                }
                if self.registry.is_volatile(name) {
                    ctx.volatile_functions.insert(name.clone());
                }
                self.registry.call_function(name, &values)
            }
            AstNode::BinaryOp { op, left, right } => {
                let left = self.walk(left, ctx, depth + 1)?;
                let right = self.walk(right, ctx, depth + 1)?;
                binary(*op, &left, &right)
            }
            AstNode::UnaryOp { op, operand } => {
                let operand = self.walk(operand, ctx, depth + 1)?;
                match operand.as_number() {
                    Ok(n) => match op {
                        UnaryOperator::Plus => finite(n),
                        UnaryOperator::Negate => finite(-n),
                    },
                    Err(err) => Value::Error(err),
                }
            }
            AstNode::Comparison { op, left, right } => {
                let left = self.walk(left, ctx, depth + 1)?;
                let right = self.walk(right, ctx, depth + 1)?;
                compare(*op, &left, &right)
            }
            AstNode::Logical { op, args } => {
                let mut flags = Vec::with_capacity(args.len());
                for arg in args {
                    match self.walk(arg, ctx, depth + 1)?.as_bool() {
                        Ok(flag) => flags.push(flag),
                        Err(err) => return Ok(Value::Error(err)),
                    }
                }
                match op {
                    LogicalOperator::And => Value::Boolean(flags.iter().all(|b| *b)),
                    LogicalOperator::Or => Value::Boolean(flags.iter().any(|b| *b)),
                    LogicalOperator::Not => match flags.as_slice() {
                        [flag] => Value::Boolean(!flag),
                        _ => Value::Error(ErrorValue::error("NOT expects 1 argument(s)")),
                    },
                }
            }
            AstNode::Array(rows) => {
                let mut grid = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut cells = Vec::with_capacity(row.len());
                    for item in row {
                        cells.push(self.walk(item, ctx, depth + 1)?);
                    }
                    grid.push(Value::Array(cells));
                }
                Value::Array(grid)
            }
            AstNode::Error(message) => Value::Error(ErrorValue::error(message.clone())),
        };
        Ok(value)
    }

    fn range(&self, range: &CellRange, ctx: &EvaluationContext<'_>) -> Value {
        let cells = range.cell_count();
        if cells > self.max_range_cells {
            return Value::Error(ErrorValue::Ref(format!(
                "range {range} has {cells} cells, limit is {}",
                self.max_range_cells
            )));
        }
        if ctx.call_stack.iter().any(|coord| range.contains(coord)) {
            return Value::Error(ErrorValue::Circular);
        }
        Value::Array(
            ctx.resolver
                .resolve_range(range)
                .into_iter()
                .map(Value::Array)
                .collect(),
        )
    }
}

fn finite(n: f64) -> Value {
    if n.is_finite() {
        Value::Number(n)
    } else {
        Value::Error(ErrorValue::Num)
    }
}

fn binary(op: BinaryOperator, left: &Value, right: &Value) -> Value {
    if let Value::Error(err) = left {
        return Value::Error(err.clone());
    }
    if let Value::Error(err) = right {
        return Value::Error(err.clone());
    }
    if op == BinaryOperator::Concat {
        if matches!(left, Value::Array(_)) || matches!(right, Value::Array(_)) {
            return Value::Error(ErrorValue::Value);
        }
        return Value::Text(left.as_text() + &right.as_text());
    }
    let (a, b) = match (left.as_number(), right.as_number()) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(err), _) | (_, Err(err)) => return Value::Error(err),
    };
    match op {
        BinaryOperator::Add => finite(a + b),
        BinaryOperator::Subtract => finite(a - b),
        BinaryOperator::Multiply => finite(a * b),
        BinaryOperator::Divide if b == 0.0 => Value::Error(ErrorValue::DivZero),
        BinaryOperator::Divide => finite(a / b),
        BinaryOperator::Modulo if b == 0.0 => Value::Error(ErrorValue::DivZero),
        BinaryOperator::Modulo => finite(a - b * (a / b).floor()),
        BinaryOperator::Power => finite(a.powf(b)),
        BinaryOperator::Concat => Value::Error(ErrorValue::Value),
    }
}

/// Numbers compare numerically, text case-insensitively. Mixed operands
/// compare as numbers when both coerce, otherwise as text.
fn compare(op: ComparisonOperator, left: &Value, right: &Value) -> Value {
    if let Value::Error(err) = left {
        return Value::Error(err.clone());
    }
    if let Value::Error(err) = right {
        return Value::Error(err.clone());
    }
    if matches!(left, Value::Array(_)) || matches!(right, Value::Array(_)) {
        return Value::Error(ErrorValue::Value);
    }
    let ordering = match (left, right) {
        (Value::Text(a), Value::Text(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
        _ => match (left.as_number(), right.as_number()) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => left.as_text().to_lowercase().cmp(&right.as_text().to_lowercase()),
        },
    };
    Value::Boolean(match op {
        ComparisonOperator::Equal => ordering == Ordering::Equal,
        ComparisonOperator::NotEqual => ordering != Ordering::Equal,
        ComparisonOperator::Less => ordering == Ordering::Less,
        ComparisonOperator::LessEqual => ordering != Ordering::Greater,
        ComparisonOperator::Greater => ordering == Ordering::Greater,
        ComparisonOperator::GreaterEqual => ordering != Ordering::Less,
    })
}

/// Evaluate a tree that reads no cells.
pub(crate) fn evaluate_constant(registry: &FunctionRegistry, ast: &AstNode) -> Value {
    let walker = Walker {
        registry,
        max_range_cells: 0,
    };
    let mut ctx = EvaluationContext::new(&NoCells);
    walker.run(ast, &mut ctx)
}

/// Evaluates ASTs with a bounded result cache keyed by (cell, tree hash).
pub struct Evaluator {
    registry: Arc<FunctionRegistry>,
    cache: Mutex<BoundedCache<(CellCoordinate, u64), Value>>,
    stats: Mutex<EvaluatorStats>,
    max_range_cells: u64,
}

impl Evaluator {
    pub fn new(registry: Arc<FunctionRegistry>, cache_size: usize, max_range_cells: u64) -> Self {
        Self {
            registry,
            cache: Mutex::new(BoundedCache::new(cache_size)),
            stats: Mutex::new(EvaluatorStats::default()),
            max_range_cells,
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Evaluate `ast` in `ctx`. Never fails.
    pub fn evaluate(&self, ast: &AstNode, ctx: &mut EvaluationContext<'_>) -> Value {
        let started = Instant::now();
        let key = match ctx.current_cell {
            Some(cell) if !ast.contains_volatile(&self.registry) => {
                Some((cell, ast.structural_hash()))
            }
            _ => None,
        };
        if let Some(key) = &key {
            if let Some(value) = self.cache.lock().get(key).cloned() {
                let mut stats = self.stats.lock();
                stats.cache_hits += 1;
                stats.evaluations += 1;
                stats.total_time += started.elapsed();
                return value;
            }
        }

        let walker = Walker {
            registry: &self.registry,
            max_range_cells: self.max_range_cells,
        };
        let value = walker.run(ast, ctx);

        if let Some(key) = key {
            self.cache.lock().insert(key, value.clone());
        }
        let mut stats = self.stats.lock();
        stats.evaluations += 1;
        if value.is_error() {
            stats.errors += 1;
        }
        stats.total_time += started.elapsed();
        value
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Drop cached results for the given cells.
    pub fn invalidate(&self, cells: &[CellCoordinate]) {
        self.cache
            .lock()
            .retain(|(cell, _), _| !cells.contains(cell));
    }

    pub fn statistics(&self) -> EvaluatorStats {
        EvaluatorStats {
            cached_results: self.cache.lock().len(),
            ..*self.stats.lock()
        }
    }
}
