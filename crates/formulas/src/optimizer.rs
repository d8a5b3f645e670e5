//! AST optimisation passes.
//!
//! Passes run in a fixed order and each rewrites the tree bottom-up:
//! constant folding, algebraic identities, then boolean and `IF`
//! simplification. A rewrite that drops an operand never drops a subtree
//! containing a volatile call.

use std::sync::Arc;

use gridcalc_primitives::Value;
use parking_lot::Mutex;
use serde::Serialize;

use crate::ast::{AstNode, BinaryOperator, LogicalOperator, UnaryOperator};
use crate::cache::BoundedCache;
use crate::evaluator::evaluate_constant;
use crate::functions::FunctionRegistry;
use crate::parser::MAX_NESTING_DEPTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OptimizationPass {
    ConstantFolding,
    AlgebraicSimplification,
    ExpressionSimplification,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub original: AstNode,
    pub optimized: AstNode,
    /// Passes that changed the tree, in the order they ran.
    pub passes_applied: Vec<OptimizationPass>,
    pub nodes_before: usize,
    pub nodes_after: usize,
}

impl OptimizationResult {
    pub fn size_reduction(&self) -> usize {
        self.nodes_before.saturating_sub(self.nodes_after)
    }

    pub fn changed(&self) -> bool {
        !self.passes_applied.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OptimizerStats {
    pub optimizations: u64,
    pub trees_changed: u64,
    pub nodes_removed: u64,
    pub cache_hits: u64,
    pub cached_results: usize,
}

pub struct Optimizer {
    registry: Arc<FunctionRegistry>,
    cache: Mutex<BoundedCache<String, OptimizationResult>>,
    stats: Mutex<OptimizerStats>,
}

fn map_children(node: &AstNode, f: &dyn Fn(&AstNode) -> AstNode) -> AstNode {
    match node {
        AstNode::Literal(_) | AstNode::CellRef(_) | AstNode::RangeRef(_) | AstNode::Error(_) => {
            node.clone()
        }
        AstNode::FunctionCall { name, args } => AstNode::FunctionCall {
            name: name.clone(),
            args: args.iter().map(f).collect(),
        },
        AstNode::BinaryOp { op, left, right } => AstNode::binary(*op, f(&**left), f(&**right)),
        AstNode::UnaryOp { op, operand } => AstNode::unary(*op, f(&**operand)),
        AstNode::Comparison { op, left, right } => AstNode::comparison(*op, f(&**left), f(&**right)),
        AstNode::Logical { op, args } => AstNode::Logical {
            op: *op,
            args: args.iter().map(f).collect(),
        },
        AstNode::Array(rows) => AstNode::Array(
            rows.iter()
                .map(|row| row.iter().map(f).collect())
                .collect(),
        ),
    }
}

fn is_number(node: &AstNode, n: f64) -> bool {
    matches!(node, AstNode::Literal(Value::Number(v)) if *v == n)
}

fn as_bool_literal(node: &AstNode) -> Option<bool> {
    match node {
        AstNode::Literal(Value::Boolean(b)) => Some(*b),
        _ => None,
    }
}

impl Optimizer {
    pub fn new(registry: Arc<FunctionRegistry>, cache_size: usize) -> Self {
        Self {
            registry,
            cache: Mutex::new(BoundedCache::new(cache_size)),
            stats: Mutex::new(OptimizerStats::default()),
        }
    }

    /// Optimise the tree parsed from `formula_text`, reusing a cached result.
    pub fn optimize(&self, formula_text: &str, ast: &AstNode) -> OptimizationResult {
        let key = formula_text.to_string();
        if let Some(result) = self.cache.lock().get(&key).cloned() {
            self.stats.lock().cache_hits += 1;
            return result;
        }
        let result = self.optimize_ast(ast);
        self.cache.lock().insert(key, result.clone());
        result
    }

    /// Run every pass over `ast` without consulting the cache. Trees
    /// deeper than [`MAX_NESTING_DEPTH`] are returned unchanged.
    pub fn optimize_ast(&self, ast: &AstNode) -> OptimizationResult {
        let depth = ast.depth();
        if depth > MAX_NESTING_DEPTH {
            tracing::debug!(depth, "tree too deep to optimize");
            self.stats.lock().optimizations += 1;
            let nodes = ast.node_count();
            return OptimizationResult {
                original: ast.clone(),
                optimized: ast.clone(),
                passes_applied: Vec::new(),
                nodes_before: nodes,
                nodes_after: nodes,
            };
        }
        let mut passes_applied = Vec::new();
        let mut current = ast.clone();
        for pass in [
            OptimizationPass::ConstantFolding,
            OptimizationPass::AlgebraicSimplification,
            OptimizationPass::ExpressionSimplification,
        ] {
            let next = match pass {
                OptimizationPass::ConstantFolding => self.fold_constants(&current),
                OptimizationPass::AlgebraicSimplification => self.simplify_algebra(&current),
                OptimizationPass::ExpressionSimplification => self.simplify_expression(&current),
            };
            if next != current {
                passes_applied.push(pass);
                current = next;
            }
        }

        let result = OptimizationResult {
            nodes_before: ast.node_count(),
            nodes_after: current.node_count(),
            original: ast.clone(),
            optimized: current,
            passes_applied,
        };
        let mut stats = self.stats.lock();
        stats.optimizations += 1;
        if result.changed() {
            stats.trees_changed += 1;
            stats.nodes_removed += result.size_reduction() as u64;
            tracing::debug!(
                formula = %result.original.to_formula(),
                optimized = %result.optimized.to_formula(),
                "optimized formula"
            );
        }
        result
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn statistics(&self) -> OptimizerStats {
        OptimizerStats {
            cached_results: self.cache.lock().len(),
            ..*self.stats.lock()
        }
    }

    fn is_volatile(&self, node: &AstNode) -> bool {
        node.contains_volatile(&self.registry)
    }

    fn fold_constants(&self, node: &AstNode) -> AstNode {
        let node = map_children(node, &|child| self.fold_constants(child));
        let foldable = match &node {
            AstNode::BinaryOp { .. }
            | AstNode::UnaryOp { .. }
            | AstNode::Comparison { .. }
            | AstNode::Logical { .. } => true,
            AstNode::FunctionCall { name, .. } => {
                self.registry.has_function(name) && !self.registry.is_volatile(name)
            }
            _ => false,
        };
        if !foldable || !node.children().into_iter().all(AstNode::is_literal) {
            return node;
        }
        match evaluate_constant(&self.registry, &node) {
            Value::Error(_) | Value::Array(_) => node,
            value => AstNode::Literal(value),
        }
    }

    fn simplify_algebra(&self, node: &AstNode) -> AstNode {
        let node = map_children(node, &|child| self.simplify_algebra(child));
        match node {
            AstNode::BinaryOp { op, left, right } => {
                match op {
                    BinaryOperator::Add if is_number(&right, 0.0) => *left,
                    BinaryOperator::Add if is_number(&left, 0.0) => *right,
                    BinaryOperator::Subtract if is_number(&right, 0.0) => *left,
                    BinaryOperator::Multiply if is_number(&right, 0.0) && !self.is_volatile(&left) => {
                        AstNode::Literal(Value::Number(0.0))
                    }
                    BinaryOperator::Multiply if is_number(&left, 0.0) && !self.is_volatile(&right) => {
                        AstNode::Literal(Value::Number(0.0))
                    }
                    BinaryOperator::Multiply if is_number(&right, 1.0) => *left,
                    BinaryOperator::Multiply if is_number(&left, 1.0) => *right,
                    BinaryOperator::Divide if is_number(&right, 1.0) => *left,
                    BinaryOperator::Power if is_number(&right, 0.0) && !self.is_volatile(&left) => {
                        AstNode::Literal(Value::Number(1.0))
                    }
                    BinaryOperator::Power if is_number(&right, 1.0) => *left,
                    BinaryOperator::Power if is_number(&left, 1.0) && !self.is_volatile(&right) => {
                        AstNode::Literal(Value::Number(1.0))
                    }
                    _ => AstNode::BinaryOp { op, left, right },
                }
            }
            AstNode::UnaryOp {
                op: UnaryOperator::Plus,
                operand,
            } => *operand,
            AstNode::UnaryOp {
                op: UnaryOperator::Negate,
                operand,
            } => match *operand {
                AstNode::UnaryOp {
                    op: UnaryOperator::Negate,
                    operand: inner,
                } => *inner,
                other => AstNode::unary(UnaryOperator::Negate, other),
            },
            other => other,
        }
    }

    fn simplify_expression(&self, node: &AstNode) -> AstNode {
        let node = map_children(node, &|child| self.simplify_expression(child));
        match node {
            AstNode::Logical {
                op: op @ (LogicalOperator::And | LogicalOperator::Or),
                args,
            } => {
                // AND is decided by a FALSE operand, OR by a TRUE one.
                let decisive = op == LogicalOperator::Or;
                let rest: Vec<&AstNode> = args
                    .iter()
                    .filter(|arg| as_bool_literal(arg).is_none())
                    .collect();
                let has_decisive = args.iter().any(|arg| as_bool_literal(arg) == Some(decisive));
                if has_decisive && !rest.iter().any(|arg| self.is_volatile(arg)) {
                    return AstNode::Literal(Value::Boolean(decisive));
                }
                if has_decisive {
                    return AstNode::Logical { op, args };
                }
                if rest.is_empty() {
                    return AstNode::Literal(Value::Boolean(!decisive));
                }
                AstNode::Logical {
                    op,
                    args: rest.into_iter().cloned().collect(),
                }
            }
            AstNode::Logical {
                op: LogicalOperator::Not,
                args,
            } => match args.as_slice() {
                [arg] => match as_bool_literal(arg) {
                    Some(b) => AstNode::Literal(Value::Boolean(!b)),
                    None => AstNode::Logical {
                        op: LogicalOperator::Not,
                        args,
                    },
                },
                _ => AstNode::Logical {
                    op: LogicalOperator::Not,
                    args,
                },
            },
            AstNode::FunctionCall { name, args } if name == "IF" && (2..=3).contains(&args.len()) => {
                let condition = match &args[0] {
                    AstNode::Literal(value) if !value.is_error() => value.as_bool().ok(),
                    _ => None,
                };
                let Some(condition) = condition else {
                    return AstNode::FunctionCall { name, args };
                };
                let (taken, dropped) = if condition { (1, 2) } else { (2, 1) };
                if args.get(dropped).is_some_and(|branch| self.is_volatile(branch)) {
                    return AstNode::FunctionCall { name, args };
                }
                args.into_iter()
                    .nth(taken)
                    .unwrap_or(AstNode::Literal(Value::Boolean(false)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_formula;
    use gridcalc_primitives::CellCoordinate;

    fn optimizer() -> Optimizer {
        Optimizer::new(Arc::new(FunctionRegistry::default()), 100)
    }

    fn optimized(formula: &str) -> AstNode {
        optimizer().optimize_ast(&parse_formula(formula)).optimized
    }

    fn cell(a1: &str) -> AstNode {
        AstNode::CellRef(CellCoordinate::from_a1(a1).expect("valid coordinate"))
    }

    #[test]
    fn test_constant_folding() {
        let result = optimizer().optimize_ast(&parse_formula("=2+3"));
        assert_eq!(result.optimized, AstNode::Literal(Value::Number(5.0)));
        assert_eq!(result.passes_applied, vec![OptimizationPass::ConstantFolding]);
        assert_eq!(result.size_reduction(), 2);
        assert_eq!(optimized("=SUM(1,2)*A1"), parse_formula("=3*A1"));
        assert_eq!(optimized("=\"a\"&\"b\""), AstNode::Literal(Value::text("ab")));
    }

    #[test]
    fn test_errors_and_arrays_not_folded() {
        assert_eq!(optimized("=1/0"), parse_formula("=1/0"));
        assert_eq!(optimized("=SUM({1,2})"), parse_formula("=SUM({1,2})"));
    }

    #[test]
    fn test_volatile_subtrees_untouched() {
        assert_eq!(optimized("=RAND()*0"), parse_formula("=RAND()*0"));
        assert_eq!(optimized("=NOW()^0"), parse_formula("=NOW()^0"));
        assert_eq!(optimized("=NOW()+(1+2)"), parse_formula("=NOW()+3"));
        assert_eq!(optimized("=RAND()*1"), parse_formula("=RAND()"));
    }

    #[test]
    fn test_algebraic_identities() {
        for formula in ["=A1+0", "=0+A1", "=A1-0", "=A1*1", "=1*A1", "=A1/1", "=A1^1", "=--A1", "=+A1"] {
            assert_eq!(optimized(formula), cell("A1"), "{formula}");
        }
        assert_eq!(optimized("=A1*0"), AstNode::Literal(Value::Number(0.0)));
        assert_eq!(optimized("=1^A1"), AstNode::Literal(Value::Number(1.0)));
        assert_eq!(optimized("=A1-A1"), parse_formula("=A1-A1"));
    }

    #[test]
    fn test_expression_simplification() {
        assert_eq!(optimized("=IF(TRUE, A1, B1)"), cell("A1"));
        let result = optimizer().optimize_ast(&parse_formula("=IF(1>2, A1, B1)"));
        assert_eq!(result.optimized, cell("B1"));
        assert_eq!(
            result.passes_applied,
            vec![
                OptimizationPass::ConstantFolding,
                OptimizationPass::ExpressionSimplification
            ]
        );
        assert_eq!(
            optimized("=IF(FALSE, A1)"),
            AstNode::Literal(Value::Boolean(false))
        );
        assert_eq!(optimized("=A1 OR TRUE"), AstNode::Literal(Value::Boolean(true)));
        assert_eq!(optimized("=A1 AND FALSE"), AstNode::Literal(Value::Boolean(false)));
        assert_eq!(
            optimized("=A1 AND TRUE AND B1"),
            AstNode::Logical {
                op: LogicalOperator::And,
                args: vec![cell("A1"), cell("B1")],
            }
        );
        assert_eq!(
            optimized("=IF(TRUE, A1, RAND())"),
            parse_formula("=IF(TRUE, A1, RAND())")
        );
    }

    #[test]
    fn test_too_deep_tree_left_unchanged() {
        let deep = (0..1_000).fold(AstNode::Literal(Value::Number(1.0)), |node, _| {
            AstNode::unary(UnaryOperator::Negate, node)
        });
        let result = optimizer().optimize_ast(&deep);
        assert!(!result.changed());
        assert_eq!(result.nodes_before, 1_001);
        assert_eq!(result.optimized, deep);

        let shallow = (0..10).fold(AstNode::Literal(Value::Number(1.0)), |node, _| {
            AstNode::unary(UnaryOperator::Negate, node)
        });
        assert_eq!(
            optimizer().optimize_ast(&shallow).optimized,
            AstNode::Literal(Value::Number(1.0))
        );
    }

    #[test]
    fn test_optimize_cache() {
        let optimizer = optimizer();
        let ast = parse_formula("=1+1");
        let first = optimizer.optimize("=1+1", &ast);
        let second = optimizer.optimize("=1+1", &ast);
        assert_eq!(first, second);
        let stats = optimizer.statistics();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.optimizations, 1);
        assert_eq!(stats.cached_results, 1);
        optimizer.clear_cache();
        assert_eq!(optimizer.statistics().cached_results, 0);
    }
}
