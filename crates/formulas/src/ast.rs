//! Formula syntax tree.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

use gridcalc_dag::Dependency;
use gridcalc_primitives::{CellCoordinate, CellRange, Value};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::functions::FunctionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    /// `%`, remainder with the sign of the divisor.
    Modulo,
    Power,
    Concat,
}

impl BinaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Power => "^",
            BinaryOperator::Concat => "&",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOperator::Concat => 4,
            BinaryOperator::Add | BinaryOperator::Subtract => 5,
            BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Modulo => 6,
            BinaryOperator::Power => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOperator {
    Plus,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl ComparisonOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonOperator::Equal => "=",
            ComparisonOperator::NotEqual => "<>",
            ComparisonOperator::Less => "<",
            ComparisonOperator::LessEqual => "<=",
            ComparisonOperator::Greater => ">",
            ComparisonOperator::GreaterEqual => ">=",
        }
    }
}

/// Keyword logic operators (`a AND b`, `a OR b`, `NOT a`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOperator {
    And,
    Or,
    Not,
}

impl LogicalOperator {
    pub fn keyword(self) -> &'static str {
        match self {
            LogicalOperator::And => "AND",
            LogicalOperator::Or => "OR",
            LogicalOperator::Not => "NOT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AstNode {
    Literal(Value),
    CellRef(CellCoordinate),
    RangeRef(CellRange),
    /// Function names are stored upper-case.
    FunctionCall {
        name: String,
        args: Vec<AstNode>,
    },
    BinaryOp {
        op: BinaryOperator,
        left: Box<AstNode>,
        right: Box<AstNode>,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<AstNode>,
    },
    Comparison {
        op: ComparisonOperator,
        left: Box<AstNode>,
        right: Box<AstNode>,
    },
    /// `AND`/`OR` take two or more operands, `NOT` exactly one.
    Logical {
        op: LogicalOperator,
        args: Vec<AstNode>,
    },
    /// Array literal, one inner vector per row.
    Array(Vec<Vec<AstNode>>),
    /// A formula that failed to parse.
    Error(String),
}

// Rendering precedence of the node kinds that are not binary operators.
const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_COMPARISON: u8 = 3;
const PREC_UNARY: u8 = 8;
const PREC_ATOM: u8 = 9;

impl AstNode {
    pub fn binary(op: BinaryOperator, left: AstNode, right: AstNode) -> Self {
        AstNode::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOperator, operand: AstNode) -> Self {
        AstNode::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn comparison(op: ComparisonOperator, left: AstNode, right: AstNode) -> Self {
        AstNode::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn function(name: impl Into<String>, args: Vec<AstNode>) -> Self {
        AstNode::FunctionCall {
            name: name.into().to_ascii_uppercase(),
            args,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, AstNode::Literal(_))
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            AstNode::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Direct child nodes in evaluation order.
    pub fn children(&self) -> Vec<&AstNode> {
        match self {
            AstNode::Literal(_) | AstNode::CellRef(_) | AstNode::RangeRef(_) | AstNode::Error(_) => {
                Vec::new()
            }
            AstNode::FunctionCall { args, .. } | AstNode::Logical { args, .. } => {
                args.iter().collect()
            }
            AstNode::BinaryOp { left, right, .. } | AstNode::Comparison { left, right, .. } => {
                vec![left.as_ref(), right.as_ref()]
            }
            AstNode::UnaryOp { operand, .. } => vec![operand.as_ref()],
            AstNode::Array(rows) => rows.iter().flatten().collect(),
        }
    }

    /// Cell and range references in first-occurrence order, without duplicates.
    pub fn dependencies(&self) -> Vec<Dependency> {
        let mut found = IndexSet::new();
        self.collect_dependencies(&mut found);
        found.into_iter().collect()
    }

    fn collect_dependencies(&self, found: &mut IndexSet<Dependency>) {
        match self {
            AstNode::CellRef(coord) => {
                found.insert(Dependency::Cell(*coord));
            }
            AstNode::RangeRef(range) => {
                found.insert(Dependency::Range(*range));
            }
            other => {
                for child in other.children() {
                    child.collect_dependencies(found);
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(node.children());
        }
        count
    }

    /// Length of the longest root-to-leaf path. Walks with an explicit
    /// stack, so any tree can be measured.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut pending = vec![(self, 1)];
        while let Some((node, depth)) = pending.pop() {
            deepest = deepest.max(depth);
            pending.extend(node.children().into_iter().map(|child| (child, depth + 1)));
        }
        deepest
    }

    /// Whether any function call in the tree is volatile in `registry`.
    pub fn contains_volatile(&self, registry: &FunctionRegistry) -> bool {
        if let AstNode::FunctionCall { name, .. } = self {
            if registry.is_volatile(name) {
                return true;
            }
        }
        self.children()
            .into_iter()
            .any(|child| child.contains_volatile(registry))
    }

    /// Hash of the tree shape and contents; equal trees hash equally.
    pub fn structural_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    fn hash_into(&self, state: &mut DefaultHasher) {
        std::mem::discriminant(self).hash(state);
        match self {
            AstNode::Literal(value) => hash_value(value, state),
            AstNode::CellRef(coord) => coord.hash(state),
            AstNode::RangeRef(range) => range.hash(state),
            AstNode::FunctionCall { name, args } => {
                name.hash(state);
                args.len().hash(state);
            }
            AstNode::BinaryOp { op, .. } => op.hash(state),
            AstNode::UnaryOp { op, .. } => op.hash(state),
            AstNode::Comparison { op, .. } => op.hash(state),
            AstNode::Logical { op, args } => {
                op.hash(state);
                args.len().hash(state);
            }
            AstNode::Array(rows) => {
                rows.len().hash(state);
                for row in rows {
                    row.len().hash(state);
                }
            }
            AstNode::Error(message) => message.hash(state),
        }
        for child in self.children() {
            child.hash_into(state);
        }
    }

    /// Canonical formula text, including the leading `=`.
    pub fn to_formula(&self) -> String {
        let mut out = String::from("=");
        self.render(&mut out);
        out
    }

    fn precedence(&self) -> u8 {
        match self {
            AstNode::BinaryOp { op, .. } => op.precedence(),
            AstNode::Comparison { .. } => PREC_COMPARISON,
            AstNode::Logical { op: LogicalOperator::Or, .. } => PREC_OR,
            AstNode::Logical { op: LogicalOperator::And, .. } => PREC_AND,
            AstNode::Logical { op: LogicalOperator::Not, .. } | AstNode::UnaryOp { .. } => {
                PREC_UNARY
            }
            AstNode::Literal(Value::Number(n)) if *n < 0.0 => PREC_UNARY,
            _ => PREC_ATOM,
        }
    }

    fn render_child(&self, out: &mut String, min_precedence: u8) {
        if self.precedence() < min_precedence {
            out.push('(');
            self.render(out);
            out.push(')');
        } else {
            self.render(out);
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            AstNode::Literal(value) => render_literal(value, out),
            AstNode::CellRef(coord) => out.push_str(&coord.to_a1()),
            AstNode::RangeRef(range) => out.push_str(&range.to_a1()),
            AstNode::FunctionCall { name, args } => {
                out.push_str(name);
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    arg.render(out);
                }
                out.push(')');
            }
            AstNode::BinaryOp { op, left, right } => {
                let prec = op.precedence();
                // `^` is right-associative, the others associate left.
                let (left_min, right_min) = if *op == BinaryOperator::Power {
                    (prec + 1, prec)
                } else {
                    (prec, prec + 1)
                };
                left.render_child(out, left_min);
                out.push_str(op.symbol());
                right.render_child(out, right_min);
            }
            AstNode::UnaryOp { op, operand } => {
                out.push(match op {
                    UnaryOperator::Plus => '+',
                    UnaryOperator::Negate => '-',
                });
                operand.render_child(out, PREC_UNARY);
            }
            AstNode::Comparison { op, left, right } => {
                left.render_child(out, PREC_COMPARISON);
                out.push_str(op.symbol());
                right.render_child(out, PREC_COMPARISON + 1);
            }
            AstNode::Logical {
                op: LogicalOperator::Not,
                args,
            } => {
                out.push_str("NOT ");
                for arg in args {
                    arg.render_child(out, PREC_UNARY);
                }
            }
            AstNode::Logical { op, args } => {
                let prec = self.precedence();
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        let _ = write!(out, " {} ", op.keyword());
                    }
                    arg.render_child(out, prec + 1);
                }
            }
            AstNode::Array(rows) => {
                out.push('{');
                for (r, row) in rows.iter().enumerate() {
                    if r > 0 {
                        out.push(';');
                    }
                    for (c, item) in row.iter().enumerate() {
                        if c > 0 {
                            out.push(',');
                        }
                        item.render(out);
                    }
                }
                out.push('}');
            }
            AstNode::Error(_) => out.push_str("#ERROR!"),
        }
    }
}

fn render_literal(value: &Value, out: &mut String) {
    match value {
        Value::Text(text) => {
            out.push('"');
            out.push_str(&text.replace('"', "\"\""));
            out.push('"');
        }
        Value::Array(items) => {
            out.push('{');
            let rows = items.iter().all(|item| matches!(item, Value::Array(_)));
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(if rows { ';' } else { ',' });
                }
                match item {
                    Value::Array(row) if rows => {
                        for (j, cell) in row.iter().enumerate() {
                            if j > 0 {
                                out.push(',');
                            }
                            render_literal(cell, out);
                        }
                    }
                    other => render_literal(other, out),
                }
            }
            out.push('}');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn hash_value(value: &Value, state: &mut DefaultHasher) {
    std::mem::discriminant(value).hash(state);
    match value {
        Value::Number(n) => n.to_bits().hash(state),
        Value::Text(s) => s.hash(state),
        Value::Boolean(b) => b.hash(state),
        Value::Error(err) => err.hash(state),
        Value::Array(items) => {
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
    }
}
