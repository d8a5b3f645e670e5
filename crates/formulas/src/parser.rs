//! Formula lexer and recursive-descent parser.
//!
//! Precedence, lowest first: `OR`, `AND`, comparison, `&`, `+ -`,
//! `* / %`, `^` (right-associative), unary `+ - NOT`, primary.

use gridcalc_dag::Dependency;
use gridcalc_primitives::{CellCoordinate, CellRange, ErrorValue, Value};
use parking_lot::Mutex;
use serde::Serialize;

use crate::ast::{AstNode, BinaryOperator, ComparisonOperator, LogicalOperator, UnaryOperator};
use crate::cache::BoundedCache;
use crate::error::FormulaError;

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    String(String),
    Boolean(bool),
    CellRef(CellCoordinate),
    RangeRef(CellRange),
    /// A name immediately followed by `(`.
    Function(String),
    Error(ErrorValue),
    And,
    Or,
    Not,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Ampersand,
    LParen,
    RParen,
    Comma,
    Semicolon,
    LBrace,
    RBrace,
    /// Text the lexer could not classify.
    Invalid(String),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

const ERROR_LABELS: [&str; 8] = [
    "#DIV/0!",
    "#N/A",
    "#VALUE!",
    "#REF!",
    "#NAME?",
    "#NUM!",
    "#NULL!",
    "#CIRCULAR!",
];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return tokens;
            }
        }
    }

    fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        let start = self.pos;
        let Some(ch) = self.peek() else {
            return Token {
                kind: TokenKind::Eof,
                pos: start,
            };
        };

        let kind = match ch {
            '(' => self.simple(TokenKind::LParen),
            ')' => self.simple(TokenKind::RParen),
            ',' => self.simple(TokenKind::Comma),
            ';' => self.simple(TokenKind::Semicolon),
            '{' => self.simple(TokenKind::LBrace),
            '}' => self.simple(TokenKind::RBrace),
            '+' => self.simple(TokenKind::Plus),
            '-' => self.simple(TokenKind::Minus),
            '*' => self.simple(TokenKind::Star),
            '/' => self.simple(TokenKind::Slash),
            '%' => self.simple(TokenKind::Percent),
            '^' => self.simple(TokenKind::Caret),
            '&' => self.simple(TokenKind::Ampersand),
            '=' => self.simple(TokenKind::Equal),
            '<' => {
                self.advance();
                if self.consume('=') {
                    TokenKind::LessEqual
                } else if self.consume('>') {
                    TokenKind::NotEqual
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                self.advance();
                if self.consume('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            '"' => self.string_token(),
            '#' => self.error_token(),
            '.' | '0'..='9' => self.number_token(),
            '$' | '_' => self.word_token(),
            c if c.is_ascii_alphabetic() => self.word_token(),
            other => {
                self.advance();
                TokenKind::Invalid(other.to_string())
            }
        };

        Token { kind, pos: start }
    }

    fn simple(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    fn string_token(&mut self) -> TokenKind {
        let start = self.pos;
        self.advance();
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            self.advance();
            if ch == '"' {
                if self.consume('"') {
                    text.push('"');
                    continue;
                }
                return TokenKind::String(text);
            }
            text.push(ch);
        }
        TokenKind::Invalid(self.slice(start, self.pos))
    }

    fn error_token(&mut self) -> TokenKind {
        for label in ERROR_LABELS {
            let len = label.chars().count();
            let candidate = self.slice(self.pos, self.pos + len);
            if candidate.eq_ignore_ascii_case(label) {
                self.pos += len;
                return TokenKind::Error(ErrorValue::from_label(label));
            }
        }
        let start = self.pos;
        self.advance();
        while matches!(self.peek(), Some(ch) if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '!' | '?' | '/')) {
            self.advance();
        }
        TokenKind::Error(ErrorValue::from_label(&self.slice(start, self.pos)))
    }

    fn number_token(&mut self) -> TokenKind {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(ch) = self.peek() {
            match ch {
                '0'..='9' => self.advance(),
                '.' if !seen_dot => {
                    seen_dot = true;
                    self.advance();
                }
                'e' | 'E' => {
                    let sign = matches!(self.peek_at(1), Some('+' | '-'));
                    let digit_at = if sign { 2 } else { 1 };
                    if !matches!(self.peek_at(digit_at), Some('0'..='9')) {
                        break;
                    }
                    self.pos += digit_at;
                    while matches!(self.peek(), Some('0'..='9')) {
                        self.advance();
                    }
                    break;
                }
                _ => break,
            }
        }
        let text = self.slice(start, self.pos);
        match text.parse::<f64>() {
            Ok(value) => TokenKind::Number(value),
            Err(_) => TokenKind::Invalid(text),
        }
    }

    /// Cell reference, range reference, function name, keyword or boolean.
    fn word_token(&mut self) -> TokenKind {
        let start = self.pos;
        if let Some(coord) = self.cell_ref() {
            if self.peek() != Some(':') {
                return TokenKind::CellRef(coord);
            }
            let colon = self.pos;
            self.advance();
            if let Some(end) = self.cell_ref() {
                return TokenKind::RangeRef(CellRange::new(coord, end));
            }
            self.pos = colon;
            return TokenKind::CellRef(coord);
        }
        self.pos = start;

        while matches!(self.peek(), Some(ch) if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '$')) {
            self.advance();
        }
        let word = self.slice(start, self.pos);
        if self.peek() == Some('(') {
            return TokenKind::Function(word.to_ascii_uppercase());
        }
        match word.to_ascii_uppercase().as_str() {
            "TRUE" => TokenKind::Boolean(true),
            "FALSE" => TokenKind::Boolean(false),
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            "NOT" => TokenKind::Not,
            _ => TokenKind::Invalid(word),
        }
    }

    /// Scan `$?letters$?digits`, rewinding when it is not a complete reference.
    fn cell_ref(&mut self) -> Option<CellCoordinate> {
        let start = self.pos;
        self.consume('$');
        let letters = self.pos;
        while matches!(self.peek(), Some(ch) if ch.is_ascii_alphabetic()) {
            self.advance();
        }
        if self.pos == letters {
            self.pos = start;
            return None;
        }
        self.consume('$');
        let digits = self.pos;
        while matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
            self.advance();
        }
        let boundary = !matches!(self.peek(), Some(ch) if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '(' | '.' | '$'));
        if self.pos == digits || !boundary {
            self.pos = start;
            return None;
        }
        match CellCoordinate::from_a1(&self.slice(start, self.pos)) {
            Ok(coord) => Some(coord),
            Err(_) => {
                self.pos = start;
                None
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(ch) if ch.is_whitespace()) {
            self.advance();
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn consume(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn slice(&self, start: usize, end: usize) -> String {
        let end = end.min(self.chars.len());
        self.chars[start.min(end)..end].iter().collect()
    }
}

/// Deepest syntax tree, or bracket nesting, a formula may produce.
pub const MAX_NESTING_DEPTH: usize = 256;

fn too_deep() -> String {
    format!("Formula nested too deeply (limit {MAX_NESTING_DEPTH})")
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
    /// Open recursive descents.
    nesting: usize,
}

/// A node with the depth of the tree rooted at it.
type Parsed = (AstNode, usize);
type ParseResult = Result<Parsed, String>;

fn node(node: AstNode, depth: usize) -> ParseResult {
    if depth > MAX_NESTING_DEPTH {
        return Err(too_deep());
    }
    Ok((node, depth))
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            idx: 0,
            nesting: 0,
        }
    }

    /// Run a nested parse, failing before the stack grows past the limit.
    fn descend<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, String>,
    ) -> Result<T, String> {
        if self.nesting >= MAX_NESTING_DEPTH {
            return Err(too_deep());
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    fn parse_expression(&mut self) -> ParseResult {
        self.descend(Self::parse_or)
    }

    fn parse_or(&mut self) -> ParseResult {
        let first = self.parse_and()?;
        self.parse_keyword_chain(first, &TokenKind::Or, LogicalOperator::Or, Self::parse_and)
    }

    fn parse_and(&mut self) -> ParseResult {
        let first = self.parse_comparison()?;
        self.parse_keyword_chain(
            first,
            &TokenKind::And,
            LogicalOperator::And,
            Self::parse_comparison,
        )
    }

    /// Collect `first KEYWORD x KEYWORD y ...` into one n-ary node.
    fn parse_keyword_chain(
        &mut self,
        first: Parsed,
        keyword: &TokenKind,
        op: LogicalOperator,
        operand: fn(&mut Self) -> ParseResult,
    ) -> ParseResult {
        if self.peek_kind() != keyword {
            return Ok(first);
        }
        let (first, mut depth) = first;
        let mut args = vec![first];
        while self.peek_kind() == keyword {
            self.advance();
            let (arg, arg_depth) = operand(self)?;
            depth = depth.max(arg_depth);
            args.push(arg);
        }
        node(AstNode::Logical { op, args }, depth + 1)
    }

    fn parse_comparison(&mut self) -> ParseResult {
        let (mut expr, mut depth) = self.parse_concat()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Equal => ComparisonOperator::Equal,
                TokenKind::NotEqual => ComparisonOperator::NotEqual,
                TokenKind::Less => ComparisonOperator::Less,
                TokenKind::LessEqual => ComparisonOperator::LessEqual,
                TokenKind::Greater => ComparisonOperator::Greater,
                TokenKind::GreaterEqual => ComparisonOperator::GreaterEqual,
                _ => break,
            };
            self.advance();
            let (right, right_depth) = self.parse_concat()?;
            (expr, depth) = node(
                AstNode::comparison(op, expr, right),
                depth.max(right_depth) + 1,
            )?;
        }
        Ok((expr, depth))
    }

    fn parse_concat(&mut self) -> ParseResult {
        let (mut expr, mut depth) = self.parse_additive()?;
        while matches!(self.peek_kind(), TokenKind::Ampersand) {
            self.advance();
            let (right, right_depth) = self.parse_additive()?;
            (expr, depth) = node(
                AstNode::binary(BinaryOperator::Concat, expr, right),
                depth.max(right_depth) + 1,
            )?;
        }
        Ok((expr, depth))
    }

    fn parse_additive(&mut self) -> ParseResult {
        let (mut expr, mut depth) = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOperator::Add,
                TokenKind::Minus => BinaryOperator::Subtract,
                _ => break,
            };
            self.advance();
            let (right, right_depth) = self.parse_multiplicative()?;
            (expr, depth) = node(AstNode::binary(op, expr, right), depth.max(right_depth) + 1)?;
        }
        Ok((expr, depth))
    }

    fn parse_multiplicative(&mut self) -> ParseResult {
        let (mut expr, mut depth) = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOperator::Multiply,
                TokenKind::Slash => BinaryOperator::Divide,
                TokenKind::Percent => BinaryOperator::Modulo,
                _ => break,
            };
            self.advance();
            let (right, right_depth) = self.parse_power()?;
            (expr, depth) = node(AstNode::binary(op, expr, right), depth.max(right_depth) + 1)?;
        }
        Ok((expr, depth))
    }

    fn parse_power(&mut self) -> ParseResult {
        let (base, base_depth) = self.parse_unary()?;
        if matches!(self.peek_kind(), TokenKind::Caret) {
            self.advance();
            let (exponent, exponent_depth) = self.descend(Self::parse_power)?;
            return node(
                AstNode::binary(BinaryOperator::Power, base, exponent),
                base_depth.max(exponent_depth) + 1,
            );
        }
        Ok((base, base_depth))
    }

    fn parse_unary(&mut self) -> ParseResult {
        let wrap: fn(AstNode) -> AstNode = match self.peek_kind() {
            TokenKind::Plus => |operand| AstNode::unary(UnaryOperator::Plus, operand),
            TokenKind::Minus => |operand| AstNode::unary(UnaryOperator::Negate, operand),
            TokenKind::Not => |operand| AstNode::Logical {
                op: LogicalOperator::Not,
                args: vec![operand],
            },
            _ => return self.parse_primary(),
        };
        self.advance();
        let (operand, depth) = self.descend(Self::parse_unary)?;
        node(wrap(operand), depth + 1)
    }

    fn parse_primary(&mut self) -> ParseResult {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => node(AstNode::Literal(Value::Number(n)), 1),
            TokenKind::String(s) => node(AstNode::Literal(Value::Text(s)), 1),
            TokenKind::Boolean(b) => node(AstNode::Literal(Value::Boolean(b)), 1),
            TokenKind::Error(err) => node(AstNode::Literal(Value::Error(err)), 1),
            TokenKind::CellRef(coord) => node(AstNode::CellRef(coord), 1),
            TokenKind::RangeRef(range) => node(AstNode::RangeRef(range), 1),
            TokenKind::Function(name) => {
                self.expect(&TokenKind::LParen, "'('")?;
                let (args, depth) = self.parse_arguments()?;
                node(AstNode::FunctionCall { name, args }, depth + 1)
            }
            TokenKind::LParen => {
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LBrace => self.parse_array(),
            TokenKind::Invalid(text) => Err(format!(
                "Unexpected '{}' at position {}",
                text, token.pos
            )),
            TokenKind::Eof => Err("Unexpected end of formula".to_string()),
            other => Err(format!(
                "Unexpected token {:?} at position {}",
                other, token.pos
            )),
        }
    }

    /// Arguments up to the closing `)`, with the deepest argument's depth.
    fn parse_arguments(&mut self) -> Result<(Vec<AstNode>, usize), String> {
        let mut args = Vec::new();
        let mut depth = 0;
        if matches!(self.peek_kind(), TokenKind::RParen) {
            self.advance();
            return Ok((args, depth));
        }
        loop {
            let (arg, arg_depth) = self.parse_expression()?;
            depth = depth.max(arg_depth);
            args.push(arg);
            match self.advance().kind {
                TokenKind::Comma | TokenKind::Semicolon => continue,
                TokenKind::RParen => return Ok((args, depth)),
                _ => return Err("Expected ',' or ')' in argument list".to_string()),
            }
        }
    }

    fn parse_array(&mut self) -> ParseResult {
        let mut rows = vec![Vec::new()];
        let mut depth = 0;
        loop {
            let (expr, expr_depth) = self.parse_expression()?;
            depth = depth.max(expr_depth);
            if let Some(row) = rows.last_mut() {
                row.push(expr);
            }
            match self.advance().kind {
                TokenKind::Comma => {}
                TokenKind::Semicolon => rows.push(Vec::new()),
                TokenKind::RBrace => break,
                _ => return Err("Expected ',', ';' or '}' in array".to_string()),
            }
        }
        let width = rows[0].len();
        if rows.iter().any(|row| row.len() != width) {
            return Err("Array rows must have the same length".to_string());
        }
        node(AstNode::Array(rows), depth + 1)
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), String> {
        let token = self.advance();
        if &token.kind == kind {
            Ok(())
        } else {
            Err(format!("Expected {} at position {}", what, token.pos))
        }
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.idx].clone();
        if token.kind != TokenKind::Eof {
            self.idx += 1;
        }
        token
    }
}

/// Parse formula text. Never fails: problems become [`AstNode::Error`].
///
/// Text not starting with `=` is a plain text literal.
pub fn parse_formula(text: &str) -> AstNode {
    let Some(body) = text.trim_start().strip_prefix('=') else {
        return AstNode::Literal(Value::Text(text.to_string()));
    };
    if body.trim().is_empty() {
        return AstNode::Error("Empty formula".to_string());
    }

    let mut parser = Parser::new(Lexer::new(body).tokenize());
    let result = parser.parse_expression().and_then(|(expr, _)| {
        if matches!(parser.peek_kind(), TokenKind::Eof) {
            Ok(expr)
        } else {
            Err(format!(
                "Unexpected trailing input at position {}",
                parser.tokens[parser.idx].pos
            ))
        }
    });
    result.unwrap_or_else(AstNode::Error)
}

/// Like [`parse_formula`] but reports syntax problems as an error.
pub fn try_parse_formula(text: &str) -> Result<AstNode, FormulaError> {
    match parse_formula(text) {
        AstNode::Error(message) => Err(FormulaError::Parse(message)),
        ast => Ok(ast),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParserStats {
    pub parses: u64,
    pub cache_hits: u64,
    pub cached_formulas: usize,
}

/// Parser with bounded caches of trees and dependency lists keyed by text.
#[derive(Debug)]
pub struct FormulaParser {
    asts: Mutex<BoundedCache<String, AstNode>>,
    dependencies: Mutex<BoundedCache<String, Vec<Dependency>>>,
    stats: Mutex<ParserStats>,
}

impl Default for FormulaParser {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl FormulaParser {
    pub fn new(cache_size: usize) -> Self {
        Self {
            asts: Mutex::new(BoundedCache::new(cache_size)),
            dependencies: Mutex::new(BoundedCache::new(cache_size)),
            stats: Mutex::new(ParserStats::default()),
        }
    }

    pub fn parse(&self, text: &str) -> AstNode {
        if let Some(ast) = self.asts.lock().get(&text.to_string()) {
            self.stats.lock().cache_hits += 1;
            return ast.clone();
        }
        let ast = parse_formula(text);
        self.stats.lock().parses += 1;
        self.asts.lock().insert(text.to_string(), ast.clone());
        ast
    }

    pub fn try_parse(&self, text: &str) -> Result<AstNode, FormulaError> {
        match self.parse(text) {
            AstNode::Error(message) => Err(FormulaError::Parse(message)),
            ast => Ok(ast),
        }
    }

    /// Cells and ranges the formula reads.
    pub fn dependencies(&self, text: &str) -> Vec<Dependency> {
        let key = text.to_string();
        if let Some(deps) = self.dependencies.lock().get(&key) {
            return deps.clone();
        }
        let deps = self.parse(text).dependencies();
        self.dependencies.lock().insert(key, deps.clone());
        deps
    }

    pub fn clear_cache(&self) {
        self.asts.lock().clear();
        self.dependencies.lock().clear();
    }

    pub fn statistics(&self) -> ParserStats {
        ParserStats {
            cached_formulas: self.asts.lock().len(),
            ..*self.stats.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(a1: &str) -> CellCoordinate {
        CellCoordinate::from_a1(a1).unwrap()
    }

    fn num(n: f64) -> AstNode {
        AstNode::Literal(Value::Number(n))
    }

    #[test]
    fn test_non_formula_is_text_literal() {
        assert_eq!(
            parse_formula("hello"),
            AstNode::Literal(Value::text("hello"))
        );
        assert_eq!(parse_formula("42"), AstNode::Literal(Value::text("42")));
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            parse_formula("=1+2*3"),
            AstNode::binary(
                BinaryOperator::Add,
                num(1.0),
                AstNode::binary(BinaryOperator::Multiply, num(2.0), num(3.0))
            )
        );
        assert_eq!(
            parse_formula("=2^3^2"),
            AstNode::binary(
                BinaryOperator::Power,
                num(2.0),
                AstNode::binary(BinaryOperator::Power, num(3.0), num(2.0))
            )
        );
        assert_eq!(
            parse_formula("=-2^2"),
            AstNode::binary(
                BinaryOperator::Power,
                AstNode::unary(UnaryOperator::Negate, num(2.0)),
                num(2.0)
            )
        );
    }

    #[test]
    fn test_comparison_binds_looser_than_concat() {
        let ast = parse_formula("=A1&\"x\"=\"ax\"");
        assert!(matches!(
            ast,
            AstNode::Comparison {
                op: ComparisonOperator::Equal,
                ..
            }
        ));
    }

    #[test]
    fn test_logical_keywords() {
        let ast = parse_formula("=A1 OR B1 AND C1 OR NOT D1");
        let AstNode::Logical { op, args } = ast else {
            panic!("expected OR node");
        };
        assert_eq!(op, LogicalOperator::Or);
        assert_eq!(args.len(), 3);
        assert!(matches!(
            &args[1],
            AstNode::Logical {
                op: LogicalOperator::And,
                ..
            }
        ));
        assert!(matches!(
            &args[2],
            AstNode::Logical {
                op: LogicalOperator::Not,
                ..
            }
        ));
    }

    #[test]
    fn test_references() {
        assert_eq!(parse_formula("=$B$2"), AstNode::CellRef(c("B2")));
        assert_eq!(
            parse_formula("=a1:$c$3"),
            AstNode::RangeRef(CellRange::new(c("A1"), c("C3")))
        );
        // A reference-shaped name followed by `(` is a function.
        assert_eq!(
            parse_formula("=LOG10(100)"),
            AstNode::function("LOG10", vec![num(100.0)])
        );
    }

    #[test]
    fn test_strings_errors_and_arrays() {
        assert_eq!(
            parse_formula("=\"say \"\"hi\"\"\""),
            AstNode::Literal(Value::text("say \"hi\""))
        );
        assert_eq!(
            parse_formula("=#DIV/0!"),
            AstNode::Literal(Value::Error(ErrorValue::DivZero))
        );
        assert_eq!(
            parse_formula("=IFERROR(#N/A,1)"),
            AstNode::function(
                "IFERROR",
                vec![AstNode::Literal(Value::Error(ErrorValue::NotAvailable)), num(1.0)]
            )
        );
        assert_eq!(
            parse_formula("={1,2;3,4}"),
            AstNode::Array(vec![vec![num(1.0), num(2.0)], vec![num(3.0), num(4.0)]])
        );
        assert_eq!(parse_formula("=1.5e3"), num(1500.0));
    }

    #[test]
    fn test_modulo_operator() {
        assert_eq!(
            parse_formula("=7%2"),
            AstNode::binary(BinaryOperator::Modulo, num(7.0), num(2.0))
        );
    }

    #[test]
    fn test_syntax_errors_never_panic() {
        for bad in ["=", "=1+", "=SUM(1,", "=(1", "=1 2", "=\"open", "=@", "={1,2;3}", "=foo"] {
            assert!(
                matches!(parse_formula(bad), AstNode::Error(_)),
                "expected error for {bad}"
            );
            assert!(matches!(try_parse_formula(bad), Err(FormulaError::Parse(_))));
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let parens = format!("={}1{}", "(".repeat(50_000), ")".repeat(50_000));
        let negations = format!("={}1", "-".repeat(50_000));
        let chain = format!("=1{}", "+1".repeat(50_000));
        let powers = format!("=2{}", "^2".repeat(50_000));
        let calls = format!("={}1{}", "ABS(".repeat(50_000), ")".repeat(50_000));
        for text in [parens, negations, chain, powers, calls] {
            match parse_formula(&text) {
                AstNode::Error(message) => assert!(message.contains("nested too deeply")),
                other => panic!("expected nesting error, got {:?}", other.node_count()),
            }
            assert!(matches!(try_parse_formula(&text), Err(FormulaError::Parse(_))));
        }
    }

    #[test]
    fn test_nesting_within_limit_parses() {
        let depth = MAX_NESTING_DEPTH - 2;
        let parens = format!("={}1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(parse_formula(&parens), num(1.0));

        let negations = parse_formula(&format!("={}1", "-".repeat(depth)));
        assert_eq!(negations.depth(), depth + 1);

        let chain = parse_formula(&format!("=1{}", "+1".repeat(depth)));
        assert_eq!(chain.depth(), depth + 1);
        assert_eq!(chain.node_count(), 2 * depth + 1);
    }

    #[test]
    fn test_parser_cache() {
        let parser = FormulaParser::new(2);
        parser.parse("=A1+1");
        parser.parse("=A1+1");
        assert_eq!(parser.statistics().cache_hits, 1);
        assert_eq!(parser.dependencies("=A1+B2"), vec![
            Dependency::Cell(c("A1")),
            Dependency::Cell(c("B2")),
        ]);
        parser.parse("=3");
        parser.parse("=4");
        assert_eq!(parser.statistics().cached_formulas, 2);
    }
}
