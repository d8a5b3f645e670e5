//! Cell values and spreadsheet error values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Spreadsheet error carried as a value.
///
/// Errors never abort evaluation; they flow through operators and functions
/// and end up stored in the cell that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorValue {
    /// `#DIV/0!`
    DivZero,
    /// `#VALUE!` (failed coercion)
    Value,
    /// `#NAME: detail` (unknown function or name)
    Name(String),
    /// `#REF: detail` (invalid reference)
    Ref(String),
    /// `#CIRCULAR!`
    Circular,
    /// `#NUM!` (non-finite numeric result)
    Num,
    /// `#N/A`
    NotAvailable,
    /// `#ERROR: detail` (any other evaluation failure)
    Error(String),
    /// Any other `#...` literal written in a formula.
    Literal(String),
}

impl ErrorValue {
    /// Map an error literal such as `#DIV/0!` to its variant.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_uppercase().as_str() {
            "#DIV/0!" => Self::DivZero,
            "#VALUE!" => Self::Value,
            "#CIRCULAR!" => Self::Circular,
            "#NUM!" => Self::Num,
            "#N/A" => Self::NotAvailable,
            "#NAME?" => Self::Name(String::new()),
            "#REF!" => Self::Ref(String::new()),
            _ => Self::Literal(label.to_string()),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self::Error(detail.into())
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DivZero => f.write_str("#DIV/0!"),
            Self::Value => f.write_str("#VALUE!"),
            Self::Name(detail) if detail.is_empty() => f.write_str("#NAME?"),
            Self::Name(detail) => write!(f, "#NAME: {detail}"),
            Self::Ref(detail) if detail.is_empty() => f.write_str("#REF!"),
            Self::Ref(detail) => write!(f, "#REF: {detail}"),
            Self::Circular => f.write_str("#CIRCULAR!"),
            Self::Num => f.write_str("#NUM!"),
            Self::NotAvailable => f.write_str("#N/A"),
            Self::Error(detail) => write!(f, "#ERROR: {detail}"),
            Self::Literal(label) => f.write_str(label),
        }
    }
}

/// A cell value.
///
/// Ranges are arrays of row arrays in row-major order. There is no empty
/// variant: a missing cell reads as `Number(0.0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(#[serde(with = "number_repr")] f64),
    Text(String),
    Boolean(bool),
    Error(ErrorValue),
    Array(Vec<Value>),
}

/// Finite numbers serialize as plain floats. Infinities and NaN, which JSON
/// cannot represent, serialize as the strings `inf`, `-inf` and `NaN`.
mod number_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if n.is_finite() {
            serializer.serialize_f64(*n)
        } else if n.is_nan() {
            serializer.serialize_str("NaN")
        } else if *n > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Finite(f64),
        Special(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Finite(n) => Ok(n),
            Repr::Special(label) => match label.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "NaN" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid number: {other}"))),
            },
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Number(0.0)
    }
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Interpret raw user input: numbers, TRUE/FALSE, error labels, else text.
    pub fn parse_input(input: &str) -> Self {
        let trimmed = input.trim();
        if let Ok(n) = trimmed.parse::<f64>() {
            if n.is_finite() {
                return Value::Number(n);
            }
        }
        if trimmed.eq_ignore_ascii_case("TRUE") {
            return Value::Boolean(true);
        }
        if trimmed.eq_ignore_ascii_case("FALSE") {
            return Value::Boolean(false);
        }
        if trimmed.starts_with('#') && (trimmed.ends_with('!') || trimmed.eq_ignore_ascii_case("#N/A")) {
            return Value::Error(ErrorValue::from_label(trimmed));
        }
        Value::Text(input.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Boolean(_) => "boolean",
            Value::Error(_) => "error",
            Value::Array(_) => "array",
        }
    }

    /// Coerce to a number. Finite numeric text parses, booleans become 1/0.
    pub fn as_number(&self) -> Result<f64, ErrorValue> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(n),
                _ => Err(ErrorValue::Value),
            },
            Value::Error(err) => Err(err.clone()),
            Value::Array(_) => Err(ErrorValue::Value),
        }
    }

    /// Coerce to a boolean. Numbers are true when non-zero.
    pub fn as_bool(&self) -> Result<bool, ErrorValue> {
        match self {
            Value::Boolean(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Text(s) if s.eq_ignore_ascii_case("TRUE") => Ok(true),
            Value::Text(s) if s.eq_ignore_ascii_case("FALSE") => Ok(false),
            Value::Text(_) | Value::Array(_) => Err(ErrorValue::Value),
            Value::Error(err) => Err(err.clone()),
        }
    }

    /// Render as display text (what `&` and text functions see).
    pub fn as_text(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Flatten nested arrays into a single list of scalars.
    pub fn flatten(&self) -> Vec<Value> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<Value>) {
        match self {
            Value::Array(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
            scalar => out.push(scalar.clone()),
        }
    }

    /// Rough heap footprint in bytes, used for memory accounting.
    pub fn heap_size(&self) -> usize {
        match self {
            Value::Text(s) => s.capacity(),
            Value::Error(ErrorValue::Name(s) | ErrorValue::Ref(s))
            | Value::Error(ErrorValue::Error(s) | ErrorValue::Literal(s)) => s.capacity(),
            Value::Array(items) => {
                items.capacity() * std::mem::size_of::<Value>()
                    + items.iter().map(Value::heap_size).sum::<usize>()
            }
            Value::Number(_) | Value::Boolean(_) | Value::Error(_) => 0,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Text(s) => f.write_str(s),
            Value::Boolean(b) => f.write_str(if *b { "TRUE" } else { "FALSE" }),
            Value::Error(err) => write!(f, "{err}"),
            Value::Array(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Integral values print without a fractional part.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<ErrorValue> for Value {
    fn from(err: ErrorValue) -> Self {
        Value::Error(err)
    }
}
