//! Builtin spreadsheet functions.
//!
//! Range arguments arrive as flattened arrays. Inside arrays only numbers
//! take part in numeric aggregates; scalar arguments are coerced.

use chrono::{Local, NaiveDate, NaiveDateTime};
use gridcalc_primitives::{ErrorValue, Value};
use rand::Rng;

use crate::functions::{FunctionCategory, FunctionInfo, FunctionRegistry};

pub(crate) fn register_builtins(registry: &FunctionRegistry) {
    use FunctionCategory::{DateTime, Information, Logical, Math, Random, Statistical, Text};

    let table: Vec<FunctionInfo> = vec![
        FunctionInfo::new("SUM", Math, sum).args(1, None).description("Sum of numbers"),
        FunctionInfo::new("AVERAGE", Math, average).args(1, None).description("Arithmetic mean"),
        FunctionInfo::new("COUNT", Math, count).args(1, None).description("Count of numbers"),
        FunctionInfo::new("COUNTA", Math, counta).args(1, None).description("Count of non-empty values"),
        FunctionInfo::new("MAX", Math, max).args(1, None),
        FunctionInfo::new("MIN", Math, min).args(1, None),
        FunctionInfo::new("PRODUCT", Math, product).args(1, None),
        FunctionInfo::new("ABS", Math, abs).args(1, Some(1)),
        FunctionInfo::new("ROUND", Math, round).args(1, Some(2)),
        FunctionInfo::new("INT", Math, int).args(1, Some(1)).description("Round down to an integer"),
        FunctionInfo::new("MOD", Math, mod_fn).args(2, Some(2)),
        FunctionInfo::new("POWER", Math, power).args(2, Some(2)),
        FunctionInfo::new("SQRT", Math, sqrt).args(1, Some(1)),
        FunctionInfo::new("PI", Math, |_: &[Value]| Value::Number(std::f64::consts::PI)).args(0, Some(0)),
        FunctionInfo::new("EXP", Math, exp).args(1, Some(1)),
        FunctionInfo::new("LN", Math, ln).args(1, Some(1)),
        FunctionInfo::new("LOG10", Math, log10).args(1, Some(1)),
        FunctionInfo::new("SIGN", Math, sign).args(1, Some(1)),
        FunctionInfo::new("MEDIAN", Statistical, median).args(1, None),
        FunctionInfo::new("STDEV", Statistical, stdev).args(1, None).description("Sample standard deviation"),
        FunctionInfo::new("VAR", Statistical, var).args(1, None).description("Sample variance"),
        FunctionInfo::new("IF", Logical, if_fn).args(2, Some(3)),
        FunctionInfo::new("AND", Logical, and_fn).args(1, None),
        FunctionInfo::new("OR", Logical, or_fn).args(1, None),
        FunctionInfo::new("NOT", Logical, not_fn).args(1, Some(1)),
        FunctionInfo::new("IFERROR", Logical, iferror).args(2, Some(2)),
        FunctionInfo::new("CONCAT", Text, concat).args(1, None),
        FunctionInfo::new("CONCATENATE", Text, concat).args(1, None),
        FunctionInfo::new("LEN", Text, len).args(1, Some(1)),
        FunctionInfo::new("LEFT", Text, left).args(1, Some(2)),
        FunctionInfo::new("RIGHT", Text, right).args(1, Some(2)),
        FunctionInfo::new("MID", Text, mid).args(3, Some(3)),
        FunctionInfo::new("UPPER", Text, upper).args(1, Some(1)),
        FunctionInfo::new("LOWER", Text, lower).args(1, Some(1)),
        FunctionInfo::new("TRIM", Text, trim).args(1, Some(1)),
        FunctionInfo::new("NOW", DateTime, now).args(0, Some(0)).volatile().description("Current date and time as a serial number"),
        FunctionInfo::new("TODAY", DateTime, today).args(0, Some(0)).volatile(),
        FunctionInfo::new("RAND", Random, rand_fn).args(0, Some(0)).volatile(),
        FunctionInfo::new("RANDBETWEEN", Random, randbetween).args(2, Some(2)).volatile(),
        FunctionInfo::new("ISNUMBER", Information, isnumber).args(1, Some(1)),
        FunctionInfo::new("ISTEXT", Information, istext).args(1, Some(1)),
        FunctionInfo::new("ISERROR", Information, iserror).args(1, Some(1)),
    ];
    for info in table {
        registry.register_function(info);
    }
}

fn number_result(n: f64) -> Value {
    if n.is_finite() {
        Value::Number(n)
    } else {
        Value::Error(ErrorValue::Num)
    }
}

/// Numbers for aggregates. Errors anywhere propagate.
fn collect_numbers(values: &[Value]) -> Result<Vec<f64>, ErrorValue> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Number(n) => out.push(*n),
                        Value::Error(err) => return Err(err.clone()),
                        Value::Array(_) => out.extend(collect_numbers(std::slice::from_ref(item))?),
                        Value::Text(_) | Value::Boolean(_) => {}
                    }
                }
            }
            scalar => out.push(scalar.as_number()?),
        }
    }
    Ok(out)
}

fn with_numbers(values: &[Value], f: impl FnOnce(Vec<f64>) -> Value) -> Value {
    match collect_numbers(values) {
        Ok(numbers) => f(numbers),
        Err(err) => Value::Error(err),
    }
}

fn number_arg(values: &[Value], idx: usize) -> Result<f64, ErrorValue> {
    values.get(idx).map_or(Err(ErrorValue::Value), Value::as_number)
}

fn text_arg(values: &[Value], idx: usize) -> Result<String, ErrorValue> {
    match values.get(idx) {
        Some(Value::Error(err)) => Err(err.clone()),
        Some(Value::Array(_)) | None => Err(ErrorValue::Value),
        Some(value) => Ok(value.as_text()),
    }
}

fn unary_math(values: &[Value], f: impl FnOnce(f64) -> Value) -> Value {
    match number_arg(values, 0) {
        Ok(n) => f(n),
        Err(err) => Value::Error(err),
    }
}

pub fn sum(values: &[Value]) -> Value {
    with_numbers(values, |numbers| number_result(numbers.iter().sum()))
}

pub fn average(values: &[Value]) -> Value {
    with_numbers(values, |numbers| {
        if numbers.is_empty() {
            return Value::Error(ErrorValue::DivZero);
        }
        number_result(numbers.iter().sum::<f64>() / numbers.len() as f64)
    })
}

pub fn count(values: &[Value]) -> Value {
    let total = values
        .iter()
        .flat_map(Value::flatten)
        .filter(|value| matches!(value, Value::Number(_)))
        .count();
    Value::Number(total as f64)
}

pub fn counta(values: &[Value]) -> Value {
    let total = values
        .iter()
        .flat_map(Value::flatten)
        .filter(|value| !matches!(value, Value::Text(s) if s.is_empty()))
        .count();
    Value::Number(total as f64)
}

pub fn max(values: &[Value]) -> Value {
    with_numbers(values, |numbers| {
        Value::Number(numbers.into_iter().reduce(f64::max).unwrap_or(0.0))
    })
}

pub fn min(values: &[Value]) -> Value {
    with_numbers(values, |numbers| {
        Value::Number(numbers.into_iter().reduce(f64::min).unwrap_or(0.0))
    })
}

pub fn product(values: &[Value]) -> Value {
    with_numbers(values, |numbers| {
        if numbers.is_empty() {
            return Value::Number(0.0);
        }
        number_result(numbers.iter().product())
    })
}

pub fn abs(values: &[Value]) -> Value {
    unary_math(values, |n| Value::Number(n.abs()))
}

pub fn round(values: &[Value]) -> Value {
    let n = match number_arg(values, 0) {
        Ok(n) => n,
        Err(err) => return Value::Error(err),
    };
    let digits = match values.get(1).map(Value::as_number) {
        None => 0,
        Some(Ok(d)) => d.trunc() as i32,
        Some(Err(err)) => return Value::Error(err),
    };
    let factor = 10f64.powi(digits);
    number_result((n * factor).round() / factor)
}

pub fn int(values: &[Value]) -> Value {
    unary_math(values, |n| Value::Number(n.floor()))
}

pub fn mod_fn(values: &[Value]) -> Value {
    match (number_arg(values, 0), number_arg(values, 1)) {
        (Err(err), _) | (_, Err(err)) => Value::Error(err),
        (Ok(_), Ok(d)) if d == 0.0 => Value::Error(ErrorValue::DivZero),
        (Ok(n), Ok(d)) => number_result(n - d * (n / d).floor()),
    }
}

pub fn power(values: &[Value]) -> Value {
    match (number_arg(values, 0), number_arg(values, 1)) {
        (Err(err), _) | (_, Err(err)) => Value::Error(err),
        (Ok(base), Ok(exp)) => number_result(base.powf(exp)),
    }
}

pub fn sqrt(values: &[Value]) -> Value {
    unary_math(values, |n| {
        if n < 0.0 {
            Value::Error(ErrorValue::Num)
        } else {
            Value::Number(n.sqrt())
        }
    })
}

pub fn exp(values: &[Value]) -> Value {
    unary_math(values, |n| number_result(n.exp()))
}

pub fn ln(values: &[Value]) -> Value {
    unary_math(values, |n| {
        if n <= 0.0 {
            Value::Error(ErrorValue::Num)
        } else {
            Value::Number(n.ln())
        }
    })
}

pub fn log10(values: &[Value]) -> Value {
    unary_math(values, |n| {
        if n <= 0.0 {
            Value::Error(ErrorValue::Num)
        } else {
            Value::Number(n.log10())
        }
    })
}

pub fn sign(values: &[Value]) -> Value {
    unary_math(values, |n| {
        Value::Number(if n > 0.0 {
            1.0
        } else if n < 0.0 {
            -1.0
        } else {
            0.0
        })
    })
}

pub fn median(values: &[Value]) -> Value {
    with_numbers(values, |mut numbers| {
        if numbers.is_empty() {
            return Value::Error(ErrorValue::Num);
        }
        numbers.sort_by(f64::total_cmp);
        let mid = numbers.len() / 2;
        if numbers.len() % 2 == 0 {
            Value::Number((numbers[mid - 1] + numbers[mid]) / 2.0)
        } else {
            Value::Number(numbers[mid])
        }
    })
}

fn sample_variance(numbers: &[f64]) -> Option<f64> {
    if numbers.len() < 2 {
        return None;
    }
    let n = numbers.len() as f64;
    let mean = numbers.iter().sum::<f64>() / n;
    Some(numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0))
}

pub fn var(values: &[Value]) -> Value {
    with_numbers(values, |numbers| match sample_variance(&numbers) {
        Some(v) => number_result(v),
        None => Value::Error(ErrorValue::DivZero),
    })
}

pub fn stdev(values: &[Value]) -> Value {
    with_numbers(values, |numbers| match sample_variance(&numbers) {
        Some(v) => number_result(v.sqrt()),
        None => Value::Error(ErrorValue::DivZero),
    })
}

pub fn if_fn(values: &[Value]) -> Value {
    match values[0].as_bool() {
        Ok(true) => values[1].clone(),
        Ok(false) => values.get(2).cloned().unwrap_or(Value::Boolean(false)),
        Err(err) => Value::Error(err),
    }
}

/// Booleans for AND/OR. Text inside arrays is skipped.
fn collect_bools(values: &[Value]) -> Result<Vec<bool>, ErrorValue> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(_) => {
                for item in value.flatten() {
                    match item {
                        Value::Text(_) => {}
                        other => out.push(other.as_bool()?),
                    }
                }
            }
            scalar => out.push(scalar.as_bool()?),
        }
    }
    if out.is_empty() {
        return Err(ErrorValue::Value);
    }
    Ok(out)
}

pub fn and_fn(values: &[Value]) -> Value {
    match collect_bools(values) {
        Ok(flags) => Value::Boolean(flags.into_iter().all(|b| b)),
        Err(err) => Value::Error(err),
    }
}

pub fn or_fn(values: &[Value]) -> Value {
    match collect_bools(values) {
        Ok(flags) => Value::Boolean(flags.into_iter().any(|b| b)),
        Err(err) => Value::Error(err),
    }
}

pub fn not_fn(values: &[Value]) -> Value {
    match values[0].as_bool() {
        Ok(b) => Value::Boolean(!b),
        Err(err) => Value::Error(err),
    }
}

pub fn iferror(values: &[Value]) -> Value {
    if values[0].is_error() {
        values[1].clone()
    } else {
        values[0].clone()
    }
}

pub fn concat(values: &[Value]) -> Value {
    let mut out = String::new();
    for value in values.iter().flat_map(Value::flatten) {
        if let Value::Error(err) = value {
            return Value::Error(err);
        }
        out.push_str(&value.as_text());
    }
    Value::Text(out)
}

pub fn len(values: &[Value]) -> Value {
    match text_arg(values, 0) {
        Ok(text) => Value::Number(text.chars().count() as f64),
        Err(err) => Value::Error(err),
    }
}

/// Optional character count argument, default 1, must not be negative.
fn char_count(values: &[Value], idx: usize) -> Result<usize, ErrorValue> {
    match values.get(idx) {
        None => Ok(1),
        Some(value) => {
            let n = value.as_number()?;
            if n < 0.0 {
                Err(ErrorValue::Value)
            } else {
                Ok(n.trunc() as usize)
            }
        }
    }
}

pub fn left(values: &[Value]) -> Value {
    match (text_arg(values, 0), char_count(values, 1)) {
        (Err(err), _) | (_, Err(err)) => Value::Error(err),
        (Ok(text), Ok(n)) => Value::Text(text.chars().take(n).collect()),
    }
}

pub fn right(values: &[Value]) -> Value {
    match (text_arg(values, 0), char_count(values, 1)) {
        (Err(err), _) | (_, Err(err)) => Value::Error(err),
        (Ok(text), Ok(n)) => {
            let total = text.chars().count();
            Value::Text(text.chars().skip(total.saturating_sub(n)).collect())
        }
    }
}

pub fn mid(values: &[Value]) -> Value {
    let text = match text_arg(values, 0) {
        Ok(text) => text,
        Err(err) => return Value::Error(err),
    };
    let (start, n) = match (number_arg(values, 1), char_count(values, 2)) {
        (Err(err), _) | (_, Err(err)) => return Value::Error(err),
        (Ok(start), Ok(n)) => (start, n),
    };
    if start < 1.0 {
        return Value::Error(ErrorValue::Value);
    }
    let skip = start.trunc() as usize - 1;
    Value::Text(text.chars().skip(skip).take(n).collect())
}

pub fn upper(values: &[Value]) -> Value {
    text_arg(values, 0).map_or_else(Value::Error, |text| Value::Text(text.to_uppercase()))
}

pub fn lower(values: &[Value]) -> Value {
    text_arg(values, 0).map_or_else(Value::Error, |text| Value::Text(text.to_lowercase()))
}

/// Strip both ends and collapse inner runs of spaces.
pub fn trim(values: &[Value]) -> Value {
    text_arg(values, 0).map_or_else(Value::Error, |text| {
        Value::Text(text.split_whitespace().collect::<Vec<_>>().join(" "))
    })
}

fn serial_epoch() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1899, 12, 30).and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Days since 1899-12-30, the usual spreadsheet serial date.
fn to_serial(moment: NaiveDateTime) -> Value {
    match serial_epoch() {
        Some(epoch) => {
            let elapsed = moment - epoch;
            Value::Number(elapsed.num_milliseconds() as f64 / 86_400_000.0)
        }
        None => Value::Error(ErrorValue::Value),
    }
}

pub fn now(_: &[Value]) -> Value {
    to_serial(Local::now().naive_local())
}

pub fn today(_: &[Value]) -> Value {
    match Local::now().date_naive().and_hms_opt(0, 0, 0) {
        Some(midnight) => to_serial(midnight),
        None => Value::Error(ErrorValue::Value),
    }
}

pub fn rand_fn(_: &[Value]) -> Value {
    Value::Number(rand::thread_rng().gen::<f64>())
}

pub fn randbetween(values: &[Value]) -> Value {
    let (low, high) = match (number_arg(values, 0), number_arg(values, 1)) {
        (Err(err), _) | (_, Err(err)) => return Value::Error(err),
        (Ok(low), Ok(high)) => (low.ceil() as i64, high.floor() as i64),
    };
    if low > high {
        return Value::Error(ErrorValue::Num);
    }
    Value::Number(rand::thread_rng().gen_range(low..=high) as f64)
}

pub fn isnumber(values: &[Value]) -> Value {
    Value::Boolean(matches!(values[0], Value::Number(_)))
}

pub fn istext(values: &[Value]) -> Value {
    Value::Boolean(matches!(values[0], Value::Text(_)))
}

pub fn iserror(values: &[Value]) -> Value {
    Value::Boolean(values[0].is_error())
}
