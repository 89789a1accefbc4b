// src/process/convert.rs

use once_cell::sync::Lazy;
use regex::Regex;

use crate::record::Value;

/// Plain decimal numbers only; rejects `inf`, `NaN`, hex and the like.
static NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").expect("numeric regex"));

/// Digits grouped with thousands separators, e.g. `1,234` or `12 345`.
static GROUPED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?\d{1,3}([, ]\d{3})+(\.\d+)?$").expect("grouped regex"));

fn parse_number(s: &str) -> Option<Value> {
    if !NUMERIC.is_match(s) {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Int(i));
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Value::Float)
}

/// Coerce a metric cell: numbers (thousands separators allowed) become
/// `Int`/`Float`, anything else becomes `Missing`.
pub fn coerce_metric(v: Value) -> Value {
    match v {
        Value::Text(s) => {
            let t = s.trim();
            let t = if GROUPED.is_match(t) {
                t.replace([',', ' '], "")
            } else {
                t.to_string()
            };
            parse_number(&t).unwrap_or(Value::Missing)
        }
        Value::Float(f) if !f.is_finite() => Value::Missing,
        other => other,
    }
}

/// Coerce a free-form cell: blank → `Missing`, numeric text → number,
/// everything else trimmed text.
pub fn coerce_generic(v: Value) -> Value {
    match v {
        Value::Text(s) => {
            let t = s.trim();
            if t.is_empty() {
                Value::Missing
            } else {
                parse_number(t).unwrap_or_else(|| Value::Text(t.to_string()))
            }
        }
        other => other,
    }
}

/// Coerce a label cell (committee name, program): trimmed text, never numeric.
pub fn coerce_label(v: Value) -> Value {
    match v {
        Value::Text(s) => {
            let t = s.trim();
            if t.is_empty() {
                Value::Missing
            } else {
                Value::Text(t.to_string())
            }
        }
        Value::Int(i) => Value::Text(i.to_string()),
        Value::Float(f) => Value::Text(f.to_string()),
        Value::Missing => Value::Missing,
    }
}
