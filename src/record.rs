// src/record.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashSet, fmt};

pub const COUNTRY_ID_COLUMN: &str = "Country_ID";
pub const COUNTRY_NAME_COLUMN: &str = "Country_Name";
pub const COUNTRY_REGION_COLUMN: &str = "Country_Region";
pub const SCRAPED_AT_COLUMN: &str = "Scraped_At";

/// A single cell. `Missing` is explicit so absent and unparsable values are
/// never confused with zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Int(i64),
    Float(f64),
    Missing,
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Missing => Ok(()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

/// One extracted row of LC performance data.
///
/// Columns are sparse and kept in source order; the country tags live outside
/// the column list so normalization can rename columns freely.
#[derive(Debug, Clone, PartialEq)]
pub struct LcRecord {
    pub country_id: Option<u32>,
    pub country_name: Option<String>,
    pub region: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    columns: Vec<(String, Value)>,
}

impl LcRecord {
    pub fn new(country_id: u32, country_name: impl Into<String>) -> Self {
        Self {
            country_id: Some(country_id),
            country_name: Some(country_name.into()),
            region: None,
            fetched_at: None,
            columns: Vec::new(),
        }
    }

    /// A record with no country tags; only normalization input should look like this.
    pub fn untagged() -> Self {
        Self {
            country_id: None,
            country_name: None,
            region: None,
            fetched_at: None,
            columns: Vec::new(),
        }
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.set(column, value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }

    /// Insert or overwrite `column`, keeping its original position if it exists.
    pub fn set(&mut self, column: &str, value: Value) {
        match self.columns.iter_mut().find(|(name, _)| name == column) {
            Some((_, slot)) => *slot = value,
            None => self.columns.push((column.to_string(), value)),
        }
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let idx = self.columns.iter().position(|(name, _)| name == column)?;
        Some(self.columns.remove(idx).1)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn into_columns(self) -> (Self, Vec<(String, Value)>) {
        let mut tags = self;
        let cols = std::mem::take(&mut tags.columns);
        (tags, cols)
    }
}

/// The accumulated records of one run, in country-processing order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    records: Vec<LcRecord>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[LcRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LcRecord> {
        self.records.iter()
    }

    /// Union of record column names in first-seen order.
    pub fn column_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for rec in &self.records {
            for (name, _) in rec.columns() {
                if seen.insert(name) {
                    out.push(name.to_string());
                }
            }
        }
        out
    }

    /// Every record keyed by the same column list, absent fields as `Missing`.
    pub fn uniform(&self) -> UniformTable {
        let fields = self.column_names();
        let mut columns = vec![
            COUNTRY_ID_COLUMN.to_string(),
            COUNTRY_NAME_COLUMN.to_string(),
            COUNTRY_REGION_COLUMN.to_string(),
        ];
        columns.extend(fields.iter().cloned());
        columns.push(SCRAPED_AT_COLUMN.to_string());

        let rows = self
            .records
            .iter()
            .map(|rec| {
                let mut row = Vec::with_capacity(columns.len());
                row.push(
                    rec.country_id
                        .map(|id| Value::Int(id as i64))
                        .unwrap_or(Value::Missing),
                );
                row.push(opt_text(&rec.country_name));
                row.push(opt_text(&rec.region));
                for f in &fields {
                    row.push(rec.get(f).cloned().unwrap_or(Value::Missing));
                }
                row.push(
                    rec.fetched_at
                        .map(|t| Value::Text(t.to_rfc3339()))
                        .unwrap_or(Value::Missing),
                );
                row
            })
            .collect();

        UniformTable { columns, rows }
    }
}

fn opt_text(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s.clone()),
        None => Value::Missing,
    }
}

impl IntoIterator for Dataset {
    type Item = LcRecord;
    type IntoIter = std::vec::IntoIter<LcRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a LcRecord;
    type IntoIter = std::slice::Iter<'a, LcRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<LcRecord> for Dataset {
    fn from_iter<I: IntoIterator<Item = LcRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Append-only accumulator owned by the orchestrator for one run.
#[derive(Debug, Default)]
pub struct DatasetBuilder {
    records: Vec<LcRecord>,
    batches: usize,
}

impl DatasetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&mut self, batch: impl IntoIterator<Item = LcRecord>) {
        self.records.extend(batch);
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish(self) -> Dataset {
        Dataset {
            records: self.records,
        }
    }
}

/// Rectangular view of a `Dataset` for columnar sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}
