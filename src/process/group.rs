// src/process/group.rs

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::record::{Dataset, UniformTable, Value, COUNTRY_NAME_COLUMN, COUNTRY_REGION_COLUMN};

use super::normalize::{LC_COLUMN, PROGRAM_COLUMN};

/// Grouped-output label for records without a program. Parenthesised so no
/// real program value can collide with it.
pub const UNSPECIFIED_LABEL: &str = "(unspecified)";

/// Program part of a group key. Records without a usable program land in
/// `Unspecified` rather than being dropped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ProgramKey {
    Named(String),
    Unspecified,
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramKey::Named(p) => f.write_str(p),
            ProgramKey::Unspecified => f.write_str(UNSPECIFIED_LABEL),
        }
    }
}

/// Extra dimensions to key groups on, besides program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GroupBy {
    pub region: bool,
    pub country: bool,
    pub lc: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GroupKey {
    pub program: ProgramKey,
    pub region: Option<String>,
    pub country: Option<String>,
    pub lc: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricTotal {
    /// Records with a non-missing value for the metric.
    pub count: usize,
    pub sum: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupSummary {
    /// Indices into the dataset the view was built from.
    pub rows: Vec<usize>,
    pub metrics: BTreeMap<String, MetricTotal>,
}

impl GroupSummary {
    pub fn records(&self) -> usize {
        self.rows.len()
    }
}

/// Read-only summary of a dataset; rebuild it rather than mutating it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedView {
    by: GroupBy,
    metrics: Vec<String>,
    groups: BTreeMap<GroupKey, GroupSummary>,
}

impl GroupedView {
    pub fn build(dataset: &Dataset, metrics: &[String], by: GroupBy) -> Self {
        let mut groups: BTreeMap<GroupKey, GroupSummary> = BTreeMap::new();

        for (idx, rec) in dataset.iter().enumerate() {
            let program = match rec.get(PROGRAM_COLUMN) {
                Some(Value::Text(p)) if !p.trim().is_empty() && p != UNSPECIFIED_LABEL => {
                    ProgramKey::Named(p.clone())
                }
                Some(v @ (Value::Int(_) | Value::Float(_))) => ProgramKey::Named(v.to_string()),
                _ => ProgramKey::Unspecified,
            };
            let key = GroupKey {
                program,
                region: if by.region { rec.region.clone() } else { None },
                country: if by.country {
                    rec.country_name.clone()
                } else {
                    None
                },
                lc: if by.lc {
                    rec.get(LC_COLUMN)
                        .filter(|v| !v.is_missing())
                        .map(Value::to_string)
                } else {
                    None
                },
            };

            let summary = groups.entry(key).or_default();
            summary.rows.push(idx);
            for m in metrics {
                let total = summary.metrics.entry(m.clone()).or_default();
                if let Some(v) = rec.get(m).and_then(Value::as_f64) {
                    total.count += 1;
                    total.sum += v;
                }
            }
        }

        Self {
            by,
            metrics: metrics.to_vec(),
            groups,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, key: &GroupKey) -> Option<&GroupSummary> {
        self.groups.get(key)
    }

    /// Shorthand lookup when grouping by program only.
    pub fn program(&self, program: &ProgramKey) -> Option<&GroupSummary> {
        self.groups.iter().find_map(|(k, v)| {
            (k.program == *program && k.region.is_none() && k.country.is_none() && k.lc.is_none())
                .then_some(v)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &GroupSummary)> {
        self.groups.iter()
    }

    /// One row per group. A metric with no values in a group is `Missing`, not zero.
    pub fn to_table(&self) -> UniformTable {
        let mut columns = vec![PROGRAM_COLUMN.to_string()];
        if self.by.region {
            columns.push(COUNTRY_REGION_COLUMN.into());
        }
        if self.by.country {
            columns.push(COUNTRY_NAME_COLUMN.into());
        }
        if self.by.lc {
            columns.push(LC_COLUMN.into());
        }
        columns.push("Records".into());
        columns.extend(self.metrics.iter().cloned());

        let rows = self
            .groups
            .iter()
            .map(|(key, summary)| {
                let mut row = vec![Value::Text(key.program.to_string())];
                if self.by.region {
                    row.push(key.region.clone().map_or(Value::Missing, Value::Text));
                }
                if self.by.country {
                    row.push(key.country.clone().map_or(Value::Missing, Value::Text));
                }
                if self.by.lc {
                    row.push(key.lc.clone().map_or(Value::Missing, Value::Text));
                }
                row.push(Value::Int(summary.records() as i64));
                for m in &self.metrics {
                    row.push(match summary.metrics.get(m) {
                        Some(t) if t.count > 0 => number(t.sum),
                        _ => Value::Missing,
                    });
                }
                row
            })
            .collect();

        UniformTable { columns, rows }
    }
}

fn number(sum: f64) -> Value {
    if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
        Value::Int(sum as i64)
    } else {
        Value::Float(sum)
    }
}

/// Group a normalized dataset by its `Program` column.
pub fn group_by_program(dataset: &Dataset, metrics: &[String]) -> GroupedView {
    GroupedView::build(dataset, metrics, GroupBy::default())
}
