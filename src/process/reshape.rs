// src/process/reshape.rs

use std::collections::HashSet;
use tracing::debug;

use crate::record::{LcRecord, Value};

use super::normalize::PROGRAM_COLUMN;

/// One `<metric> <program>` cell pulled out of a wide record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WideCell {
    pub metric: String,
    pub program: String,
    pub value: Value,
}

/// Turn one wide record into one record per program, in the order programs
/// first appear. Each output carries the base's non-metric columns plus
/// `Program` and the plain metric columns for that program; metrics a program
/// lacks stay absent.
///
/// Row-level metric columns on `base` never go onto a program record. If the
/// same metric also has per-program cells it is a redundant total and is
/// dropped; otherwise it is kept on one extra record with no `Program`.
pub(crate) fn explode_programs<F>(mut base: LcRecord, cells: Vec<WideCell>, is_metric: F) -> Vec<LcRecord>
where
    F: Fn(&str) -> bool,
{
    let per_program: HashSet<String> = cells.iter().map(|c| c.metric.clone()).collect();
    let row_metrics: Vec<String> = base
        .columns()
        .map(|(name, _)| name)
        .filter(|name| is_metric(name))
        .map(str::to_string)
        .collect();

    let mut residual = Vec::new();
    for name in row_metrics {
        let Some(value) = base.remove(&name) else {
            continue;
        };
        if per_program.contains(&name) {
            debug!(column = %name, "row-level total dropped in favour of per-program values");
        } else if !value.is_missing() {
            residual.push((name, value));
        }
    }

    let mut programs: Vec<String> = Vec::new();
    for c in &cells {
        if !programs.contains(&c.program) {
            programs.push(c.program.clone());
        }
    }

    let mut out: Vec<LcRecord> = programs
        .into_iter()
        .map(|program| {
            let mut rec = base.clone();
            rec.set(PROGRAM_COLUMN, Value::Text(program.clone()));
            for c in cells.iter().filter(|c| c.program == program) {
                rec.set(&c.metric, c.value.clone());
            }
            rec
        })
        .collect();

    if !residual.is_empty() {
        for (name, value) in residual {
            base.set(&name, value);
        }
        out.push(base);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(metric: &str, program: &str, v: i64) -> WideCell {
        WideCell {
            metric: metric.into(),
            program: program.into(),
            value: Value::Int(v),
        }
    }

    fn is_metric(name: &str) -> bool {
        matches!(name, "Signups" | "Approved" | "Realized")
    }

    #[test]
    fn one_row_per_program_in_first_seen_order() {
        let base = LcRecord::new(1, "Chile").with("LC", "Santiago");
        let out = explode_programs(
            base,
            vec![
                cell("Signups", "OGV", 10),
                cell("Approved", "IGV", 1),
                cell("Approved", "OGV", 2),
            ],
            is_metric,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("Program"), Some(&Value::from("OGV")));
        assert_eq!(out[0].get("Signups"), Some(&Value::Int(10)));
        assert_eq!(out[0].get("Approved"), Some(&Value::Int(2)));
        assert_eq!(out[1].get("Program"), Some(&Value::from("IGV")));
        assert_eq!(out[1].get("Signups"), None);
        assert!(out.iter().all(|r| r.get("LC") == Some(&Value::from("Santiago"))));
    }

    #[test]
    fn row_level_metrics_stay_off_program_records() {
        let base = LcRecord::new(1, "Chile")
            .with("LC", "Santiago")
            .with("Approved", Value::Int(3))
            .with("Signups", Value::Int(10))
            .with("Realized", Value::Missing);
        let out = explode_programs(
            base,
            vec![cell("Approved", "OGV", 1), cell("Approved", "IGTa", 2)],
            is_metric,
        );

        assert_eq!(out.len(), 3);
        for rec in &out[..2] {
            assert_eq!(rec.get("Signups"), None);
        }
        assert_eq!(out[0].get("Approved"), Some(&Value::Int(1)));
        assert_eq!(out[1].get("Approved"), Some(&Value::Int(2)));

        let rest = &out[2];
        assert_eq!(rest.get("Program"), None);
        assert_eq!(rest.get("Approved"), None);
        assert_eq!(rest.get("Signups"), Some(&Value::Int(10)));
        assert_eq!(rest.get("Realized"), None);
        assert_eq!(rest.get("LC"), Some(&Value::from("Santiago")));
    }
}
