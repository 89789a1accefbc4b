// src/process/normalize.rs

use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::NormalizeConfig,
    error::SchemaDrop,
    extract::utils::normalize_header,
    record::{Dataset, LcRecord, Value},
};

use super::{
    convert::{coerce_generic, coerce_label, coerce_metric},
    group::{GroupBy, GroupedView},
    reshape::{explode_programs, WideCell},
};

pub const LC_COLUMN: &str = "LC";
pub const PROGRAM_COLUMN: &str = "Program";

/// Built-in column variants. Keys are compared after `normalize_header`.
const BUILTIN_SYNONYMS: &[(&str, &str)] = &[
    ("lc", LC_COLUMN),
    ("lc name", LC_COLUMN),
    ("lc_name", LC_COLUMN),
    ("local committee", LC_COLUMN),
    ("committee", LC_COLUMN),
    ("entity", LC_COLUMN),
    ("program", PROGRAM_COLUMN),
    ("programme", PROGRAM_COLUMN),
    ("product", PROGRAM_COLUMN),
    ("sign ups", "Signups"),
    ("sign-ups", "Signups"),
    ("signup", "Signups"),
    ("su", "Signups"),
    ("applications", "Applicants"),
    ("applied", "Applicants"),
    ("apl", "Applicants"),
    ("matched", "Accepted"),
    ("acc", "Accepted"),
    ("approvals", "Approved"),
    ("apd", "Approved"),
    ("realizations", "Realized"),
    ("realised", "Realized"),
    ("re", "Realized"),
    ("fin", "Finished"),
    ("fi", "Finished"),
    ("completions", "Completed"),
    ("co", "Completed"),
];

/// How a source column maps onto the canonical schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    Plain(String),
    /// `<metric> <program>`, e.g. `Approved OGV`.
    Wide { metric: String, program: String },
    /// `Total <metric>` next to per-program columns.
    Total { metric: String },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NormalizeStats {
    pub input: usize,
    pub output: usize,
    pub dropped: Vec<(Option<u32>, SchemaDrop)>,
    /// Wide records split into one record per program.
    pub reshaped: usize,
}

/// Canonicalizes column names, coerces types and drops unusable records.
#[derive(Debug, Clone)]
pub struct Normalizer {
    synonyms: HashMap<String, String>,
    metrics: Vec<String>,
    programs: Vec<String>,
    closed_markers: Vec<String>,
    reshape_wide: bool,
    group_by: GroupBy,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&NormalizeConfig::default())
    }
}

impl Normalizer {
    pub fn new(cfg: &NormalizeConfig) -> Self {
        let mut synonyms = HashMap::new();
        for canonical in cfg
            .metrics
            .iter()
            .map(String::as_str)
            .chain([LC_COLUMN, PROGRAM_COLUMN])
        {
            synonyms.insert(normalize_header(canonical), canonical.to_string());
        }
        for (variant, canonical) in BUILTIN_SYNONYMS {
            synonyms.insert(normalize_header(variant), canonical.to_string());
        }
        for (variant, canonical) in &cfg.synonyms {
            synonyms.insert(normalize_header(variant), canonical.clone());
        }
        // canonical names must always map to themselves
        for canonical in synonyms.values().cloned().collect::<Vec<_>>() {
            synonyms.insert(normalize_header(&canonical), canonical);
        }

        Self {
            synonyms,
            metrics: cfg.metrics.clone(),
            programs: cfg.programs.clone(),
            closed_markers: cfg.closed_markers.clone(),
            reshape_wide: cfg.reshape_wide,
            group_by: cfg.group_by,
        }
    }

    pub fn is_metric(&self, column: &str) -> bool {
        self.metrics.iter().any(|m| m == column)
    }

    /// Canonical spelling of a known program, matched case-insensitively.
    pub fn canonical_program(&self, raw: &str) -> Option<&str> {
        let raw = raw.trim();
        self.programs
            .iter()
            .find(|p| p.eq_ignore_ascii_case(raw))
            .map(String::as_str)
    }

    pub(crate) fn classify(&self, column: &str) -> ColumnKind {
        let key = normalize_header(column);
        if let Some(canonical) = self.synonyms.get(&key) {
            return ColumnKind::Plain(canonical.clone());
        }

        if let Some((head, tail)) = key.rsplit_once(' ') {
            if let (Some(metric), Some(program)) =
                (self.metric_named(head), self.canonical_program(tail))
            {
                return ColumnKind::Wide {
                    metric: metric.to_string(),
                    program: program.to_string(),
                };
            }
            if let Some(metric) = self.metric_named(tail).filter(|_| head == "total") {
                return ColumnKind::Total {
                    metric: metric.to_string(),
                };
            }
            if let Some(metric) = self.metric_named(head).filter(|_| tail == "total") {
                return ColumnKind::Total {
                    metric: metric.to_string(),
                };
            }
        }
        ColumnKind::Plain(column.to_string())
    }

    fn metric_named(&self, key: &str) -> Option<&str> {
        self.synonyms
            .get(key)
            .map(String::as_str)
            .filter(|c| self.is_metric(c))
    }

    fn coerce(&self, column: &str, value: Value) -> Value {
        if self.is_metric(column) {
            coerce_metric(value)
        } else if column == PROGRAM_COLUMN {
            match coerce_label(value) {
                Value::Text(s) => Value::Text(
                    self.canonical_program(&s)
                        .map(str::to_string)
                        .unwrap_or(s),
                ),
                other => other,
            }
        } else if column == LC_COLUMN {
            coerce_label(value)
        } else {
            coerce_generic(value)
        }
    }

    /// Normalize a dataset. Running it twice gives the same result as once.
    pub fn normalize(&self, dataset: Dataset) -> Dataset {
        self.normalize_with_stats(dataset).0
    }

    #[instrument(level = "info", skip_all, fields(records = dataset.len()))]
    pub fn normalize_with_stats(&self, dataset: Dataset) -> (Dataset, NormalizeStats) {
        let mut stats = NormalizeStats {
            input: dataset.len(),
            ..NormalizeStats::default()
        };
        let mut out = Vec::with_capacity(dataset.len());

        for rec in dataset {
            let country_id = rec.country_id;
            match self.normalize_record(rec) {
                Ok((recs, reshaped)) => {
                    if reshaped {
                        stats.reshaped += 1;
                    }
                    out.extend(recs);
                }
                Err(reason) => {
                    warn!(country_id = ?country_id, %reason, "dropping record");
                    stats.dropped.push((country_id, reason));
                }
            }
        }

        stats.output = out.len();
        info!(
            input = stats.input,
            output = stats.output,
            dropped = stats.dropped.len(),
            reshaped = stats.reshaped,
            "normalized dataset"
        );
        (out.into_iter().collect(), stats)
    }

    fn normalize_record(&self, rec: LcRecord) -> Result<(Vec<LcRecord>, bool), SchemaDrop> {
        if rec.country_id.is_none() {
            return Err(SchemaDrop::MissingCountryId);
        }
        if rec
            .country_name
            .as_deref()
            .map_or(true, |n| n.trim().is_empty())
        {
            return Err(SchemaDrop::MissingCountryName);
        }

        let (mut base, columns) = rec.into_columns();
        if let Some(name) = base.country_name.as_mut() {
            *name = name.trim().to_string();
        }

        let mut wide: Vec<WideCell> = Vec::new();
        let mut totals: Vec<(String, Value)> = Vec::new();

        for (column, value) in columns {
            match self.classify(&column) {
                ColumnKind::Plain(name) => {
                    let value = self.coerce(&name, value);
                    let occupied = base.get(&name).map_or(false, |v| !v.is_missing());
                    if occupied {
                        debug!(column = %column, canonical = %name, "duplicate column ignored");
                    } else {
                        base.set(&name, value);
                    }
                }
                ColumnKind::Wide { metric, program } => wide.push(WideCell {
                    value: coerce_metric(value),
                    metric,
                    program,
                }),
                ColumnKind::Total { metric } => {
                    totals.push((format!("Total {}", metric), coerce_metric(value)))
                }
            }
        }

        if let Some(Value::Text(lc)) = base.get(LC_COLUMN) {
            if self.closed_markers.iter().any(|m| m == lc) {
                return Err(SchemaDrop::ClosedCommittee(lc.clone()));
            }
        }

        if self.reshape_wide && !wide.is_empty() {
            return Ok((explode_programs(base, wide, |c| self.is_metric(c)), true));
        }

        for cell in wide {
            base.set(&format!("{} {}", cell.metric, cell.program), cell.value);
        }
        for (name, value) in totals {
            base.set(&name, value);
        }
        Ok((vec![base], false))
    }

    /// Group a normalized dataset by program, plus the configured extra keys,
    /// summing this normalizer's metrics.
    pub fn group(&self, dataset: &Dataset) -> GroupedView {
        GroupedView::build(dataset, &self.metrics, self.group_by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::group::ProgramKey;

    fn ds(records: Vec<LcRecord>) -> Dataset {
        records.into_iter().collect()
    }

    #[test]
    fn canonicalizes_and_coerces() {
        let n = Normalizer::default();
        let out = n.normalize(ds(vec![LcRecord::new(1566, "Chile")
            .with("lc name", " Santiago ")
            .with("approvals", "1,204")
            .with("realized", "n/a")
            .with("programme", "ogv")
            .with("rank", "3")
            .with("notes", "new office")]));

        let r = &out.records()[0];
        assert_eq!(r.get("LC"), Some(&Value::from("Santiago")));
        assert_eq!(r.get("Approved"), Some(&Value::Int(1204)));
        assert_eq!(r.get("Realized"), Some(&Value::Missing));
        assert_eq!(r.get("Program"), Some(&Value::from("OGV")));
        assert_eq!(r.get("rank"), Some(&Value::Int(3)));
        assert_eq!(r.get("notes"), Some(&Value::from("new office")));
    }

    #[test]
    fn drops_untagged_and_closed_records() {
        let n = Normalizer::default();
        let mut no_name = LcRecord::new(9, "x");
        no_name.country_name = Some("  ".into());
        let (out, stats) = n.normalize_with_stats(ds(vec![
            LcRecord::untagged().with("lc", "Ghost"),
            no_name,
            LcRecord::new(1, "Chile").with("lc", "(Closed)"),
            LcRecord::new(1, "Chile").with("lc", "Santiago"),
        ]));

        assert_eq!(out.len(), 1);
        assert_eq!(
            stats.dropped,
            vec![
                (None, SchemaDrop::MissingCountryId),
                (Some(9), SchemaDrop::MissingCountryName),
                (Some(1), SchemaDrop::ClosedCommittee("(Closed)".into())),
            ]
        );
    }

    #[test]
    fn partial_records_keep_absent_fields_absent() {
        let n = Normalizer::default();
        let out = n.normalize(ds(vec![
            LcRecord::new(1, "A").with("lc", "X").with("approved", "2"),
            LcRecord::new(2, "B")
                .with("lc", "Y")
                .with("approved", "3")
                .with("program", "IGV"),
        ]));
        assert_eq!(out.records()[0].get("Program"), None);
        assert_eq!(out.records()[1].get("Program"), Some(&Value::from("IGV")));
    }

    #[test]
    fn wide_program_columns_become_rows() {
        let n = Normalizer::default();
        let (out, stats) = n.normalize_with_stats(ds(vec![LcRecord::new(1566, "Chile")
            .with("lc", "Santiago")
            .with("total approved", "5")
            .with("approved ogv", "2")
            .with("approved igta", "3")
            .with("realized ogv", "1")]));

        assert_eq!(stats.reshaped, 1);
        assert_eq!(out.len(), 2);
        let ogv = &out.records()[0];
        assert_eq!(ogv.get("Program"), Some(&Value::from("OGV")));
        assert_eq!(ogv.get("Approved"), Some(&Value::Int(2)));
        assert_eq!(ogv.get("Realized"), Some(&Value::Int(1)));
        assert_eq!(ogv.get("Total Approved"), None);

        let igta = &out.records()[1];
        assert_eq!(igta.get("Program"), Some(&Value::from("IGTa")));
        assert_eq!(igta.get("Approved"), Some(&Value::Int(3)));
        assert_eq!(igta.get("Realized"), None);
        assert_eq!(igta.get("LC"), Some(&Value::from("Santiago")));
    }

    #[test]
    fn wide_columns_kept_when_reshape_disabled() {
        let n = Normalizer::new(&NormalizeConfig {
            reshape_wide: false,
            ..NormalizeConfig::default()
        });
        let once = n.normalize(ds(vec![LcRecord::new(1, "A")
            .with("approved ogv", "2")
            .with("total approved", "2")]));
        let r = &once.records()[0];
        assert_eq!(r.get("Approved OGV"), Some(&Value::Int(2)));
        assert_eq!(r.get("Total Approved"), Some(&Value::Int(2)));
        assert_eq!(n.normalize(once.clone()), once);
    }

    #[test]
    fn normalize_is_idempotent() {
        let n = Normalizer::default();
        let input = ds(vec![
            LcRecord::new(1566, "Chile ")
                .with("lc", "Santiago")
                .with("approved", "12")
                .with("rate", "45.5")
                .with("approved ogv", "4")
                .with("signups ogte", "x"),
            LcRecord::new(572, "Afghanistan")
                .with("local committee", "Kabul")
                .with("completions", "")
                .with("program", "ogta"),
            LcRecord::untagged().with("lc", "dropped"),
        ]);
        let once = n.normalize(input);
        let twice = n.normalize(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn row_level_metric_is_not_counted_per_program() {
        let n = Normalizer::default();
        let out = n.normalize(ds(vec![LcRecord::new(1566, "Chile")
            .with("lc", "Santiago")
            .with("approved", "10")
            .with("realized ogv", "1")
            .with("realized igta", "2")]));

        assert_eq!(out.len(), 3);
        let view = n.group(&out);
        let approved: f64 = view.iter().map(|(_, g)| g.metrics["Approved"].sum).sum();
        let realized: f64 = view.iter().map(|(_, g)| g.metrics["Realized"].sum).sum();
        assert_eq!(approved, 10.0);
        assert_eq!(realized, 3.0);

        let unspecified = view.program(&ProgramKey::Unspecified).unwrap();
        assert_eq!(unspecified.metrics["Approved"].sum, 10.0);
        assert_eq!(unspecified.metrics["Realized"].count, 0);
    }

    #[test]
    fn row_level_total_with_per_program_values_is_dropped() {
        let n = Normalizer::default();
        let out = n.normalize(ds(vec![LcRecord::new(1566, "Chile")
            .with("lc", "Santiago")
            .with("approved", "3")
            .with("approved ogv", "1")
            .with("approved igta", "2")]));

        assert_eq!(out.len(), 2);
        let sum: f64 = n
            .group(&out)
            .iter()
            .map(|(_, g)| g.metrics["Approved"].sum)
            .sum();
        assert_eq!(sum, 3.0);
        assert_eq!(n.normalize(out.clone()), out);
    }

    #[test]
    fn user_synonyms_extend_builtins() {
        let mut cfg = NormalizeConfig::default();
        cfg.synonyms.insert("Comité Local".into(), "LC".into());
        let n = Normalizer::new(&cfg);
        assert_eq!(n.classify("comité local"), ColumnKind::Plain("LC".into()));
        assert_eq!(n.classify("apd"), ColumnKind::Plain("Approved".into()));
        assert_eq!(
            n.classify("Realized OGTe"),
            ColumnKind::Wide {
                metric: "Realized".into(),
                program: "OGTe".into()
            }
        );
        assert_eq!(
            n.classify("Approved total"),
            ColumnKind::Total {
                metric: "Approved".into()
            }
        );
        assert_eq!(n.classify("weird col"), ColumnKind::Plain("weird col".into()));
    }
}
