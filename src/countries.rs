// src/countries.rs

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, StringRecord};
use serde::Serialize;
use std::{collections::HashMap, io::Read, path::Path};
use tracing::{info, instrument, warn};

use crate::{config::InputConfig, error::MappingRowError};

/// One page to fetch, identified by country id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CountryTarget {
    pub id: u32,
    pub name: String,
    pub region: Option<String>,
}

impl CountryTarget {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Load the country mapping file described by `cfg`.
///
/// A missing file or id column is fatal; bad rows are skipped with a warning.
#[instrument(level = "info", skip(cfg), fields(path = %cfg.path.display()))]
pub fn load_targets(cfg: &InputConfig) -> Result<Vec<CountryTarget>> {
    let path: &Path = &cfg.path;
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening country mapping {:?}", path))?;
    let targets = read_targets(file, cfg)
        .with_context(|| format!("reading country mapping {:?}", path))?;
    if targets.is_empty() {
        warn!("no valid country rows in {}", path.display());
    } else {
        info!(count = targets.len(), "loaded country targets");
    }
    Ok(targets)
}

/// Parse mapping rows from any reader. Order follows first appearance of each id.
pub fn read_targets<R: Read>(reader: R, cfg: &InputConfig) -> Result<Vec<CountryTarget>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(cfg.delimiter as u8)
        .from_reader(reader);

    let headers = rdr.headers().context("reading header row")?.clone();
    let find = |name: &str| headers.iter().position(|h| h.trim() == name);

    let Some(id_idx) = find(&cfg.id_column) else {
        bail!("id column {:?} not found in header", cfg.id_column);
    };
    let name_idx = find(&cfg.name_column);
    if name_idx.is_none() {
        warn!(
            column = %cfg.name_column,
            "name column not found; using placeholder names"
        );
    }
    let region_idx = find(&cfg.region_column);

    let mut targets: Vec<CountryTarget> = Vec::new();
    let mut positions: HashMap<u32, usize> = HashMap::new();

    for (idx, result) in rdr.records().enumerate() {
        // header is line 1
        let line = idx + 2;
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                let err = MappingRowError::Csv(e.to_string());
                warn!(line, error = %err, "skipping mapping row");
                continue;
            }
        };

        let target = match parse_row(&row, id_idx, name_idx, region_idx) {
            Ok(t) => t,
            Err(err) => {
                warn!(line, error = %err, "skipping mapping row");
                continue;
            }
        };

        match positions.get(&target.id) {
            Some(&pos) => {
                warn!(
                    country_id = target.id,
                    line, "duplicate country id; later row replaces earlier one"
                );
                targets[pos] = target;
            }
            None => {
                positions.insert(target.id, targets.len());
                targets.push(target);
            }
        }
    }

    Ok(targets)
}

fn parse_row(
    row: &StringRecord,
    id_idx: usize,
    name_idx: Option<usize>,
    region_idx: Option<usize>,
) -> Result<CountryTarget, MappingRowError> {
    let raw_id = row.get(id_idx).map(str::trim).unwrap_or("");
    if raw_id.is_empty() {
        return Err(MappingRowError::MissingId);
    }
    let id = parse_id(raw_id).ok_or_else(|| MappingRowError::InvalidId(raw_id.to_string()))?;

    let name = name_idx
        .and_then(|i| row.get(i))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Country_{}", id));

    let region = region_idx
        .and_then(|i| row.get(i))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(CountryTarget { id, name, region })
}

/// Accepts `572` and spreadsheet-style `572.0`.
fn parse_id(raw: &str) -> Option<u32> {
    if let Ok(id) = raw.parse::<u32>() {
        return Some(id);
    }
    let f: f64 = raw.parse().ok()?;
    if f.fract() == 0.0 && f >= 0.0 && f <= u32::MAX as f64 {
        Some(f as u32)
    } else {
        None
    }
}
