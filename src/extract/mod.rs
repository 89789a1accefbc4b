// src/extract/mod.rs

use anyhow::{anyhow, Result};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::{
    config::ExtractConfig,
    error::ParseSkip,
    fetch::RawPage,
    record::{LcRecord, Value},
};

pub mod utils;

use utils::{clean_text, header_keys};

/// What one page yielded: its records plus everything that was skipped.
#[derive(Debug, Default)]
pub struct Extraction {
    pub records: Vec<LcRecord>,
    pub tables_found: usize,
    pub skips: Vec<ParseSkip>,
}

impl Extraction {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn skipped_rows(&self) -> usize {
        self.skips
            .iter()
            .filter(|s| matches!(s, ParseSkip::RowShape { .. }))
            .count()
    }
}

impl IntoIterator for Extraction {
    type Item = LcRecord;
    type IntoIter = std::vec::IntoIter<LcRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Turns a country page into LC records by reading every table matching a
/// CSS selector. Holds no per-page state.
pub struct TableExtractor {
    table: Selector,
    row: Selector,
}

impl TableExtractor {
    pub fn new(table_selector: &str) -> Result<Self> {
        let table = Selector::parse(table_selector)
            .map_err(|e| anyhow!("invalid table selector {:?}: {:?}", table_selector, e))?;
        let row = Selector::parse("tr").expect("tr selector should parse");
        Ok(Self { table, row })
    }

    pub fn from_config(cfg: &ExtractConfig) -> Result<Self> {
        Self::new(&cfg.table_selector)
    }

    /// Extract records from `page`. Failed or empty pages yield nothing.
    pub fn extract(&self, page: RawPage) -> Extraction {
        let mut out = Extraction::default();
        if !page.status.is_ok() || page.html.trim().is_empty() {
            return out;
        }

        let doc = Html::parse_document(&page.html);
        let template = {
            let mut r = LcRecord::new(page.target.id, page.target.name.clone());
            r.region = page.target.region.clone();
            r.fetched_at = Some(page.fetched_at);
            r
        };

        for table in doc.select(&self.table) {
            out.tables_found += 1;
            self.extract_table(table, &template, &mut out);
        }

        if out.tables_found == 0 {
            warn!(
                country_id = page.target.id,
                country = %page.target.name,
                "no table matched selector"
            );
            out.skips.push(ParseSkip::TableNotFound);
        } else {
            debug!(
                country_id = page.target.id,
                tables = out.tables_found,
                records = out.records.len(),
                skipped_rows = out.skipped_rows(),
                "extracted page"
            );
        }
        out
    }

    fn extract_table(&self, table: ElementRef<'_>, template: &LcRecord, out: &mut Extraction) {
        let rows = self.owned_rows(table);

        // header: first all-<th> row, else the first row
        let header_idx = rows
            .iter()
            .position(|r| {
                let cells = cells(*r);
                !cells.is_empty() && cells.iter().all(|c| c.value().name() == "th")
            })
            .unwrap_or(0);
        let Some(header_row) = rows.get(header_idx) else {
            return;
        };
        let keys = header_keys(cells(*header_row).iter().map(|c| cell_text(*c)));
        if keys.is_empty() {
            return;
        }

        for row in rows.iter().skip(header_idx + 1) {
            let cells = cells(*row);
            if !cells.iter().any(|c| c.value().name() == "td") {
                continue;
            }
            if cells.len() != keys.len() {
                let skip = ParseSkip::RowShape {
                    expected: keys.len(),
                    found: cells.len(),
                };
                debug!(country_id = ?template.country_id, %skip, "skipping row");
                out.skips.push(skip);
                continue;
            }

            let mut rec = template.clone();
            for (key, cell) in keys.iter().zip(cells) {
                let text = cell_text(cell);
                let value = if text.is_empty() {
                    Value::Missing
                } else {
                    Value::Text(text)
                };
                rec.set(key, value);
            }
            out.records.push(rec);
        }
    }

    /// Rows belonging to `table` itself, not to tables nested inside it.
    fn owned_rows<'a>(&self, table: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        let id = table.id();
        table
            .select(&self.row)
            .filter(|row| nearest_table(*row).map(|t| t.id()) == Some(id))
            .collect()
    }
}

fn nearest_table(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "table")
}

fn cells(row: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(c.value().name(), "td" | "th"))
        .collect()
}

fn cell_text(cell: ElementRef<'_>) -> String {
    clean_text(&cell.text().collect::<Vec<_>>().join(" "))
}
