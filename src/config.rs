// src/config.rs

use anyhow::{bail, Context, Result};
use scraper::Selector;
use serde::Deserialize;
use std::{collections::BTreeMap, fs, path::{Path, PathBuf}, time::Duration};

use crate::{fetch::urls::UrlTemplate, process::GroupBy};

pub const MAX_WORKERS: usize = 4;
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub fetch: FetchConfig,
    pub extract: ExtractConfig,
    pub normalize: NormalizeConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub path: PathBuf,
    pub id_column: String,
    pub name_column: String,
    /// Optional; rows without it simply have no region.
    pub region_column: String,
    pub delimiter: char,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/codigos.csv"),
            id_column: "Country_ID".into(),
            name_column: "Country_Name".into(),
            region_column: "Country_Region".into(),
            delimiter: ',',
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Must contain `{id}`.
    pub url_template: String,
    pub delay_ms: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub workers: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            url_template: "https://core.aiesec.org.eg/analytics/{id}/LC25/".into(),
            delay_ms: 1000,
            timeout_secs: 20,
            user_agent: concat!("lcscraper/", env!("CARGO_PKG_VERSION")).into(),
            workers: 1,
            max_retries: 0,
            retry_backoff_ms: 500,
        }
    }
}

impl FetchConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }

    /// Extra attempts allowed after the first, capped at `MAX_RETRIES`.
    pub fn retry_count(&self) -> u32 {
        self.max_retries.min(MAX_RETRIES)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub table_selector: String,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            table_selector: "table#signups-table".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Extra `variant -> canonical` column names, merged over the built-in table.
    pub synonyms: BTreeMap<String, String>,
    pub metrics: Vec<String>,
    pub programs: Vec<String>,
    pub closed_markers: Vec<String>,
    pub reshape_wide: bool,
    /// Keys added to the grouped output besides program.
    pub group_by: GroupBy,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            synonyms: BTreeMap::new(),
            metrics: [
                "Signups",
                "Applicants",
                "Accepted",
                "Approved",
                "Realized",
                "Finished",
                "Completed",
            ]
            .map(String::from)
            .to_vec(),
            programs: ["IGV", "IGTa", "IGTe", "OGV", "OGTa", "OGTe"]
                .map(String::from)
                .to_vec(),
            closed_markers: [
                "[Closed]",
                "Closed",
                "(Closed)",
                "closed",
                "CLOSED",
                "(Closed Expansion)",
                "-",
                ".",
            ]
            .map(String::from)
            .to_vec(),
            reshape_wide: true,
            group_by: GroupBy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub formats: Vec<OutputFormat>,
    pub delimiter: char,
    pub write_grouped: bool,
    pub write_summary: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            formats: vec![OutputFormat::Csv],
            delimiter: ';',
            write_grouped: true,
            write_summary: true,
        }
    }
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(s).context("parsing config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading config {:?}", path))
    }

    /// Load from `path` if given, otherwise fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_yaml_file(p),
            None => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        UrlTemplate::parse(&self.fetch.url_template)?;
        if let Err(e) = Selector::parse(&self.extract.table_selector) {
            bail!(
                "invalid table selector {:?}: {:?}",
                self.extract.table_selector,
                e
            );
        }
        for (what, c) in [
            ("input.delimiter", self.input.delimiter),
            ("output.delimiter", self.output.delimiter),
        ] {
            if !c.is_ascii() {
                bail!("{} must be a single ASCII character, got {:?}", what, c);
            }
        }
        if self.input.id_column.trim().is_empty() || self.input.name_column.trim().is_empty() {
            bail!("input id/name column names must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.input.id_column, "Country_ID");
        assert_eq!(cfg.fetch.worker_count(), 1);
        assert_eq!(cfg.output.formats, vec![OutputFormat::Csv]);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let cfg = Config::from_yaml_str(
            r#"
fetch:
  delay_ms: 0
  workers: 9
output:
  formats: [csv, parquet]
normalize:
  synonyms:
    "lc name": LC
"#,
        )
        .unwrap();
        assert_eq!(cfg.fetch.delay_ms, 0);
        assert_eq!(cfg.fetch.worker_count(), MAX_WORKERS);
        assert_eq!(cfg.fetch.timeout_secs, 20);
        assert_eq!(
            cfg.output.formats,
            vec![OutputFormat::Csv, OutputFormat::Parquet]
        );
        assert_eq!(cfg.normalize.synonyms.get("lc name").map(String::as_str), Some("LC"));
        assert!(cfg.normalize.reshape_wide);
    }

    #[test]
    fn retries_are_capped() {
        let cfg = Config::from_yaml_str("fetch:\n  max_retries: 4000000000\n").unwrap();
        assert_eq!(cfg.fetch.retry_count(), MAX_RETRIES);
        let cfg = Config::from_yaml_str("fetch:\n  max_retries: 2\n").unwrap();
        assert_eq!(cfg.fetch.retry_count(), 2);
    }

    #[test]
    fn group_by_keys_from_yaml() {
        let cfg = Config::from_yaml_str("normalize:\n  group_by:\n    region: true\n    lc: true\n").unwrap();
        assert_eq!(
            cfg.normalize.group_by,
            GroupBy {
                region: true,
                country: false,
                lc: true,
            }
        );
        assert_eq!(Config::load(None).unwrap().normalize.group_by, GroupBy::default());
    }

    #[test]
    fn rejects_template_without_placeholder() {
        let err = Config::from_yaml_str("fetch:\n  url_template: https://example.com/x\n");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_bad_selector() {
        let err = Config::from_yaml_str("extract:\n  table_selector: \"table[[\"\n");
        assert!(err.is_err());
    }
}
