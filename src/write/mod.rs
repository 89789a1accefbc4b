// src/write/mod.rs

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

use crate::{
    config::{OutputConfig, OutputFormat},
    record::{UniformTable, Value},
    run::{RunOutput, RunSummary},
};

pub mod columnar;

pub use columnar::{to_record_batch, write_parquet};

/// Write `table` as delimited text with a header row. Missing values are empty cells.
pub fn write_csv<W: Write>(table: &UniformTable, sink: W, delimiter: u8) -> Result<()> {
    let mut wtr = WriterBuilder::new().delimiter(delimiter).from_writer(sink);
    wtr.write_record(&table.columns)
        .context("writing CSV header")?;
    for row in &table.rows {
        wtr.write_record(row.iter().map(Value::to_string))
            .context("writing CSV row")?;
    }
    wtr.flush().context("flushing CSV writer")?;
    Ok(())
}

/// Create `path` by writing to a hidden temp file beside it and renaming over it.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{}.tmp", name));

    let result = (|| -> Result<()> {
        let file = File::create(&tmp_path)
            .with_context(|| format!("creating {:?}", tmp_path))?;
        let mut buf = BufWriter::new(file);
        write(&mut buf)?;
        buf.flush()
            .with_context(|| format!("flushing {:?}", tmp_path))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming {:?} -> {:?}", tmp_path, path))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Persists a finished run under the configured output directory.
pub struct OutputWriter {
    cfg: OutputConfig,
}

impl OutputWriter {
    pub fn new(cfg: &OutputConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    fn delimiter(&self) -> u8 {
        self.cfg.delimiter as u8
    }

    fn write_table(&self, table: &UniformTable, path: &Path, format: OutputFormat) -> Result<()> {
        write_atomic(path, |out| match format {
            OutputFormat::Csv => write_csv(table, out, self.delimiter()),
            OutputFormat::Parquet => write_parquet(table, out),
        })?;
        debug!(path = %path.display(), rows = table.rows.len(), "wrote table");
        Ok(())
    }

    /// Write the dataset in every enabled format as `data_<stamp>` and
    /// `data_latest`, the grouped view, and the run summary. An empty dataset
    /// writes only the summary. Returns the paths written.
    #[instrument(level = "info", skip_all, fields(dir = %self.cfg.dir.display()))]
    pub fn write_run(&self, out: &RunOutput, stamp: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.cfg.dir)
            .with_context(|| format!("creating output directory {:?}", self.cfg.dir))?;
        let mut written = Vec::new();

        if out.dataset.is_empty() {
            info!("dataset is empty, no data files written");
        } else {
            let table = out.dataset.uniform();
            let ts = stamp.format("%Y%m%d_%H%M%S");
            for format in &self.cfg.formats {
                let ext = format.extension();
                for name in [format!("data_{}.{}", ts, ext), format!("data_latest.{}", ext)] {
                    let path = self.cfg.dir.join(name);
                    self.write_table(&table, &path, *format)?;
                    written.push(path);
                }
            }

            if self.cfg.write_grouped {
                let path = self.cfg.dir.join("grouped_latest.csv");
                self.write_table(&out.grouped.to_table(), &path, OutputFormat::Csv)?;
                written.push(path);
            }
        }

        if self.cfg.write_summary {
            let path = self.cfg.dir.join("summary_latest.json");
            write_summary(&out.summary, &path)?;
            written.push(path);
        }

        info!(files = written.len(), records = out.dataset.len(), "outputs written");
        Ok(written)
    }
}

/// Pretty JSON with a trailing newline.
pub fn write_summary(summary: &RunSummary, path: &Path) -> Result<()> {
    write_atomic(path, |out| {
        serde_json::to_writer_pretty(&mut *out, summary).context("serializing run summary")?;
        out.write_all(b"\n")?;
        Ok(())
    })
}
