// src/write/columnar.rs

use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, Float64Array, Int64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use std::{io::Write, sync::Arc};

use crate::record::{UniformTable, Value};

/// Narrowest Arrow type that holds every non-missing value of a column.
/// Any text forces `Utf8`; an all-missing column is `Utf8` of nulls.
pub fn infer_type(values: impl IntoIterator<Item = Value>) -> DataType {
    let mut ty: Option<DataType> = None;
    for v in values {
        match v {
            Value::Missing => {}
            Value::Text(_) => return DataType::Utf8,
            Value::Int(_) if ty != Some(DataType::Float64) => ty = Some(DataType::Int64),
            Value::Int(_) | Value::Float(_) => ty = Some(DataType::Float64),
        }
    }
    ty.unwrap_or(DataType::Utf8)
}

fn column(table: &UniformTable, idx: usize) -> impl Iterator<Item = Value> + '_ {
    table.rows.iter().map(move |row| row[idx].clone())
}

fn build_array(table: &UniformTable, idx: usize, ty: &DataType) -> ArrayRef {
    match ty {
        DataType::Int64 => Arc::new(
            column(table, idx)
                .map(|v| match v {
                    Value::Int(i) => Some(i),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        DataType::Float64 => Arc::new(
            column(table, idx)
                .map(|v| v.as_f64())
                .collect::<Float64Array>(),
        ),
        _ => Arc::new(
            column(table, idx)
                .map(|v| match v {
                    Value::Missing => None,
                    other => Some(other.to_string()),
                })
                .collect::<StringArray>(),
        ),
    }
}

/// Convert a uniform table to a single Arrow batch; every field is nullable.
pub fn to_record_batch(table: &UniformTable) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(table.columns.len());
    let mut arrays = Vec::with_capacity(table.columns.len());
    for (idx, name) in table.columns.iter().enumerate() {
        let ty = infer_type(column(table, idx));
        arrays.push(build_array(table, idx, &ty));
        fields.push(Field::new(name, ty, true));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context("building record batch")
}

/// Write `table` as one SNAPPY-compressed Parquet file.
pub fn write_parquet<W: Write + Send>(table: &UniformTable, sink: W) -> Result<()> {
    let batch = to_record_batch(table)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(sink, batch.schema(), Some(props))
        .context("initializing Parquet writer")?;
    writer.write(&batch).context("writing Parquet batch")?;
    writer.close().context("closing Parquet writer")?;
    Ok(())
}
