// src/process/mod.rs

use crate::record::{Dataset, DatasetBuilder, LcRecord};

pub mod convert;
pub mod group;
pub mod normalize;
mod reshape;

pub use group::{group_by_program, GroupBy, GroupKey, GroupSummary, GroupedView, ProgramKey};
pub use normalize::{NormalizeStats, Normalizer, LC_COLUMN, PROGRAM_COLUMN};

/// Concatenate per-country batches in the order given. Records are never
/// reordered, merged or deduplicated.
pub fn aggregate<I, B>(batches: I) -> Dataset
where
    I: IntoIterator<Item = B>,
    B: IntoIterator<Item = LcRecord>,
{
    let mut builder = DatasetBuilder::new();
    for batch in batches {
        builder.push_batch(batch);
    }
    builder.finish()
}
