// src/error.rs

use serde::Serialize;
use thiserror::Error;

/// Why a single country's page could not be retrieved.
///
/// This is the failure half of the per-country `Result`; it never aborts a run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchFailure {
    #[error("non-success HTTP status {status}")]
    Status { status: u16 },

    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

/// A page or row the extractor dropped. Counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseSkip {
    #[error("no table matched the configured selector")]
    TableNotFound,

    #[error("row has {found} cells but the header has {expected}")]
    RowShape { expected: usize, found: usize },
}

/// Why normalization removed a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaDrop {
    #[error("record has no country id")]
    MissingCountryId,

    #[error("record has no country name")]
    MissingCountryName,

    #[error("local committee {0:?} is marked closed")]
    ClosedCommittee(String),
}

/// A malformed row in the input country mapping; the row is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingRowError {
    #[error("id cell is empty")]
    MissingId,

    #[error("id {0:?} is not a non-negative integer")]
    InvalidId(String),

    #[error("unreadable row: {0}")]
    Csv(String),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no countries to process")]
    NoCountries,
}
