//! Error types shared by the detection, extraction, and processing layers.
//!
//! Per-row parse failures never surface here: they are counted on
//! [`crate::range::RangeScan`] and [`crate::harmonize::HarmonizationOutcome`].
//! Whole-operation failures are captured into a
//! [`crate::record::ProcessingRecord`] by the processor instead of reaching the
//! CLI as an uncaught error.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::record::Status;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("No date column found (no column reached a {percent:.0}% match ratio)", percent = .threshold * 100.0)]
    NoDateColumnFound { threshold: f64 },
    #[error("Column '{column}' does not contain any recognizable dates")]
    UnparseableColumn { column: String },
    #[error("Column '{column}' not found in dataset")]
    ColumnNotFound { column: String },
    #[error("Dataset {path:?} is empty or inaccessible: {reason}")]
    EmptyOrInaccessibleDataset { path: PathBuf, reason: String },
    #[error("Unsupported file type {extension:?} for {path:?}")]
    UnsupportedSource { path: PathBuf, extension: String },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to decode text with encoding {0}")]
    Encoding(&'static str),
}

impl DatasetError {
    pub fn inaccessible(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DatasetError::EmptyOrInaccessibleDataset {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{value}' does not match date format {pattern}")]
pub struct ParseError {
    pub value: String,
    pub pattern: &'static str,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid transition for '{file_id}': {from} -> {to}")]
    InvalidTransition {
        file_id: String,
        from: Status,
        to: Status,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No record for '{0}'")]
    Missing(String),
    #[error("Metadata store I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Metadata store lock poisoned")]
    Poisoned,
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("A worker is already running for '{0}'")]
    AlreadyRunning(String),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("Worker thread for '{0}' panicked")]
    Panicked(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
