//! Date column detection over a bounded head sample.
//!
//! Each candidate column is scored by the share of its non-empty sampled
//! values that match *any* catalog format; the format reported for the column
//! is the one that matched most often (ties go to the higher-priority format).
//! Empty values are excluded from the denominator, so a sparse date column is
//! judged on the values it actually has.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::DatasetError,
    formats::{AmbiguityPreference, DateFormatSpec, FormatCatalog},
};

pub const DEFAULT_SAMPLE_ROWS: usize = 1000;
pub const DEFAULT_THRESHOLD: f64 = 0.80;

/// A bounded prefix of a dataset's rows. The cap is enforced on insertion.
#[derive(Debug, Clone)]
pub struct DetectionSample {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    cap: usize,
}

impl DetectionSample {
    pub fn new(headers: Vec<String>, cap: usize) -> Self {
        Self {
            headers,
            rows: Vec::with_capacity(cap.min(DEFAULT_SAMPLE_ROWS)),
            cap,
        }
    }

    pub fn from_rows<I>(headers: Vec<String>, rows: I, cap: usize) -> Self
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let mut sample = Self::new(headers, cap);
        for row in rows.into_iter().take(cap) {
            sample.push(row);
        }
        sample
    }

    /// Adds `row` unless the sample is already full.
    pub fn push(&mut self, row: Vec<String>) -> bool {
        if self.is_full() {
            return false;
        }
        self.rows.push(row);
        true
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.cap
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == column)
    }

    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .map(move |row| row.get(idx).map(String::as_str).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionOptions {
    pub sample_rows: usize,
    pub threshold: f64,
    pub preference: AmbiguityPreference,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            sample_rows: DEFAULT_SAMPLE_ROWS,
            threshold: DEFAULT_THRESHOLD,
            preference: AmbiguityPreference::default(),
        }
    }
}

impl DetectionOptions {
    pub fn catalog(&self) -> FormatCatalog {
        FormatCatalog::new(self.preference)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCandidate {
    pub column: String,
    pub successes: usize,
    pub attempts: usize,
    pub format: Option<&'static DateFormatSpec>,
}

impl ColumnCandidate {
    /// Matched share of non-empty sampled values, always within `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn qualifies(&self, threshold: f64) -> bool {
        self.attempts > 0 && self.format.is_some() && self.ratio() >= threshold
    }
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub selected: Option<ColumnCandidate>,
    pub candidates: Vec<ColumnCandidate>,
    pub threshold: f64,
}

impl DetectionResult {
    pub fn column(&self) -> Option<&str> {
        self.selected.as_ref().map(|c| c.column.as_str())
    }

    pub fn format(&self) -> Option<&'static DateFormatSpec> {
        self.selected.as_ref().and_then(|c| c.format)
    }

    pub fn ratio(&self) -> Option<f64> {
        self.selected.as_ref().map(ColumnCandidate::ratio)
    }

    /// Every scored column meeting the threshold, in input order.
    pub fn qualifying(&self) -> impl Iterator<Item = &ColumnCandidate> {
        self.candidates
            .iter()
            .filter(move |candidate| candidate.qualifies(self.threshold))
    }
}

/// Format resolved for an explicitly chosen column.
#[derive(Debug, Clone)]
pub struct ColumnFormat {
    pub candidate: ColumnCandidate,
    pub format: &'static DateFormatSpec,
    /// Set when the match ratio is below the threshold; the override stands.
    pub warning: Option<String>,
}

pub fn score_column(
    sample: &DetectionSample,
    idx: usize,
    catalog: &FormatCatalog,
) -> ColumnCandidate {
    let mut per_spec = vec![0usize; catalog.specs().len()];
    let mut successes = 0usize;
    let mut attempts = 0usize;
    for value in sample.column_values(idx) {
        if value.trim().is_empty() {
            continue;
        }
        attempts += 1;
        if let Some(spec) = catalog.match_value(value) {
            successes += 1;
            per_spec[catalog.priority(spec)] += 1;
        }
    }
    // Most frequent spec; on equal counts the earlier (higher priority) wins.
    let format = per_spec
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .max_by(|(a_idx, a), (b_idx, b)| a.cmp(b).then(b_idx.cmp(a_idx)))
        .map(|(spec_idx, _)| catalog.specs()[spec_idx]);
    ColumnCandidate {
        column: sample.headers()[idx].clone(),
        successes,
        attempts,
        format,
    }
}

/// Scores `columns` (in the given order) and selects the best qualifying one.
pub fn detect(
    sample: &DetectionSample,
    columns: &[String],
    options: &DetectionOptions,
) -> DetectionResult {
    let catalog = options.catalog();
    let mut candidates = Vec::with_capacity(columns.len());
    for column in columns {
        match sample.column_index(column) {
            Some(idx) => candidates.push(score_column(sample, idx, &catalog)),
            None => debug!("Skipping column '{column}': not present in sample"),
        }
    }

    let mut selected: Option<&ColumnCandidate> = None;
    for candidate in &candidates {
        debug!(
            "Column '{}': {}/{} matched ({:.3}), format {:?}",
            candidate.column,
            candidate.successes,
            candidate.attempts,
            candidate.ratio(),
            candidate.format.map(|spec| spec.id)
        );
        if !candidate.qualifies(options.threshold) {
            continue;
        }
        // Strictly greater keeps the first column on ties.
        if selected.is_none_or(|best| candidate.ratio() > best.ratio()) {
            selected = Some(candidate);
        }
    }

    let selected = selected.cloned();
    DetectionResult {
        selected,
        candidates,
        threshold: options.threshold,
    }
}

/// Explicit-column mode: resolves a format for `column` without rejecting it
/// for a low ratio.
pub fn detect_format_for_column(
    sample: &DetectionSample,
    column: &str,
    options: &DetectionOptions,
) -> Result<ColumnFormat, DatasetError> {
    let idx = sample
        .column_index(column)
        .ok_or_else(|| DatasetError::ColumnNotFound {
            column: column.to_string(),
        })?;
    let candidate = score_column(sample, idx, &options.catalog());
    let format = candidate
        .format
        .ok_or_else(|| DatasetError::UnparseableColumn {
            column: column.to_string(),
        })?;
    let warning = (candidate.ratio() < options.threshold).then(|| {
        format!(
            "Only {}/{} sampled values in '{}' look like dates ({:.0}%)",
            candidate.successes,
            candidate.attempts,
            column,
            candidate.ratio() * 100.0
        )
    });
    if let Some(message) = &warning {
        warn!("{message}; keeping the requested column");
    }
    Ok(ColumnFormat {
        candidate,
        format,
        warning,
    })
}
