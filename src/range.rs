//! Streaming min/max extraction for a confirmed date column.
//!
//! The scan folds each parsed value into a running `(min, max)` pair. Nothing
//! but the two bounds and a few counters is kept, so memory use does not grow
//! with the dataset.

use std::fmt;

use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{dataset::Dataset, error::DatasetError, formats::DateFormatSpec};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn include(&mut self, date: NaiveDate) {
        if date < self.start {
            self.start = date;
        }
        if date > self.end {
            self.end = date;
        }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} .. {}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeScan {
    pub range: DateRange,
    pub parsed: u64,
    /// Non-empty values that did not parse with the column's format.
    pub skipped: u64,
    pub empty: u64,
}

#[derive(Debug, Default)]
struct RangeFold {
    range: Option<DateRange>,
    parsed: u64,
    skipped: u64,
    empty: u64,
}

impl RangeFold {
    fn ingest(&mut self, value: &str, spec: &DateFormatSpec) {
        if value.trim().is_empty() {
            self.empty += 1;
            return;
        }
        match spec.parse(value) {
            Ok(date) => {
                self.parsed += 1;
                match self.range.as_mut() {
                    Some(range) => range.include(date),
                    None => self.range = Some(DateRange::single(date)),
                }
            }
            Err(_) => self.skipped += 1,
        }
    }
}

pub fn extract_range(
    dataset: &dyn Dataset,
    column: &str,
    spec: &DateFormatSpec,
) -> Result<RangeScan, DatasetError> {
    let mut fold = RangeFold::default();
    let rows = dataset.scan_column(column, &mut |value| fold.ingest(value, spec))?;
    debug!(
        "Scanned {rows} row(s) of '{column}' in {:?}: {} parsed, {} skipped, {} empty",
        dataset.source(),
        fold.parsed,
        fold.skipped,
        fold.empty
    );
    let range = fold.range.ok_or_else(|| DatasetError::UnparseableColumn {
        column: column.to_string(),
    })?;
    if fold.skipped > 0 {
        warn!(
            "Skipped {} value(s) in '{column}' that did not match {}",
            fold.skipped, spec.pattern
        );
    }
    Ok(RangeScan {
        range,
        parsed: fold.parsed,
        skipped: fold.skipped,
        empty: fold.empty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::InMemoryTable, formats::FormatCatalog};

    fn table(values: &[&str]) -> InMemoryTable {
        InMemoryTable::new(
            vec!["when".into()],
            values.iter().map(|v| vec![v.to_string()]).collect(),
        )
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn extract_range_skips_malformed_and_empty_values() {
        let iso = FormatCatalog::by_id("iso").unwrap();
        let data = table(&["2024-03-01", "", "garbage", "2023-12-31", "2024-13-01", "2024-02-29"]);
        let scan = extract_range(&data, "when", iso).expect("range");
        assert_eq!(scan.range.start, ymd(2023, 12, 31));
        assert_eq!(scan.range.end, ymd(2024, 3, 1));
        assert_eq!(scan.parsed, 3);
        assert_eq!(scan.skipped, 2);
        assert_eq!(scan.empty, 1);
        assert_eq!(scan.range.to_string(), "2023-12-31 .. 2024-03-01");
    }

    #[test]
    fn extract_range_fails_when_nothing_parses() {
        let iso = FormatCatalog::by_id("iso").unwrap();
        let data = table(&["", "n/a", "01/02/2024"]);
        assert!(matches!(
            extract_range(&data, "when", iso),
            Err(DatasetError::UnparseableColumn { .. })
        ));
        assert!(matches!(
            extract_range(&data, "other", iso),
            Err(DatasetError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn single_value_range_has_equal_bounds() {
        let us = FormatCatalog::by_id("us-slash").unwrap();
        let scan = extract_range(&table(&["07/04/2024"]), "when", us).unwrap();
        assert_eq!(scan.range, DateRange::single(ymd(2024, 7, 4)));
        assert_eq!(scan.range.days(), 0);
    }
}
