//! Rewrites confirmed date columns to ISO 8601 (`YYYY-MM-DD`).
//!
//! Two strategies share one entry point. [`HarmonizeStrategy::RowWise`]
//! converts and writes one record at a time; [`HarmonizeStrategy::Chunked`]
//! buffers a fixed number of records, converts the chunk in parallel with
//! rayon, then writes it in order. The strategy is chosen from the dataset's
//! size hint unless forced. Either way the output is streamed to a CSV file
//! and bad values are counted, never fatal.

use std::{
    io,
    ops::AddAssign,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    dataset::{CsvSource, Dataset, ReadOptions},
    error::DatasetError,
    formats::{AmbiguityPreference, DateFormatSpec, FormatCatalog, to_iso},
    heuristic::DetectionResult,
    io_utils,
};

pub const DEFAULT_CHUNKED_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024;
pub const DEFAULT_CHUNK_ROWS: usize = 20_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HarmonizeStrategy {
    RowWise,
    Chunked,
}

impl HarmonizeStrategy {
    pub fn select(dataset: &dyn Dataset, options: &HarmonizeOptions) -> Self {
        if let Some(forced) = options.strategy {
            return forced;
        }
        if dataset.size_hint() >= options.chunked_threshold_bytes {
            HarmonizeStrategy::Chunked
        } else {
            HarmonizeStrategy::RowWise
        }
    }
}

pub const HARMONIZED_SUFFIX: &str = "_harmonized";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputColumn {
    #[default]
    InPlace,
    /// Keep each original column and add its ISO values under
    /// `<column><suffix>`, made unique against the existing headers.
    Appended { suffix: String },
}

impl OutputColumn {
    pub fn appended() -> Self {
        OutputColumn::Appended {
            suffix: HARMONIZED_SUFFIX.to_string(),
        }
    }
}

/// A column to rewrite and the format its values were detected in.
#[derive(Debug, Clone, Copy)]
pub struct HarmonizeTarget<'a> {
    pub column: &'a str,
    pub spec: &'a DateFormatSpec,
}

/// Every column that met the detection threshold, each with its own format.
pub fn detected_targets(
    result: &DetectionResult,
) -> Result<Vec<HarmonizeTarget<'_>>, DatasetError> {
    let targets = result
        .qualifying()
        .filter_map(|candidate| {
            candidate.format.map(|spec| HarmonizeTarget {
                column: candidate.column.as_str(),
                spec,
            })
        })
        .collect::<Vec<_>>();
    if targets.is_empty() {
        return Err(DatasetError::NoDateColumnFound {
            threshold: result.threshold,
        });
    }
    Ok(targets)
}

#[derive(Debug, Clone)]
pub struct HarmonizeOptions {
    pub output_column: OutputColumn,
    pub strategy: Option<HarmonizeStrategy>,
    pub chunked_threshold_bytes: u64,
    pub chunk_rows: usize,
    pub delimiter: u8,
    pub preference: AmbiguityPreference,
}

impl Default for HarmonizeOptions {
    fn default() -> Self {
        Self {
            output_column: OutputColumn::InPlace,
            strategy: None,
            chunked_threshold_bytes: DEFAULT_CHUNKED_THRESHOLD_BYTES,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            delimiter: io_utils::DEFAULT_CSV_DELIMITER,
            preference: AmbiguityPreference::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub converted: u64,
    /// Subset of `converted` that needed a catalog format other than the declared one.
    pub fallback: u64,
    pub failed: u64,
    pub empty: u64,
}

impl AddAssign for Tally {
    fn add_assign(&mut self, other: Self) {
        self.converted += other.converted;
        self.fallback += other.fallback;
        self.failed += other.failed;
        self.empty += other.empty;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarmonizedColumn {
    pub column: String,
    /// Header the ISO values were written under.
    pub header: String,
    pub format: &'static str,
    pub tally: Tally,
}

#[derive(Debug, Clone)]
pub struct HarmonizationOutcome {
    pub rows: u64,
    /// Sum over `columns`.
    pub tally: Tally,
    pub columns: Vec<HarmonizedColumn>,
    pub strategy: HarmonizeStrategy,
    pub output: CsvSource,
}

impl HarmonizationOutcome {
    pub fn converted(&self) -> u64 {
        self.tally.converted
    }

    pub fn failed(&self) -> u64 {
        self.tally.failed
    }
}

enum Cell {
    Iso(String),
    Failed,
    Empty,
}

struct Target<'a> {
    idx: usize,
    spec: &'a DateFormatSpec,
}

struct Converter<'a> {
    targets: Vec<Target<'a>>,
    width: usize,
    catalog: &'a FormatCatalog,
    append: bool,
}

impl Converter<'_> {
    fn convert(&self, spec: &DateFormatSpec, value: &str, tally: &mut Tally) -> Cell {
        if value.trim().is_empty() {
            tally.empty += 1;
            return Cell::Empty;
        }
        if let Ok(date) = spec.parse(value) {
            tally.converted += 1;
            return Cell::Iso(to_iso(date));
        }
        match self.catalog.parse_any(value) {
            Some((_, date)) => {
                tally.converted += 1;
                tally.fallback += 1;
                Cell::Iso(to_iso(date))
            }
            None => {
                tally.failed += 1;
                Cell::Failed
            }
        }
    }

    /// Converts every target cell of `row`, one tally slot per target.
    fn apply(&self, row: &mut Vec<String>, tallies: &mut [Tally]) {
        if row.len() < self.width {
            row.resize(self.width, String::new());
        }
        if self.append {
            row.truncate(self.width);
        }
        for (target, tally) in self.targets.iter().zip(tallies.iter_mut()) {
            let cell = self.convert(target.spec, &row[target.idx], tally);
            match (self.append, cell) {
                (false, Cell::Iso(iso)) => row[target.idx] = iso,
                (false, _) => {}
                (true, Cell::Iso(iso)) => row.push(iso),
                (true, _) => row.push(String::new()),
            }
        }
    }

    fn tallies(&self) -> Vec<Tally> {
        vec![Tally::default(); self.targets.len()]
    }
}

fn merge(mut acc: Vec<Tally>, next: Vec<Tally>) -> Vec<Tally> {
    for (slot, tally) in acc.iter_mut().zip(next) {
        *slot += tally;
    }
    acc
}

/// `base`, or `base_2`, `base_3`... whichever is not taken yet.
fn unique_header(taken: &[String], base: String) -> String {
    if !taken.contains(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(base)
}

pub fn harmonize(
    dataset: &dyn Dataset,
    column: &str,
    spec: &DateFormatSpec,
    output: &Path,
    options: &HarmonizeOptions,
) -> Result<HarmonizationOutcome, DatasetError> {
    harmonize_columns(dataset, &[HarmonizeTarget { column, spec }], output, options)
}

/// Rewrites several date columns in one pass, each with its own format.
pub fn harmonize_columns(
    dataset: &dyn Dataset,
    targets: &[HarmonizeTarget<'_>],
    output: &Path,
    options: &HarmonizeOptions,
) -> Result<HarmonizationOutcome, DatasetError> {
    if same_file(dataset.source(), output) {
        return Err(invalid_input(format!(
            "Refusing to overwrite the source file {output:?}"
        )));
    }
    if targets.is_empty() {
        return Err(invalid_input("No columns to harmonize".to_string()));
    }
    if let Some(dup) = targets.iter().map(|t| t.column).duplicates().next() {
        return Err(invalid_input(format!("Column '{dup}' is listed more than once")));
    }
    let resolved = targets
        .iter()
        .map(|target| {
            Ok(Target {
                idx: dataset.column_index(target.column)?,
                spec: target.spec,
            })
        })
        .collect::<Result<Vec<_>, DatasetError>>()?;

    let strategy = HarmonizeStrategy::select(dataset, options);
    let catalog = FormatCatalog::new(options.preference);
    let converter = Converter {
        targets: resolved,
        width: dataset.headers().len(),
        catalog: &catalog,
        append: matches!(options.output_column, OutputColumn::Appended { .. }),
    };
    let names = targets.iter().map(|t| t.column).join(", ");
    debug!(
        "Harmonizing [{names}] of {:?} using {strategy:?}",
        dataset.source()
    );

    let mut headers = dataset.headers().to_vec();
    let mut written = Vec::with_capacity(targets.len());
    for target in targets {
        let header = match &options.output_column {
            OutputColumn::InPlace => target.column.to_string(),
            OutputColumn::Appended { suffix } => {
                let wanted = format!("{}{suffix}", target.column);
                let header = unique_header(&headers, wanted.clone());
                if header != wanted {
                    warn!("Header '{wanted}' already exists; writing '{header}' instead");
                }
                headers.push(header.clone());
                header
            }
        };
        written.push(header);
    }

    let mut writer = io_utils::open_csv_writer(output, options.delimiter)?;
    writer.write_record(&headers)?;

    let mut tallies = converter.tallies();
    let rows = match strategy {
        HarmonizeStrategy::RowWise => dataset.scan_rows(&mut |mut row| {
            converter.apply(&mut row, &mut tallies);
            writer.write_record(&row)?;
            Ok(())
        })?,
        HarmonizeStrategy::Chunked => {
            let chunk_rows = options.chunk_rows.max(1);
            let mut chunk = Vec::with_capacity(chunk_rows);
            let rows = dataset.scan_rows(&mut |row| {
                chunk.push(row);
                if chunk.len() >= chunk_rows {
                    let done = flush_chunk(&converter, &mut chunk, &mut writer)?;
                    tallies = merge(std::mem::take(&mut tallies), done);
                }
                Ok(())
            })?;
            let done = flush_chunk(&converter, &mut chunk, &mut writer)?;
            tallies = merge(tallies, done);
            rows
        }
    };
    writer.flush()?;
    drop(writer);

    let columns = targets
        .iter()
        .zip(written)
        .zip(tallies)
        .map(|((target, header), tally)| HarmonizedColumn {
            column: target.column.to_string(),
            header,
            format: target.spec.id,
            tally,
        })
        .collect::<Vec<_>>();
    let mut tally = Tally::default();
    for column in &columns {
        if column.tally.failed > 0 {
            warn!(
                "{} value(s) in '{}' matched no known date format and were left unchanged",
                column.tally.failed, column.column
            );
        }
        tally += column.tally;
    }
    info!(
        "Harmonized {} value(s) across {rows} row(s) in [{names}] -> {output:?}",
        tally.converted
    );
    let output = CsvSource::open(
        output,
        &ReadOptions {
            delimiter: Some(options.delimiter),
            ..ReadOptions::default()
        },
    )?;
    Ok(HarmonizationOutcome {
        rows,
        tally,
        columns,
        strategy,
        output,
    })
}

fn invalid_input(message: String) -> DatasetError {
    DatasetError::Io(io::Error::new(io::ErrorKind::InvalidInput, message))
}

fn flush_chunk<W: io::Write>(
    converter: &Converter<'_>,
    chunk: &mut Vec<Vec<String>>,
    writer: &mut csv::Writer<W>,
) -> Result<Vec<Tally>, DatasetError> {
    let tallies = chunk
        .par_iter_mut()
        .fold(
            || converter.tallies(),
            |mut acc, row| {
                converter.apply(row, &mut acc);
                acc
            },
        )
        .reduce(|| converter.tallies(), merge);
    for row in chunk.drain(..) {
        writer.write_record(&row)?;
    }
    Ok(tallies)
}

fn same_file(a: &Path, b: &Path) -> bool {
    let canonical = |p: &Path| -> Option<PathBuf> { p.canonicalize().ok() };
    match (canonical(a), canonical(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}
