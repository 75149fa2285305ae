//! Dataset handles over uploaded tabular files.
//!
//! A [`Dataset`] offers exactly what the detection core needs: headers, a
//! bounded head sample, and full scans (one column, or whole rows) driven by
//! visitor callbacks. [`CsvSource`] re-reads the file for every scan and never
//! holds more than one record in memory; [`InMemoryTable`] owns its rows and is
//! used for Excel workbooks and for callers that already hold the data.

use std::{
    fs,
    path::{Path, PathBuf},
};

use encoding_rs::{Encoding, UTF_8};
use log::debug;

use crate::{error::DatasetError, heuristic::DetectionSample, io_utils};

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub delimiter: Option<u8>,
    pub encoding: &'static Encoding,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            encoding: UTF_8,
        }
    }
}

pub trait Dataset: Send + Sync {
    fn source(&self) -> &Path;

    fn headers(&self) -> &[String];

    /// Approximate payload size in bytes, used to pick a processing strategy.
    fn size_hint(&self) -> u64;

    /// Up to `cap` rows from the head of the dataset.
    fn sample(&self, cap: usize) -> Result<DetectionSample, DatasetError>;

    /// Visits every value of `column` in row order and returns the row count.
    fn scan_column(&self, column: &str, visit: &mut dyn FnMut(&str)) -> Result<u64, DatasetError>;

    /// Visits every data row in order, stopping at the first visitor error.
    fn scan_rows(
        &self,
        visit: &mut dyn FnMut(Vec<String>) -> Result<(), DatasetError>,
    ) -> Result<u64, DatasetError>;

    fn column_index(&self, column: &str) -> Result<usize, DatasetError> {
        self.headers()
            .iter()
            .position(|header| header == column)
            .ok_or_else(|| DatasetError::ColumnNotFound {
                column: column.to_string(),
            })
    }
}

/// Opens `path` with the loader matching its extension.
pub fn open_dataset(path: &Path, options: &ReadOptions) -> Result<Box<dyn Dataset>, DatasetError> {
    if !path.is_file() {
        return Err(DatasetError::inaccessible(path, "file does not exist"));
    }
    let extension = io_utils::extension(path).unwrap_or_default();
    match extension.as_str() {
        "csv" | "tsv" | "txt" => Ok(Box::new(CsvSource::open(path, options)?)),
        "xlsx" | "xls" | "xlsm" | "ods" => open_workbook(path),
        _ => Err(DatasetError::UnsupportedSource {
            path: path.to_path_buf(),
            extension,
        }),
    }
}

#[cfg(feature = "excel")]
fn open_workbook(path: &Path) -> Result<Box<dyn Dataset>, DatasetError> {
    Ok(Box::new(InMemoryTable::load_workbook(path)?))
}

#[cfg(not(feature = "excel"))]
fn open_workbook(path: &Path) -> Result<Box<dyn Dataset>, DatasetError> {
    Err(DatasetError::UnsupportedSource {
        path: path.to_path_buf(),
        extension: format!(
            "{} (rebuild with the `excel` feature)",
            io_utils::extension(path).unwrap_or_default()
        ),
    })
}

#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    delimiter: u8,
    encoding: &'static Encoding,
    headers: Vec<String>,
    byte_len: u64,
}

impl CsvSource {
    pub fn open(path: &Path, options: &ReadOptions) -> Result<Self, DatasetError> {
        let delimiter = io_utils::resolve_input_delimiter(path, options.delimiter);
        let byte_len = fs::metadata(path)
            .map_err(|err| DatasetError::inaccessible(path, err.to_string()))?
            .len();
        let mut reader = io_utils::open_csv_reader_from_path(path, delimiter)?;
        let header_record = reader.byte_headers()?.clone();
        if header_record.is_empty() {
            return Err(DatasetError::inaccessible(path, "no header row"));
        }
        let headers = io_utils::decode_headers(&header_record, options.encoding)?;
        debug!(
            "Opened {path:?}: {} column(s), {byte_len} byte(s)",
            headers.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            delimiter,
            encoding: options.encoding,
            headers,
            byte_len,
        })
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    fn reader(&self) -> Result<csv::Reader<std::io::BufReader<fs::File>>, DatasetError> {
        io_utils::open_csv_reader_from_path(&self.path, self.delimiter)
    }
}

impl Dataset for CsvSource {
    fn source(&self) -> &Path {
        &self.path
    }

    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn size_hint(&self) -> u64 {
        self.byte_len
    }

    fn sample(&self, cap: usize) -> Result<DetectionSample, DatasetError> {
        let mut sample = DetectionSample::new(self.headers.clone(), cap);
        let mut reader = self.reader()?;
        let mut record = csv::ByteRecord::new();
        while !sample.is_full() && reader.read_byte_record(&mut record)? {
            sample.push(io_utils::decode_record(&record, self.encoding));
        }
        Ok(sample)
    }

    fn scan_column(&self, column: &str, visit: &mut dyn FnMut(&str)) -> Result<u64, DatasetError> {
        let idx = self.column_index(column)?;
        let mut reader = self.reader()?;
        let mut record = csv::ByteRecord::new();
        let mut rows = 0u64;
        while reader.read_byte_record(&mut record)? {
            let field = record.get(idx).unwrap_or_default();
            visit(&io_utils::decode_field(field, self.encoding));
            rows += 1;
        }
        Ok(rows)
    }

    fn scan_rows(
        &self,
        visit: &mut dyn FnMut(Vec<String>) -> Result<(), DatasetError>,
    ) -> Result<u64, DatasetError> {
        let mut reader = self.reader()?;
        let mut record = csv::ByteRecord::new();
        let mut rows = 0u64;
        while reader.read_byte_record(&mut record)? {
            visit(io_utils::decode_record(&record, self.encoding))?;
            rows += 1;
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryTable {
    source: PathBuf,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl InMemoryTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            source: PathBuf::from("<memory>"),
            headers,
            rows,
        }
    }

    /// Reads the first worksheet of a workbook; date cells become ISO strings.
    #[cfg(feature = "excel")]
    pub fn load_workbook(path: &Path) -> Result<Self, DatasetError> {
        use calamine::{Data, DataType, Reader, open_workbook_auto};

        let mut workbook = open_workbook_auto(path)
            .map_err(|err| DatasetError::inaccessible(path, err.to_string()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| DatasetError::inaccessible(path, "workbook has no worksheets"))?
            .map_err(|err| DatasetError::inaccessible(path, err.to_string()))?;

        let render = |cell: &Data| -> String {
            match cell {
                Data::Empty => String::new(),
                Data::DateTime(_) => cell
                    .as_date()
                    .map(crate::formats::to_iso)
                    .unwrap_or_else(|| cell.to_string()),
                other => other.to_string(),
            }
        };

        let mut rows = range.rows();
        let headers = rows
            .next()
            .map(|row| row.iter().map(render).collect::<Vec<_>>())
            .filter(|headers| !headers.is_empty())
            .ok_or_else(|| DatasetError::inaccessible(path, "worksheet has no header row"))?;
        let rows = rows
            .map(|row| row.iter().map(render).collect())
            .collect::<Vec<Vec<String>>>();
        debug!("Loaded {} row(s) from workbook {path:?}", rows.len());
        Ok(Self {
            source: path.to_path_buf(),
            headers,
            rows,
        })
    }
}

impl Dataset for InMemoryTable {
    fn source(&self) -> &Path {
        &self.source
    }

    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn size_hint(&self) -> u64 {
        self.rows
            .iter()
            .flatten()
            .map(|cell| cell.len() as u64 + 1)
            .sum()
    }

    fn sample(&self, cap: usize) -> Result<DetectionSample, DatasetError> {
        Ok(DetectionSample::from_rows(
            self.headers.clone(),
            self.rows.iter().cloned(),
            cap,
        ))
    }

    fn scan_column(&self, column: &str, visit: &mut dyn FnMut(&str)) -> Result<u64, DatasetError> {
        let idx = self.column_index(column)?;
        for row in &self.rows {
            visit(row.get(idx).map(String::as_str).unwrap_or_default());
        }
        Ok(self.rows.len() as u64)
    }

    fn scan_rows(
        &self,
        visit: &mut dyn FnMut(Vec<String>) -> Result<(), DatasetError>,
    ) -> Result<u64, DatasetError> {
        for row in &self.rows {
            visit(row.clone())?;
        }
        Ok(self.rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn csv_source_samples_head_and_scans_columns() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("orders.csv");
        let mut file = fs::File::create(&path).expect("create csv");
        writeln!(file, "id,ordered_at").unwrap();
        for i in 1..=5 {
            writeln!(file, "{i},2024-01-0{i}").unwrap();
        }
        drop(file);

        let source = CsvSource::open(&path, &ReadOptions::default()).expect("open");
        assert_eq!(source.headers(), ["id", "ordered_at"]);
        assert_eq!(source.sample(3).unwrap().len(), 3);

        let mut seen = Vec::new();
        let rows = source
            .scan_column("ordered_at", &mut |value| seen.push(value.to_string()))
            .unwrap();
        assert_eq!(rows, 5);
        assert_eq!(seen.last().map(String::as_str), Some("2024-01-05"));
        assert!(matches!(
            source.scan_column("missing", &mut |_| {}),
            Err(DatasetError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn open_dataset_rejects_missing_and_unknown_files() {
        let dir = tempdir().expect("temp dir");
        let missing = dir.path().join("nope.csv");
        assert!(matches!(
            open_dataset(&missing, &ReadOptions::default()),
            Err(DatasetError::EmptyOrInaccessibleDataset { .. })
        ));

        let unknown = dir.path().join("data.parquet");
        fs::write(&unknown, b"PAR1").unwrap();
        assert!(matches!(
            open_dataset(&unknown, &ReadOptions::default()),
            Err(DatasetError::UnsupportedSource { .. })
        ));

        let empty = dir.path().join("empty.csv");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(
            open_dataset(&empty, &ReadOptions::default()),
            Err(DatasetError::EmptyOrInaccessibleDataset { .. })
        ));
    }

    #[test]
    fn in_memory_table_pads_short_rows_with_empty_values() {
        let table = InMemoryTable::new(
            vec!["id".into(), "date".into()],
            vec![vec!["1".into()], vec!["2".into(), "2024-02-01".into()]],
        );
        let mut seen = Vec::new();
        table
            .scan_column("date", &mut |value| seen.push(value.to_string()))
            .unwrap();
        assert_eq!(seen, vec!["", "2024-02-01"]);
    }

    #[cfg(feature = "excel")]
    #[test]
    fn workbook_date_cells_load_as_iso_strings() {
        use crate::heuristic::{DetectionOptions, detect};
        use rust_xlsxwriter::{ExcelDateTime, Format, Workbook};

        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("visits.xlsx");
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        let day = Format::new().set_num_format("yyyy-mm-dd");
        sheet.write_string(0, 0, "visitor").unwrap();
        sheet.write_string(0, 1, "visited").unwrap();
        let visits = [("ana", (2024, 3, 1)), ("bo", (2023, 11, 20)), ("cy", (2024, 1, 9))];
        for (idx, (name, (y, m, d))) in visits.into_iter().enumerate() {
            let row = idx as u32 + 1;
            sheet.write_string(row, 0, name).unwrap();
            let date = ExcelDateTime::from_ymd(y, m, d).unwrap();
            sheet.write_datetime_with_format(row, 1, &date, &day).unwrap();
        }
        workbook.save(&path).unwrap();

        let dataset = open_dataset(&path, &ReadOptions::default()).unwrap();
        assert_eq!(dataset.headers(), ["visitor", "visited"]);
        let mut seen = Vec::new();
        let rows = dataset
            .scan_column("visited", &mut |value| seen.push(value.to_string()))
            .unwrap();
        assert_eq!(rows, 3);
        assert_eq!(seen, vec!["2024-03-01", "2023-11-20", "2024-01-09"]);

        let options = DetectionOptions::default();
        let sample = dataset.sample(options.sample_rows).unwrap();
        let result = detect(&sample, dataset.headers(), &options);
        assert_eq!(result.column(), Some("visited"));
        assert_eq!(result.format().map(|f| f.id), Some("iso"));
    }
}
