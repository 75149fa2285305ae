#![allow(dead_code)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use tempfile::{TempDir, tempdir};

/// Scratch directory with a source area and an upload store underneath.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Upload directory used with `--store`.
    pub fn store(&self) -> PathBuf {
        self.temp_dir.path().join("uploads")
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// Writes `rows` rows of `id,label,date` where the date cycles through
    /// `start..=end` one day per row, formatted with `pattern`.
    pub fn write_dated_rows(
        &self,
        name: &str,
        rows: usize,
        start: NaiveDate,
        end: NaiveDate,
        pattern: &str,
    ) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut out = BufWriter::new(File::create(&path).expect("create csv"));
        writeln!(out, "id,label,date").expect("header");
        let span = (end - start).num_days() + 1;
        for i in 0..rows {
            let date = start + Duration::days(i as i64 % span);
            writeln!(out, "{i},item-{},{}", i % 97, date.format(pattern)).expect("row");
        }
        out.flush().expect("flush csv");
        path
    }
}

pub fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// Values of one column of a CSV file, by header name.
pub fn read_column(path: &Path, column: &str) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).expect("open csv");
    let idx = reader
        .headers()
        .expect("headers")
        .iter()
        .position(|h| h == column)
        .expect("column present");
    reader
        .records()
        .map(|r| r.expect("record").get(idx).unwrap_or_default().to_string())
        .collect()
}
