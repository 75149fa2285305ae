use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::ReadOptions,
    formats::AmbiguityPreference,
    harmonize::{DEFAULT_CHUNK_ROWS, DEFAULT_CHUNKED_THRESHOLD_BYTES, HarmonizeOptions},
    heuristic::{DEFAULT_SAMPLE_ROWS, DEFAULT_THRESHOLD, DetectionOptions},
    io_utils,
    worker::DEFAULT_POLL_INTERVAL,
};

pub const DEFAULT_STORE_DIR: &str = "uploads";

/// Runtime settings: defaults, then an optional YAML file, then CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub store_dir: PathBuf,
    pub sample_rows: usize,
    pub threshold: f64,
    pub preference: AmbiguityPreference,
    pub delimiter: Option<char>,
    pub input_encoding: Option<String>,
    pub chunked_threshold_bytes: u64,
    pub chunk_rows: usize,
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            sample_rows: DEFAULT_SAMPLE_ROWS,
            threshold: DEFAULT_THRESHOLD,
            preference: AmbiguityPreference::default(),
            delimiter: None,
            input_encoding: None,
            chunked_threshold_bytes: DEFAULT_CHUNKED_THRESHOLD_BYTES,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("Reading settings file {path:?}"))?;
                if raw.trim().is_empty() {
                    Settings::default()
                } else {
                    serde_yaml::from_str(&raw)
                        .with_context(|| format!("Parsing settings file {path:?}"))?
                }
            }
            None => Settings::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.threshold),
            "threshold must be between 0 and 1, got {}",
            self.threshold
        );
        ensure!(self.sample_rows > 0, "sample_rows must be at least 1");
        ensure!(self.chunk_rows > 0, "chunk_rows must be at least 1");
        if let Some(delimiter) = self.delimiter {
            ensure!(delimiter.is_ascii(), "delimiter must be a single ASCII character");
        }
        Ok(())
    }

    pub fn delimiter_byte(&self) -> Option<u8> {
        self.delimiter.filter(char::is_ascii).map(|c| c as u8)
    }

    pub fn detection(&self) -> DetectionOptions {
        DetectionOptions {
            sample_rows: self.sample_rows,
            threshold: self.threshold,
            preference: self.preference,
        }
    }

    pub fn read_options(&self) -> Result<ReadOptions> {
        let encoding = io_utils::resolve_encoding(self.input_encoding.as_deref())
            .map_err(anyhow::Error::msg)?;
        Ok(ReadOptions {
            delimiter: self.delimiter_byte(),
            encoding,
        })
    }

    pub fn harmonize(&self) -> HarmonizeOptions {
        HarmonizeOptions {
            chunked_threshold_bytes: self.chunked_threshold_bytes,
            chunk_rows: self.chunk_rows,
            preference: self.preference,
            ..HarmonizeOptions::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn yaml_overrides_only_named_fields() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.yml");
        fs::write(
            &path,
            "threshold: 0.9\npreference: day-first\ndelimiter: ';'\n",
        )
        .unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.threshold, 0.9);
        assert_eq!(settings.preference, AmbiguityPreference::DayFirst);
        assert_eq!(settings.delimiter_byte(), Some(b';'));
        assert_eq!(settings.sample_rows, DEFAULT_SAMPLE_ROWS);
        assert_eq!(settings.store_dir, PathBuf::from(DEFAULT_STORE_DIR));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.yml");
        fs::write(&path, "threshold: 1.5\n").unwrap();
        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn unknown_encoding_is_reported() {
        let settings = Settings {
            input_encoding: Some("klingon".into()),
            ..Settings::default()
        };
        assert!(settings.read_options().is_err());
    }
}
