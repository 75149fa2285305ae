//! The upload directory: where registered files live, keyed by file name.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use log::info;
use sha2::{Digest, Sha256};

use crate::{
    dataset::{Dataset, ReadOptions, open_dataset},
    error::DatasetError,
    store::METADATA_FILE_NAME,
};

pub const SUPPORTED_EXTENSIONS: &[&str] = &["csv", "tsv", "txt", "xlsx", "xls", "xlsm", "ods"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub file_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

/// Resolves file ids to datasets for the processor.
pub trait DatasetProvider: Send + Sync {
    fn open(&self, file_id: &str) -> Result<Box<dyn Dataset>, DatasetError>;
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    read_options: ReadOptions,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, read_options: ReadOptions) -> Self {
        Self {
            dir: dir.into(),
            read_options,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, file_id: &str) -> PathBuf {
        self.dir.join(file_id)
    }

    /// Copies `source` into the upload directory under its file name.
    pub fn save(&self, source: &Path) -> Result<StoredFile, DatasetError> {
        let file_id = file_id_for(source)?;
        fs::create_dir_all(&self.dir)?;
        let target = self.path_for(&file_id);
        let same = match (source.canonicalize(), target.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if !same {
            fs::copy(source, &target)
                .map_err(|err| DatasetError::inaccessible(source, err.to_string()))?;
        }
        let stored = self.describe(&file_id)?;
        info!(
            "Stored '{}' ({} bytes, sha256 {})",
            stored.file_id,
            stored.size,
            &stored.checksum[..12.min(stored.checksum.len())]
        );
        Ok(stored)
    }

    pub fn describe(&self, file_id: &str) -> Result<StoredFile, DatasetError> {
        let path = self.path_for(file_id);
        let size = fs::metadata(&path)
            .map_err(|err| DatasetError::inaccessible(&path, err.to_string()))?
            .len();
        let checksum = checksum(&path)?;
        Ok(StoredFile {
            file_id: file_id.to_string(),
            path,
            size,
            checksum,
        })
    }

    /// Registered files, newest first.
    pub fn list(&self) -> Result<Vec<PathBuf>, DatasetError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == METADATA_FILE_NAME || !entry.file_type()?.is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            files.push((modified, entry.path()));
        }
        Ok(files
            .into_iter()
            .sorted_by(|a, b| b.0.cmp(&a.0))
            .map(|(_, path)| path)
            .collect())
    }

    pub fn delete(&self, file_id: &str) -> Result<bool, DatasetError> {
        let path = self.path_for(file_id);
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }
}

impl DatasetProvider for UploadStore {
    fn open(&self, file_id: &str) -> Result<Box<dyn Dataset>, DatasetError> {
        open_dataset(&self.path_for(file_id), &self.read_options)
    }
}

fn file_id_for(source: &Path) -> Result<String, DatasetError> {
    let name = source
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.starts_with('.'))
        .ok_or_else(|| DatasetError::inaccessible(source, "not a regular file name"))?;
    let extension = crate::io_utils::extension(source).unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(DatasetError::UnsupportedSource {
            path: source.to_path_buf(),
            extension,
        });
    }
    Ok(name.to_string())
}

pub fn checksum(path: &Path) -> Result<String, DatasetError> {
    let mut file = File::open(path).map_err(|err| DatasetError::inaccessible(path, err.to_string()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_copies_and_fingerprints_files() {
        let dir = tempdir().expect("temp dir");
        let source = dir.path().join("orders.csv");
        fs::write(&source, "id,date\n1,2024-01-01\n").unwrap();
        let uploads = UploadStore::new(dir.path().join("uploads"), ReadOptions::default());

        let stored = uploads.save(&source).unwrap();
        assert_eq!(stored.file_id, "orders.csv");
        assert_eq!(stored.size, 21);
        assert_eq!(stored.checksum.len(), 64);
        assert_eq!(uploads.list().unwrap(), vec![uploads.path_for("orders.csv")]);

        fs::write(&source, "id,date\n1,2024-01-02\n").unwrap();
        let changed = uploads.save(&source).unwrap();
        assert_ne!(changed.checksum, stored.checksum);

        assert!(uploads.open("orders.csv").is_ok());
        assert!(uploads.delete("orders.csv").unwrap());
        assert!(!uploads.delete("orders.csv").unwrap());
    }

    #[test]
    fn save_rejects_unsupported_extensions() {
        let dir = tempdir().expect("temp dir");
        let source = dir.path().join("notes.md");
        fs::write(&source, "# hi").unwrap();
        let uploads = UploadStore::new(dir.path().join("uploads"), ReadOptions::default());
        assert!(matches!(
            uploads.save(&source),
            Err(DatasetError::UnsupportedSource { .. })
        ));
    }
}
