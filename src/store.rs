//! Metadata persistence for processing records.
//!
//! Every write replaces a whole record while the store's lock is held, so a
//! reader polling from another thread sees either the previous transition or
//! the next one, never a mix of the two.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};

use log::debug;

use crate::{
    error::{StateError, StoreError},
    record::ProcessingRecord,
};

pub const METADATA_FILE_NAME: &str = ".metadata.json";

pub trait RecordStore: Send + Sync {
    fn get(&self, file_id: &str) -> Result<Option<ProcessingRecord>, StoreError>;

    fn put(&self, record: &ProcessingRecord) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<ProcessingRecord>, StoreError>;

    fn remove(&self, file_id: &str) -> Result<bool, StoreError>;

    /// Applies one transition to the stored record atomically and returns the
    /// updated copy.
    fn update(
        &self,
        file_id: &str,
        apply: &mut dyn FnMut(&mut ProcessingRecord) -> Result<(), StateError>,
    ) -> Result<ProcessingRecord, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, ProcessingRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, file_id: &str) -> Result<Option<ProcessingRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(file_id).cloned())
    }

    fn put(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.insert(record.file_id.clone(), record.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<ProcessingRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut all = records.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(all)
    }

    fn remove(&self, file_id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        Ok(records.remove(file_id).is_some())
    }

    fn update(
        &self,
        file_id: &str,
        apply: &mut dyn FnMut(&mut ProcessingRecord) -> Result<(), StateError>,
    ) -> Result<ProcessingRecord, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let stored = records
            .get_mut(file_id)
            .ok_or_else(|| StoreError::Missing(file_id.to_string()))?;
        let mut next = stored.clone();
        apply(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }
}

/// All records of an upload directory in one pretty-printed JSON object keyed
/// by file id.
#[derive(Debug)]
pub struct JsonRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(METADATA_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, ProcessingRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let file = File::open(&self.path).map_err(|source| self.io_error(source))?;
        if file.metadata().map(|m| m.len() == 0).unwrap_or(false) {
            return Ok(BTreeMap::new());
        }
        let records = serde_json::from_reader(BufReader::new(file))?;
        Ok(records)
    }

    fn save(&self, records: &BTreeMap<String, ProcessingRecord>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        let staging = self.path.with_extension("json.tmp");
        let file = File::create(&staging).map_err(|source| self.io_error(source))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, records)?;
        writer.flush().map_err(|source| self.io_error(source))?;
        drop(writer);
        fs::rename(&staging, &self.path).map_err(|source| self.io_error(source))?;
        debug!("Saved {} record(s) to {:?}", records.len(), self.path);
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl RecordStore for JsonRecordStore {
    fn get(&self, file_id: &str) -> Result<Option<ProcessingRecord>, StoreError> {
        let _guard = self.guard()?;
        Ok(self.load()?.remove(file_id))
    }

    fn put(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let mut records = self.load()?;
        records.insert(record.file_id.clone(), record.clone());
        self.save(&records)
    }

    fn list(&self) -> Result<Vec<ProcessingRecord>, StoreError> {
        let _guard = self.guard()?;
        Ok(self.load()?.into_values().collect())
    }

    fn remove(&self, file_id: &str) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        let mut records = self.load()?;
        if records.remove(file_id).is_none() {
            return Ok(false);
        }
        self.save(&records)?;
        Ok(true)
    }

    fn update(
        &self,
        file_id: &str,
        apply: &mut dyn FnMut(&mut ProcessingRecord) -> Result<(), StateError>,
    ) -> Result<ProcessingRecord, StoreError> {
        let _guard = self.guard()?;
        let mut records = self.load()?;
        let record = records
            .get_mut(file_id)
            .ok_or_else(|| StoreError::Missing(file_id.to_string()))?;
        apply(record)?;
        let updated = record.clone();
        self.save(&records)?;
        Ok(updated)
    }
}
