//! Drives one processing attempt from pending to a terminal state.
//!
//! Work failures (unreadable dataset, no date column, nothing parseable) are
//! written into the record as an `error` state; only metadata store failures
//! are returned to the caller. Every transition goes through
//! [`RecordStore::update`] and is then published to subscribers.
//!
//! A record found in `processing` that this processor is not running belongs
//! to a session that died mid-attempt. That attempt is closed as an error and
//! a new one may start; only attempts running here block a retry.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, mpsc},
};

use log::{error, info, warn};
use uuid::Uuid;

use crate::{
    dataset::Dataset,
    error::{DatasetError, StateError, StoreError},
    heuristic::{DetectionOptions, detect, detect_format_for_column},
    range::extract_range,
    record::{Completion, ProcessingRecord, Status},
    store::RecordStore,
    uploads::{DatasetProvider, StoredFile},
};

pub const INTERRUPTED_MESSAGE: &str = "Processing was interrupted before completion";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub file_id: String,
    pub attempt: Uuid,
    pub status: Status,
}

pub struct Processor {
    store: Arc<dyn RecordStore>,
    datasets: Arc<dyn DatasetProvider>,
    options: DetectionOptions,
    subscribers: Mutex<Vec<mpsc::Sender<StatusEvent>>>,
    running: Arc<Mutex<HashSet<String>>>,
}

/// Marks a file as running in this processor until dropped.
struct Running {
    file_id: String,
    set: Arc<Mutex<HashSet<String>>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.file_id);
        }
    }
}

impl Processor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        datasets: Arc<dyn DatasetProvider>,
        options: DetectionOptions,
    ) -> Self {
        Self {
            store,
            datasets,
            options,
            subscribers: Mutex::new(Vec::new()),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn options(&self) -> &DetectionOptions {
        &self.options
    }

    /// Receives every transition made by this processor from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Creates (or renews) the pending record for a freshly stored file.
    ///
    /// Re-uploading identical content starts a new attempt on the existing
    /// record; different content replaces the record entirely.
    pub fn register(&self, stored: &StoredFile) -> Result<ProcessingRecord, StoreError> {
        let existing = match self.store.get(&stored.file_id)? {
            Some(mut existing) => {
                self.close_interrupted(&mut existing)?;
                Some(existing)
            }
            None => None,
        };
        let record = match existing {
            Some(mut existing) if existing.checksum == stored.checksum => {
                existing.begin_attempt(None)?;
                existing.file_size = stored.size;
                existing
            }
            Some(existing) if existing.status() == Status::Processing => {
                return Err(StoreError::State(StateError::InvalidTransition {
                    file_id: existing.file_id,
                    from: Status::Processing,
                    to: Status::Pending,
                }));
            }
            _ => ProcessingRecord::new_pending(&stored.file_id, stored.size, stored.checksum.clone()),
        };
        self.store.put(&record)?;
        info!("Registered '{}' as pending", record.file_id);
        self.publish(&record);
        Ok(record)
    }

    /// Puts the record into a pending attempt for `requested_column`.
    pub fn prepare(
        &self,
        file_id: &str,
        requested_column: Option<String>,
    ) -> Result<ProcessingRecord, StoreError> {
        let mut became_pending = false;
        let record = self.store.update(file_id, &mut |record| {
            if record.status() == Status::Pending {
                return record.request_column(requested_column.clone());
            }
            self.close_interrupted(record)?;
            became_pending = true;
            record.begin_attempt(requested_column.clone()).map(|_| ())
        })?;
        if became_pending {
            self.publish(&record);
        }
        Ok(record)
    }

    /// Runs the prepared attempt of `file_id` to completion.
    pub fn run(&self, file_id: &str) -> Result<ProcessingRecord, StoreError> {
        let _running = self.enter(file_id)?;
        let record = self.transition(file_id, |record| record.mark_processing())?;
        let outcome = self
            .datasets
            .open(file_id)
            .and_then(|dataset| self.analyse(dataset.as_ref(), record.requested_column.as_deref()));
        self.finish(file_id, outcome)
    }

    /// Same as [`Processor::run`] against a dataset the caller already holds.
    pub fn run_with(
        &self,
        file_id: &str,
        dataset: &dyn Dataset,
    ) -> Result<ProcessingRecord, StoreError> {
        let _running = self.enter(file_id)?;
        let record = self.transition(file_id, |record| record.mark_processing())?;
        let outcome = self.analyse(dataset, record.requested_column.as_deref());
        self.finish(file_id, outcome)
    }

    /// Starts a fresh attempt (auto-detect or explicit column) and runs it.
    pub fn start(
        &self,
        file_id: &str,
        explicit_column: Option<&str>,
    ) -> Result<ProcessingRecord, StoreError> {
        self.prepare(file_id, explicit_column.map(str::to_string))?;
        self.run(file_id)
    }

    pub fn start_with(
        &self,
        file_id: &str,
        dataset: &dyn Dataset,
        explicit_column: Option<&str>,
    ) -> Result<ProcessingRecord, StoreError> {
        self.prepare(file_id, explicit_column.map(str::to_string))?;
        self.run_with(file_id, dataset)
    }

    /// Re-runs detection and range extraction for a user-chosen column.
    pub fn reassign_column(
        &self,
        file_id: &str,
        column: &str,
    ) -> Result<ProcessingRecord, StoreError> {
        info!("Reassigning date column of '{file_id}' to '{column}'");
        self.start(file_id, Some(column))
    }

    /// Marks a stuck attempt as failed (used when a worker dies mid-run).
    pub fn abandon(&self, file_id: &str, reason: &str) -> Result<ProcessingRecord, StoreError> {
        self.transition(file_id, |record| record.fail(reason))
    }

    /// Whether an attempt for `file_id` is executing in this processor.
    pub fn is_running(&self, file_id: &str) -> bool {
        self.running
            .lock()
            .map(|set| set.contains(file_id))
            .unwrap_or(false)
    }

    fn enter(&self, file_id: &str) -> Result<Running, StoreError> {
        let mut set = self.running.lock().map_err(|_| StoreError::Poisoned)?;
        set.insert(file_id.to_string());
        Ok(Running {
            file_id: file_id.to_string(),
            set: Arc::clone(&self.running),
        })
    }

    /// Fails a `processing` attempt left behind by a dead session. Attempts
    /// running in this processor are left alone and keep blocking a retry.
    fn close_interrupted(&self, record: &mut ProcessingRecord) -> Result<(), StateError> {
        if record.status() != Status::Processing || self.is_running(&record.file_id) {
            return Ok(());
        }
        warn!(
            "'{}' was left processing by attempt {}; closing it",
            record.file_id, record.attempt
        );
        record.fail(INTERRUPTED_MESSAGE)
    }

    fn analyse(
        &self,
        dataset: &dyn Dataset,
        explicit_column: Option<&str>,
    ) -> Result<Completion, DatasetError> {
        let sample = dataset.sample(self.options.sample_rows)?;
        let (candidate, format, warning) = match explicit_column {
            Some(column) => {
                let resolved = detect_format_for_column(&sample, column, &self.options)?;
                (resolved.candidate, resolved.format, resolved.warning)
            }
            None => {
                let result = detect(&sample, dataset.headers(), &self.options);
                let candidate = result
                    .selected
                    .ok_or(DatasetError::NoDateColumnFound {
                        threshold: self.options.threshold,
                    })?;
                let format = candidate.format.ok_or_else(|| DatasetError::UnparseableColumn {
                    column: candidate.column.clone(),
                })?;
                (candidate, format, None)
            }
        };
        let scan = extract_range(dataset, &candidate.column, format)?;
        Ok(Completion {
            ratio: candidate.ratio(),
            column: candidate.column,
            format: format.id,
            range: scan.range,
            warning,
        })
    }

    fn finish(
        &self,
        file_id: &str,
        outcome: Result<Completion, DatasetError>,
    ) -> Result<ProcessingRecord, StoreError> {
        match outcome {
            Ok(completion) => {
                let summary = format!("'{}' {}", completion.column, completion.range);
                let record = self.transition(file_id, |record| record.complete(completion.clone()))?;
                info!("Completed '{file_id}': {summary}");
                Ok(record)
            }
            Err(err) => {
                let message = err.to_string();
                let record = self.transition(file_id, |record| record.fail(message.clone()))?;
                error!("Processing '{file_id}' failed: {message}");
                Ok(record)
            }
        }
    }

    fn transition<F>(&self, file_id: &str, mut apply: F) -> Result<ProcessingRecord, StoreError>
    where
        F: FnMut(&mut ProcessingRecord) -> Result<(), StateError>,
    {
        let record = self
            .store
            .update(file_id, &mut |record| apply(record))
            .inspect_err(|err| error!("Metadata update for '{file_id}' failed: {err}"))?;
        self.publish(&record);
        Ok(record)
    }

    fn publish(&self, record: &ProcessingRecord) {
        let event = StatusEvent {
            file_id: record.file_id.clone(),
            attempt: record.attempt,
            status: record.status(),
        };
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::InMemoryTable, store::MemoryRecordStore};
    use chrono::NaiveDate;

    struct NoFiles;

    impl DatasetProvider for NoFiles {
        fn open(&self, file_id: &str) -> Result<Box<dyn Dataset>, DatasetError> {
            Err(DatasetError::inaccessible(file_id, "gone"))
        }
    }

    fn processor() -> Processor {
        Processor::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(NoFiles),
            DetectionOptions::default(),
        )
    }

    fn stored(file_id: &str, checksum: &str) -> StoredFile {
        StoredFile {
            file_id: file_id.into(),
            path: file_id.into(),
            size: 1,
            checksum: checksum.into(),
        }
    }

    fn orders() -> InMemoryTable {
        InMemoryTable::new(
            vec!["id".into(), "note".into(), "ordered".into()],
            vec![
                vec!["1".into(), "2024-05-01".into(), "03/01/2024".into()],
                vec!["2".into(), "hello".into(), "01/15/2024".into()],
                vec!["3".into(), "".into(), "12/31/2023".into()],
            ],
        )
    }

    #[test]
    fn auto_detection_completes_with_range() {
        let processor = processor();
        let events = processor.subscribe();
        processor.register(&stored("orders.csv", "x")).unwrap();
        let record = processor.start_with("orders.csv", &orders(), None).unwrap();

        assert_eq!(record.status(), Status::Completed);
        assert_eq!(record.column(), Some("ordered"));
        let range = record.range().unwrap();
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
        assert_eq!(range.end, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert!(record.error().is_none());

        let statuses = events.try_iter().map(|e| e.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![Status::Pending, Status::Processing, Status::Completed]
        );
    }

    #[test]
    fn failures_are_captured_into_the_record() {
        let processor = processor();
        processor.register(&stored("orders.csv", "x")).unwrap();
        let record = processor.start("orders.csv", None).unwrap();
        assert_eq!(record.status(), Status::Error);
        assert!(record.error().unwrap().contains("gone"));
        assert!(record.range().is_none());

        let words = InMemoryTable::new(vec!["w".into()], vec![vec!["alpha".into()]]);
        let record = processor.start_with("orders.csv", &words, None).unwrap();
        assert_eq!(record.status(), Status::Error);
        assert!(record.error().unwrap().starts_with("No date column found"));
    }

    #[test]
    fn reassignment_starts_a_new_attempt_on_the_same_file() {
        let processor = processor();
        let registered = processor.register(&stored("orders.csv", "x")).unwrap();
        let first = processor.start_with("orders.csv", &orders(), None).unwrap();
        assert_eq!(first.attempt, registered.attempt);

        let second = processor
            .start_with("orders.csv", &orders(), Some("note"))
            .unwrap();
        assert_ne!(second.attempt, first.attempt);
        assert_eq!(second.uploaded_at, first.uploaded_at);
        assert_eq!(second.column(), Some("note"));
        assert!(second.range().is_some());
        match &second.state {
            crate::record::RecordState::Completed { warning, .. } => assert!(warning.is_some()),
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[test]
    fn missing_records_surface_as_store_errors() {
        let processor = processor();
        assert!(matches!(
            processor.start("ghost.csv", None),
            Err(StoreError::Missing(_))
        ));
    }

    #[test]
    fn attempt_left_processing_by_a_dead_session_is_superseded() {
        let processor = processor();
        let first = processor.register(&stored("orders.csv", "x")).unwrap();
        processor
            .store()
            .update("orders.csv", &mut |record| record.mark_processing())
            .unwrap();

        let record = processor.start_with("orders.csv", &orders(), None).unwrap();
        assert_eq!(record.status(), Status::Completed);
        assert_ne!(record.attempt, first.attempt);
        let closed = record
            .history
            .iter()
            .filter(|t| t.attempt == first.attempt)
            .map(|t| t.status)
            .collect::<Vec<_>>();
        assert_eq!(
            closed,
            vec![Status::Pending, Status::Processing, Status::Error]
        );
    }

    #[test]
    fn reupload_over_an_interrupted_attempt_starts_fresh() {
        let processor = processor();
        processor.register(&stored("orders.csv", "x")).unwrap();
        processor
            .store()
            .update("orders.csv", &mut |record| record.mark_processing())
            .unwrap();

        let renewed = processor.register(&stored("orders.csv", "x")).unwrap();
        assert_eq!(renewed.status(), Status::Pending);
        assert!(renewed.history.iter().any(|t| t.status == Status::Error));
        assert!(!processor.is_running("orders.csv"));
    }

    #[test]
    fn changed_content_replaces_the_record() {
        let processor = processor();
        let first = processor.register(&stored("a.csv", "one")).unwrap();
        let same = processor.register(&stored("a.csv", "one")).unwrap();
        assert_eq!(same.uploaded_at, first.uploaded_at);
        assert_ne!(same.attempt, first.attempt);
        let replaced = processor.register(&stored("a.csv", "two")).unwrap();
        assert_eq!(replaced.checksum, "two");
        assert_eq!(replaced.history.len(), 1);
    }
}
