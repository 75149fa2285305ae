//! Background execution of processing attempts plus a polling observer.
//!
//! At most one attempt per file runs at a time; the in-flight set is released
//! by a drop guard so a panicking attempt cannot wedge its file.

use std::{
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, warn};
use uuid::Uuid;

use crate::{
    error::{StoreError, WorkerError},
    processor::Processor,
    record::ProcessingRecord,
    store::RecordStore,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct Worker {
    processor: Arc<Processor>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

pub struct WorkerHandle {
    file_id: String,
    attempt: Uuid,
    thread: JoinHandle<Result<ProcessingRecord, WorkerError>>,
}

struct InFlight {
    file_id: String,
    set: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.file_id);
        }
    }
}

impl Worker {
    pub fn new(processor: Arc<Processor>) -> Self {
        Self {
            processor,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn is_running(&self, file_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(file_id))
            .unwrap_or(false)
    }

    /// Prepares a new attempt synchronously, then runs it on its own thread.
    ///
    /// The returned handle names the attempt, so observers can wait for that
    /// attempt specifically rather than a stale terminal state.
    pub fn spawn(
        &self,
        file_id: &str,
        explicit_column: Option<String>,
    ) -> Result<WorkerHandle, WorkerError> {
        let guard = self.claim(file_id)?;
        let prepared = self.processor.prepare(file_id, explicit_column)?;
        let attempt = prepared.attempt;
        let processor = Arc::clone(&self.processor);
        let id = file_id.to_string();
        let thread = thread::Builder::new()
            .name(format!("datespan-{file_id}"))
            .spawn(move || {
                let _guard = guard;
                match panic::catch_unwind(AssertUnwindSafe(|| processor.run(&id))) {
                    Ok(result) => result.map_err(WorkerError::from),
                    Err(_) => {
                        error!("Worker for '{id}' panicked");
                        if let Err(err) = processor.abandon(&id, "Processing worker panicked") {
                            warn!("Could not record failure for '{id}': {err}");
                        }
                        Err(WorkerError::Panicked(id))
                    }
                }
            })?;
        debug!("Spawned worker for '{file_id}' attempt {attempt}");
        Ok(WorkerHandle {
            file_id: file_id.to_string(),
            attempt,
            thread,
        })
    }

    fn claim(&self, file_id: &str) -> Result<InFlight, WorkerError> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| WorkerError::Store(StoreError::Poisoned))?;
        if !set.insert(file_id.to_string()) {
            return Err(WorkerError::AlreadyRunning(file_id.to_string()));
        }
        Ok(InFlight {
            file_id: file_id.to_string(),
            set: Arc::clone(&self.in_flight),
        })
    }
}

impl WorkerHandle {
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn attempt(&self) -> Uuid {
        self.attempt
    }

    pub fn join(self) -> Result<ProcessingRecord, WorkerError> {
        self.thread
            .join()
            .map_err(|_| WorkerError::Panicked(self.file_id.clone()))?
    }
}

/// Re-reads the record every `interval` until `attempt` reaches a terminal
/// state, reporting each observed change to `on_change`.
pub fn poll_until_terminal<F>(
    store: &dyn RecordStore,
    file_id: &str,
    attempt: Uuid,
    interval: Duration,
    mut on_change: F,
) -> Result<ProcessingRecord, StoreError>
where
    F: FnMut(&ProcessingRecord),
{
    let mut last = None;
    loop {
        let record = store
            .get(file_id)?
            .ok_or_else(|| StoreError::Missing(file_id.to_string()))?;
        let seen = (record.attempt, record.status());
        if last != Some(seen) {
            on_change(&record);
            last = Some(seen);
        }
        // A different attempt id means ours was superseded.
        if record.attempt != attempt || record.status().is_terminal() {
            return Ok(record);
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{Dataset, InMemoryTable},
        error::DatasetError,
        heuristic::DetectionOptions,
        record::Status,
        store::MemoryRecordStore,
        uploads::{DatasetProvider, StoredFile},
    };
    use std::sync::mpsc;

    /// Hands out a small table once the test releases it.
    struct Gated {
        release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl DatasetProvider for Gated {
        fn open(&self, _file_id: &str) -> Result<Box<dyn Dataset>, DatasetError> {
            if let Some(rx) = self.release.lock().unwrap().take() {
                let _ = rx.recv();
            }
            Ok(Box::new(InMemoryTable::new(
                vec!["d".into()],
                vec![vec!["2024-01-02".into()], vec!["2023-06-30".into()]],
            )))
        }
    }

    fn worker() -> (Worker, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let processor = Processor::new(
            store,
            Arc::new(Gated {
                release: Mutex::new(Some(rx)),
            }),
            DetectionOptions::default(),
        );
        processor
            .register(&StoredFile {
                file_id: "a.csv".into(),
                path: "a.csv".into(),
                size: 1,
                checksum: "x".into(),
            })
            .unwrap();
        (Worker::new(Arc::new(processor)), tx)
    }

    #[test]
    fn duplicate_spawns_are_refused_until_the_attempt_ends() {
        let (worker, release) = worker();
        let handle = worker.spawn("a.csv", None).unwrap();
        assert!(worker.is_running("a.csv"));
        assert!(matches!(
            worker.spawn("a.csv", None),
            Err(WorkerError::AlreadyRunning(_))
        ));
        release.send(()).unwrap();
        let record = handle.join().unwrap();
        assert_eq!(record.status(), Status::Completed);
        assert!(!worker.is_running("a.csv"));
        assert!(worker.spawn("a.csv", Some("d".into())).unwrap().join().is_ok());
    }

    #[test]
    fn attempt_running_in_this_process_is_never_superseded() {
        let (worker, release) = worker();
        let handle = worker.spawn("a.csv", None).unwrap();
        let store = Arc::clone(worker.processor().store());
        while store.get("a.csv").unwrap().unwrap().status() != Status::Processing {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(worker.processor().is_running("a.csv"));
        assert!(matches!(
            worker.processor().prepare("a.csv", None),
            Err(StoreError::State(_))
        ));
        let changed = StoredFile {
            file_id: "a.csv".into(),
            path: "a.csv".into(),
            size: 2,
            checksum: "y".into(),
        };
        assert!(matches!(
            worker.processor().register(&changed),
            Err(StoreError::State(_))
        ));
        release.send(()).unwrap();
        assert_eq!(handle.join().unwrap().status(), Status::Completed);
        assert!(!worker.processor().is_running("a.csv"));
    }

    #[test]
    fn poller_observes_monotonic_progress() {
        let (worker, release) = worker();
        let handle = worker.spawn("a.csv", None).unwrap();
        let attempt = handle.attempt();
        let store = Arc::clone(worker.processor().store());
        let observer = thread::spawn(move || {
            let mut seen = Vec::new();
            let last = poll_until_terminal(
                store.as_ref(),
                "a.csv",
                attempt,
                Duration::from_millis(5),
                |record| seen.push(record.status()),
            )
            .unwrap();
            (seen, last)
        });
        thread::sleep(Duration::from_millis(30));
        release.send(()).unwrap();
        handle.join().unwrap();
        let (seen, last) = observer.join().unwrap();

        assert_eq!(last.status(), Status::Completed);
        assert_eq!(seen.last(), Some(&Status::Completed));
        let rank = |s: &Status| match s {
            Status::Pending => 0,
            Status::Processing => 1,
            Status::Completed | Status::Error => 2,
        };
        assert!(seen.windows(2).all(|w| rank(&w[0]) < rank(&w[1])));
    }
}
