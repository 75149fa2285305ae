pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod formats;
pub mod harmonize;
pub mod heuristic;
pub mod io_utils;
pub mod processor;
pub mod range;
pub mod record;
pub mod store;
pub mod table;
pub mod uploads;
pub mod worker;

use std::{env, path::Path, sync::Arc, sync::OnceLock};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info, warn};

use crate::{
    cli::{Cli, Commands, GlobalArgs},
    config::Settings,
    dataset::Dataset,
    formats::{AmbiguityPreference, FormatCatalog},
    harmonize::{HarmonizeOptions, OutputColumn},
    heuristic::{detect, detect_format_for_column},
    processor::Processor,
    record::{ProcessingRecord, RecordState},
    store::{JsonRecordStore, RecordStore},
    uploads::{DatasetProvider, UploadStore},
    worker::{Worker, WorkerHandle, poll_until_terminal},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("csv_datespan", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let settings = resolve_settings(&cli.global)?;
    let session = Session::open(settings)?;
    match cli.command {
        Commands::Upload(args) => handle_upload(&session, &args),
        Commands::Status(args) => handle_status(&session, &args),
        Commands::Preview(args) => handle_preview(&session, &args),
        Commands::Detect(args) => handle_detect(&session, &args),
        Commands::Reassign(args) => handle_reassign(&session, &args),
        Commands::Harmonize(args) => handle_harmonize(&session, &args),
        Commands::Delete(args) => handle_delete(&session, &args),
    }
}

fn resolve_settings(global: &GlobalArgs) -> Result<Settings> {
    let mut settings = Settings::load(global.config.as_deref())?;
    if let Some(store) = &global.store {
        settings.store_dir = store.clone();
    }
    if let Some(rows) = global.sample_rows {
        settings.sample_rows = rows;
    }
    if let Some(threshold) = global.threshold {
        settings.threshold = threshold;
    }
    if global.day_first {
        settings.preference = AmbiguityPreference::DayFirst;
    }
    if let Some(delimiter) = global.delimiter {
        settings.delimiter = Some(delimiter as char);
    }
    if let Some(encoding) = &global.input_encoding {
        settings.input_encoding = Some(encoding.clone());
    }
    settings.validate()?;
    debug!("Effective settings: {settings:?}");
    Ok(settings)
}

/// Everything one CLI invocation works against.
struct Session {
    settings: Settings,
    uploads: Arc<UploadStore>,
    store: Arc<dyn RecordStore>,
    worker: Worker,
}

impl Session {
    fn open(settings: Settings) -> Result<Self> {
        let uploads = Arc::new(UploadStore::new(
            settings.store_dir.clone(),
            settings.read_options()?,
        ));
        let store: Arc<dyn RecordStore> = Arc::new(JsonRecordStore::in_dir(&settings.store_dir));
        let processor = Processor::new(
            Arc::clone(&store),
            Arc::clone(&uploads) as Arc<dyn DatasetProvider>,
            settings.detection(),
        );
        Ok(Self {
            worker: Worker::new(Arc::new(processor)),
            settings,
            uploads,
            store,
        })
    }

    fn record(&self, file_id: &str) -> Result<ProcessingRecord> {
        self.store
            .get(file_id)
            .with_context(|| format!("Reading metadata for '{file_id}'"))?
            .with_context(|| format!("No uploaded file named '{file_id}'"))
    }

    fn dataset(&self, file_id: &str) -> Result<Box<dyn Dataset>> {
        self.uploads
            .open(file_id)
            .with_context(|| format!("Opening uploaded file '{file_id}'"))
    }

    fn wait(&self, handle: WorkerHandle) -> Result<ProcessingRecord> {
        let file_id = handle.file_id().to_string();
        let record = poll_until_terminal(
            self.store.as_ref(),
            &file_id,
            handle.attempt(),
            self.settings.poll_interval(),
            |record| info!("'{}' is {}", record.file_id, record.status()),
        )
        .with_context(|| format!("Polling status of '{file_id}'"))?;
        if let Err(err) = handle.join() {
            warn!("Worker for '{file_id}' ended abnormally: {err}");
        }
        Ok(record)
    }
}

fn handle_upload(session: &Session, args: &cli::UploadArgs) -> Result<()> {
    let mut handles = Vec::with_capacity(args.files.len());
    for path in &args.files {
        info!("Uploading {path:?} into {:?}", session.uploads.dir());
        let stored = session
            .uploads
            .save(path)
            .with_context(|| format!("Storing {path:?}"))?;
        session
            .worker
            .processor()
            .register(&stored)
            .with_context(|| format!("Registering '{}'", stored.file_id))?;
        let handle = session
            .worker
            .spawn(&stored.file_id, args.column.clone())
            .with_context(|| format!("Starting processing of '{}'", stored.file_id))?;
        handles.push(handle);
    }
    let mut records = Vec::with_capacity(handles.len());
    for handle in handles {
        records.push(session.wait(handle)?);
    }
    print_records(&records);
    Ok(())
}

fn handle_status(session: &Session, args: &cli::StatusArgs) -> Result<()> {
    if let Some(file_id) = &args.file_id {
        let tracked = session
            .store
            .get(file_id)
            .with_context(|| format!("Reading metadata for '{file_id}'"))?;
        let record = match tracked {
            Some(record) => record,
            None if session.uploads.path_for(file_id).is_file() => {
                bail!("No metadata found for '{file_id}'")
            }
            None => bail!("No uploaded file named '{file_id}'"),
        };
        if args.json {
            println!("{}", serde_json::to_string_pretty(&[&record])?);
        } else {
            print_records(std::slice::from_ref(&record));
        }
        return Ok(());
    }

    let records = session.store.list().context("Listing processing records")?;
    let files = session
        .uploads
        .list()
        .with_context(|| format!("Listing {:?}", session.settings.store_dir))?;
    // Stored files the metadata does not know about.
    let untracked = files
        .iter()
        .filter_map(|path| path.file_name()?.to_str())
        .filter(|name| !records.iter().any(|r| r.file_id == *name))
        .map(str::to_string)
        .collect::<Vec<_>>();
    if !untracked.is_empty() {
        warn!("{} stored file(s) have no metadata", untracked.len());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() && untracked.is_empty() {
        println!("No files uploaded to {:?}", session.settings.store_dir);
    } else {
        let mut rows = records.iter().map(record_row).collect::<Vec<_>>();
        rows.extend(untracked.into_iter().map(untracked_row));
        table::print_table(&record_headers(), &rows);
    }
    Ok(())
}

fn handle_preview(session: &Session, args: &cli::PreviewArgs) -> Result<()> {
    let dataset = session.dataset(&args.file_id)?;
    let sample = dataset
        .sample(args.rows.max(1))
        .with_context(|| format!("Reading rows of '{}'", args.file_id))?;
    table::print_table(sample.headers(), sample.rows());
    Ok(())
}

fn handle_detect(session: &Session, args: &cli::DetectArgs) -> Result<()> {
    let dataset = session.dataset(&args.file_id)?;
    let options = session.settings.detection();
    let sample = dataset
        .sample(options.sample_rows)
        .with_context(|| format!("Sampling '{}'", args.file_id))?;
    let result = detect(&sample, dataset.headers(), &options);
    let headers = ["column", "matched", "ratio", "format", "selected"]
        .map(String::from)
        .to_vec();
    let rows = result
        .candidates
        .iter()
        .map(|candidate| {
            vec![
                candidate.column.clone(),
                format!("{}/{}", candidate.successes, candidate.attempts),
                format!("{:.1}%", candidate.ratio() * 100.0),
                candidate.format.map(|f| f.id).unwrap_or("-").to_string(),
                if result.column() == Some(candidate.column.as_str()) {
                    "yes".to_string()
                } else {
                    String::new()
                },
            ]
        })
        .collect::<Vec<_>>();
    table::print_table(&headers, &rows);
    if result.selected.is_none() {
        println!(
            "No column reached the {:.0}% threshold in {} sampled row(s).",
            result.threshold * 100.0,
            sample.len()
        );
    }
    Ok(())
}

fn handle_reassign(session: &Session, args: &cli::ReassignArgs) -> Result<()> {
    session.record(&args.file_id)?;
    let handle = session
        .worker
        .spawn(&args.file_id, Some(args.column.clone()))
        .with_context(|| format!("Reassigning '{}' to '{}'", args.file_id, args.column))?;
    let record = session.wait(handle)?;
    print_records(std::slice::from_ref(&record));
    Ok(())
}

fn handle_harmonize(session: &Session, args: &cli::HarmonizeArgs) -> Result<()> {
    let record = session.record(&args.file_id)?;
    let dataset = session.dataset(&args.file_id)?;
    let options = HarmonizeOptions {
        output_column: if args.append {
            OutputColumn::appended()
        } else {
            OutputColumn::InPlace
        },
        strategy: args.strategy.map(Into::into),
        delimiter: session
            .settings
            .delimiter_byte()
            .unwrap_or(io_utils::DEFAULT_CSV_DELIMITER),
        ..session.settings.harmonize()
    };
    let detection = session.settings.detection();

    let result = if args.all {
        let sample = dataset
            .sample(detection.sample_rows)
            .with_context(|| format!("Sampling '{}'", args.file_id))?;
        let detected = detect(&sample, dataset.headers(), &detection);
        let targets = harmonize::detected_targets(&detected)
            .with_context(|| format!("Finding date columns in '{}'", args.file_id))?;
        harmonize::harmonize_columns(dataset.as_ref(), &targets, &args.output, &options)
    } else {
        let recorded = record.column().zip(record.format());
        let (column, spec) = match (&args.column, recorded) {
            (Some(column), Some((done, format))) if column == done => {
                (column.clone(), FormatCatalog::by_id(format))
            }
            (None, Some((done, format))) => (done.to_string(), FormatCatalog::by_id(format)),
            (Some(column), _) => (column.clone(), None),
            (None, None) => bail!(
                "'{}' has no confirmed date column (status {}); pass --column or --all",
                args.file_id,
                record.status()
            ),
        };
        let spec = match spec {
            Some(spec) => spec,
            None => {
                let sample = dataset.sample(detection.sample_rows)?;
                detect_format_for_column(&sample, &column, &detection)
                    .with_context(|| format!("Resolving the date format of '{column}'"))?
                    .format
            }
        };
        harmonize::harmonize(dataset.as_ref(), &column, spec, &args.output, &options)
    };
    let outcome = result.with_context(|| format!("Harmonizing '{}'", args.file_id))?;

    for column in &outcome.columns {
        println!(
            "{} -> {} ({}): {} converted, {} unparseable, {} empty",
            column.column,
            column.header,
            column.format,
            column.tally.converted,
            column.tally.failed,
            column.tally.empty
        );
    }
    println!(
        "Wrote {} row(s) to {}: {} converted, {} unparseable, {} empty ({:?})",
        outcome.rows,
        display_path(&args.output),
        outcome.converted(),
        outcome.failed(),
        outcome.tally.empty,
        outcome.strategy
    );
    Ok(())
}

fn handle_delete(session: &Session, args: &cli::DeleteArgs) -> Result<()> {
    if session.worker.is_running(&args.file_id) {
        bail!("'{}' is still being processed", args.file_id);
    }
    let removed_file = session
        .uploads
        .delete(&args.file_id)
        .with_context(|| format!("Deleting '{}'", args.file_id))?;
    let removed_record = session
        .store
        .remove(&args.file_id)
        .with_context(|| format!("Removing metadata for '{}'", args.file_id))?;
    if !removed_file && !removed_record {
        bail!("No uploaded file named '{}'", args.file_id);
    }
    info!("Deleted '{}'", args.file_id);
    Ok(())
}

fn record_headers() -> Vec<String> {
    ["file", "status", "column", "range", "ratio", "updated", "note"]
        .map(String::from)
        .to_vec()
}

fn print_records(records: &[ProcessingRecord]) {
    let rows = records.iter().map(record_row).collect::<Vec<_>>();
    table::print_table(&record_headers(), &rows);
}

fn untracked_row(file_id: String) -> Vec<String> {
    let mut row = vec![String::new(); 7];
    row[0] = file_id;
    row[1] = "-".to_string();
    row[6] = "No metadata found".to_string();
    row
}

fn record_row(record: &ProcessingRecord) -> Vec<String> {
    let (column, range, ratio, note) = match &record.state {
        RecordState::Completed {
            column,
            ratio,
            warning,
            ..
        } => (
            column.clone(),
            record.range().map(|r| r.to_string()).unwrap_or_default(),
            format!("{:.1}%", ratio * 100.0),
            warning.clone().unwrap_or_default(),
        ),
        RecordState::Error { error } => (String::new(), String::new(), String::new(), error.clone()),
        RecordState::Pending | RecordState::Processing => Default::default(),
    };
    vec![
        record.file_id.clone(),
        record.status().to_string(),
        column,
        range,
        ratio,
        record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        note,
    ]
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
