use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::harmonize::HarmonizeStrategy;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Find the date column of uploaded tables and report its date span",
    long_about = None
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Upload directory holding files and their .metadata.json
    #[arg(long = "store", global = true)]
    pub store: Option<PathBuf>,
    /// YAML settings file (flags given here take precedence)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Maximum number of rows sampled during detection
    #[arg(long = "sample-rows", global = true)]
    pub sample_rows: Option<usize>,
    /// Minimum fraction of sampled values that must parse (0.0 - 1.0)
    #[arg(long, global = true)]
    pub threshold: Option<f64>,
    /// Read ambiguous values such as 01/02/2024 as day/month
    #[arg(long = "day-first", global = true)]
    pub day_first: bool,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, global = true, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of uploaded files (defaults to utf-8)
    #[arg(long = "input-encoding", global = true)]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Store one or more files and process them in the background
    Upload(UploadArgs),
    /// Show processing records for uploaded files
    Status(StatusArgs),
    /// Print the first rows of an uploaded file
    Preview(PreviewArgs),
    /// Score every column of an uploaded file without recording anything
    Detect(DetectArgs),
    /// Re-process a file using a user-chosen date column
    Reassign(ReassignArgs),
    /// Write a copy of a file with its date column rewritten to YYYY-MM-DD
    Harmonize(HarmonizeArgs),
    /// Remove an uploaded file and its processing record
    Delete(DeleteArgs),
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Files to upload (.csv, .tsv, .txt; spreadsheets with the `excel` feature)
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
    /// Use this column instead of auto-detecting one
    #[arg(short = 'C', long = "column")]
    pub column: Option<String>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Limit output to a single file id
    pub file_id: Option<String>,
    /// Emit records as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    pub file_id: String,
    /// Number of rows to display
    #[arg(long, default_value_t = 10)]
    pub rows: usize,
}

#[derive(Debug, Args)]
pub struct DetectArgs {
    pub file_id: String,
}

#[derive(Debug, Args)]
pub struct ReassignArgs {
    pub file_id: String,
    /// Column to use as the date column
    pub column: String,
}

#[derive(Debug, Args)]
pub struct HarmonizeArgs {
    pub file_id: String,
    /// Destination CSV file
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
    /// Column to harmonize (defaults to the recorded date column)
    #[arg(short = 'C', long = "column", conflicts_with = "all")]
    pub column: Option<String>,
    /// Harmonize every column that passes detection, each with its own format
    #[arg(long)]
    pub all: bool,
    /// Keep the original columns and add `<column>_harmonized`
    #[arg(long)]
    pub append: bool,
    /// Force a strategy instead of choosing by file size
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    pub file_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum StrategyArg {
    RowWise,
    Chunked,
}

impl From<StrategyArg> for HarmonizeStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::RowWise => HarmonizeStrategy::RowWise,
            StrategyArg::Chunked => HarmonizeStrategy::Chunked,
        }
    }
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "pipe" | "|" => Ok(b'|'),
        "semicolon" | ";" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (None, _) => Err("Delimiter cannot be empty".to_string()),
                (Some(_), Some(_)) => Err("Delimiter must be a single character".to_string()),
                (Some(c), None) if !c.is_ascii() => Err("Delimiter must be ASCII".to_string()),
                (Some(c), None) => Ok(c as u8),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiter_names_and_characters_are_accepted() {
        assert_eq!(parse_delimiter("tab"), Ok(b'\t'));
        assert_eq!(parse_delimiter("semicolon"), Ok(b';'));
        assert_eq!(parse_delimiter(":"), Ok(b':'));
        assert!(parse_delimiter("").is_err());
        assert!(parse_delimiter("ab").is_err());
        assert!(parse_delimiter("é").is_err());
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "csv-datespan",
            "status",
            "--store",
            "data",
            "--day-first",
            "--delimiter",
            "tab",
        ])
        .unwrap();
        assert_eq!(cli.global.store, Some(PathBuf::from("data")));
        assert!(cli.global.day_first);
        assert_eq!(cli.global.delimiter, Some(b'\t'));
        assert!(matches!(cli.command, Commands::Status(_)));
    }

    #[test]
    fn harmonize_all_excludes_an_explicit_column() {
        let cli = Cli::try_parse_from([
            "csv-datespan",
            "harmonize",
            "a.csv",
            "-o",
            "out.csv",
            "--all",
            "--append",
        ])
        .unwrap();
        match cli.command {
            Commands::Harmonize(args) => assert!(args.all && args.append && args.column.is_none()),
            other => panic!("expected harmonize, got {other:?}"),
        }
        assert!(
            Cli::try_parse_from([
                "csv-datespan",
                "harmonize",
                "a.csv",
                "-o",
                "out.csv",
                "--all",
                "-C",
                "d",
            ])
            .is_err()
        );
    }
}
