//! I/O helpers for CSV reading, writing, encoding, and delimiter resolution.
//!
//! - **Delimiter resolution**: extension-based (`.tsv` → tab, everything else
//!   comma) with manual override.
//! - **Encoding**: input decoding through `encoding_rs`, defaulting to UTF-8.
//!   Output is always UTF-8.
//! - **Reader/writer construction**: one place decides quoting and
//!   flexibility so every scan of an upload sees the same records.

use std::{
    borrow::Cow,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use csv::QuoteStyle;
use encoding_rs::{Encoding, UTF_8};

use crate::error::DatasetError;

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding, String> {
    match label {
        Some(value) => Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| format!("Unknown encoding '{value}'")),
        None => Ok(UTF_8),
    }
}

pub fn resolve_input_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| match extension(path).as_deref() {
        Some("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    })
}

/// Lower-cased file extension, if any.
pub fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn open_csv_reader<R>(reader: R, delimiter: u8) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(true)
        .delimiter(delimiter)
        .double_quote(true)
        // Ragged uploads must not abort a scan; short rows read as empty cells.
        .flexible(true);
    builder.from_reader(reader)
}

pub fn open_csv_reader_from_path(
    path: &Path,
    delimiter: u8,
) -> Result<csv::Reader<BufReader<File>>, DatasetError> {
    let file = File::open(path).map_err(|err| DatasetError::inaccessible(path, err.to_string()))?;
    Ok(open_csv_reader(BufReader::new(file), delimiter))
}

pub fn open_csv_writer(path: &Path, delimiter: u8) -> Result<csv::Writer<Box<dyn Write>>, DatasetError> {
    let file = File::create(path)?;
    let writer: Box<dyn Write> = Box::new(BufWriter::new(file));
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(delimiter)
        .quote_style(QuoteStyle::Necessary)
        .double_quote(true);
    Ok(builder.from_writer(writer))
}

/// Strict decode used for headers: a header that cannot be decoded means the
/// wrong encoding was selected.
pub fn decode_bytes(bytes: &[u8], encoding: &'static Encoding) -> Result<String, DatasetError> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        Err(DatasetError::Encoding(encoding.name()))
    } else {
        Ok(text.into_owned())
    }
}

/// Lossy decode used for data cells; an undecodable cell simply fails to
/// parse as a date later on.
pub fn decode_field<'a>(bytes: &'a [u8], encoding: &'static Encoding) -> Cow<'a, str> {
    encoding.decode_without_bom_handling(bytes).0
}

pub fn decode_headers(
    record: &csv::ByteRecord,
    encoding: &'static Encoding,
) -> Result<Vec<String>, DatasetError> {
    record
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let decoded = decode_bytes(field, encoding)?;
            // Strip a UTF-8 BOM glued to the first header.
            Ok(if idx == 0 {
                decoded.trim_start_matches('\u{feff}').to_string()
            } else {
                decoded
            })
        })
        .collect()
}

pub fn decode_record(record: &csv::ByteRecord, encoding: &'static Encoding) -> Vec<String> {
    record
        .iter()
        .map(|field| decode_field(field, encoding).into_owned())
        .collect()
}
