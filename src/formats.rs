//! The fixed catalog of recognised date formats.
//!
//! Every [`DateFormatSpec`] pairs a chrono pattern with a regex shape gate so
//! that cheap structural rejection happens before chrono is asked to parse.
//! Catalog order is priority order: four-digit-year-first layouts come before
//! the ambiguous two-digit day/month layouts, and the US (month-first) slash
//! and dash variants come before their EU (day-first) twins unless the catalog
//! is built with [`AmbiguityPreference::DayFirst`]. A value such as
//! `01/02/2024` is therefore classified purely by order; nothing inspects the
//! rest of the column to disambiguate it.

use std::{fmt, sync::LazyLock};

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

pub const ISO_PATTERN: &str = "%Y-%m-%d";

pub struct DateFormatSpec {
    /// Stable identifier persisted in metadata.
    pub id: &'static str,
    /// chrono `strftime` pattern.
    pub pattern: &'static str,
    pub example: &'static str,
    shape: LazyLock<Regex>,
}

const fn spec(
    id: &'static str,
    pattern: &'static str,
    example: &'static str,
    shape: fn() -> Regex,
) -> DateFormatSpec {
    DateFormatSpec {
        id,
        pattern,
        example,
        shape: LazyLock::new(shape),
    }
}

fn shape(source: &str) -> Regex {
    Regex::new(source).expect("Invalid date shape pattern")
}

const LONG_MONTHS: &str =
    "(?i:january|february|march|april|may|june|july|august|september|october|november|december)";
const SHORT_MONTHS: &str = "(?i:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)";

/// Default-priority catalog contents.
pub static FORMATS: [DateFormatSpec; 11] = [
    spec("iso", "%Y-%m-%d", "2024-01-15", || {
        shape(r"^\d{4}-\d{1,2}-\d{1,2}$")
    }),
    spec("us-slash", "%m/%d/%Y", "01/15/2024", || {
        shape(r"^\d{1,2}/\d{1,2}/\d{4}$")
    }),
    spec("eu-slash", "%d/%m/%Y", "15/01/2024", || {
        shape(r"^\d{1,2}/\d{1,2}/\d{4}$")
    }),
    spec("ymd-slash", "%Y/%m/%d", "2024/01/15", || {
        shape(r"^\d{4}/\d{1,2}/\d{1,2}$")
    }),
    spec("us-dash", "%m-%d-%Y", "01-15-2024", || {
        shape(r"^\d{1,2}-\d{1,2}-\d{4}$")
    }),
    spec("eu-dash", "%d-%m-%Y", "15-01-2024", || {
        shape(r"^\d{1,2}-\d{1,2}-\d{4}$")
    }),
    spec("compact", "%Y%m%d", "20240115", || shape(r"^\d{8}$")),
    spec("month-name-comma", "%B %d, %Y", "January 15, 2024", || {
        shape(&format!(r"^{LONG_MONTHS} \d{{1,2}}, \d{{4}}$"))
    }),
    spec("month-abbr-comma", "%b %d, %Y", "Jan 15, 2024", || {
        shape(&format!(r"^{SHORT_MONTHS} \d{{1,2}}, \d{{4}}$"))
    }),
    spec("day-month-name", "%d %B %Y", "15 January 2024", || {
        shape(&format!(r"^\d{{1,2}} {LONG_MONTHS} \d{{4}}$"))
    }),
    spec("day-month-abbr", "%d %b %Y", "15 Jan 2024", || {
        shape(&format!(r"^\d{{1,2}} {SHORT_MONTHS} \d{{4}}$"))
    }),
];

impl DateFormatSpec {
    /// Whether `value` has this format's shape and names a real calendar date.
    pub fn matches(&self, value: &str) -> bool {
        self.parse(value).is_ok()
    }

    pub fn parse(&self, value: &str) -> Result<NaiveDate, ParseError> {
        let trimmed = value.trim();
        if !self.shape.is_match(trimmed) {
            return Err(self.parse_error(value));
        }
        NaiveDate::parse_from_str(trimmed, self.pattern).map_err(|_| self.parse_error(value))
    }

    fn parse_error(&self, value: &str) -> ParseError {
        ParseError {
            value: value.to_string(),
            pattern: self.pattern,
        }
    }
}

impl PartialEq for DateFormatSpec {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DateFormatSpec {}

impl fmt::Debug for DateFormatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DateFormatSpec")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish()
    }
}

impl fmt::Display for DateFormatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.pattern)
    }
}

/// Which reading wins for ambiguous two-digit day/month values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AmbiguityPreference {
    #[default]
    MonthFirst,
    DayFirst,
}

#[derive(Debug, Clone)]
pub struct FormatCatalog {
    specs: Vec<&'static DateFormatSpec>,
    preference: AmbiguityPreference,
}

impl Default for FormatCatalog {
    fn default() -> Self {
        Self::new(AmbiguityPreference::default())
    }
}

impl FormatCatalog {
    pub fn new(preference: AmbiguityPreference) -> Self {
        let mut specs = FORMATS.iter().collect::<Vec<_>>();
        if preference == AmbiguityPreference::DayFirst {
            // us-slash <-> eu-slash, us-dash <-> eu-dash
            specs.swap(1, 2);
            specs.swap(4, 5);
        }
        Self { specs, preference }
    }

    pub fn preference(&self) -> AmbiguityPreference {
        self.preference
    }

    pub fn specs(&self) -> &[&'static DateFormatSpec] {
        &self.specs
    }

    pub fn by_id(id: &str) -> Option<&'static DateFormatSpec> {
        FORMATS.iter().find(|spec| spec.id == id)
    }

    /// Position of `spec` in this catalog's priority order.
    pub fn priority(&self, spec: &DateFormatSpec) -> usize {
        self.specs
            .iter()
            .position(|candidate| *candidate == spec)
            .unwrap_or(usize::MAX)
    }

    /// First spec, in priority order, that accepts `value`.
    pub fn match_value(&self, value: &str) -> Option<&'static DateFormatSpec> {
        self.parse_any(value).map(|(spec, _)| spec)
    }

    pub fn parse(&self, value: &str, spec: &DateFormatSpec) -> Result<NaiveDate, ParseError> {
        spec.parse(value)
    }

    pub fn parse_any(&self, value: &str) -> Option<(&'static DateFormatSpec, NaiveDate)> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        self.specs
            .iter()
            .find_map(|spec| spec.parse(trimmed).ok().map(|date| (*spec, date)))
    }
}

pub fn to_iso(date: NaiveDate) -> String {
    date.format(ISO_PATTERN).to_string()
}
