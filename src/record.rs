//! Per-file processing records and their lifecycle.
//!
//! A record moves `pending -> processing -> completed | error` within one
//! attempt. Terminal states never move again on their own; only
//! [`ProcessingRecord::begin_attempt`] starts over, under a fresh attempt id.
//! The payload lives inside [`RecordState`], so a completed record always has
//! a range and never an error message, and an errored record the reverse.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::StateError, range::DateRange};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RecordState {
    Pending,
    Processing,
    Completed {
        column: String,
        format: String,
        ratio: f64,
        range_start: NaiveDate,
        range_end: NaiveDate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Error {
        error: String,
    },
}

impl RecordState {
    pub fn status(&self) -> Status {
        match self {
            RecordState::Pending => Status::Pending,
            RecordState::Processing => Status::Processing,
            RecordState::Completed { .. } => Status::Completed,
            RecordState::Error { .. } => Status::Error,
        }
    }
}

/// Payload of a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub column: String,
    pub format: &'static str,
    pub ratio: f64,
    pub range: DateRange,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub attempt: Uuid,
    pub status: Status,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingRecord {
    pub file_id: String,
    pub file_size: u64,
    #[serde(default)]
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempt: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_column: Option<String>,
    #[serde(flatten)]
    pub state: RecordState,
    #[serde(default)]
    pub history: Vec<Transition>,
}

impl ProcessingRecord {
    pub fn new_pending(file_id: impl Into<String>, file_size: u64, checksum: String) -> Self {
        let now = Utc::now();
        let attempt = Uuid::new_v4();
        Self {
            file_id: file_id.into(),
            file_size,
            checksum,
            uploaded_at: now,
            updated_at: now,
            attempt,
            requested_column: None,
            state: RecordState::Pending,
            history: vec![Transition {
                attempt,
                status: Status::Pending,
                at: now,
            }],
        }
    }

    pub fn status(&self) -> Status {
        self.state.status()
    }

    pub fn column(&self) -> Option<&str> {
        match &self.state {
            RecordState::Completed { column, .. } => Some(column),
            _ => None,
        }
    }

    /// Format id the completed attempt settled on.
    pub fn format(&self) -> Option<&str> {
        match &self.state {
            RecordState::Completed { format, .. } => Some(format),
            _ => None,
        }
    }

    pub fn range(&self) -> Option<DateRange> {
        match &self.state {
            RecordState::Completed {
                range_start,
                range_end,
                ..
            } => Some(DateRange {
                start: *range_start,
                end: *range_end,
            }),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            RecordState::Error { error } => Some(error),
            _ => None,
        }
    }

    /// Starts a new attempt. Refused while an attempt is processing.
    pub fn begin_attempt(&mut self, requested_column: Option<String>) -> Result<Uuid, StateError> {
        if self.status() == Status::Processing {
            return Err(self.invalid(Status::Pending));
        }
        self.attempt = Uuid::new_v4();
        self.requested_column = requested_column;
        self.enter(RecordState::Pending);
        Ok(self.attempt)
    }

    /// Changes the column override of a pending attempt.
    pub fn request_column(&mut self, requested_column: Option<String>) -> Result<(), StateError> {
        if self.status() != Status::Pending {
            return Err(self.invalid(Status::Pending));
        }
        self.requested_column = requested_column;
        Ok(())
    }

    pub fn mark_processing(&mut self) -> Result<(), StateError> {
        if self.status() != Status::Pending {
            return Err(self.invalid(Status::Processing));
        }
        self.enter(RecordState::Processing);
        Ok(())
    }

    pub fn complete(&mut self, completion: Completion) -> Result<(), StateError> {
        if self.status() != Status::Processing {
            return Err(self.invalid(Status::Completed));
        }
        self.enter(RecordState::Completed {
            column: completion.column,
            format: completion.format.to_string(),
            ratio: completion.ratio,
            range_start: completion.range.start,
            range_end: completion.range.end,
            warning: completion.warning,
        });
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), StateError> {
        if self.status().is_terminal() {
            return Err(self.invalid(Status::Error));
        }
        self.enter(RecordState::Error {
            error: message.into(),
        });
        Ok(())
    }

    fn enter(&mut self, state: RecordState) {
        let now = Utc::now();
        self.history.push(Transition {
            attempt: self.attempt,
            status: state.status(),
            at: now,
        });
        self.state = state;
        self.updated_at = now;
    }

    fn invalid(&self, to: Status) -> StateError {
        StateError::InvalidTransition {
            file_id: self.file_id.clone(),
            from: self.status(),
            to,
        }
    }

    /// Transitions belonging to the current attempt, oldest first.
    pub fn current_attempt_history(&self) -> impl Iterator<Item = &Transition> {
        self.history
            .iter()
            .filter(move |transition| transition.attempt == self.attempt)
    }
}
