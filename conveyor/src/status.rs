//! Per-tuple outcomes and run progress.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// The closed set of per-tuple outcomes. The `Display`/`FromStr` forms are
/// what goes over the wire and into the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    ParseSuccess,
    ParseSuccessWithException,
    ParseExceptionNoEmit,
    ParseExceptionEmit,
    EmitSuccess,
    EmitSuccessParseException,
    EmitException,
    FetchException,
    FetchNotFound,
    Oom,
    Timeout,
    UnspecifiedCrash,
    NoEmitterFound,
    ClientUnavailableWithinMs,
    InterruptedException,
    Skipped,
    Empty,
    IntermediateParseException,
}

impl Status {
    /// All statuses, in declaration order.
    pub const ALL: &'static [Status] = &[
        Status::ParseSuccess,
        Status::ParseSuccessWithException,
        Status::ParseExceptionNoEmit,
        Status::ParseExceptionEmit,
        Status::EmitSuccess,
        Status::EmitSuccessParseException,
        Status::EmitException,
        Status::FetchException,
        Status::FetchNotFound,
        Status::Oom,
        Status::Timeout,
        Status::UnspecifiedCrash,
        Status::NoEmitterFound,
        Status::ClientUnavailableWithinMs,
        Status::InterruptedException,
        Status::Skipped,
        Status::Empty,
        Status::IntermediateParseException,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::ParseSuccess => "PARSE_SUCCESS",
            Status::ParseSuccessWithException => "PARSE_SUCCESS_WITH_EXCEPTION",
            Status::ParseExceptionNoEmit => "PARSE_EXCEPTION_NO_EMIT",
            Status::ParseExceptionEmit => "PARSE_EXCEPTION_EMIT",
            Status::EmitSuccess => "EMIT_SUCCESS",
            Status::EmitSuccessParseException => "EMIT_SUCCESS_PARSE_EXCEPTION",
            Status::EmitException => "EMIT_EXCEPTION",
            Status::FetchException => "FETCH_EXCEPTION",
            Status::FetchNotFound => "FETCH_NOT_FOUND",
            Status::Oom => "OOM",
            Status::Timeout => "TIMEOUT",
            Status::UnspecifiedCrash => "UNSPECIFIED_CRASH",
            Status::NoEmitterFound => "NO_EMITTER_FOUND",
            Status::ClientUnavailableWithinMs => "CLIENT_UNAVAILABLE_WITHIN_MS",
            Status::InterruptedException => "INTERRUPTED_EXCEPTION",
            Status::Skipped => "SKIPPED",
            Status::Empty => "EMPTY",
            Status::IntermediateParseException => "INTERMEDIATE_PARSE_EXCEPTION",
        }
    }

    /// Whether the tuple reached its sink.
    pub fn is_success(&self) -> bool {
        matches!(self, Status::EmitSuccess | Status::EmitSuccessParseException)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Status::Skipped | Status::Empty)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("unknown status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownStatus(s.to_owned()))
    }
}

/// The outcome of one tuple, created by the worker on completion and
/// consumed by the reporters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipesResult {
    pub status: Status,
    pub message: Option<String>,
    pub trace: Option<String>,
    /// Metadata accumulated before a parse failure, when the tuple's
    /// policy emits partial output.
    pub metadata: Option<Vec<Metadata>>,
}

impl PipesResult {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            message: None,
            trace: None,
            metadata: None,
        }
    }

    pub fn with_message(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            trace: None,
            metadata: None,
        }
    }
}

/// Progress of a run, emitted periodically by sources that can compute an
/// upper bound on the number of tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalCount {
    pub count: u64,
    pub status: TotalCountStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TotalCountStatus {
    NotCompleted,
    Completed,
    Unsupported,
}

impl TotalCount {
    pub fn unsupported() -> Self {
        Self {
            count: 0,
            status: TotalCountStatus::Unsupported,
        }
    }

    pub fn completed(count: u64) -> Self {
        Self {
            count,
            status: TotalCountStatus::Completed,
        }
    }

    pub fn in_progress(count: u64) -> Self {
        Self {
            count,
            status: TotalCountStatus::NotCompleted,
        }
    }
}
