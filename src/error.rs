use std::path::PathBuf;

use thiserror::Error;

/// Failure of a source as a whole. Per-record problems are [`RecordSkipped`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// Retry budget exhausted on 429/5xx or transport failures.
    #[error("source unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
    /// 4xx other than 429, rejected credentials, API-level refusals.
    #[error("permanent source error: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("worksheet `{0}` not found")]
    MissingWorksheet(String),
    #[error("{0}")]
    Destination(String),
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor io at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("failed to load cursor: {0}")]
    CursorLoad(#[source] CursorError),
    /// Sink writes already happened; a re-run may append them again.
    #[error("failed to persist cursor after sink append: {0}")]
    CursorPersistence(#[source] CursorError),
}

/// One record excluded from a batch, with the stage that dropped it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSkipped {
    pub stage: &'static str,
    pub key: Option<String>,
    pub reason: String,
}

impl RecordSkipped {
    pub fn new(stage: &'static str, key: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            stage,
            key: key.map(str::to_string),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for RecordSkipped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(k) => write!(f, "[{}] {}: {}", self.stage, k, self.reason),
            None => write!(f, "[{}] {}", self.stage, self.reason),
        }
    }
}
