//! Typed errors for the analysis pipeline.
//!
//! Failures below the orchestrator (a single source, a single inference call)
//! are recovered locally and folded into run statistics. Only phase-level
//! failures become an [`AnalyzerError`] that a caller ever sees.

use crate::pipeline::Phase;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the analyzer and its run handles.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// The run was started without any sources.
    #[error("no sources given")]
    NoSources,

    /// Every source failed to produce articles.
    #[error("all {failed} sources were unavailable")]
    SourcesUnavailable { failed: usize },

    /// The inference client failed for every item dispatched in a phase.
    #[error("inference unavailable during {phase}: {reason}")]
    InferenceUnavailable { phase: Phase, reason: String },

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run not found: {0}")]
    RunNotFound(uuid::Uuid),

    /// Results were requested before the run reached a terminal phase.
    #[error("run has not finished (currently {phase})")]
    RunNotFinished { phase: Phase },

    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// A single inference call failed.
///
/// Retried by the batch scheduler, then recorded as a per-item failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("inference timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("inference API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference API returned an empty response")]
    EmptyResponse,

    /// A batch call returned a different number of results than items sent.
    #[error("batch returned {got} results for {expected} items")]
    BatchShape { expected: usize, got: usize },

    #[error("inference cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        InferenceError::Http(e.to_string())
    }
}

/// A single source failed to fetch (the `SourceUnavailable` case).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("invalid source URL: {url}")]
    InvalidUrl { url: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("source returned {status}")]
    Status { status: u16 },

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("source produced no articles")]
    NoArticles,

    #[error("feed parse error: {0}")]
    Feed(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Http(e.to_string())
    }
}

/// Errors from the worker pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    /// The job was cancelled before a worker started it.
    #[error("job cancelled before it started")]
    Cancelled,

    #[error("job panicked")]
    Panicked,
}

pub type Result<T> = std::result::Result<T, AnalyzerError>;
