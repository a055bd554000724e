//! Error taxonomy for the ingest pipeline.
//!
//! Only [`CycleAbortError`] ends a cycle early, and nothing here ends the
//! process. Per-record errors are counted and skipped.

use std::time::Duration;
use thiserror::Error;

/// Failure talking to the upstream state-vector source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport-level failure: DNS, connect, TLS, timeout.
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success HTTP status other than 401/429.
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body was not the JSON shape we expect.
    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    /// The bearer token was rejected (HTTP 401). Recoverable by re-authenticating.
    #[error("upstream rejected the access token")]
    Unauthorized,

    /// Obtaining a token failed, or no credentials are configured.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP 429. `retry_after` carries the upstream hint when it sent one.
    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

impl SourceError {
    /// True for failures that a fresh token may fix: a rejected token, or a
    /// token request that failed before the fetch was sent.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, SourceError::Unauthorized | SourceError::Auth(_))
    }
}

/// A raw state vector that could not be turned into an `AircraftState`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecordError {
    #[error("state vector is not an array of at least {expected} elements (got {actual})")]
    Shape { expected: usize, actual: usize },

    #[error("state vector has no usable icao24 identifier")]
    MissingIcao24,
}

/// A single-row write to the state store failed.
#[derive(Debug, Error)]
pub enum StoreWriteError {
    #[error("failed to get database connection: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("blocking task failed: {0}")]
    Task(String),
}

/// An unrecovered fetch or auth failure that ended one ingest cycle.
#[derive(Debug, Error)]
#[error("cycle {cycle} aborted: {source}")]
pub struct CycleAbortError {
    pub cycle: u64,
    #[source]
    pub source: SourceError,
}
