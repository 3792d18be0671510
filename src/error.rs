//! Error taxonomy for the telemetry core
//!
//! Per-line ingestion problems are not errors in this sense: they are collected
//! as human-readable strings and returned alongside the partial success count.

/// Store-level failure. Fatal to the current task only; no retries here.
#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::Sqlite(e) => write!(f, "Database error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Query-level failure. Aborts the current request; surfaced to the caller
/// as a structured failure, never retried automatically.
#[derive(Debug)]
pub enum QueryError {
    SourceNotFound(String),
    InvalidWindow(String),
    EmptyResult,
    Store(StoreError),
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        QueryError::Store(err)
    }
}

impl From<rusqlite::Error> for QueryError {
    fn from(err: rusqlite::Error) -> Self {
        QueryError::Store(StoreError::Sqlite(err))
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::SourceNotFound(source) => write!(f, "Unknown source: {}", source),
            QueryError::InvalidWindow(msg) => write!(f, "Invalid time window: {}", msg),
            QueryError::EmptyResult => write!(f, "Could not retrieve data (no columns)."),
            QueryError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::Store(e) => Some(e),
            _ => None,
        }
    }
}
