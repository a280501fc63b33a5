// src/error.rs

use thiserror::Error;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Failures surfaced by the backing table and the record store.
///
/// Not-found on an id-addressed mutation is not an error; those operations
/// return `Ok(false)`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Rate or usage limit hit on the backing service. Retried by `RetryPolicy`.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Credentials missing, rejected, or expired.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The spreadsheet or worksheet cannot be reached or created.
    #[error("table unavailable: {0}")]
    Unavailable(String),

    /// Header row differs from the expected schema and the configured policy
    /// refuses to repair it.
    #[error("schema mismatch: expected {expected:?}, found {found:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// The caller handed the store something it cannot persist.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Any other failure talking to the backing service.
    #[error("io error: {0}")]
    Io(String),

    /// The backing service answered with something we could not parse.
    #[error("decode error: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::Quota(_))
    }

    /// Fatal errors leave the store unusable until the environment is fixed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Auth(_) | StoreError::Unavailable(_))
    }

    /// Message suitable for showing to an end user next to a retry prompt.
    pub fn user_message(&self) -> String {
        match self {
            StoreError::Quota(_) => {
                "The data service is busy right now. Please try again shortly.".to_string()
            }
            StoreError::Auth(_) | StoreError::Unavailable(_) => {
                format!("The data service is not available: {}", self)
            }
            other => format!("The operation failed: {}", other),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}
