use thiserror::Error;

/// Client-side envelope problems. Never retried by the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid JSON body: {0}")]
    MalformedBody(String),

    #[error("missing required envelope field: {0}")]
    MissingField(&'static str),
}

/// Failures of the durable components (staging log, idempotency index).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("staging log is over its high-water mark ({pending} pending, limit {limit})")]
    Overloaded { pending: u64, limit: u64 },

    #[error("staging storage is corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Transient errors are worth a retry by the caller.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Corrupted(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                StoreError::Corrupted(err.to_string())
            }
            _ => StoreError::StorageUnavailable(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

/// Downstream queue transport problems. Recovered by dispatcher backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("downstream transport failed: {0}")]
    Transport(String),

    #[error("downstream enqueue timed out after {0}ms")]
    Timeout(u64),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
