//src/error.rs

use thiserror::Error;

/// Error type for all library operations. Per-query conditions (filter
/// rejections, lookup misses, timeouts) are not errors; only run-level
/// infrastructure failures surface here.
#[derive(Error, Debug)]
pub enum BlastaxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store format error: {0}")]
    StoreFormat(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    Checksum {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, BlastaxError>;

impl From<reqwest::Error> for BlastaxError {
    fn from(err: reqwest::Error) -> Self {
        BlastaxError::Network(err.to_string())
    }
}
