//! Error types shared by the archiver crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling archive data.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A line in a server list file could not be parsed.
    #[error("invalid server list line {line}: {reason}")]
    InvalidServerLine {
        /// 1-based line number in the source file.
        line: usize,
        /// Description of what's wrong.
        reason: String,
    },
}
