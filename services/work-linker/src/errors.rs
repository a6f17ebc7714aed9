//!
//! src/errors.rs  Andrew Belles  Oct 16th, 2026
//!
//! Defines the error taxonomy of the linker and the conversions
//! from the crates it leans on. Only transient I/O is retried.
//!
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkerError {
    #[error("config error: {0}")]
    Config(String),
    #[error("transient io error: {0}")]
    TransientIo(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("already linked: recording {recording} -> work {work}")]
    AlreadyLinked { recording: String, work: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl LinkerError {
    /// Network and service failures are resubmitted at the queue head,
    /// everything else is surfaced to whoever awaits the task
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkerError::TransientIo(_))
    }
}

impl From<reqwest::Error> for LinkerError {
    fn from(e: reqwest::Error) -> Self { LinkerError::TransientIo(e.to_string()) }
}

impl From<serde_json::Error> for LinkerError {
    fn from(e: serde_json::Error) -> Self { LinkerError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for LinkerError {
    fn from(e: sqlx::Error) -> Self { LinkerError::Db(e.to_string()) }
}
