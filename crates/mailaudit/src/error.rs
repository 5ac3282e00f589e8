//! Error types for mailaudit

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Mailaudit error type
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    /// Could not authenticate against the remote directory.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A remote directory query failed mid-scan.
    #[error("Directory query failed: {0}")]
    Directory(String),

    /// Incremental and resume scans need an existing canonical snapshot.
    #[error("No snapshot found at {}; run a full scan first", .0.display())]
    MissingSnapshot(PathBuf),

    #[error("Another scan holds the run lock for {}", .0.display())]
    Locked(PathBuf),

    #[error("Failed to acquire run lock: {0}")]
    LockFailed(#[source] io::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl AuditError {
    /// True for failures that leave transient files behind for `--resume`.
    pub fn is_resumable(&self) -> bool {
        matches!(self, AuditError::Directory(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AuditError>;
