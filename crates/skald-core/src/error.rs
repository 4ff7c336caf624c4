//! Error types for the Skald library.
//!
//! One enum covers the whole crate; variants carry a human-readable message
//! plus the underlying error where one exists so embedders can log the chain.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Skald library.
#[derive(Debug, Error)]
pub enum SkaldError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Handle is already running")]
    AlreadyRunning,

    #[error("No scan root configured")]
    NoScanRoot,

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Network errors
    #[error("Download failed for {url}: {message}")]
    Download { url: String, message: String },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    // Grabber errors
    #[error("Grabber {name} failed: {message}")]
    Grab { name: &'static str, message: String },

    #[error("Grabber has nothing for this file")]
    GrabMiss,

    // Thread lifecycle
    #[error("Worker thread failed to start: {0}")]
    Thread(String),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for SkaldError {
    fn from(e: rusqlite::Error) -> Self {
        SkaldError::Database {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

impl From<std::io::Error> for SkaldError {
    fn from(e: std::io::Error) -> Self {
        SkaldError::Io {
            message: e.to_string(),
            path: None,
            source: Some(e),
        }
    }
}

impl SkaldError {
    /// Shorthand for configuration refusals.
    pub fn config(message: impl Into<String>) -> Self {
        SkaldError::Config {
            message: message.into(),
        }
    }
}

/// Result type alias for the Skald library.
pub type Result<T> = std::result::Result<T, SkaldError>;
