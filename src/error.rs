//! Error types for readout modules.
//!
//! Every fallible operation in the crate returns [`ReadoutError`]. Errors carry
//! structured context so that the command that triggered them (configure, start, stop,
//! scrap, record) can report something actionable.
//!
//! ## Error Categories
//!
//! - **Configuration Errors**: endpoints with ambiguous data types, missing queues
//! - **Format Errors**: descriptors outside the closed set of supported frame formats
//! - **Hardware Errors**: allocation, data-taking and polling failures of a source
//! - **Channel Errors**: send/receive timeouts and disconnected queues
//! - **Lifecycle Errors**: commands issued in a state that does not accept them
//! - **File / Parse Errors**: recordings, replay files and YAML configuration
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use fdreadout::ReadoutError;
//!
//! let error = ReadoutError::hardware("fill", "link down");
//! if !error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::lifecycle::ModuleState;

/// Result type alias for readout operations.
pub type Result<T, E = ReadoutError> = std::result::Result<T, E>;

/// Main error type for readout operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReadoutError {
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Unsupported data format '{descriptor}'")]
    UnsupportedFormat { descriptor: String },

    #[error("Hardware {operation} failed: {reason}")]
    Hardware {
        operation: &'static str,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Queue '{queue}' is disconnected")]
    Disconnected { queue: String },

    #[error("Cannot {command} a module that is {state}")]
    InvalidTransition { command: &'static str, state: ModuleState },

    #[error("File error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Worker thread '{thread}' failed: {reason}")]
    Thread { thread: String, reason: String },
}

impl ReadoutError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReadoutError::Timeout { .. } => true,
            ReadoutError::Hardware { operation, .. } => *operation != "fill",
            ReadoutError::Configuration { .. } => false,
            ReadoutError::UnsupportedFormat { .. } => false,
            ReadoutError::Disconnected { .. } => false,
            ReadoutError::InvalidTransition { .. } => false,
            ReadoutError::File { .. } => false,
            ReadoutError::Parse { .. } => false,
            ReadoutError::Thread { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ReadoutError::Configuration { .. } => vec![
                "Declare exactly one data type per queue endpoint",
                "Check that every referenced queue uid is declared",
            ],
            ReadoutError::UnsupportedFormat { .. } => vec![
                "Use one of the supported frame format names",
                "Check the spelling and case of the data type",
            ],
            ReadoutError::Hardware { .. } => vec![
                "Check that the readout card is present and initialised",
                "Re-run configure to reallocate the DMA buffer",
                "Inspect the card's link status",
            ],
            ReadoutError::Timeout { .. } => vec![
                "Increase the queue timeout",
                "Check that the downstream consumer is running",
            ],
            ReadoutError::Disconnected { .. } => vec![
                "Ensure the consuming module was not scrapped before the producer",
                "Reconfigure both ends of the queue",
            ],
            ReadoutError::InvalidTransition { .. } => vec![
                "Issue commands in configure, start, stop, scrap order",
                "Query the module state before sending a command",
            ],
            ReadoutError::File { .. } => vec![
                "Check the file exists and is readable",
                "Ensure sufficient disk space for recordings",
                "Check file permissions",
            ],
            ReadoutError::Parse { .. } => vec![
                "Check the YAML configuration against the documented fields",
                "Verify replay files contain whole frames",
            ],
            ReadoutError::Thread { .. } => vec!["Check the logs for a panic in the worker thread"],
        }
    }

    /// Helper constructor for configuration errors.
    pub fn configuration(reason: impl Into<String>) -> Self {
        ReadoutError::Configuration { reason: reason.into() }
    }

    /// Helper constructor for unsupported format descriptors.
    pub fn unsupported_format(descriptor: impl Into<String>) -> Self {
        ReadoutError::UnsupportedFormat { descriptor: descriptor.into() }
    }

    /// Helper constructor for hardware errors.
    pub fn hardware(operation: &'static str, reason: impl Into<String>) -> Self {
        ReadoutError::Hardware { operation, reason: reason.into(), source: None }
    }

    /// Helper constructor for hardware errors with source.
    pub fn hardware_with_source(
        operation: &'static str,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        ReadoutError::Hardware { operation, reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for disconnected queues.
    pub fn disconnected(queue: impl Into<String>) -> Self {
        ReadoutError::Disconnected { queue: queue.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReadoutError::File { path: path.into(), source }
    }

    /// Helper constructor for parse errors.
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        ReadoutError::Parse { context: context.into(), details: details.into() }
    }
}

impl From<std::io::Error> for ReadoutError {
    fn from(err: std::io::Error) -> Self {
        ReadoutError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<serde_yaml_ng::Error> for ReadoutError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        ReadoutError::Parse { context: "YAML configuration".to_string(), details: err.to_string() }
    }
}
