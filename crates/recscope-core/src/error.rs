//! Error types for the recscope-core library.
//!
//! This module provides error handling using the `thiserror` crate, with
//! variants for configuration, I/O and evaluation failures.
//!
//! Per-field evaluation failures are deliberately absent: they never surface as
//! an [`Error`] and are instead recorded as diagnostic meta-items on the record.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for recscope operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all recscope operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read an input, layout, script or configuration file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A configuration or layout file is not valid TOML
    #[error("failed to parse '{path}': {source}")]
    ConfigSyntax {
        /// Path to the offending file
        path: PathBuf,
        /// Underlying TOML error
        #[source]
        source: toml::de::Error,
    },

    /// A configuration or layout file is well-formed but its content is invalid
    #[error("invalid setting '{key}' in '{path}': {message}")]
    InvalidConfig {
        /// Path to the offending file
        path: PathBuf,
        /// Key of the offending setting
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// A layout or group condition could not be evaluated; the record parse is aborted
    #[error("condition '{expression}' aborted the record parse: {message}")]
    Condition {
        /// The condition expression
        expression: String,
        /// Evaluator message
        message: String,
    },

    /// The variable-length read procedure failed
    #[error("read procedure failed on '{path}': {message}")]
    ReadProcess {
        /// The file being read
        path: PathBuf,
        /// Evaluator message
        message: String,
    },

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new configuration syntax error
    pub fn config_syntax(path: impl Into<PathBuf>, source: toml::de::Error) -> Self {
        Self::ConfigSyntax {
            path: path.into(),
            source,
        }
    }

    /// Creates a new invalid configuration error
    pub fn invalid_config(
        path: impl Into<PathBuf>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidConfig {
            path: path.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a new condition error
    pub fn condition(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Condition {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Creates a new read procedure error
    pub fn read_process(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ReadProcess {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error comes from configuration or layout files
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigSyntax { .. } | Self::InvalidConfig { .. })
    }
}
