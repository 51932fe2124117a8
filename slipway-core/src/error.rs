//! Error types for Slipway.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Component-level errors (parser, plan, cache, executor) convert into
//! [`SlipwayError`] at the crate boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Slipway operations.
pub type Result<T> = std::result::Result<T, SlipwayError>;

/// Main error type for Slipway.
#[derive(Error, Debug)]
pub enum SlipwayError {
    // Image errors
    #[error("Image not found: {image}")]
    ImageNotFound { image: String },

    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Corrupt image record {id}: {reason}")]
    CorruptImage { id: String, reason: String },

    // Build errors
    #[error("Base runtime {image} unreachable: {reason}")]
    BaseUnreachable { image: String, reason: String },

    #[error("Build failed at step {step} ({instruction}): {reason}")]
    BuildFailed { step: usize, instruction: String, reason: String },

    #[error("Invalid recipe at {path:?}: {reason}")]
    InvalidRecipe { path: PathBuf, reason: String },

    #[error("Build source not found: {path:?}")]
    SourceNotFound { path: PathBuf },

    #[error("File read error: {path}: {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // Launch errors
    #[error("Entry file {entry} not found in image working directory {workdir}")]
    EntryNotFound { entry: String, workdir: String },

    #[error("Port {port} already in use on {address}")]
    PortConflict { port: u16, address: String },

    #[error("Failed to bind {address}:{port}: {reason}")]
    BindFailed { port: u16, address: String, reason: String },

    #[error("Runner program not found: {program}")]
    ProgramNotFound { program: String },

    #[error("Launch failed: {reason}")]
    LaunchFailed { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SlipwayError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Process exit code the CLI reports for this error.
    ///
    /// Build-side failures exit with 1. Launch-side failures that happen before
    /// the dashboard process exists use 125, and a missing runner program uses
    /// 127, mirroring container runtimes.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProgramNotFound { .. } => 127,
            Self::ImageNotFound { .. }
            | Self::EntryNotFound { .. }
            | Self::PortConflict { .. }
            | Self::BindFailed { .. }
            | Self::LaunchFailed { .. }
            | Self::CorruptImage { .. } => 125,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let not_found = SlipwayError::ImageNotFound { image: "dash:latest".into() };
        assert_eq!(not_found.exit_code(), 125);

        let port = SlipwayError::PortConflict { port: 8501, address: "0.0.0.0".into() };
        assert_eq!(port.exit_code(), 125);
        assert!(port.to_string().contains("8501"));

        let program = SlipwayError::ProgramNotFound { program: "streamlit".into() };
        assert_eq!(program.exit_code(), 127);

        let build = SlipwayError::BuildFailed {
            step: 4,
            instruction: "RUN pip install".into(),
            reason: "exit status 1".into(),
        };
        assert_eq!(build.exit_code(), 1);
    }
}
