//! Crate-level error types.

use crate::backend::BackendError;
use thiserror::Error;

/// Errors produced by the frame pipeline.
#[derive(Error, Debug)]
pub enum RenderError {
    /// A backend call failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    /// An extractor failed while populating the write-role frame.
    ///
    /// The tick is aborted and the frame is never published.
    #[error("extraction failed in '{extractor}': {message}")]
    Extraction { extractor: String, message: String },
    /// A render extension failed inside a pipeline pass.
    #[error("pass {phase} failed in extension '{extension}': {message}")]
    Pass {
        phase: &'static str,
        extension: String,
        message: String,
    },
    /// The GPU driver reported a non-success status.
    ///
    /// Only raised when `RendererConfig::validate_driver_calls` is set.
    #[error("GPU driver reported: {0}")]
    Driver(String),
    /// An invalid parameter was rejected at construction time.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Convenience alias used throughout the crate.
pub type RenderResult<T> = Result<T, RenderError>;
