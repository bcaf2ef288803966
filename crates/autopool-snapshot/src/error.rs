//! Sampling error types.

use thiserror::Error;

/// Result type alias for a single resource sample.
pub type SampleResult<T> = Result<T, SampleError>;

/// Errors a resource probe can report. The snapshotter logs them and
/// skips the tick.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("{0} is unavailable")]
    Unavailable(String),
}
