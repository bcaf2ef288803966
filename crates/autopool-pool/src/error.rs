//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::state::PoolPhase;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by the autoscaled pool.
///
/// Everything except `PauseTimeout` ends the run.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid configuration: {0}")]
    Config(#[from] autopool_core::ConfigError),

    #[error("pool cannot run from the {0:?} phase")]
    NotIdle(PoolPhase),

    #[error("task failed: {0}")]
    TaskFailed(#[source] anyhow::Error),

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("task readiness check failed: {0}")]
    ReadinessCheckFailed(#[source] anyhow::Error),

    #[error("finish check failed: {0}")]
    FinishCheckFailed(#[source] anyhow::Error),

    #[error("pause timed out after {0:?} with tasks still in flight")]
    PauseTimeout(Duration),
}
