//! Caller-supplied capabilities: what a task is, whether one is ready,
//! and whether the whole run is done.
//!
//! Any error returned by these is fatal to the pool's run. Plain
//! closures returning futures implement each trait.

use std::future::Future;

use async_trait::async_trait;

/// Performs one unit of work.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self) -> anyhow::Result<()>;
}

/// Reports whether a task could start right now. Only consulted when
/// there is free concurrency.
#[async_trait]
pub trait ReadinessChecker: Send + Sync {
    async fn is_task_ready(&self) -> anyhow::Result<bool>;
}

/// Reports whether the run is complete. Only consulted when no task is
/// in flight.
#[async_trait]
pub trait FinishChecker: Send + Sync {
    async fn is_finished(&self) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F, Fut> TaskRunner for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run_task(&self) -> anyhow::Result<()> {
        self().await
    }
}

#[async_trait]
impl<F, Fut> ReadinessChecker for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn is_task_ready(&self) -> anyhow::Result<bool> {
        self().await
    }
}

#[async_trait]
impl<F, Fut> FinishChecker for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn is_finished(&self) -> anyhow::Result<bool> {
        self().await
    }
}
