//! autopool-pool: an autoscaled task pool.
//!
//! `AutoscaledPool` repeatedly asks a `ReadinessChecker` whether work is
//! available and launches it through a `TaskRunner`, keeping the number of
//! tasks in flight under a desired concurrency. That target moves between
//! the configured floor and ceiling according to `SystemStatus`: it shrinks
//! while any resource is overloaded and grows while the pool is nearly
//! saturated on an idle system. The run ends when a `FinishChecker` agrees
//! nothing is left, when any callback fails, or on `abort()`.

pub mod error;
pub mod pool;
pub mod state;
pub mod task;

pub use error::{PoolError, PoolResult};
pub use pool::AutoscaledPool;
pub use state::PoolPhase;
pub use task::{FinishChecker, ReadinessChecker, TaskRunner};
