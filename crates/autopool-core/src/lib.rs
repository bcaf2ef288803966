//! autopool-core: configuration shared by every autopool subsystem.
//!
//! One TOML document configures all three components:
//!
//! ```text
//! [pool]          → PoolConfig          (concurrency bounds, intervals)
//! [snapshotter]   → SnapshotterConfig   (sampling intervals, overload limits)
//! [status]        → SystemStatusConfig  (evaluation window, overload ratios)
//! ```
//!
//! Every field has a default, so an empty document is a valid config.

pub mod config;
pub mod error;

pub use config::{AutopoolConfig, PoolConfig, SnapshotterConfig, SystemStatusConfig};
pub use error::{ConfigError, ConfigResult};
