//! autopool-status: turns snapshot history into an idle/overloaded verdict.
//!
//! For every resource the evaluator computes the fraction of overloaded
//! snapshots in a sample and compares it to that resource's configured
//! maximum. The system is idle when no resource exceeds its maximum.
//!
//! Two horizons are offered:
//!
//! ```text
//! current_status()     → last `current_history_secs` of each history
//! historical_status()  → the whole retained history
//! ```

pub mod status;

pub use status::{LoadRatioInfo, SystemInfo, SystemStatus};
