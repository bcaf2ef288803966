//! System info pushed by a hosting platform.

use serde::{Deserialize, Serialize};

use crate::probe::MemoryUsage;

/// Memory and CPU readings reported by an external platform.
///
/// A snapshotter built with `Snapshotter::with_system_info_events` records
/// one memory and one CPU snapshot per event instead of sampling locally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemInfoEvent {
    /// CPU utilization in `[0, 1]`.
    pub cpu_used_ratio: f64,
    pub memory: MemoryUsage,
}
