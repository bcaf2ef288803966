//! autopool-snapshot: bounded, time-ordered resource overload history.
//!
//! The `Snapshotter` owns four independent sampling timers. Each tick
//! samples exactly one resource, appends one snapshot to that resource's
//! history and prunes entries older than `snapshot_history_secs`.
//!
//! # Architecture
//!
//! ```text
//! Snapshotter
//!   ├── event-loop timer → EventLoopSnapshot (scheduler lateness)
//!   ├── client timer     → ClientSnapshot    (ClientErrorSource delta)
//!   └── resource source, one of:
//!       ├── ResourceProbe (local)  → memory timer, cpu timer
//!       └── SystemInfoEvent stream (pushed by a hosting platform)
//! ```
//!
//! Sampling failures are logged and the tick is skipped; they never
//! reach the caller and never stop later ticks.

pub mod client;
pub mod error;
pub mod event;
pub mod probe;
pub mod snapshot;
pub mod snapshotter;

pub use client::{ClientErrorSource, ErrorTracker};
pub use error::{SampleError, SampleResult};
pub use event::SystemInfoEvent;
pub use probe::{CpuTicks, FixedProbe, MemoryUsage, ResourceProbe, SystemProbe};
pub use snapshot::{
    ClientSnapshot, CpuSnapshot, EventLoopSnapshot, MemorySnapshot, Snapshot, SnapshotHistory,
};
pub use snapshotter::{SamplingLease, Snapshotter};
