//! Snapshot records and the bounded history that stores them.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// One timestamped observation of a resource, tagged overloaded or not.
pub trait Snapshot {
    fn created_at(&self) -> Instant;
    fn is_overloaded(&self) -> bool;
}

/// Process memory against the configured limit.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    pub used_bytes: u64,
    /// Memory limit the usage is measured against.
    pub limit_bytes: u64,
    /// `used_bytes / limit_bytes`.
    pub used_ratio: f64,
}

/// How late the runtime woke the event-loop sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLoopSnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    pub delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuSnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    pub used_ratio: f64,
    pub max_used_ratio: f64,
}

/// Rate-limit errors reported by the dependent service.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    /// Counter value at this tick.
    pub error_count: u64,
    /// Errors since the previous tick.
    pub new_error_count: u64,
    pub max_errors: u64,
}

macro_rules! impl_snapshot {
    ($($ty:ty),*) => {
        $(
            impl Snapshot for $ty {
                fn created_at(&self) -> Instant {
                    self.created_at
                }

                fn is_overloaded(&self) -> bool {
                    self.is_overloaded
                }
            }
        )*
    };
}

impl_snapshot!(MemorySnapshot, EventLoopSnapshot, CpuSnapshot, ClientSnapshot);

/// Time-ordered snapshots of one resource, bounded by a retention window.
///
/// Entries are appended in timestamp order and pruned from the front after
/// every push, so the history never reorders.
#[derive(Debug, Clone)]
pub struct SnapshotHistory<T> {
    entries: VecDeque<T>,
    retention: Duration,
}

impl<T: Snapshot + Clone> SnapshotHistory<T> {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
        }
    }

    /// Append a snapshot and drop everything older than the retention
    /// window, measured from the new snapshot's timestamp.
    pub fn push(&mut self, snapshot: T) {
        let now = snapshot.created_at();
        self.entries.push_back(snapshot);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.retention) else {
            return;
        };
        while self
            .entries
            .front()
            .is_some_and(|s| s.created_at() < cutoff)
        {
            self.entries.pop_front();
        }
    }

    /// Snapshots taken within `window` of `now`, oldest first. `None`
    /// returns the whole history.
    pub fn sample(&self, window: Option<Duration>, now: Instant) -> Vec<T> {
        let start = match window.and_then(|w| now.checked_sub(w)) {
            Some(cutoff) => self.entries.partition_point(|s| s.created_at() < cutoff),
            None => 0,
        };
        self.entries.range(start..).cloned().collect()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
