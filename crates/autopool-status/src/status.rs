//! System status evaluation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::trace;

use autopool_core::SystemStatusConfig;
use autopool_snapshot::{Snapshot, Snapshotter};

/// Overload verdict for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadRatioInfo {
    pub is_overloaded: bool,
    /// Configured maximum overloaded ratio.
    pub limit_ratio: f64,
    /// Overloaded snapshots divided by all snapshots in the sample.
    pub actual_ratio: f64,
    pub sample_size: usize,
}

impl LoadRatioInfo {
    /// Evaluate a sample against `limit_ratio`. An empty sample is not
    /// overloaded.
    pub fn evaluate<T: Snapshot>(sample: &[T], limit_ratio: f64) -> Self {
        if sample.is_empty() {
            return Self {
                is_overloaded: false,
                limit_ratio,
                actual_ratio: 0.0,
                sample_size: 0,
            };
        }

        let overloaded = sample.iter().filter(|s| s.is_overloaded()).count();
        let actual_ratio = overloaded as f64 / sample.len() as f64;
        Self {
            is_overloaded: actual_ratio > limit_ratio,
            limit_ratio,
            actual_ratio,
            sample_size: sample.len(),
        }
    }
}

/// Evaluation result over one time window. Recomputed on every call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub is_system_idle: bool,
    pub mem_info: LoadRatioInfo,
    pub event_loop_info: LoadRatioInfo,
    pub cpu_info: LoadRatioInfo,
    pub client_info: LoadRatioInfo,
}

impl SystemInfo {
    /// Names of the resources judged overloaded.
    pub fn overloaded_resources(&self) -> Vec<&'static str> {
        [
            ("memory", &self.mem_info),
            ("event_loop", &self.event_loop_info),
            ("cpu", &self.cpu_info),
            ("client", &self.client_info),
        ]
        .into_iter()
        .filter(|(_, info)| info.is_overloaded)
        .map(|(name, _)| name)
        .collect()
    }
}

/// Reads the snapshotter's histories and reports whether the system is
/// idle. Holds no state of its own.
#[derive(Clone)]
pub struct SystemStatus {
    snapshotter: Arc<Snapshotter>,
    config: SystemStatusConfig,
}

impl SystemStatus {
    pub fn new(snapshotter: Arc<Snapshotter>, config: SystemStatusConfig) -> Self {
        Self {
            snapshotter,
            config,
        }
    }

    pub fn snapshotter(&self) -> &Arc<Snapshotter> {
        &self.snapshotter
    }

    pub fn config(&self) -> &SystemStatusConfig {
        &self.config
    }

    /// Status over the last `current_history_secs`. Drives scaling.
    pub fn current_status(&self) -> SystemInfo {
        self.evaluate(Some(self.config.current_history()))
    }

    /// Status over the whole retained history. Used for reporting.
    pub fn historical_status(&self) -> SystemInfo {
        self.evaluate(None)
    }

    fn evaluate(&self, window: Option<Duration>) -> SystemInfo {
        let mem_info = LoadRatioInfo::evaluate(
            &self.snapshotter.memory_sample(window),
            self.config.max_memory_overloaded_ratio,
        );
        let event_loop_info = LoadRatioInfo::evaluate(
            &self.snapshotter.event_loop_sample(window),
            self.config.max_event_loop_overloaded_ratio,
        );
        let cpu_info = LoadRatioInfo::evaluate(
            &self.snapshotter.cpu_sample(window),
            self.config.max_cpu_overloaded_ratio,
        );
        let client_info = LoadRatioInfo::evaluate(
            &self.snapshotter.client_sample(window),
            self.config.max_client_overloaded_ratio,
        );

        let is_system_idle = !(mem_info.is_overloaded
            || event_loop_info.is_overloaded
            || cpu_info.is_overloaded
            || client_info.is_overloaded);

        trace!(
            window_secs = window.map(|w| w.as_secs_f64()),
            is_system_idle,
            "system status evaluated"
        );

        SystemInfo {
            is_system_idle,
            mem_info,
            event_loop_info,
            cpu_info,
            client_info,
        }
    }
}
