//! Local resource probes.
//!
//! `SystemProbe` reads the host: process memory through `sysinfo` and
//! cumulative CPU ticks from `/proc/stat`. `FixedProbe` reports readings
//! set by its owner, for tests and simulations.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

use crate::error::{SampleError, SampleResult};

/// Path of the kernel's cumulative CPU counters.
const PROC_STAT: &str = "/proc/stat";

/// Memory reading from a resource source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Memory used by the monitored process (or container).
    pub used_bytes: u64,
    /// Total memory available to it.
    pub total_bytes: u64,
}

/// Cumulative CPU time counters, in kernel ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTicks {
    /// Idle plus iowait ticks.
    pub idle: u64,
    /// Sum of every tick category.
    pub total: u64,
}

impl CpuTicks {
    /// Utilization between two readings: `1 - idle_delta / total_delta`.
    ///
    /// Returns `None` when no ticks elapsed.
    pub fn used_ratio_since(&self, previous: &CpuTicks) -> Option<f64> {
        let idle_delta = self.idle.saturating_sub(previous.idle);
        let total_delta = self.total.saturating_sub(previous.total);
        if total_delta == 0 {
            return None;
        }
        Some((1.0 - idle_delta as f64 / total_delta as f64).clamp(0.0, 1.0))
    }
}

/// A source of local memory and CPU readings.
pub trait ResourceProbe: Send {
    fn memory_usage(&mut self) -> SampleResult<MemoryUsage>;
    fn cpu_ticks(&mut self) -> SampleResult<CpuTicks>;
}

/// Reads the current process's resident memory and the host's CPU ticks.
pub struct SystemProbe {
    system: System,
    pid: Option<Pid>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn memory_usage(&mut self) -> SampleResult<MemoryUsage> {
        self.system.refresh_memory();
        let total_bytes = self.system.total_memory();
        if total_bytes == 0 {
            return Err(SampleError::Unavailable("total memory".to_string()));
        }

        let pid = self
            .pid
            .ok_or_else(|| SampleError::Unavailable("current pid".to_string()))?;
        if !self.system.refresh_process(pid) {
            return Err(SampleError::Unavailable(format!("process {pid}")));
        }
        let used_bytes = self
            .system
            .process(pid)
            .map(|p| p.memory())
            .ok_or_else(|| SampleError::Unavailable(format!("process {pid}")))?;

        Ok(MemoryUsage {
            used_bytes,
            total_bytes,
        })
    }

    #[cfg(target_os = "linux")]
    fn cpu_ticks(&mut self) -> SampleResult<CpuTicks> {
        let content = std::fs::read_to_string(PROC_STAT).map_err(|source| SampleError::Read {
            path: PROC_STAT.to_string(),
            source,
        })?;
        parse_proc_stat(&content)
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_ticks(&mut self) -> SampleResult<CpuTicks> {
        Err(SampleError::Unsupported("cpu tick counters"))
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
///
/// Columns: user nice system idle iowait irq softirq steal [guest guest_nice].
/// Guest time is already included in user/nice, so only the first eight
/// columns are summed.
pub(crate) fn parse_proc_stat(content: &str) -> SampleResult<CpuTicks> {
    let parse_err = |detail: String| SampleError::Parse {
        path: PROC_STAT.to_string(),
        detail,
    };

    let line = content
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| parse_err("no aggregate cpu line".to_string()))?;

    let fields = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| parse_err(format!("expected integer tick count, got '{v}'")))
        })
        .collect::<SampleResult<Vec<u64>>>()?;

    if fields.len() < 4 {
        return Err(parse_err(format!(
            "expected at least 4 tick columns, got {}",
            fields.len()
        )));
    }

    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().sum();
    Ok(CpuTicks { idle, total })
}

/// Ticks added per `cpu_ticks()` call by `FixedProbe`.
const FIXED_TICKS_PER_READ: u64 = 1000;

#[derive(Debug)]
struct FixedReadings {
    memory: MemoryUsage,
    cpu_used_ratio: f64,
    ticks: CpuTicks,
    failing: bool,
}

/// Probe that reports readings set through its handle.
///
/// Clones share state, so a test can keep one clone and hand the other to
/// a `Snapshotter`. Each `cpu_ticks()` call advances the counters so the
/// delta between consecutive reads reproduces the configured usage ratio.
#[derive(Debug, Clone)]
pub struct FixedProbe {
    readings: Arc<Mutex<FixedReadings>>,
}

impl FixedProbe {
    /// Idle machine: 10% of a 1 GiB host used, 10% CPU.
    pub fn new() -> Self {
        Self {
            readings: Arc::new(Mutex::new(FixedReadings {
                memory: MemoryUsage {
                    used_bytes: 100 * 1024 * 1024,
                    total_bytes: 1024 * 1024 * 1024,
                },
                cpu_used_ratio: 0.1,
                ticks: CpuTicks::default(),
                failing: false,
            })),
        }
    }

    pub fn set_memory(&self, used_bytes: u64, total_bytes: u64) {
        self.readings.lock().memory = MemoryUsage {
            used_bytes,
            total_bytes,
        };
    }

    pub fn set_cpu_used_ratio(&self, ratio: f64) {
        self.readings.lock().cpu_used_ratio = ratio.clamp(0.0, 1.0);
    }

    /// Make every read fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.readings.lock().failing = failing;
    }
}

impl Default for FixedProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for FixedProbe {
    fn memory_usage(&mut self) -> SampleResult<MemoryUsage> {
        let readings = self.readings.lock();
        if readings.failing {
            return Err(SampleError::Unavailable("fixed memory reading".to_string()));
        }
        Ok(readings.memory)
    }

    fn cpu_ticks(&mut self) -> SampleResult<CpuTicks> {
        let mut readings = self.readings.lock();
        if readings.failing {
            return Err(SampleError::Unavailable("fixed cpu reading".to_string()));
        }
        let idle = ((1.0 - readings.cpu_used_ratio) * FIXED_TICKS_PER_READ as f64).round() as u64;
        readings.ticks.idle += idle;
        readings.ticks.total += FIXED_TICKS_PER_READ;
        Ok(readings.ticks)
    }
}
