//! autopool.toml configuration parser.
//!
//! Option names mirror the pool's documented options, with interval
//! options expressed in (fractional) seconds. Use the `Duration`
//! accessors rather than reading the `*_secs` fields directly.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopoolConfig {
    pub pool: PoolConfig,
    pub snapshotter: SnapshotterConfig,
    pub status: SystemStatusConfig,
}

impl AutopoolConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: AutopoolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate every section.
    pub fn validate(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.snapshotter.validate()?;
        self.status.validate()
    }
}

/// Options for the autoscaled pool's control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrency floor.
    pub min_concurrency: usize,
    /// Concurrency ceiling.
    pub max_concurrency: usize,
    /// Starting concurrency. Defaults to `min_concurrency`.
    pub desired_concurrency: Option<usize>,
    /// Fraction of the desired concurrency that must be in use before
    /// scaling up is considered.
    pub desired_concurrency_ratio: f64,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// Polling period for new tasks.
    pub maybe_run_interval_secs: f64,
    /// Period of the status log line. `0` disables it.
    pub logging_interval_secs: f64,
    pub autoscale_interval_secs: f64,
    /// Cap on task starts within any sliding minute. `None` is unlimited.
    pub max_tasks_per_minute: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 1000,
            desired_concurrency: None,
            desired_concurrency_ratio: 0.95,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            maybe_run_interval_secs: 0.5,
            logging_interval_secs: 60.0,
            autoscale_interval_secs: 10.0,
            max_tasks_per_minute: None,
        }
    }
}

impl PoolConfig {
    /// The starting desired concurrency.
    pub fn initial_desired_concurrency(&self) -> usize {
        self.desired_concurrency.unwrap_or(self.min_concurrency)
    }

    pub fn maybe_run_interval(&self) -> Duration {
        bounded_duration(self.maybe_run_interval_secs)
    }

    pub fn autoscale_interval(&self) -> Duration {
        bounded_duration(self.autoscale_interval_secs)
    }

    /// Status log period, `None` when disabled.
    pub fn logging_interval(&self) -> Option<Duration> {
        (self.logging_interval_secs != 0.0).then(|| bounded_duration(self.logging_interval_secs))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_concurrency == 0 {
            return Err(ConfigError::invalid("min_concurrency", "must be at least 1"));
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(ConfigError::invalid(
                "min_concurrency",
                format!(
                    "{} exceeds max_concurrency {}",
                    self.min_concurrency, self.max_concurrency
                ),
            ));
        }
        if let Some(desired) = self.desired_concurrency
            && !(self.min_concurrency..=self.max_concurrency).contains(&desired)
        {
            return Err(ConfigError::invalid(
                "desired_concurrency",
                format!(
                    "{desired} is outside [{}, {}]",
                    self.min_concurrency, self.max_concurrency
                ),
            ));
        }
        check_unit_ratio("desired_concurrency_ratio", self.desired_concurrency_ratio)?;
        check_unit_ratio("scale_up_step_ratio", self.scale_up_step_ratio)?;
        check_unit_ratio("scale_down_step_ratio", self.scale_down_step_ratio)?;
        check_interval("maybe_run_interval_secs", self.maybe_run_interval_secs)?;
        check_interval("autoscale_interval_secs", self.autoscale_interval_secs)?;
        if self.logging_interval_secs != 0.0 {
            check_interval("logging_interval_secs", self.logging_interval_secs)?;
        }
        if self.max_tasks_per_minute == Some(0) {
            return Err(ConfigError::invalid(
                "max_tasks_per_minute",
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

/// Options for the snapshotter's sampling timers and overload limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotterConfig {
    pub event_loop_snapshot_interval_secs: f64,
    pub memory_snapshot_interval_secs: f64,
    pub cpu_snapshot_interval_secs: f64,
    pub client_snapshot_interval_secs: f64,
    /// Scheduler lateness above which an event-loop snapshot is overloaded.
    pub max_blocked_millis: u64,
    pub max_used_memory_ratio: f64,
    pub max_used_cpu_ratio: f64,
    /// Rate-limit errors per tick above which a client snapshot is overloaded.
    pub max_client_errors: u64,
    /// Retention window for every history.
    pub snapshot_history_secs: f64,
    /// Explicit memory limit. When unset the limit is
    /// `available_memory_ratio` of total memory.
    pub max_memory_bytes: Option<u64>,
    pub available_memory_ratio: f64,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            event_loop_snapshot_interval_secs: 0.5,
            memory_snapshot_interval_secs: 1.0,
            cpu_snapshot_interval_secs: 1.0,
            client_snapshot_interval_secs: 1.0,
            max_blocked_millis: 50,
            max_used_memory_ratio: 0.7,
            max_used_cpu_ratio: 0.95,
            max_client_errors: 1,
            snapshot_history_secs: 60.0,
            max_memory_bytes: None,
            available_memory_ratio: 0.25,
        }
    }
}

impl SnapshotterConfig {
    pub fn event_loop_interval(&self) -> Duration {
        bounded_duration(self.event_loop_snapshot_interval_secs)
    }

    pub fn memory_interval(&self) -> Duration {
        bounded_duration(self.memory_snapshot_interval_secs)
    }

    pub fn cpu_interval(&self) -> Duration {
        bounded_duration(self.cpu_snapshot_interval_secs)
    }

    pub fn client_interval(&self) -> Duration {
        bounded_duration(self.client_snapshot_interval_secs)
    }

    pub fn max_blocked(&self) -> Duration {
        Duration::from_millis(self.max_blocked_millis)
    }

    pub fn snapshot_history(&self) -> Duration {
        bounded_duration(self.snapshot_history_secs)
    }

    /// Memory limit for a source reporting `total_bytes` of memory.
    pub fn memory_limit_bytes(&self, total_bytes: u64) -> u64 {
        self.max_memory_bytes
            .unwrap_or_else(|| (total_bytes as f64 * self.available_memory_ratio) as u64)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_interval(
            "event_loop_snapshot_interval_secs",
            self.event_loop_snapshot_interval_secs,
        )?;
        check_interval(
            "memory_snapshot_interval_secs",
            self.memory_snapshot_interval_secs,
        )?;
        check_interval("cpu_snapshot_interval_secs", self.cpu_snapshot_interval_secs)?;
        check_interval(
            "client_snapshot_interval_secs",
            self.client_snapshot_interval_secs,
        )?;
        check_interval("snapshot_history_secs", self.snapshot_history_secs)?;
        check_unit_ratio("max_used_memory_ratio", self.max_used_memory_ratio)?;
        check_unit_ratio("max_used_cpu_ratio", self.max_used_cpu_ratio)?;
        check_unit_ratio("available_memory_ratio", self.available_memory_ratio)?;
        if self.max_memory_bytes == Some(0) {
            return Err(ConfigError::invalid(
                "max_memory_bytes",
                "must be positive when set",
            ));
        }
        Ok(())
    }
}

/// Options for turning snapshot history into a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemStatusConfig {
    /// Window used for "is the system overloaded right now".
    pub current_history_secs: f64,
    pub max_memory_overloaded_ratio: f64,
    pub max_event_loop_overloaded_ratio: f64,
    pub max_cpu_overloaded_ratio: f64,
    pub max_client_overloaded_ratio: f64,
}

impl Default for SystemStatusConfig {
    fn default() -> Self {
        Self {
            current_history_secs: 5.0,
            max_memory_overloaded_ratio: 0.2,
            max_event_loop_overloaded_ratio: 0.2,
            max_cpu_overloaded_ratio: 0.4,
            max_client_overloaded_ratio: 0.2,
        }
    }
}

impl SystemStatusConfig {
    pub fn current_history(&self) -> Duration {
        bounded_duration(self.current_history_secs)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_interval("current_history_secs", self.current_history_secs)?;
        check_fraction(
            "max_memory_overloaded_ratio",
            self.max_memory_overloaded_ratio,
        )?;
        check_fraction(
            "max_event_loop_overloaded_ratio",
            self.max_event_loop_overloaded_ratio,
        )?;
        check_fraction("max_cpu_overloaded_ratio", self.max_cpu_overloaded_ratio)?;
        check_fraction(
            "max_client_overloaded_ratio",
            self.max_client_overloaded_ratio,
        )
    }
}

/// Ratio in `(0, 1]`.
fn check_unit_ratio(option: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(option, format!("{value} is not in (0, 1]")))
    }
}

/// Ratio in `[0, 1]`.
fn check_fraction(option: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(option, format!("{value} is not in [0, 1]")))
    }
}

/// Longest accepted interval or window: one year.
const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Positive seconds that convert to a non-zero `Duration` of at most
/// `MAX_INTERVAL_SECS`.
fn check_interval(option: &'static str, secs: f64) -> ConfigResult<()> {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() && d <= Duration::from_secs(MAX_INTERVAL_SECS) => Ok(()),
        _ => Err(ConfigError::invalid(
            option,
            format!("{secs} is not a positive number of seconds up to {MAX_INTERVAL_SECS}"),
        )),
    }
}

/// Convert seconds to a `Duration` in `[1ns, MAX_INTERVAL_SECS]`.
///
/// Validated configs always convert exactly; unvalidated values saturate
/// instead of panicking.
fn bounded_duration(secs: f64) -> Duration {
    let max = Duration::from_secs(MAX_INTERVAL_SECS);
    match Duration::try_from_secs_f64(secs) {
        Ok(d) => d.clamp(Duration::from_nanos(1), max),
        Err(_) if secs > 0.0 => max,
        Err(_) => Duration::from_nanos(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AutopoolConfig::from_toml_str("").unwrap();
        assert_eq!(config, AutopoolConfig::default());
        assert_eq!(config.pool.initial_desired_concurrency(), 1);
        assert_eq!(config.pool.autoscale_interval(), Duration::from_secs(10));
        assert_eq!(config.pool.maybe_run_interval(), Duration::from_millis(500));
        assert_eq!(config.pool.logging_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.snapshotter.max_blocked(), Duration::from_millis(50));
        assert_eq!(config.snapshotter.snapshot_history(), Duration::from_secs(60));
        assert_eq!(config.status.current_history(), Duration::from_secs(5));
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[pool]
min_concurrency = 2
max_concurrency = 8
desired_concurrency = 4
logging_interval_secs = 0

[snapshotter]
max_memory_bytes = 1073741824

[status]
max_cpu_overloaded_ratio = 0.5
"#;
        let config = AutopoolConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.pool.min_concurrency, 2);
        assert_eq!(config.pool.initial_desired_concurrency(), 4);
        assert_eq!(config.pool.logging_interval(), None);
        assert_eq!(config.pool.scale_up_step_ratio, 0.05);
        assert_eq!(config.snapshotter.memory_limit_bytes(0), 1 << 30);
        assert_eq!(config.status.max_cpu_overloaded_ratio, 0.5);
        assert_eq!(config.status.max_memory_overloaded_ratio, 0.2);
    }

    #[test]
    fn memory_limit_defaults_to_quarter_of_total() {
        let config = SnapshotterConfig::default();
        assert_eq!(config.memory_limit_bytes(4000), 1000);
    }

    #[test]
    fn rejects_min_above_max() {
        let config = PoolConfig {
            min_concurrency: 10,
            max_concurrency: 5,
            ..PoolConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                option: "min_concurrency",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_min_concurrency() {
        let config = PoolConfig {
            min_concurrency: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_desired_outside_bounds() {
        let config = PoolConfig {
            min_concurrency: 2,
            max_concurrency: 4,
            desired_concurrency: Some(5),
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_ratios_and_intervals() {
        let pool = PoolConfig {
            scale_up_step_ratio: 0.0,
            ..PoolConfig::default()
        };
        assert!(pool.validate().is_err());

        let snapshotter = SnapshotterConfig {
            memory_snapshot_interval_secs: -1.0,
            ..SnapshotterConfig::default()
        };
        assert!(snapshotter.validate().is_err());

        let status = SystemStatusConfig {
            max_client_overloaded_ratio: 1.5,
            ..SystemStatusConfig::default()
        };
        assert!(status.validate().is_err());
    }

    #[test]
    fn invalid_document_is_rejected_on_load() {
        let err = AutopoolConfig::from_toml_str("[pool]\nmax_tasks_per_minute = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_tasks_per_minute"));

        let err = AutopoolConfig::from_toml_str("[pool]\nmin_concurrency = \"one\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autopool.toml");
        std::fs::write(&path, "[pool]\nmax_concurrency = 8\n").unwrap();

        let config = AutopoolConfig::from_file(&path).unwrap();
        assert_eq!(config.pool.max_concurrency, 8);

        let missing = AutopoolConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = AutopoolConfig::default();
        config.pool.max_tasks_per_minute = Some(120);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("max_tasks_per_minute = 120"));
        assert_eq!(AutopoolConfig::from_toml_str(&toml_str).unwrap(), config);
    }

    #[test]
    fn disabled_logging_survives_round_trip() {
        let mut config = AutopoolConfig::default();
        config.pool.logging_interval_secs = 0.0;
        let toml_str = config.to_toml_string().unwrap();
        let reloaded = AutopoolConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(reloaded, config);
        assert_eq!(reloaded.pool.logging_interval(), None);
    }

    #[test]
    fn rejects_intervals_that_do_not_fit_a_duration() {
        for secs in [1e300, f64::INFINITY, f64::NAN, 1e-12, -0.5] {
            let pool = PoolConfig {
                autoscale_interval_secs: secs,
                ..PoolConfig::default()
            };
            assert!(pool.validate().is_err(), "accepted {secs}");

            let snapshotter = SnapshotterConfig {
                snapshot_history_secs: secs,
                ..SnapshotterConfig::default()
            };
            assert!(snapshotter.validate().is_err(), "accepted {secs}");

            let status = SystemStatusConfig {
                current_history_secs: secs,
                ..SystemStatusConfig::default()
            };
            assert!(status.validate().is_err(), "accepted {secs}");
        }
    }

    #[test]
    fn accessors_saturate_on_unvalidated_values() {
        let pool = PoolConfig {
            maybe_run_interval_secs: 1e300,
            autoscale_interval_secs: -3.0,
            logging_interval_secs: f64::NAN,
            ..PoolConfig::default()
        };
        assert_eq!(pool.maybe_run_interval(), Duration::from_secs(MAX_INTERVAL_SECS));
        assert_eq!(pool.autoscale_interval(), Duration::from_nanos(1));
        assert_eq!(pool.logging_interval(), Some(Duration::from_nanos(1)));
    }
}
