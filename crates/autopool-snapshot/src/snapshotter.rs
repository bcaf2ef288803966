//! Snapshotter: periodic resource sampling into bounded histories.
//!
//! Every sampler runs as its own background task with its own interval.
//! Histories are written only by those tasks (or by `record_system_info`
//! in pushed mode) and read through the `*_sample` accessors.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use autopool_core::SnapshotterConfig;

use crate::client::ClientErrorSource;
use crate::event::SystemInfoEvent;
use crate::probe::{CpuTicks, MemoryUsage, ResourceProbe, SystemProbe};
use crate::snapshot::{
    ClientSnapshot, CpuSnapshot, EventLoopSnapshot, MemorySnapshot, SnapshotHistory,
};

/// Usage ratio above which memory is reported as critically overloaded.
const CRITICAL_MEMORY_RATIO: f64 = 0.9;

/// Minimum time between two critical memory warnings.
const MEMORY_WARNING_COOLDOWN: Duration = Duration::from_secs(10);

/// Background sampler tasks of a running snapshotter.
struct TimerSet {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

/// State shared with the sampler tasks.
struct Shared {
    config: SnapshotterConfig,
    /// Local probe; `None` in pushed mode.
    probe: Option<Mutex<Box<dyn ResourceProbe>>>,
    client_errors: RwLock<Option<Arc<dyn ClientErrorSource>>>,

    memory: Mutex<SnapshotHistory<MemorySnapshot>>,
    event_loop: Mutex<SnapshotHistory<EventLoopSnapshot>>,
    cpu: Mutex<SnapshotHistory<CpuSnapshot>>,
    client: Mutex<SnapshotHistory<ClientSnapshot>>,

    previous_cpu_ticks: Mutex<Option<CpuTicks>>,
    previous_client_errors: Mutex<Option<u64>>,
    last_memory_warning: Mutex<Option<Instant>>,
}

/// Samples memory, CPU, event-loop lag and client errors on independent
/// timers and keeps a bounded history of each.
///
/// `start()` must be called from within a tokio runtime.
pub struct Snapshotter {
    shared: Arc<Shared>,
    /// Platform event stream; `Some` in pushed mode.
    events: Option<broadcast::Receiver<SystemInfoEvent>>,
    timers: Mutex<Option<TimerSet>>,
    /// Outstanding `SamplingLease`s.
    leases: Mutex<usize>,
}

/// Keeps a shared snapshotter sampling while held.
///
/// The first lease starts the sampler tasks and dropping the last one stops
/// them, so several pools can share one snapshotter without stopping it
/// under each other.
#[must_use = "sampling stops when the lease is dropped"]
pub struct SamplingLease {
    snapshotter: Arc<Snapshotter>,
}

impl Drop for SamplingLease {
    fn drop(&mut self) {
        self.snapshotter.release();
    }
}

impl Snapshotter {
    /// Snapshotter that samples the local host.
    pub fn new(config: SnapshotterConfig) -> Self {
        Self::with_probe(config, SystemProbe::new())
    }

    /// Snapshotter that reads memory and CPU from `probe`.
    pub fn with_probe(config: SnapshotterConfig, probe: impl ResourceProbe + 'static) -> Self {
        Self::build(config, Some(Mutex::new(Box::new(probe))), None)
    }

    /// Snapshotter that records memory and CPU from platform events
    /// instead of sampling them. Event-loop and client sampling stay local.
    pub fn with_system_info_events(
        config: SnapshotterConfig,
        events: broadcast::Receiver<SystemInfoEvent>,
    ) -> Self {
        Self::build(config, None, Some(events))
    }

    fn build(
        config: SnapshotterConfig,
        probe: Option<Mutex<Box<dyn ResourceProbe>>>,
        events: Option<broadcast::Receiver<SystemInfoEvent>>,
    ) -> Self {
        let retention = config.snapshot_history();
        Self {
            shared: Arc::new(Shared {
                config,
                probe,
                client_errors: RwLock::new(None),
                memory: Mutex::new(SnapshotHistory::new(retention)),
                event_loop: Mutex::new(SnapshotHistory::new(retention)),
                cpu: Mutex::new(SnapshotHistory::new(retention)),
                client: Mutex::new(SnapshotHistory::new(retention)),
                previous_cpu_ticks: Mutex::new(None),
                previous_client_errors: Mutex::new(None),
                last_memory_warning: Mutex::new(None),
            }),
            events,
            timers: Mutex::new(None),
            leases: Mutex::new(0),
        }
    }

    /// Set the counter the client sampler reads. Without one, client
    /// snapshots always report zero new errors.
    pub fn with_client_errors(self, source: Arc<dyn ClientErrorSource>) -> Self {
        *self.shared.client_errors.write() = Some(source);
        self
    }

    /// Configuration this snapshotter was built with.
    pub fn config(&self) -> &SnapshotterConfig {
        &self.shared.config
    }

    /// Whether memory and CPU come from pushed platform events.
    pub fn is_pushed_mode(&self) -> bool {
        self.events.is_some()
    }

    /// Whether the sampler tasks are running.
    pub fn is_running(&self) -> bool {
        self.timers.lock().is_some()
    }

    /// Start the sampler tasks. Starting a running snapshotter is a no-op.
    pub fn start(&self) {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            debug!("snapshotter already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = &self.shared.config;
        let mut handles = vec![
            spawn_event_loop_sampler(self.shared.clone(), shutdown_rx.clone()),
            spawn_sampler(
                "client",
                config.client_interval(),
                self.shared.clone(),
                shutdown_rx.clone(),
                Shared::sample_client,
            ),
        ];

        match &self.events {
            Some(events) => handles.push(spawn_event_listener(
                self.shared.clone(),
                events.resubscribe(),
                shutdown_rx,
            )),
            None => {
                handles.push(spawn_sampler(
                    "memory",
                    config.memory_interval(),
                    self.shared.clone(),
                    shutdown_rx.clone(),
                    Shared::sample_memory,
                ));
                handles.push(spawn_sampler(
                    "cpu",
                    config.cpu_interval(),
                    self.shared.clone(),
                    shutdown_rx,
                    Shared::sample_cpu,
                ));
            }
        }

        *timers = Some(TimerSet {
            handles,
            shutdown_tx,
        });
        info!(pushed = self.events.is_some(), "snapshotter started");
    }

    /// Stop all sampler tasks. History is kept.
    pub fn stop(&self) {
        if let Some(timers) = self.timers.lock().take() {
            let _ = timers.shutdown_tx.send(true);
            for handle in timers.handles {
                handle.abort();
            }
            info!("snapshotter stopped");
        }
    }

    /// Start sampling if needed and hold it running until the lease drops.
    ///
    /// Explicit `start`/`stop` calls are independent of leases; `stop`
    /// halts sampling even while leases are outstanding.
    pub fn lease(self: &Arc<Self>) -> SamplingLease {
        let mut leases = self.leases.lock();
        *leases += 1;
        self.start();
        SamplingLease {
            snapshotter: self.clone(),
        }
    }

    /// Number of outstanding leases.
    pub fn lease_count(&self) -> usize {
        *self.leases.lock()
    }

    fn release(&self) {
        let mut leases = self.leases.lock();
        *leases = leases.saturating_sub(1);
        if *leases == 0 {
            self.stop();
        }
    }

    /// Record memory and CPU readings pushed by a hosting platform.
    pub fn record_system_info(&self, event: SystemInfoEvent) {
        self.shared.record_system_info(event);
    }

    /// Memory snapshots from the last `window`, or the whole history.
    pub fn memory_sample(&self, window: Option<Duration>) -> Vec<MemorySnapshot> {
        self.shared.memory.lock().sample(window, Instant::now())
    }

    /// Event-loop snapshots from the last `window`, or the whole history.
    pub fn event_loop_sample(&self, window: Option<Duration>) -> Vec<EventLoopSnapshot> {
        self.shared.event_loop.lock().sample(window, Instant::now())
    }

    /// CPU snapshots from the last `window`, or the whole history.
    pub fn cpu_sample(&self, window: Option<Duration>) -> Vec<CpuSnapshot> {
        self.shared.cpu.lock().sample(window, Instant::now())
    }

    /// Client snapshots from the last `window`, or the whole history.
    pub fn client_sample(&self, window: Option<Duration>) -> Vec<ClientSnapshot> {
        self.shared.client.lock().sample(window, Instant::now())
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn sample_memory(&self) {
        let Some(probe) = &self.probe else {
            return;
        };
        let reading = probe.lock().memory_usage();
        match reading {
            Ok(usage) => self.record_memory(usage, Instant::now()),
            Err(e) => warn!(error = %e, "memory sampling failed, skipping tick"),
        }
    }

    fn sample_cpu(&self) {
        let Some(probe) = &self.probe else {
            return;
        };
        let reading = probe.lock().cpu_ticks();
        let ticks = match reading {
            Ok(ticks) => ticks,
            Err(e) => {
                warn!(error = %e, "cpu sampling failed, skipping tick");
                return;
            }
        };

        let previous = self.previous_cpu_ticks.lock().replace(ticks);
        // The first reading only establishes the baseline.
        let Some(previous) = previous else {
            return;
        };
        match ticks.used_ratio_since(&previous) {
            Some(ratio) => self.record_cpu(ratio, Instant::now()),
            None => debug!("no cpu ticks elapsed, skipping tick"),
        }
    }

    fn sample_client(&self) {
        let error_count = self
            .client_errors
            .read()
            .as_ref()
            .map_or(0, |source| source.rate_limit_error_count());
        let previous = self.previous_client_errors.lock().replace(error_count);

        let new_error_count = previous.map_or(0, |p| error_count.saturating_sub(p));
        let max_errors = self.config.max_client_errors;
        self.client.lock().push(ClientSnapshot {
            created_at: Instant::now(),
            is_overloaded: previous.is_some() && new_error_count > max_errors,
            error_count,
            new_error_count,
            max_errors,
        });
    }

    fn record_event_loop(&self, delay: Duration) {
        let max_delay = self.config.max_blocked();
        let is_overloaded = delay > max_delay;
        if is_overloaded {
            debug!(delay_ms = delay.as_millis() as u64, "event loop blocked");
        }
        self.event_loop.lock().push(EventLoopSnapshot {
            created_at: Instant::now(),
            is_overloaded,
            delay,
            max_delay,
        });
    }

    fn record_system_info(&self, event: SystemInfoEvent) {
        let now = Instant::now();
        self.record_memory(event.memory, now);
        self.record_cpu(event.cpu_used_ratio.clamp(0.0, 1.0), now);
    }

    fn record_memory(&self, usage: MemoryUsage, now: Instant) {
        let limit_bytes = self.config.memory_limit_bytes(usage.total_bytes);
        if limit_bytes == 0 {
            warn!("memory limit resolved to zero, skipping tick");
            return;
        }

        let used_ratio = usage.used_bytes as f64 / limit_bytes as f64;
        if used_ratio > CRITICAL_MEMORY_RATIO {
            self.warn_critical_memory(usage.used_bytes, limit_bytes, now);
        }

        self.memory.lock().push(MemorySnapshot {
            created_at: now,
            is_overloaded: used_ratio > self.config.max_used_memory_ratio,
            used_bytes: usage.used_bytes,
            limit_bytes,
            used_ratio,
        });
    }

    fn warn_critical_memory(&self, used_bytes: u64, limit_bytes: u64, now: Instant) {
        let mut last = self.last_memory_warning.lock();
        if last.is_some_and(|at| now.duration_since(at) < MEMORY_WARNING_COOLDOWN) {
            return;
        }
        *last = Some(now);
        warn!(
            used_mb = used_bytes / (1024 * 1024),
            limit_mb = limit_bytes / (1024 * 1024),
            "memory is critically overloaded"
        );
    }

    fn record_cpu(&self, used_ratio: f64, now: Instant) {
        let max_used_ratio = self.config.max_used_cpu_ratio;
        self.cpu.lock().push(CpuSnapshot {
            created_at: now,
            is_overloaded: used_ratio > max_used_ratio,
            used_ratio,
            max_used_ratio,
        });
    }
}

/// Run `tick` every `period` until shutdown. The first tick fires
/// immediately.
fn spawn_sampler(
    name: &'static str,
    period: Duration,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    tick: fn(&Shared),
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => tick(&shared),
                _ = shutdown.changed() => {
                    debug!(sampler = name, "sampler shutting down");
                    break;
                }
            }
        }
    })
}

/// Measure how late the runtime wakes a sleep of the nominal interval.
///
/// Each sleep is scheduled relative to the previous wake-up, so the
/// recorded delay is the scheduler's lateness for this tick alone.
fn spawn_event_loop_sampler(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = shared.config.event_loop_interval();
    tokio::spawn(async move {
        loop {
            let scheduled = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    let delay = scheduled.elapsed().saturating_sub(period);
                    shared.record_event_loop(delay);
                }
                _ = shutdown.changed() => {
                    debug!(sampler = "event_loop", "sampler shutting down");
                    break;
                }
            }
        }
    })
}

fn spawn_event_listener(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<SystemInfoEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => shared.record_system_info(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "system info listener lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("system info channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    debug!(sampler = "system_info", "sampler shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ErrorTracker;
    use crate::probe::FixedProbe;

    fn test_config() -> SnapshotterConfig {
        SnapshotterConfig {
            max_memory_bytes: Some(1000),
            ..SnapshotterConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_lifecycle() {
        let snapshotter = Snapshotter::with_probe(test_config(), FixedProbe::new());
        assert!(!snapshotter.is_running());

        snapshotter.start();
        snapshotter.start();
        assert!(snapshotter.is_running());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        snapshotter.stop();
        assert!(!snapshotter.is_running());

        let recorded = snapshotter.memory_sample(None).len();
        assert!(recorded >= 3, "expected ticks at 0s, 1s and 2s, got {recorded}");

        // History survives stop and stops growing.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(snapshotter.memory_sample(None).len(), recorded);
    }

    #[tokio::test(start_paused = true)]
    async fn leases_keep_sampling_until_the_last_is_dropped() {
        let snapshotter = Arc::new(Snapshotter::with_probe(test_config(), FixedProbe::new()));

        let first = snapshotter.lease();
        let second = snapshotter.lease();
        assert!(snapshotter.is_running());
        assert_eq!(snapshotter.lease_count(), 2);

        drop(first);
        assert!(snapshotter.is_running());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let recorded = snapshotter.memory_sample(None).len();
        assert!(recorded >= 2, "sampling stopped early, {recorded} snapshots");

        drop(second);
        assert!(!snapshotter.is_running());
        assert_eq!(snapshotter.lease_count(), 0);

        // A fresh lease restarts sampling.
        let third = snapshotter.lease();
        assert!(snapshotter.is_running());
        drop(third);
        assert!(!snapshotter.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_event_loop_is_overloaded() {
        let snapshotter = Snapshotter::with_probe(test_config(), FixedProbe::new());
        snapshotter.shared.record_event_loop(Duration::from_millis(20));
        snapshotter.shared.record_event_loop(Duration::from_millis(50));
        snapshotter.shared.record_event_loop(Duration::from_millis(200));

        let sample = snapshotter.event_loop_sample(None);
        let overloaded: Vec<bool> = sample.iter().map(|s| s.is_overloaded).collect();
        // Lateness equal to the limit is still within it.
        assert_eq!(overloaded, [false, false, true]);
        assert_eq!(sample[2].delay, Duration::from_millis(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn sampler_detects_a_blocked_worker() {
        let config = SnapshotterConfig {
            event_loop_snapshot_interval_secs: 0.05,
            max_blocked_millis: 20,
            ..test_config()
        };
        let snapshotter = Snapshotter::with_probe(config, FixedProbe::new());
        snapshotter.start();

        // Hog the only worker so the sampler's sleep wakes up late.
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            std::thread::sleep(Duration::from_millis(300));
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        snapshotter.stop();

        let sample = snapshotter.event_loop_sample(None);
        assert!(
            sample.iter().any(|s| s.is_overloaded && s.delay > Duration::from_millis(20)),
            "no blocked tick recorded in {sample:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_cpu_tick_is_baseline_only() {
        let probe = FixedProbe::new();
        probe.set_cpu_used_ratio(0.5);
        let snapshotter = Snapshotter::with_probe(test_config(), probe);

        snapshotter.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(snapshotter.cpu_sample(None).is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let sample = snapshotter.cpu_sample(None);
        assert_eq!(sample.len(), 1);
        assert!((sample[0].used_ratio - 0.5).abs() < 1e-9);
        assert!(!sample[0].is_overloaded);
        snapshotter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn memory_overload_uses_limit() {
        let probe = FixedProbe::new();
        probe.set_memory(900, 10_000);
        let snapshotter = Snapshotter::with_probe(test_config(), probe);

        snapshotter.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        snapshotter.stop();

        let sample = snapshotter.memory_sample(None);
        assert_eq!(sample[0].limit_bytes, 1000);
        assert!((sample[0].used_ratio - 0.9).abs() < 1e-9);
        assert!(sample[0].is_overloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_failures_skip_ticks_without_stopping() {
        let probe = FixedProbe::new();
        probe.set_failing(true);
        let snapshotter = Snapshotter::with_probe(test_config(), probe.clone());

        snapshotter.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(snapshotter.memory_sample(None).is_empty());
        assert!(snapshotter.cpu_sample(None).is_empty());
        // Event-loop and client sampling are unaffected.
        assert!(!snapshotter.event_loop_sample(None).is_empty());
        assert!(!snapshotter.client_sample(None).is_empty());

        probe.set_failing(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        snapshotter.stop();
        assert!(!snapshotter.memory_sample(None).is_empty());
        assert!(!snapshotter.cpu_sample(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn client_snapshots_record_deltas() {
        let tracker = Arc::new(ErrorTracker::new());
        let snapshotter = Snapshotter::with_probe(test_config(), FixedProbe::new())
            .with_client_errors(tracker.clone());

        tracker.record_rate_limit_error(1);
        snapshotter.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        for _ in 0..3 {
            tracker.record_rate_limit_error(2);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        snapshotter.stop();

        let sample = snapshotter.client_sample(None);
        assert_eq!(sample.len(), 3);
        // Baseline tick is never overloaded, whatever the counter says.
        assert_eq!(sample[0].error_count, 1);
        assert_eq!(sample[0].new_error_count, 0);
        assert!(!sample[0].is_overloaded);

        assert_eq!(sample[1].new_error_count, 3);
        assert!(sample[1].is_overloaded);

        assert_eq!(sample[2].new_error_count, 0);
        assert!(!sample[2].is_overloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn event_loop_is_idle_on_an_unloaded_runtime() {
        let snapshotter = Snapshotter::with_probe(test_config(), FixedProbe::new());
        snapshotter.start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        snapshotter.stop();

        let sample = snapshotter.event_loop_sample(None);
        assert!(sample.len() >= 5);
        assert!(sample.iter().all(|s| !s.is_overloaded));
        assert!(sample.iter().all(|s| s.max_delay == Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_pruned_to_retention_window() {
        let config = SnapshotterConfig {
            snapshot_history_secs: 3.0,
            ..test_config()
        };
        let snapshotter = Snapshotter::with_probe(config, FixedProbe::new());
        snapshotter.start();
        tokio::time::sleep(Duration::from_secs(20)).await;
        snapshotter.stop();

        let sample = snapshotter.memory_sample(None);
        assert!(sample.len() <= 4, "history not pruned: {} entries", sample.len());
        let span = sample[sample.len() - 1].created_at - sample[0].created_at;
        assert!(span <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_events_replace_local_sampling() {
        let (tx, rx) = broadcast::channel(16);
        let snapshotter = Snapshotter::with_system_info_events(test_config(), rx);
        assert!(snapshotter.is_pushed_mode());

        snapshotter.start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(snapshotter.memory_sample(None).is_empty());

        tx.send(SystemInfoEvent {
            cpu_used_ratio: 0.99,
            memory: MemoryUsage {
                used_bytes: 100,
                total_bytes: 4000,
            },
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        snapshotter.stop();

        let memory = snapshotter.memory_sample(None);
        assert_eq!(memory.len(), 1);
        assert!(!memory[0].is_overloaded);
        let cpu = snapshotter.cpu_sample(None);
        assert_eq!(cpu.len(), 1);
        assert!(cpu[0].is_overloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn samples_are_read_only() {
        let snapshotter = Snapshotter::with_probe(test_config(), FixedProbe::new());
        snapshotter.record_system_info(SystemInfoEvent {
            cpu_used_ratio: 0.2,
            memory: MemoryUsage {
                used_bytes: 100,
                total_bytes: 1000,
            },
        });

        let first = snapshotter.memory_sample(None);
        let second = snapshotter.memory_sample(None);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }
}
