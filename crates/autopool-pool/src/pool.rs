//! Autoscaled pool: runs caller tasks with load-adjusted concurrency.
//!
//! Three timers drive the pool while it runs:
//! - autoscale: every `autoscale_interval_secs`, nudges the desired
//!   concurrency up or down from the current system status
//! - maybe-run: every `maybe_run_interval_secs` (and after each task
//!   settles), starts ready tasks while there is budget
//! - logging: every `logging_interval_secs`, reports concurrency and status
//!
//! Task launches are fire-and-forget: the loop counts tasks, it never
//! awaits them inline.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use autopool_core::{AutopoolConfig, PoolConfig};
use autopool_snapshot::{SamplingLease, Snapshotter};
use autopool_status::{SystemInfo, SystemStatus};

use crate::error::{PoolError, PoolResult};
use crate::state::{PoolPhase, PoolState, ScaleChange};
use crate::task::{FinishChecker, ReadinessChecker, TaskRunner};

/// Body of a periodic pool timer.
type TimerBody = fn(Arc<PoolInner>) -> BoxFuture<'static, ()>;

/// Single-slot re-entrancy guard. Holding it means the check is in flight.
struct CheckGuard<'a>(&'a AtomicBool);

impl<'a> CheckGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then(|| Self(flag))
    }
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct PoolInner {
    config: PoolConfig,
    status: SystemStatus,
    runner: Arc<dyn TaskRunner>,
    readiness: Arc<dyn ReadinessChecker>,
    finish: Arc<dyn FinishChecker>,

    state: Mutex<PoolState>,
    maybe_run_in_progress: AtomicBool,
    maybe_finish_in_progress: AtomicBool,

    /// Resolves the `run()` future. Taken exactly once.
    outcome_tx: Mutex<Option<oneshot::Sender<PoolResult<()>>>>,
    /// Signalled whenever the last in-flight task settles.
    drained: Notify,
    shutdown_tx: watch::Sender<bool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    /// Keeps the shared snapshotter sampling while this pool runs.
    sampling: Mutex<Option<SamplingLease>>,
}

/// Runs tasks from a `TaskRunner` with a concurrency that follows the
/// health of the system.
///
/// Clones share the same pool.
#[derive(Clone)]
pub struct AutoscaledPool {
    inner: Arc<PoolInner>,
}

impl AutoscaledPool {
    /// Create a pool that evaluates load through `status`.
    ///
    /// The pool, snapshotter and status configs are all validated here,
    /// since every timer period derives from them.
    pub fn new(
        config: PoolConfig,
        status: SystemStatus,
        runner: impl TaskRunner + 'static,
        readiness: impl ReadinessChecker + 'static,
        finish: impl FinishChecker + 'static,
    ) -> PoolResult<Self> {
        config.validate()?;
        status.snapshotter().config().validate()?;
        status.config().validate()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::new(&config)),
                config,
                status,
                runner: Arc::new(runner),
                readiness: Arc::new(readiness),
                finish: Arc::new(finish),
                maybe_run_in_progress: AtomicBool::new(false),
                maybe_finish_in_progress: AtomicBool::new(false),
                outcome_tx: Mutex::new(None),
                drained: Notify::new(),
                shutdown_tx,
                timers: Mutex::new(Vec::new()),
                sampling: Mutex::new(None),
            }),
        })
    }

    /// Create a pool that samples the local host.
    pub fn from_config(
        config: &AutopoolConfig,
        runner: impl TaskRunner + 'static,
        readiness: impl ReadinessChecker + 'static,
        finish: impl FinishChecker + 'static,
    ) -> PoolResult<Self> {
        config.validate()?;
        let snapshotter = Arc::new(Snapshotter::new(config.snapshotter.clone()));
        let status = SystemStatus::new(snapshotter, config.status.clone());
        Self::new(config.pool.clone(), status, runner, readiness, finish)
    }

    /// Run until the finish check passes, a callback fails, or the pool
    /// is aborted.
    ///
    /// Leases the snapshotter and starts the pool timers, then checks for ready
    /// tasks immediately. Dropping the returned future does not stop the
    /// pool; use `abort`.
    pub async fn run(&self) -> PoolResult<()> {
        let outcome_rx = {
            let mut state = self.inner.state.lock();
            if state.phase != PoolPhase::Idle {
                return Err(PoolError::NotIdle(state.phase));
            }
            state.phase = PoolPhase::Running;

            let (tx, rx) = oneshot::channel();
            *self.inner.outcome_tx.lock() = Some(tx);
            rx
        };

        self.inner.start_timers();
        {
            let state = self.inner.state.lock();
            info!(
                min = state.min_concurrency,
                max = state.max_concurrency,
                desired = state.desired_concurrency,
                "autoscaled pool started"
            );
        }
        tokio::spawn(self.inner.clone().maybe_run_tasks());

        // The sender lives in the pool until settle(), which always sends.
        let outcome = outcome_rx.await.unwrap_or(Ok(()));
        self.inner.teardown();
        outcome
    }

    /// Resolve `run()` immediately and stop all timers.
    ///
    /// Tasks already in flight keep running in the background; their
    /// outcome is ignored.
    pub async fn abort(&self) {
        if self.inner.settle(Ok(()), PoolPhase::Aborted) {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.phase == PoolPhase::Idle {
            state.phase = PoolPhase::Aborted;
        }
    }

    /// Stop starting new tasks and wait for in-flight tasks to settle.
    ///
    /// With a timeout, fails with `PoolError::PauseTimeout` if tasks are
    /// still in flight when it elapses; the pool stays paused and the
    /// tasks keep running. Does not resolve `run()`.
    pub async fn pause(&self, timeout: Option<Duration>) -> PoolResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.phase == PoolPhase::Running {
                state.phase = PoolPhase::Paused;
                info!(
                    in_flight = state.current_concurrency,
                    "pausing autoscaled pool"
                );
            }
        }

        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.wait_for_drain())
                .await
                .map_err(|_| PoolError::PauseTimeout(limit)),
            None => {
                self.inner.wait_for_drain().await;
                Ok(())
            }
        }
    }

    /// Allow new tasks to start again after `pause`.
    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.phase != PoolPhase::Paused {
                return;
            }
            state.phase = PoolPhase::Running;
        }
        info!("resuming autoscaled pool");
        self.notify();
    }

    /// Check for ready tasks now instead of waiting for the next tick.
    pub fn notify(&self) {
        if !self.inner.state.lock().has_capacity() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.inner.clone().maybe_run_tasks());
            }
            Err(_) => debug!("no runtime to notify from, waiting for the next tick"),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> PoolPhase {
        self.inner.state.lock().phase
    }

    /// Whether `pause` stopped new task starts.
    pub fn is_paused(&self) -> bool {
        self.phase() == PoolPhase::Paused
    }

    /// Whether `run()` is in progress, paused or not.
    pub fn is_running(&self) -> bool {
        self.phase().is_active()
    }

    /// Floor of the desired concurrency.
    pub fn min_concurrency(&self) -> usize {
        self.inner.state.lock().min_concurrency
    }

    /// Set the floor. Raises the ceiling if it would cross it; values
    /// below 1 are raised to 1. Re-clamps the desired concurrency.
    pub fn set_min_concurrency(&self, value: usize) {
        self.inner.state.lock().set_min_concurrency(value);
    }

    /// Ceiling of the desired concurrency.
    pub fn max_concurrency(&self) -> usize {
        self.inner.state.lock().max_concurrency
    }

    /// Set the ceiling. Lowers the floor if it would cross it; values
    /// below 1 are raised to 1. Re-clamps the desired concurrency.
    pub fn set_max_concurrency(&self, value: usize) {
        self.inner.state.lock().set_max_concurrency(value);
    }

    /// Number of tasks the pool currently aims to keep in flight.
    pub fn desired_concurrency(&self) -> usize {
        self.inner.state.lock().desired_concurrency
    }

    /// Set the desired concurrency, clamped into `[min, max]`.
    pub fn set_desired_concurrency(&self, value: usize) {
        self.inner.state.lock().set_desired_concurrency(value);
    }

    /// Number of tasks in flight.
    pub fn current_concurrency(&self) -> usize {
        self.inner.state.lock().current_concurrency
    }

    /// Status the pool scales against.
    pub fn system_status(&self) -> &SystemStatus {
        &self.inner.status
    }
}

impl PoolInner {
    fn start_timers(self: &Arc<Self>) {
        let mut timers = self.timers.lock();
        // abort() may have torn the pool down before the timers started.
        if *self.shutdown_tx.borrow() {
            return;
        }

        *self.sampling.lock() = Some(self.status.snapshotter().lease());
        timers.push(self.spawn_timer(
            "autoscale",
            self.config.autoscale_interval(),
            |inner| async move { inner.autoscale() }.boxed(),
        ));
        timers.push(self.spawn_timer(
            "maybe_run",
            self.config.maybe_run_interval(),
            |inner| inner.maybe_run_tasks().boxed(),
        ));
        if let Some(period) = self.config.logging_interval() {
            timers.push(self.spawn_timer(
                "logging",
                period,
                |inner| async move { inner.log_status() }.boxed(),
            ));
        }
    }

    /// Run `body` every `period`, first after one full period. A body that
    /// overruns its period delays the next tick rather than overlapping it.
    fn spawn_timer(self: &Arc<Self>, name: &'static str, period: Duration, body: TimerBody) -> JoinHandle<()> {
        let inner = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => body(inner.clone()).await,
                    _ = shutdown.changed() => {
                        debug!(timer = name, "pool timer shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stop timers and release the snapshotter lease. Idempotent.
    ///
    /// The flag is stored even with no timer subscribed, so a later
    /// `start_timers` sees it.
    fn teardown(&self) {
        self.shutdown_tx.send_replace(true);
        for handle in self.timers.lock().drain(..) {
            handle.abort();
        }
        let lease = self.sampling.lock().take();
        drop(lease);
    }

    /// Move to a terminal phase and resolve `run()`. Returns false if the
    /// run was already resolved (or never started).
    fn settle(&self, outcome: PoolResult<()>, phase: PoolPhase) -> bool {
        let Some(tx) = self.outcome_tx.lock().take() else {
            return false;
        };
        let in_flight = {
            let mut state = self.state.lock();
            state.phase = phase;
            state.current_concurrency
        };
        self.teardown();

        let historical = self.status.historical_status();
        match &outcome {
            Ok(()) => info!(
                ?phase,
                in_flight,
                is_system_idle = historical.is_system_idle,
                overloaded = ?historical.overloaded_resources(),
                "autoscaled pool stopped"
            ),
            Err(e) => error!(
                error = %e,
                in_flight,
                is_system_idle = historical.is_system_idle,
                overloaded = ?historical.overloaded_resources(),
                "autoscaled pool failed"
            ),
        }

        let _ = tx.send(outcome);
        true
    }

    fn fail(&self, error: PoolError) {
        if !self.settle(Err(error), PoolPhase::Failed) {
            debug!("pool already stopped, ignoring later failure");
        }
    }

    fn autoscale(&self) {
        let status = self.status.current_status();
        let change = {
            let mut state = self.state.lock();
            if !state.phase.is_active() {
                return;
            }
            state.autoscale(status.is_system_idle, &self.config)
        };

        match change {
            Some(ScaleChange::Up { from, to }) => {
                debug!(from, to, "scaling up desired concurrency");
            }
            Some(ScaleChange::Down { from, to }) => {
                debug!(
                    from,
                    to,
                    overloaded = ?status.overloaded_resources(),
                    "scaling down desired concurrency"
                );
            }
            None => trace!(is_system_idle = status.is_system_idle, "desired concurrency unchanged"),
        }
    }

    /// Start ready tasks while there is budget. Skipped if a check is
    /// already in flight.
    async fn maybe_run_tasks(self: Arc<Self>) {
        let Some(_guard) = CheckGuard::acquire(&self.maybe_run_in_progress) else {
            trace!("maybe-run already in progress");
            return;
        };
        if let Err(e) = self.start_ready_tasks().await {
            self.fail(e);
        }
    }

    async fn start_ready_tasks(self: &Arc<Self>) -> PoolResult<()> {
        loop {
            let below_min = {
                let mut state = self.state.lock();
                if !state.has_capacity() {
                    return Ok(());
                }
                if !state.start_allowed(Instant::now(), self.config.max_tasks_per_minute) {
                    trace!("task start rate limit reached");
                    return Ok(());
                }
                state.current_concurrency < state.min_concurrency
            };

            // Overload only holds back tasks above the floor. Below it the
            // readiness check also runs, so a drained pool can still finish.
            if !below_min && !self.status.current_status().is_system_idle {
                trace!("system overloaded, not starting tasks");
                return Ok(());
            }

            let ready = self
                .readiness
                .is_task_ready()
                .await
                .map_err(PoolError::ReadinessCheckFailed)?;

            let mut state = self.state.lock();
            if !ready {
                if state.current_concurrency == 0 {
                    tokio::spawn(self.clone().maybe_finish());
                }
                return Ok(());
            }
            // Budget or phase may have changed while the check was pending.
            if !state.has_capacity() {
                return Ok(());
            }
            state.record_start(Instant::now(), self.config.max_tasks_per_minute);
            self.spawn_task();
        }
    }

    /// Launch one task. The caller has already counted it.
    fn spawn_task(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            let runner = inner.runner.clone();
            let result = AssertUnwindSafe(runner.run_task()).catch_unwind().await;
            inner.on_task_settled(result);
        });
    }

    fn on_task_settled(self: &Arc<Self>, result: Result<anyhow::Result<()>, Box<dyn Any + Send>>) {
        let (drained, phase) = {
            let mut state = self.state.lock();
            (state.record_settled(), state.phase)
        };
        if drained {
            self.drained.notify_waiters();
        }

        match result {
            Ok(Ok(())) => {
                if phase == PoolPhase::Running {
                    tokio::spawn(self.clone().maybe_run_tasks());
                    tokio::spawn(self.clone().maybe_finish());
                }
            }
            Ok(Err(e)) => self.fail(PoolError::TaskFailed(e)),
            Err(panic) => self.fail(PoolError::TaskPanicked(panic_message(panic.as_ref()))),
        }
    }

    /// Resolve the run if nothing is in flight and the finish check agrees.
    async fn maybe_finish(self: Arc<Self>) {
        let Some(_guard) = CheckGuard::acquire(&self.maybe_finish_in_progress) else {
            trace!("maybe-finish already in progress");
            return;
        };
        {
            let state = self.state.lock();
            if state.phase != PoolPhase::Running || state.current_concurrency > 0 {
                return;
            }
        }

        match self.finish.is_finished().await {
            Ok(true) => {
                // A task may have started while the check was pending; its
                // completion will check again.
                if self.state.lock().current_concurrency > 0 {
                    return;
                }
                self.settle(Ok(()), PoolPhase::Finished);
            }
            Ok(false) => trace!("not finished yet"),
            Err(e) => self.fail(PoolError::FinishCheckFailed(e)),
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().current_concurrency == 0 {
                return;
            }
            notified.await;
        }
    }

    fn log_status(&self) {
        let status = self.status.current_status();
        let (current, desired) = {
            let state = self.state.lock();
            (state.current_concurrency, state.desired_concurrency)
        };
        log_system_info(current, desired, &status);
    }
}

fn log_system_info(current: usize, desired: usize, status: &SystemInfo) {
    if status.is_system_idle {
        info!(
            current_concurrency = current,
            desired_concurrency = desired,
            mem = status.mem_info.actual_ratio,
            event_loop = status.event_loop_info.actual_ratio,
            cpu = status.cpu_info.actual_ratio,
            client = status.client_info.actual_ratio,
            "pool status"
        );
    } else {
        warn!(
            current_concurrency = current,
            desired_concurrency = desired,
            overloaded = ?status.overloaded_resources(),
            mem = status.mem_info.actual_ratio,
            event_loop = status.event_loop_info.actual_ratio,
            cpu = status.cpu_info.actual_ratio,
            client = status.client_info.actual_ratio,
            "pool status: system overloaded"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
