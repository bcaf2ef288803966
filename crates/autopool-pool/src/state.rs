//! Concurrency bookkeeping for the pool.
//!
//! `PoolState` is only ever touched under the pool's state mutex, so the
//! counters, bounds and phase change together.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use autopool_core::PoolConfig;

/// Window for `max_tasks_per_minute`.
const TASK_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Lifecycle of a pool.
///
/// ```text
/// Idle → Running ⇄ Paused
///           └──────────→ Finished | Aborted | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    Idle,
    Running,
    Paused,
    Finished,
    Aborted,
    Failed,
}

impl PoolPhase {
    /// Running or paused.
    pub fn is_active(self) -> bool {
        matches!(self, PoolPhase::Running | PoolPhase::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PoolPhase::Finished | PoolPhase::Aborted | PoolPhase::Failed
        )
    }
}

/// A change of desired concurrency made by one autoscale tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScaleChange {
    Up { from: usize, to: usize },
    Down { from: usize, to: usize },
}

#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) phase: PoolPhase,
    pub(crate) min_concurrency: usize,
    pub(crate) max_concurrency: usize,
    pub(crate) desired_concurrency: usize,
    pub(crate) current_concurrency: usize,
    /// Task start times within the last `TASK_RATE_WINDOW`.
    recent_starts: VecDeque<Instant>,
}

impl PoolState {
    /// Build from a validated config.
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            phase: PoolPhase::Idle,
            min_concurrency: config.min_concurrency,
            max_concurrency: config.max_concurrency,
            desired_concurrency: config.initial_desired_concurrency(),
            current_concurrency: 0,
            recent_starts: VecDeque::new(),
        }
    }

    /// Whether the pool may start another task right now.
    pub(crate) fn has_capacity(&self) -> bool {
        self.phase == PoolPhase::Running && self.current_concurrency < self.desired_concurrency
    }

    /// Whether a start at `now` stays within `max_per_minute`.
    pub(crate) fn start_allowed(&mut self, now: Instant, max_per_minute: Option<u32>) -> bool {
        let Some(limit) = max_per_minute else {
            return true;
        };
        if let Some(cutoff) = now.checked_sub(TASK_RATE_WINDOW) {
            while self.recent_starts.front().is_some_and(|at| *at <= cutoff) {
                self.recent_starts.pop_front();
            }
        }
        self.recent_starts.len() < limit as usize
    }

    /// Count a task as started.
    pub(crate) fn record_start(&mut self, now: Instant, max_per_minute: Option<u32>) {
        self.current_concurrency += 1;
        if max_per_minute.is_some() {
            self.recent_starts.push_back(now);
        }
    }

    /// Count a task as settled. Returns true when nothing is left in flight.
    pub(crate) fn record_settled(&mut self) -> bool {
        self.current_concurrency = self.current_concurrency.saturating_sub(1);
        self.current_concurrency == 0
    }

    /// Apply one autoscale decision.
    ///
    /// Overload scales down; otherwise the pool scales up only when at
    /// least `desired_concurrency_ratio` of the desired concurrency is in
    /// use. Steps are never smaller than one.
    pub(crate) fn autoscale(&mut self, is_system_idle: bool, config: &PoolConfig) -> Option<ScaleChange> {
        let from = self.desired_concurrency;

        if !is_system_idle {
            let step = scale_step(config.scale_down_step_ratio, from);
            let to = from.saturating_sub(step).max(self.min_concurrency);
            self.desired_concurrency = to;
            return (to != from).then_some(ScaleChange::Down { from, to });
        }

        let min_in_use = from as f64 * config.desired_concurrency_ratio;
        if (self.current_concurrency as f64) >= min_in_use {
            let step = scale_step(config.scale_up_step_ratio, from);
            let to = (from + step).min(self.max_concurrency);
            self.desired_concurrency = to;
            return (to != from).then_some(ScaleChange::Up { from, to });
        }

        None
    }

    /// Set the floor. A floor above the ceiling raises the ceiling.
    pub(crate) fn set_min_concurrency(&mut self, value: usize) {
        self.min_concurrency = value.max(1);
        if self.max_concurrency < self.min_concurrency {
            self.max_concurrency = self.min_concurrency;
        }
        self.clamp_desired();
    }

    /// Set the ceiling. A ceiling below the floor lowers the floor.
    pub(crate) fn set_max_concurrency(&mut self, value: usize) {
        self.max_concurrency = value.max(1);
        if self.min_concurrency > self.max_concurrency {
            self.min_concurrency = self.max_concurrency;
        }
        self.clamp_desired();
    }

    pub(crate) fn set_desired_concurrency(&mut self, value: usize) {
        self.desired_concurrency = value;
        self.clamp_desired();
    }

    fn clamp_desired(&mut self) {
        self.desired_concurrency = self
            .desired_concurrency
            .clamp(self.min_concurrency, self.max_concurrency);
    }
}

/// `max(1, round(ratio * desired))`.
pub(crate) fn scale_step(ratio: f64, desired: usize) -> usize {
    ((ratio * desired as f64).round() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(min: usize, max: usize, desired: usize) -> PoolState {
        PoolState::new(&PoolConfig {
            min_concurrency: min,
            max_concurrency: max,
            desired_concurrency: Some(desired),
            ..PoolConfig::default()
        })
    }

    #[test]
    fn desired_defaults_to_min() {
        let state = PoolState::new(&PoolConfig {
            min_concurrency: 3,
            ..PoolConfig::default()
        });
        assert_eq!(state.desired_concurrency, 3);
        assert_eq!(state.phase, PoolPhase::Idle);
        assert!(!state.has_capacity());
    }

    #[test]
    fn step_is_at_least_one() {
        assert_eq!(scale_step(0.05, 1), 1);
        assert_eq!(scale_step(0.05, 10), 1);
        assert_eq!(scale_step(0.05, 100), 5);
        assert_eq!(scale_step(0.05, 250), 13);
    }

    #[test]
    fn scales_up_only_when_filled() {
        let config = PoolConfig::default();
        let mut state = state_with(1, 100, 20);

        state.current_concurrency = 18;
        assert_eq!(state.autoscale(true, &config), None);
        assert_eq!(state.desired_concurrency, 20);

        state.current_concurrency = 19;
        assert_eq!(
            state.autoscale(true, &config),
            Some(ScaleChange::Up { from: 20, to: 21 })
        );
    }

    #[test]
    fn scale_up_is_capped_at_max() {
        let config = PoolConfig::default();
        let mut state = state_with(1, 5, 5);
        state.current_concurrency = 5;
        assert_eq!(state.autoscale(true, &config), None);
        assert_eq!(state.desired_concurrency, 5);
    }

    #[test]
    fn overload_scales_down_to_min() {
        let config = PoolConfig::default();
        let mut state = state_with(2, 100, 4);
        state.current_concurrency = 4;

        assert_eq!(
            state.autoscale(false, &config),
            Some(ScaleChange::Down { from: 4, to: 3 })
        );
        assert_eq!(
            state.autoscale(false, &config),
            Some(ScaleChange::Down { from: 3, to: 2 })
        );
        assert_eq!(state.autoscale(false, &config), None);
        assert_eq!(state.desired_concurrency, 2);
    }

    #[test]
    fn overload_takes_precedence_over_fill() {
        let config = PoolConfig::default();
        let mut state = state_with(1, 1000, 200);
        state.current_concurrency = 200;
        assert_eq!(
            state.autoscale(false, &config),
            Some(ScaleChange::Down { from: 200, to: 190 })
        );
    }

    #[test]
    fn min_above_max_raises_max() {
        let mut state = state_with(1, 5, 3);
        state.set_min_concurrency(8);
        assert_eq!(state.min_concurrency, 8);
        assert_eq!(state.max_concurrency, 8);
        assert_eq!(state.desired_concurrency, 8);
    }

    #[test]
    fn max_below_min_lowers_min() {
        let mut state = state_with(4, 10, 6);
        state.set_max_concurrency(2);
        assert_eq!(state.max_concurrency, 2);
        assert_eq!(state.min_concurrency, 2);
        assert_eq!(state.desired_concurrency, 2);
    }

    #[test]
    fn zero_bounds_are_raised_to_one() {
        let mut state = state_with(2, 10, 5);
        state.set_min_concurrency(0);
        assert_eq!(state.min_concurrency, 1);
        state.set_max_concurrency(0);
        assert_eq!(state.max_concurrency, 1);
        assert_eq!(state.desired_concurrency, 1);
    }

    #[test]
    fn desired_is_clamped() {
        let mut state = state_with(2, 10, 5);
        state.set_desired_concurrency(50);
        assert_eq!(state.desired_concurrency, 10);
        state.set_desired_concurrency(0);
        assert_eq!(state.desired_concurrency, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_rate_is_limited_per_minute() {
        let mut state = state_with(1, 10, 10);
        let limit = Some(2);
        let start = Instant::now();

        assert!(state.start_allowed(start, limit));
        state.record_start(start, limit);
        state.record_start(start + Duration::from_secs(10), limit);
        assert!(!state.start_allowed(start + Duration::from_secs(30), limit));

        // The first start leaves the window.
        assert!(state.start_allowed(start + Duration::from_secs(61), limit));
        assert!(state.start_allowed(start, None));
    }

    #[test]
    fn settle_reports_drain() {
        let mut state = state_with(1, 10, 10);
        let now = Instant::now();
        state.record_start(now, None);
        state.record_start(now, None);
        assert!(!state.record_settled());
        assert!(state.record_settled());
        assert_eq!(state.current_concurrency, 0);
    }
}
