//! Rate-limit error counters for the dependent service.

use parking_lot::Mutex;

/// A monotonically increasing count of rate-limit errors.
///
/// The client sampler records the delta between consecutive reads.
pub trait ClientErrorSource: Send + Sync {
    fn rate_limit_error_count(&self) -> u64;
}

/// Counts rate-limit errors per retry attempt.
///
/// Errors on a request's first attempt are tracked but not reported by
/// `rate_limit_error_count`: a single rejected attempt is usually a
/// transient spike, a rejected retry is a signal to back off.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    /// Index = attempt number, 0 being the first attempt.
    by_attempt: Mutex<Vec<u64>>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rate-limit error on `attempt` (0 for the first try).
    pub fn record_rate_limit_error(&self, attempt: usize) {
        let mut counts = self.by_attempt.lock();
        if counts.len() <= attempt {
            counts.resize(attempt + 1, 0);
        }
        counts[attempt] += 1;
    }

    /// Error counts indexed by attempt number.
    pub fn errors_by_attempt(&self) -> Vec<u64> {
        self.by_attempt.lock().clone()
    }

    pub fn total_errors(&self) -> u64 {
        self.by_attempt.lock().iter().sum()
    }
}

impl ClientErrorSource for ErrorTracker {
    fn rate_limit_error_count(&self) -> u64 {
        self.by_attempt.lock().iter().skip(1).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_errors_are_not_reported() {
        let tracker = ErrorTracker::new();
        tracker.record_rate_limit_error(0);
        tracker.record_rate_limit_error(0);
        assert_eq!(tracker.rate_limit_error_count(), 0);
        assert_eq!(tracker.total_errors(), 2);
    }

    #[test]
    fn retry_errors_accumulate() {
        let tracker = ErrorTracker::new();
        tracker.record_rate_limit_error(1);
        tracker.record_rate_limit_error(3);
        tracker.record_rate_limit_error(1);
        assert_eq!(tracker.errors_by_attempt(), vec![0, 2, 0, 1]);
        assert_eq!(tracker.rate_limit_error_count(), 3);
    }
}
