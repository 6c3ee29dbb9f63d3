use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering::AcqRel, Ordering::Acquire},
        Arc, Mutex, PoisonError,
    },
};

use courier_metrics::static_metrics;
use tracing::warn;

use super::ResourcePriority;

/// Default number of retries that may be outstanding at once, per cluster and priority.
pub const DEFAULT_MAX_RETRIES: u64 = 3;

/// Limits how many retries may be outstanding against an upstream cluster.
///
/// Every successful call to `try_acquire` must be balanced by exactly one call to `release`. Use [`RetryTicket`] to
/// make that automatic.
pub trait RetryBudget: Send + Sync {
    /// Attempts to reserve capacity for one retry.
    ///
    /// Returns `true` if capacity was reserved.
    fn try_acquire(&self) -> bool;

    /// Returns capacity reserved by an earlier successful call to `try_acquire`.
    fn release(&self);
}

/// Capacity reserved from a [`RetryBudget`].
///
/// The capacity is returned to the budget when the ticket is dropped.
pub struct RetryTicket {
    budget: Arc<dyn RetryBudget>,
}

impl RetryTicket {
    /// Attempts to reserve capacity from `budget`.
    ///
    /// Returns `None` if the budget is exhausted.
    pub fn try_acquire(budget: &Arc<dyn RetryBudget>) -> Option<Self> {
        budget.try_acquire().then(|| Self {
            budget: Arc::clone(budget),
        })
    }
}

impl Drop for RetryTicket {
    fn drop(&mut self) {
        self.budget.release();
    }
}

impl fmt::Debug for RetryTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTicket").finish_non_exhaustive()
    }
}

static_metrics!(
    name => RetryBreakerMetrics,
    prefix => circuit_breakers,
    labels => [cluster_name: String, priority: ResourcePriority],
    metrics => [gauge(rq_retry_open)],
);

/// A retry budget that caps the number of concurrently outstanding retries.
///
/// When a cluster name is attached, the `circuit_breakers_rq_retry_open` gauge is kept at 1 while the limit is
/// saturated, and 0 otherwise.
pub struct ConcurrencyLimit {
    max: u64,
    outstanding: AtomicU64,
    metrics: Option<RetryBreakerMetrics>,
    gauge_lock: Mutex<()>,
}

impl ConcurrencyLimit {
    /// Creates a new `ConcurrencyLimit` allowing up to `max` outstanding retries.
    ///
    /// A limit of zero never admits a retry.
    pub fn new(max: u64) -> Self {
        Self {
            max,
            outstanding: AtomicU64::new(0),
            metrics: None,
            gauge_lock: Mutex::new(()),
        }
    }

    /// Creates a new `ConcurrencyLimit` that reports its saturation for the given cluster and priority.
    pub fn with_metrics(max: u64, cluster_name: &str, priority: ResourcePriority) -> Self {
        let metrics = RetryBreakerMetrics::new(cluster_name.to_string(), priority);
        metrics.rq_retry_open().set(0.0);

        Self {
            metrics: Some(metrics),
            ..Self::new(max)
        }
    }

    /// Returns the maximum number of outstanding retries.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Returns the current number of outstanding retries.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Acquire)
    }

    fn refresh_open_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            // The count is read under the lock, so the last write sees the latest update.
            let _guard = self.gauge_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let open = if self.outstanding() >= self.max { 1.0 } else { 0.0 };
            metrics.rq_retry_open().set(open);
        }
    }
}

impl RetryBudget for ConcurrencyLimit {
    fn try_acquire(&self) -> bool {
        let max = self.max;
        match self
            .outstanding
            .fetch_update(AcqRel, Acquire, |current| (current < max).then_some(current + 1))
        {
            Ok(_) => {
                self.refresh_open_gauge();
                true
            }
            Err(_) => false,
        }
    }

    fn release(&self) {
        match self
            .outstanding
            .fetch_update(AcqRel, Acquire, |current| current.checked_sub(1))
        {
            Ok(_) => self.refresh_open_gauge(),
            Err(_) => warn!("Retry budget released more times than it was acquired."),
        }
    }
}

impl fmt::Debug for ConcurrencyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimit")
            .field("max", &self.max)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use courier_metrics::test::TestRecorder;

    use super::*;

    fn open_gauge(recorder: &TestRecorder, priority: &str) -> Option<f64> {
        recorder.gauge_value(
            RetryBreakerMetrics::rq_retry_open_name(),
            &[("cluster_name", "backend"), ("priority", priority)],
        )
    }

    #[test]
    fn limit_caps_outstanding_retries() {
        let limit = ConcurrencyLimit::new(2);
        assert!(limit.try_acquire());
        assert!(limit.try_acquire());
        assert!(!limit.try_acquire());
        assert_eq!(limit.outstanding(), 2);

        limit.release();
        assert!(limit.try_acquire());
    }

    #[test]
    fn zero_limit_never_admits() {
        let limit = ConcurrencyLimit::new(0);
        assert!(!limit.try_acquire());
        assert_eq!(limit.outstanding(), 0);
    }

    #[test]
    fn unbalanced_release_does_not_underflow() {
        let limit = ConcurrencyLimit::new(1);
        limit.release();
        assert_eq!(limit.outstanding(), 0);
        assert!(limit.try_acquire());
    }

    #[test]
    fn ticket_releases_on_drop() {
        let budget: Arc<dyn RetryBudget> = Arc::new(ConcurrencyLimit::new(1));

        let ticket = RetryTicket::try_acquire(&budget).expect("budget should have capacity");
        assert!(RetryTicket::try_acquire(&budget).is_none());

        drop(ticket);
        assert!(RetryTicket::try_acquire(&budget).is_some());
    }

    #[test]
    fn open_gauge_tracks_saturation() {
        let recorder = TestRecorder::default();
        let limit = metrics::with_local_recorder(&recorder, || {
            ConcurrencyLimit::with_metrics(1, "backend", ResourcePriority::Default)
        });
        assert_eq!(open_gauge(&recorder, "default"), Some(0.0));

        assert!(limit.try_acquire());
        assert_eq!(open_gauge(&recorder, "default"), Some(1.0));

        limit.release();
        assert_eq!(open_gauge(&recorder, "default"), Some(0.0));
        assert_eq!(open_gauge(&recorder, "high"), None);
    }

    #[test]
    fn open_gauge_stays_closed_below_limit() {
        let recorder = TestRecorder::default();
        let limit = metrics::with_local_recorder(&recorder, || {
            ConcurrencyLimit::with_metrics(3, "backend", ResourcePriority::High)
        });

        assert!(limit.try_acquire());
        assert!(limit.try_acquire());
        assert_eq!(open_gauge(&recorder, "high"), Some(0.0));

        assert!(limit.try_acquire());
        assert_eq!(open_gauge(&recorder, "high"), Some(1.0));
    }

    #[test]
    fn open_gauge_settles_under_concurrent_callers() {
        let recorder = TestRecorder::default();
        let limit = metrics::with_local_recorder(&recorder, || {
            ConcurrencyLimit::with_metrics(2, "backend", ResourcePriority::Default)
        });

        // Hold one unit so every racing acquire saturates the limit.
        assert!(limit.try_acquire());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..5_000 {
                        if limit.try_acquire() {
                            limit.release();
                        }
                    }
                });
            }
        });

        assert_eq!(limit.outstanding(), 1);
        assert_eq!(open_gauge(&recorder, "default"), Some(0.0));

        assert!(limit.try_acquire());
        assert_eq!(open_gauge(&recorder, "default"), Some(1.0));
        limit.release();
        limit.release();
        assert_eq!(open_gauge(&recorder, "default"), Some(0.0));
    }
}
