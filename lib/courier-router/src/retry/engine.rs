use std::{fmt, sync::Arc};

use http::HeaderMap;
use rand::RngCore;
use tracing::{debug, trace};

use super::{
    backoff::BackoffRng,
    headers::resolve_policy,
    outcome::{Outcome, ResetReason, ResponseAttributes},
    policy::{EffectivePolicy, RetryPolicy},
    timer::{RetryCallback, RetryTimer, TimerFactory},
};
use crate::{
    cluster::{ResourcePriority, RetryBudget, RetryStatistics, RetryTicket, UpstreamCluster},
    runtime::{RuntimeFeatures, USE_RETRY_DEFAULT_PERCENT, USE_RETRY_FEATURE},
};

/// Result of a retry decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryStatus {
    /// A retry was scheduled, and the retry callback will be invoked once its back-off elapses.
    Yes,

    /// The outcome is not retriable.
    No,

    /// The outcome is retriable, but the cluster's retry budget is exhausted.
    Overflow,

    /// The outcome is retriable, but the request has no retries left.
    RetryLimitExceeded,
}

/// Lifecycle state of a [`RetryEngine`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryState {
    /// No outcome has been classified yet.
    Fresh,

    /// At least one outcome has been classified, and no retry is waiting on its back-off.
    Active,

    /// A retry is waiting on its back-off.
    Scheduled,

    /// The retry limit was reached.
    Exhausted,
}

/// Builds a [`RetryEngine`] for a single request.
pub struct RetryEngineBuilder<'a> {
    policy: &'a RetryPolicy,
    cluster: &'a UpstreamCluster,
    runtime: &'a dyn RuntimeFeatures,
    priority: ResourcePriority,
    rng: BackoffRng,
}

impl<'a> RetryEngineBuilder<'a> {
    /// Creates a new `RetryEngineBuilder` for a request routed with `policy` to `cluster`.
    ///
    /// `runtime` is consulted once, when the engine is built, to decide whether retries are enabled at all.
    pub fn new(policy: &'a RetryPolicy, cluster: &'a UpstreamCluster, runtime: &'a dyn RuntimeFeatures) -> Self {
        Self {
            policy,
            cluster,
            runtime,
            priority: ResourcePriority::Default,
            rng: BackoffRng::default(),
        }
    }

    /// Sets the priority of the request, which selects the retry budget to draw from.
    ///
    /// Defaults to [`ResourcePriority::Default`].
    pub fn with_priority(mut self, priority: ResourcePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the random number generator used to jitter back-off delays.
    ///
    /// Defaults to a lazily-initialized, thread-local CSPRNG seeded by the operating system.
    pub fn with_rng<R>(mut self, rng: R) -> Self
    where
        R: RngCore + Send + 'static,
    {
        self.rng = BackoffRng::shared(rng);
        self
    }

    /// Builds the retry engine.
    ///
    /// Retry directives are removed from `request_headers` regardless of the result. If neither the route policy nor
    /// the directives enable any retry condition, `None` is returned.
    pub fn build<F>(self, request_headers: &mut HeaderMap, timer_factory: F) -> Option<RetryEngine<F>>
    where
        F: TimerFactory,
    {
        let policy = resolve_policy(self.policy, request_headers);
        if policy.retry_on.is_none() {
            return None;
        }

        let runtime_enabled = self
            .runtime
            .feature_enabled(USE_RETRY_FEATURE, USE_RETRY_DEFAULT_PERCENT);

        trace!(
            cluster_name = self.cluster.name(),
            retry_on = %policy.retry_on,
            num_retries = policy.num_retries,
            runtime_enabled,
            "Built retry engine."
        );

        Some(RetryEngine {
            retries_remaining: policy.num_retries,
            attempts: 0,
            cluster_name: self.cluster.shared_name(),
            budget: Arc::clone(self.cluster.retry_budget(self.priority)),
            stats: self.cluster.retry_stats().clone(),
            runtime_enabled,
            policy,
            rng: self.rng,
            ticket: None,
            timer: None,
            timer_factory,
            classified: false,
            exhausted: false,
            success_recorded: false,
        })
    }
}

/// Decides whether, and when, a request is retried.
///
/// One engine exists per request, and is driven by the router: after every failed upstream attempt, the router hands
/// the outcome to the engine, and the engine either schedules a retry or explains why it won't.
///
/// ## Budget
///
/// Every scheduled retry holds one unit of the cluster's retry budget until the next outcome is classified, or until
/// the engine is dropped.
///
/// ## Cancellation
///
/// Dropping the engine disarms any pending retry, so the retry callback is never invoked after the request is gone.
pub struct RetryEngine<F>
where
    F: TimerFactory,
{
    policy: EffectivePolicy,
    retries_remaining: u32,
    attempts: u32,
    cluster_name: Arc<str>,
    budget: Arc<dyn RetryBudget>,
    stats: RetryStatistics,
    runtime_enabled: bool,
    rng: BackoffRng,
    ticket: Option<RetryTicket>,
    timer: Option<F::Timer>,
    timer_factory: F,
    classified: bool,
    exhausted: bool,
    success_recorded: bool,
}

impl<F> RetryEngine<F>
where
    F: TimerFactory,
{
    /// Decides whether to retry after the upstream stream was reset.
    ///
    /// When [`RetryStatus::Yes`] is returned, `on_retry` is invoked once the back-off elapses. Otherwise, it is
    /// dropped without being invoked.
    pub fn should_retry_reset<C>(&mut self, reason: ResetReason, on_retry: C) -> RetryStatus
    where
        C: FnOnce() + Send + 'static,
    {
        self.classify(Outcome::Reset(reason), RetryCallback::new(on_retry))
    }

    /// Decides whether to retry after receiving an upstream response.
    ///
    /// When [`RetryStatus::Yes`] is returned, `on_retry` is invoked once the back-off elapses. Otherwise, it is
    /// dropped without being invoked.
    pub fn should_retry_response<C>(&mut self, response: &ResponseAttributes, on_retry: C) -> RetryStatus
    where
        C: FnOnce() + Send + 'static,
    {
        self.classify(Outcome::Response(response), RetryCallback::new(on_retry))
    }

    /// Returns `true` if any retry condition is enabled for the request.
    pub fn enabled(&self) -> bool {
        !self.policy.retry_on.is_none()
    }

    /// Returns the number of retries the request has left.
    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    /// Returns the number of retries scheduled so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the number of host selection attempts the router should make for each retry.
    pub fn host_selection_max_attempts(&self) -> u32 {
        self.policy.host_selection_max_attempts
    }

    /// Returns the effective retry policy of the request.
    pub fn policy(&self) -> &EffectivePolicy {
        &self.policy
    }

    /// Returns the lifecycle state of the engine.
    pub fn state(&self) -> RetryState {
        if self.exhausted {
            RetryState::Exhausted
        } else if self.timer.as_ref().is_some_and(|timer| timer.is_armed()) {
            RetryState::Scheduled
        } else if self.classified {
            RetryState::Active
        } else {
            RetryState::Fresh
        }
    }

    fn classify(&mut self, outcome: Outcome<'_>, callback: RetryCallback) -> RetryStatus {
        self.classified = true;

        if !self.runtime_enabled {
            trace!(cluster_name = %self.cluster_name, "Retries disabled by runtime.");
            return RetryStatus::No;
        }

        // Budget held for the previous retry is returned before the next decision.
        self.ticket = None;

        if !outcome.is_retriable(&self.policy) {
            if self.attempts > 0 && !self.success_recorded {
                self.success_recorded = true;
                self.stats.retry_success().increment(1);
            }

            trace!(cluster_name = %self.cluster_name, attempts = self.attempts, ?outcome, "Outcome not retriable.");
            return RetryStatus::No;
        }

        if self.retries_remaining == 0 {
            self.exhausted = true;
            debug!(cluster_name = %self.cluster_name, attempts = self.attempts, ?outcome, "Retry limit exceeded.");
            return RetryStatus::RetryLimitExceeded;
        }

        let Some(ticket) = RetryTicket::try_acquire(&self.budget) else {
            self.stats.retry_overflow().increment(1);
            debug!(
                cluster_name = %self.cluster_name,
                retries_remaining = self.retries_remaining,
                ?outcome,
                "Retry budget exhausted."
            );
            return RetryStatus::Overflow;
        };

        self.ticket = Some(ticket);
        self.retries_remaining -= 1;
        self.attempts += 1;

        let backoff = self.policy.backoff.next_delay(self.attempts, &mut self.rng);
        self.stats.retry().increment(1);

        let timer_factory = &self.timer_factory;
        let timer = self.timer.get_or_insert_with(|| timer_factory.create_timer());
        timer.arm(backoff, callback);

        debug!(
            cluster_name = %self.cluster_name,
            attempt = self.attempts,
            retries_remaining = self.retries_remaining,
            ?backoff,
            ?outcome,
            "Scheduled retry."
        );

        RetryStatus::Yes
    }
}

impl<F> Drop for RetryEngine<F>
where
    F: TimerFactory,
{
    fn drop(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.disarm();
        }
        self.ticket = None;
    }
}

impl<F> fmt::Debug for RetryEngine<F>
where
    F: TimerFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("cluster_name", &self.cluster_name)
            .field("policy", &self.policy)
            .field("retries_remaining", &self.retries_remaining)
            .field("attempts", &self.attempts)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
