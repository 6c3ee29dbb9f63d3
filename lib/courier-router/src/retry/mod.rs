//! Request retries.
//!
//! A [`RetryEngine`] is built per request from the route's [`RetryPolicy`] and the request's retry directives. It
//! classifies the outcome of each upstream attempt, draws from the cluster's retry budget, and schedules the next
//! attempt after a jittered exponential back-off.

mod backoff;
pub use self::backoff::{
    BackoffRng, JitteredBackoff, DEFAULT_BASE_INTERVAL, DEFAULT_MAX_INTERVAL_MULTIPLIER,
};

mod config;
pub use self::config::{RetryBackOffConfiguration, RetryPolicyConfiguration};

mod engine;
pub use self::engine::{RetryEngine, RetryEngineBuilder, RetryState, RetryStatus};

pub mod headers;

pub mod outcome;
pub use self::outcome::{Outcome, ResetReason, ResponseAttributes};

mod policy;
pub use self::policy::{EffectivePolicy, PolicyError, RetryCondition, RetryOn, RetryPolicy};

mod timer;
pub use self::timer::{RetryCallback, RetryTimer, TimerFactory, TokioRetryTimer, TokioTimerFactory};
