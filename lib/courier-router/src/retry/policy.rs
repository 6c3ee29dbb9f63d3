use std::{fmt, time::Duration};

use bitmask_enum::bitmask;
use snafu::Snafu;

use super::backoff::{JitteredBackoff, DEFAULT_BASE_INTERVAL};

/// Set of conditions under which a request may be retried.
///
/// This type is a bitmask, so individual conditions can be combined together. An empty set means the request is never
/// retried.
#[bitmask(u16)]
#[bitmask_config(vec_debug)]
pub enum RetryOn {
    /// Any 5xx response, or any reset.
    FiveXx,

    /// A 502, 503, or 504 response, or any reset.
    GatewayError,

    /// Any reset.
    Reset,

    /// A failure to establish the upstream connection.
    ConnectFailure,

    /// A stream refused by the upstream before any processing happened.
    RefusedStream,

    /// A 409 response.
    Retriable4xx,

    /// A response whose status is in the policy's retriable status codes.
    RetriableStatusCodes,

    /// A gRPC `CANCELLED` status.
    GrpcCancelled,

    /// A gRPC `DEADLINE_EXCEEDED` status.
    GrpcDeadlineExceeded,

    /// A gRPC `RESOURCE_EXHAUSTED` status.
    GrpcResourceExhausted,

    /// A gRPC `UNAVAILABLE` status.
    GrpcUnavailable,

    /// A gRPC `INTERNAL` status.
    GrpcInternal,
}

impl Default for RetryOn {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryOn {
    /// Parses a comma-separated list of HTTP retry condition names.
    ///
    /// Unknown names are ignored.
    pub fn parse_http_conditions(value: &str) -> Self {
        parse_conditions(value, RetryCondition::from_http_name)
    }

    /// Parses a comma-separated list of gRPC retry condition names.
    ///
    /// Unknown names are ignored.
    pub fn parse_grpc_conditions(value: &str) -> Self {
        parse_conditions(value, RetryCondition::from_grpc_name)
    }

    /// Parses a comma-separated list of retry condition names, accepting both HTTP and gRPC names.
    ///
    /// Unknown names are ignored.
    pub fn parse_conditions(value: &str) -> Self {
        parse_conditions(value, |name| {
            RetryCondition::from_http_name(name).or_else(|| RetryCondition::from_grpc_name(name))
        })
    }

    /// Returns an iterator over the individual conditions in this set.
    pub fn conditions(self) -> impl Iterator<Item = RetryCondition> {
        RetryCondition::ALL
            .into_iter()
            .filter(move |condition| self.contains(condition.flag()))
    }
}

impl fmt::Display for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, condition) in self.conditions().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(condition.name())?;
        }
        Ok(())
    }
}

fn parse_conditions<F>(value: &str, lookup: F) -> RetryOn
where
    F: Fn(&str) -> Option<RetryCondition>,
{
    value
        .split(',')
        .filter_map(|name| lookup(name.trim()))
        .fold(RetryOn::none(), |acc, condition| acc | condition.flag())
}

/// A single retry condition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RetryCondition {
    /// See [`RetryOn::FiveXx`].
    FiveXx,

    /// See [`RetryOn::GatewayError`].
    GatewayError,

    /// See [`RetryOn::Reset`].
    Reset,

    /// See [`RetryOn::ConnectFailure`].
    ConnectFailure,

    /// See [`RetryOn::RefusedStream`].
    RefusedStream,

    /// See [`RetryOn::Retriable4xx`].
    Retriable4xx,

    /// See [`RetryOn::RetriableStatusCodes`].
    RetriableStatusCodes,

    /// See [`RetryOn::GrpcCancelled`].
    GrpcCancelled,

    /// See [`RetryOn::GrpcDeadlineExceeded`].
    GrpcDeadlineExceeded,

    /// See [`RetryOn::GrpcResourceExhausted`].
    GrpcResourceExhausted,

    /// See [`RetryOn::GrpcUnavailable`].
    GrpcUnavailable,

    /// See [`RetryOn::GrpcInternal`].
    GrpcInternal,
}

impl RetryCondition {
    /// All retry conditions.
    pub const ALL: [RetryCondition; 12] = [
        RetryCondition::FiveXx,
        RetryCondition::GatewayError,
        RetryCondition::Reset,
        RetryCondition::ConnectFailure,
        RetryCondition::RefusedStream,
        RetryCondition::Retriable4xx,
        RetryCondition::RetriableStatusCodes,
        RetryCondition::GrpcCancelled,
        RetryCondition::GrpcDeadlineExceeded,
        RetryCondition::GrpcResourceExhausted,
        RetryCondition::GrpcUnavailable,
        RetryCondition::GrpcInternal,
    ];

    /// Returns the flag for this condition.
    pub const fn flag(self) -> RetryOn {
        match self {
            RetryCondition::FiveXx => RetryOn::FiveXx,
            RetryCondition::GatewayError => RetryOn::GatewayError,
            RetryCondition::Reset => RetryOn::Reset,
            RetryCondition::ConnectFailure => RetryOn::ConnectFailure,
            RetryCondition::RefusedStream => RetryOn::RefusedStream,
            RetryCondition::Retriable4xx => RetryOn::Retriable4xx,
            RetryCondition::RetriableStatusCodes => RetryOn::RetriableStatusCodes,
            RetryCondition::GrpcCancelled => RetryOn::GrpcCancelled,
            RetryCondition::GrpcDeadlineExceeded => RetryOn::GrpcDeadlineExceeded,
            RetryCondition::GrpcResourceExhausted => RetryOn::GrpcResourceExhausted,
            RetryCondition::GrpcUnavailable => RetryOn::GrpcUnavailable,
            RetryCondition::GrpcInternal => RetryOn::GrpcInternal,
        }
    }

    /// Returns the name of this condition, as used in configuration and request headers.
    pub const fn name(self) -> &'static str {
        match self {
            RetryCondition::FiveXx => "5xx",
            RetryCondition::GatewayError => "gateway-error",
            RetryCondition::Reset => "reset",
            RetryCondition::ConnectFailure => "connect-failure",
            RetryCondition::RefusedStream => "refused-stream",
            RetryCondition::Retriable4xx => "retriable-4xx",
            RetryCondition::RetriableStatusCodes => "retriable-status-codes",
            RetryCondition::GrpcCancelled => "cancelled",
            RetryCondition::GrpcDeadlineExceeded => "deadline-exceeded",
            RetryCondition::GrpcResourceExhausted => "resource-exhausted",
            RetryCondition::GrpcUnavailable => "unavailable",
            RetryCondition::GrpcInternal => "internal",
        }
    }

    /// Returns `true` if this condition is driven by the gRPC status of a response.
    pub const fn is_grpc(self) -> bool {
        matches!(
            self,
            RetryCondition::GrpcCancelled
                | RetryCondition::GrpcDeadlineExceeded
                | RetryCondition::GrpcResourceExhausted
                | RetryCondition::GrpcUnavailable
                | RetryCondition::GrpcInternal
        )
    }

    /// Looks up an HTTP retry condition by name.
    pub fn from_http_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|condition| !condition.is_grpc() && condition.name() == name)
    }

    /// Looks up a gRPC retry condition by name.
    pub fn from_grpc_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|condition| condition.is_grpc() && condition.name() == name)
    }
}

impl fmt::Display for RetryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Policy error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PolicyError {
    /// The back-off base interval was zero.
    #[snafu(display("retry back-off base interval must be greater than zero"))]
    ZeroBaseInterval,

    /// The back-off maximum interval was smaller than the base interval.
    #[snafu(display(
        "retry back-off max interval ({}ms) must not be smaller than the base interval ({}ms)",
        max.as_millis(),
        base.as_millis()
    ))]
    MaxIntervalBelowBase {
        /// Base interval.
        base: Duration,

        /// Maximum interval.
        max: Duration,
    },
}

/// Retry policy of a route.
///
/// This is the static half of a request's retry behavior. Request headers can override parts of it on a per-request
/// basis, which produces an [`EffectivePolicy`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    retry_on: RetryOn,
    num_retries: u32,
    retriable_status_codes: Vec<u16>,
    base_interval: Option<Duration>,
    max_interval: Option<Duration>,
    host_selection_max_attempts: u32,
}

impl RetryPolicy {
    /// Sets the conditions under which requests are retried.
    ///
    /// Defaults to no conditions, which disables retries unless a request opts in by header.
    pub fn with_retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Sets the maximum number of retries for a request.
    ///
    /// Defaults to 1.
    pub fn with_num_retries(mut self, num_retries: u32) -> Self {
        self.num_retries = num_retries;
        self
    }

    /// Sets the status codes retried under [`RetryOn::RetriableStatusCodes`].
    ///
    /// Defaults to no status codes.
    pub fn with_retriable_status_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.retriable_status_codes = codes.into_iter().collect();
        self
    }

    /// Sets the back-off intervals.
    ///
    /// When `max` is `None`, the maximum interval is derived from the base interval.
    ///
    /// # Errors
    ///
    /// If `base` is zero, or `max` is smaller than `base`, an error is returned.
    pub fn with_back_off(mut self, base: Duration, max: Option<Duration>) -> Result<Self, PolicyError> {
        if base.is_zero() {
            return Err(PolicyError::ZeroBaseInterval);
        }
        if let Some(max) = max {
            if max < base {
                return Err(PolicyError::MaxIntervalBelowBase { base, max });
            }
        }

        self.base_interval = Some(base);
        self.max_interval = max;
        Ok(self)
    }

    /// Sets the maximum back-off interval, keeping the default base interval.
    ///
    /// # Errors
    ///
    /// If `max` is smaller than the default base interval, an error is returned.
    pub fn with_max_back_off(self, max: Duration) -> Result<Self, PolicyError> {
        let base = self.base_interval.unwrap_or(DEFAULT_BASE_INTERVAL);
        let mut policy = self.with_back_off(base, Some(max))?;
        policy.base_interval = None;
        Ok(policy)
    }

    /// Sets the number of host selection attempts made for each retry.
    ///
    /// Defaults to 1.
    pub fn with_host_selection_max_attempts(mut self, attempts: u32) -> Self {
        self.host_selection_max_attempts = attempts;
        self
    }

    /// Returns the retry conditions.
    pub fn retry_on(&self) -> RetryOn {
        self.retry_on
    }

    /// Returns the maximum number of retries.
    pub fn num_retries(&self) -> u32 {
        self.num_retries
    }

    /// Returns the retriable status codes.
    pub fn retriable_status_codes(&self) -> &[u16] {
        &self.retriable_status_codes
    }

    /// Returns the configured base back-off interval, if any.
    pub fn base_interval(&self) -> Option<Duration> {
        self.base_interval
    }

    /// Returns the configured maximum back-off interval, if any.
    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval
    }

    /// Returns the number of host selection attempts made for each retry.
    pub fn host_selection_max_attempts(&self) -> u32 {
        self.host_selection_max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on: RetryOn::none(),
            num_retries: 1,
            retriable_status_codes: Vec::new(),
            base_interval: None,
            max_interval: None,
            host_selection_max_attempts: 1,
        }
    }
}

/// Retry policy of a single request, after request header directives were applied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EffectivePolicy {
    pub(crate) retry_on: RetryOn,
    pub(crate) retriable_status_codes: Vec<u16>,
    pub(crate) num_retries: u32,
    pub(crate) backoff: JitteredBackoff,
    pub(crate) host_selection_max_attempts: u32,
}

impl EffectivePolicy {
    /// Creates an `EffectivePolicy` from a route policy, without any overrides.
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self {
            retry_on: policy.retry_on,
            retriable_status_codes: policy.retriable_status_codes.clone(),
            num_retries: policy.num_retries,
            backoff: JitteredBackoff::new(policy.base_interval, policy.max_interval),
            host_selection_max_attempts: policy.host_selection_max_attempts,
        }
    }

    /// Returns the retry conditions.
    pub fn retry_on(&self) -> RetryOn {
        self.retry_on
    }

    /// Returns the retriable status codes.
    pub fn retriable_status_codes(&self) -> &[u16] {
        &self.retriable_status_codes
    }

    /// Returns the maximum number of retries.
    pub fn num_retries(&self) -> u32 {
        self.num_retries
    }

    /// Returns the back-off used between retries.
    pub fn backoff(&self) -> &JitteredBackoff {
        &self.backoff
    }

    /// Returns the number of host selection attempts made for each retry.
    pub fn host_selection_max_attempts(&self) -> u32 {
        self.host_selection_max_attempts
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parse_http_conditions() {
        assert_eq!(RetryOn::parse_http_conditions("5xx"), RetryOn::FiveXx);
        assert_eq!(
            RetryOn::parse_http_conditions("5xx,connect-failure"),
            RetryOn::FiveXx | RetryOn::ConnectFailure
        );
        assert_eq!(
            RetryOn::parse_http_conditions("gateway-error, reset,refused-stream,retriable-4xx"),
            RetryOn::GatewayError | RetryOn::Reset | RetryOn::RefusedStream | RetryOn::Retriable4xx
        );
        assert_eq!(RetryOn::parse_http_conditions("retriable-status-codes"), RetryOn::RetriableStatusCodes);
    }

    #[test]
    fn parse_ignores_unknown_and_foreign_names() {
        assert!(RetryOn::parse_http_conditions("").is_none());
        assert!(RetryOn::parse_http_conditions("foo,bar").is_none());
        assert!(RetryOn::parse_http_conditions("cancelled").is_none());
        assert!(RetryOn::parse_grpc_conditions("5xx").is_none());
        assert_eq!(RetryOn::parse_http_conditions("foo,5xx"), RetryOn::FiveXx);
    }

    #[test]
    fn parse_grpc_conditions() {
        assert_eq!(
            RetryOn::parse_grpc_conditions("cancelled,deadline-exceeded,resource-exhausted,unavailable,internal"),
            RetryOn::GrpcCancelled
                | RetryOn::GrpcDeadlineExceeded
                | RetryOn::GrpcResourceExhausted
                | RetryOn::GrpcUnavailable
                | RetryOn::GrpcInternal
        );
    }

    #[test]
    fn parse_mixed_conditions() {
        assert_eq!(
            RetryOn::parse_conditions("5xx,unavailable"),
            RetryOn::FiveXx | RetryOn::GrpcUnavailable
        );
    }

    #[test]
    fn display_round_trips_names() {
        let retry_on = RetryOn::Reset | RetryOn::GrpcInternal;
        assert_eq!(retry_on.to_string(), "reset,internal");
        assert_eq!(RetryOn::parse_conditions(&retry_on.to_string()), retry_on);
    }

    #[test]
    fn every_condition_has_a_distinct_flag() {
        let all = RetryCondition::ALL
            .into_iter()
            .fold(RetryOn::none(), |acc, condition| acc | condition.flag());
        assert_eq!(all.bits().count_ones() as usize, RetryCondition::ALL.len());
        assert_eq!(all.conditions().count(), RetryCondition::ALL.len());
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert!(policy.retry_on().is_none());
        assert_eq!(policy.num_retries(), 1);
        assert_eq!(policy.host_selection_max_attempts(), 1);
        assert!(policy.retriable_status_codes().is_empty());
        assert_eq!(policy.base_interval(), None);
        assert_eq!(policy.max_interval(), None);
    }

    #[test]
    fn back_off_validation() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.clone().with_back_off(Duration::ZERO, None),
            Err(PolicyError::ZeroBaseInterval)
        );
        assert_eq!(
            policy
                .clone()
                .with_back_off(Duration::from_millis(100), Some(Duration::from_millis(50))),
            Err(PolicyError::MaxIntervalBelowBase {
                base: Duration::from_millis(100),
                max: Duration::from_millis(50),
            })
        );

        let policy = policy
            .with_back_off(Duration::from_millis(100), Some(Duration::from_millis(100)))
            .unwrap();
        let effective = EffectivePolicy::from_policy(&policy);
        assert_eq!(effective.backoff().base_interval(), Duration::from_millis(100));
        assert_eq!(effective.backoff().max_interval(), Duration::from_millis(100));
    }

    #[test]
    fn max_back_off_only() {
        let policy = RetryPolicy::default()
            .with_max_back_off(Duration::from_millis(500))
            .unwrap();
        assert_eq!(policy.base_interval(), None);

        let effective = EffectivePolicy::from_policy(&policy);
        assert_eq!(effective.backoff().base_interval(), Duration::from_millis(25));
        assert_eq!(effective.backoff().max_interval(), Duration::from_millis(500));

        assert!(RetryPolicy::default()
            .with_max_back_off(Duration::from_millis(10))
            .is_err());
    }
}
