//! Upstream attempt outcomes and their classification.

use std::fmt;

use http::{HeaderMap, HeaderName, Response, StatusCode};

use super::policy::{EffectivePolicy, RetryCondition};

/// Response header set by upstreams that are shedding load.
pub const OVERLOADED_HEADER: HeaderName = HeaderName::from_static("x-envoy-overloaded");

/// Response header set when a request was rate limited.
pub const RATE_LIMITED_HEADER: HeaderName = HeaderName::from_static("x-envoy-ratelimited");

/// Response header carrying the gRPC status code.
pub const GRPC_STATUS_HEADER: HeaderName = HeaderName::from_static("grpc-status");

/// gRPC `CANCELLED` status code.
pub const GRPC_CANCELLED: u64 = 1;

/// gRPC `DEADLINE_EXCEEDED` status code.
pub const GRPC_DEADLINE_EXCEEDED: u64 = 4;

/// gRPC `RESOURCE_EXHAUSTED` status code.
pub const GRPC_RESOURCE_EXHAUSTED: u64 = 8;

/// gRPC `INTERNAL` status code.
pub const GRPC_INTERNAL: u64 = 13;

/// gRPC `UNAVAILABLE` status code.
pub const GRPC_UNAVAILABLE: u64 = 14;

/// Reason an upstream stream was reset before a response was received.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResetReason {
    /// The stream was reset locally.
    LocalReset,

    /// The stream was refused locally.
    LocalRefusedStreamReset,

    /// The upstream reset the stream.
    RemoteReset,

    /// The upstream refused the stream before processing it.
    RemoteRefusedStreamReset,

    /// The upstream connection could not be established.
    ConnectionFailure,

    /// The upstream connection was terminated while the stream was active.
    ConnectionTermination,

    /// The stream was rejected because a local resource limit was reached.
    Overflow,
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResetReason::LocalReset => "local reset",
            ResetReason::LocalRefusedStreamReset => "local refused stream reset",
            ResetReason::RemoteReset => "remote reset",
            ResetReason::RemoteRefusedStreamReset => "remote refused stream reset",
            ResetReason::ConnectionFailure => "connection failure",
            ResetReason::ConnectionTermination => "connection termination",
            ResetReason::Overflow => "overflow",
        };
        f.write_str(s)
    }
}

/// The parts of an upstream response that matter for retry decisions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResponseAttributes {
    status: u16,
    overloaded: bool,
    rate_limited: bool,
    grpc_status: Option<u64>,
}

impl ResponseAttributes {
    /// Creates a new `ResponseAttributes` for a response with the given status and no signal headers.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            overloaded: false,
            rate_limited: false,
            grpc_status: None,
        }
    }

    /// Extracts the retry-relevant attributes from a response status and its headers.
    ///
    /// The overload and rate-limit signals are considered set when their header is present, regardless of its value.
    /// A gRPC status header that is not a valid unsigned integer is treated as absent.
    pub fn from_parts(status: StatusCode, headers: &HeaderMap) -> Self {
        let grpc_status = headers
            .get(&GRPC_STATUS_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());

        Self {
            status: status.as_u16(),
            overloaded: headers.contains_key(&OVERLOADED_HEADER),
            rate_limited: headers.contains_key(&RATE_LIMITED_HEADER),
            grpc_status,
        }
    }

    /// Marks the response as coming from an overloaded upstream.
    pub fn with_overloaded(mut self, overloaded: bool) -> Self {
        self.overloaded = overloaded;
        self
    }

    /// Marks the response as rate limited.
    pub fn with_rate_limited(mut self, rate_limited: bool) -> Self {
        self.rate_limited = rate_limited;
        self
    }

    /// Sets the gRPC status code of the response.
    pub fn with_grpc_status(mut self, grpc_status: u64) -> Self {
        self.grpc_status = Some(grpc_status);
        self
    }

    /// Returns the HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns `true` if the upstream signalled that it is overloaded.
    pub fn is_overloaded(&self) -> bool {
        self.overloaded
    }

    /// Returns `true` if the response signalled rate limiting.
    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    /// Returns the gRPC status code, if any.
    pub fn grpc_status(&self) -> Option<u64> {
        self.grpc_status
    }

    // gRPC statuses only count on an otherwise successful HTTP response.
    fn effective_grpc_status(&self) -> Option<u64> {
        if self.status == 200 {
            self.grpc_status
        } else {
            None
        }
    }
}

impl<B> From<&Response<B>> for ResponseAttributes {
    fn from(response: &Response<B>) -> Self {
        Self::from_parts(response.status(), response.headers())
    }
}

/// Result of an upstream attempt.
#[derive(Clone, Copy, Debug)]
pub enum Outcome<'a> {
    /// The stream was reset before a response arrived.
    Reset(ResetReason),

    /// A response was received.
    Response(&'a ResponseAttributes),
}

impl Outcome<'_> {
    fn is_never_retriable(&self) -> bool {
        match self {
            Outcome::Reset(reason) => *reason == ResetReason::Overflow,
            Outcome::Response(response) => {
                response.overloaded
                    || (response.rate_limited && response.effective_grpc_status() == Some(GRPC_RESOURCE_EXHAUSTED))
            }
        }
    }

    /// Returns `true` if this outcome is retriable under the given policy.
    ///
    /// Only the retry conditions are considered here. Limits and budgets are the engine's concern.
    pub fn is_retriable(&self, policy: &EffectivePolicy) -> bool {
        if self.is_never_retriable() {
            return false;
        }

        policy
            .retry_on
            .conditions()
            .any(|condition| condition.matches(self, &policy.retriable_status_codes))
    }
}

impl RetryCondition {
    fn matches(self, outcome: &Outcome<'_>, retriable_status_codes: &[u16]) -> bool {
        match outcome {
            Outcome::Reset(reason) => self.matches_reset(*reason),
            Outcome::Response(response) => self.matches_response(response, retriable_status_codes),
        }
    }

    fn matches_reset(self, reason: ResetReason) -> bool {
        match self {
            RetryCondition::FiveXx | RetryCondition::GatewayError | RetryCondition::Reset => true,
            RetryCondition::ConnectFailure => reason == ResetReason::ConnectionFailure,
            RetryCondition::RefusedStream => reason == ResetReason::RemoteRefusedStreamReset,
            RetryCondition::Retriable4xx
            | RetryCondition::RetriableStatusCodes
            | RetryCondition::GrpcCancelled
            | RetryCondition::GrpcDeadlineExceeded
            | RetryCondition::GrpcResourceExhausted
            | RetryCondition::GrpcUnavailable
            | RetryCondition::GrpcInternal => false,
        }
    }

    fn matches_response(self, response: &ResponseAttributes, retriable_status_codes: &[u16]) -> bool {
        let grpc_status = response.effective_grpc_status();
        match self {
            RetryCondition::FiveXx => response.status >= 500,
            RetryCondition::GatewayError => matches!(response.status, 502..=504),
            RetryCondition::Retriable4xx => response.status == 409,
            RetryCondition::RetriableStatusCodes => retriable_status_codes.contains(&response.status),
            RetryCondition::Reset | RetryCondition::ConnectFailure | RetryCondition::RefusedStream => false,
            RetryCondition::GrpcCancelled => grpc_status == Some(GRPC_CANCELLED),
            RetryCondition::GrpcDeadlineExceeded => grpc_status == Some(GRPC_DEADLINE_EXCEEDED),
            RetryCondition::GrpcResourceExhausted => grpc_status == Some(GRPC_RESOURCE_EXHAUSTED),
            RetryCondition::GrpcUnavailable => grpc_status == Some(GRPC_UNAVAILABLE),
            RetryCondition::GrpcInternal => grpc_status == Some(GRPC_INTERNAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, StatusCode};

    use super::*;
    use crate::retry::{RetryOn, RetryPolicy};

    fn policy(retry_on: RetryOn) -> EffectivePolicy {
        EffectivePolicy::from_policy(&RetryPolicy::default().with_retry_on(retry_on))
    }

    fn response(status: u16) -> ResponseAttributes {
        ResponseAttributes::new(StatusCode::from_u16(status).unwrap())
    }

    fn reset_retriable(retry_on: RetryOn, reason: ResetReason) -> bool {
        Outcome::Reset(reason).is_retriable(&policy(retry_on))
    }

    fn response_retriable(retry_on: RetryOn, attrs: &ResponseAttributes) -> bool {
        Outcome::Response(attrs).is_retriable(&policy(retry_on))
    }

    #[test]
    fn overflow_reset_is_never_retriable() {
        let everything = RetryCondition::ALL
            .into_iter()
            .fold(RetryOn::none(), |acc, condition| acc | condition.flag());
        assert!(!reset_retriable(everything, ResetReason::Overflow));
    }

    #[test]
    fn generic_triggers_match_any_reset() {
        for retry_on in [RetryOn::FiveXx, RetryOn::GatewayError, RetryOn::Reset] {
            for reason in [
                ResetReason::LocalReset,
                ResetReason::LocalRefusedStreamReset,
                ResetReason::RemoteReset,
                ResetReason::RemoteRefusedStreamReset,
                ResetReason::ConnectionFailure,
                ResetReason::ConnectionTermination,
            ] {
                assert!(reset_retriable(retry_on, reason), "{:?} should retry {}", retry_on, reason);
            }
        }
    }

    #[test]
    fn specific_reset_triggers() {
        assert!(reset_retriable(RetryOn::ConnectFailure, ResetReason::ConnectionFailure));
        assert!(!reset_retriable(RetryOn::ConnectFailure, ResetReason::RemoteReset));
        assert!(reset_retriable(RetryOn::RefusedStream, ResetReason::RemoteRefusedStreamReset));
        assert!(!reset_retriable(RetryOn::RefusedStream, ResetReason::LocalRefusedStreamReset));
        assert!(!reset_retriable(RetryOn::RefusedStream, ResetReason::RemoteReset));
        assert!(!reset_retriable(RetryOn::RetriableStatusCodes, ResetReason::RemoteReset));
        assert!(!reset_retriable(
            RetryOn::Retriable4xx | RetryOn::GrpcCancelled,
            ResetReason::RemoteReset
        ));
    }

    #[test]
    fn status_based_triggers() {
        assert!(response_retriable(RetryOn::FiveXx, &response(500)));
        assert!(response_retriable(RetryOn::FiveXx, &response(503)));
        assert!(!response_retriable(RetryOn::FiveXx, &response(200)));
        assert!(!response_retriable(RetryOn::FiveXx, &response(409)));

        assert!(response_retriable(RetryOn::GatewayError, &response(502)));
        assert!(response_retriable(RetryOn::GatewayError, &response(503)));
        assert!(response_retriable(RetryOn::GatewayError, &response(504)));
        assert!(!response_retriable(RetryOn::GatewayError, &response(500)));

        assert!(response_retriable(RetryOn::Retriable4xx, &response(409)));
        assert!(!response_retriable(RetryOn::Retriable4xx, &response(400)));

        assert!(!response_retriable(RetryOn::Reset, &response(503)));
        assert!(!response_retriable(RetryOn::ConnectFailure, &response(503)));
    }

    #[test]
    fn retriable_status_codes() {
        let policy = EffectivePolicy::from_policy(
            &RetryPolicy::default()
                .with_retry_on(RetryOn::RetriableStatusCodes)
                .with_retriable_status_codes([418]),
        );
        assert!(Outcome::Response(&response(418)).is_retriable(&policy));
        assert!(!Outcome::Response(&response(200)).is_retriable(&policy));

        // Codes are only consulted when the trigger is enabled.
        let policy = EffectivePolicy::from_policy(
            &RetryPolicy::default()
                .with_retry_on(RetryOn::FiveXx)
                .with_retriable_status_codes([418]),
        );
        assert!(!Outcome::Response(&response(418)).is_retriable(&policy));
    }

    #[test]
    fn grpc_triggers_require_success_status() {
        let cases = [
            (RetryOn::GrpcCancelled, GRPC_CANCELLED),
            (RetryOn::GrpcDeadlineExceeded, GRPC_DEADLINE_EXCEEDED),
            (RetryOn::GrpcResourceExhausted, GRPC_RESOURCE_EXHAUSTED),
            (RetryOn::GrpcUnavailable, GRPC_UNAVAILABLE),
            (RetryOn::GrpcInternal, GRPC_INTERNAL),
        ];

        for (retry_on, code) in cases {
            assert!(response_retriable(retry_on, &response(200).with_grpc_status(code)));
            assert!(!response_retriable(retry_on, &response(500).with_grpc_status(code)));
            assert!(!response_retriable(retry_on, &response(200).with_grpc_status(0)));
            assert!(!response_retriable(retry_on, &response(200)));
        }
    }

    #[test]
    fn overloaded_is_never_retriable() {
        let attrs = response(503).with_overloaded(true);
        assert!(!response_retriable(RetryOn::FiveXx | RetryOn::GatewayError, &attrs));
    }

    #[test]
    fn rate_limited_resource_exhausted_is_never_retriable() {
        let attrs = response(200)
            .with_grpc_status(GRPC_RESOURCE_EXHAUSTED)
            .with_rate_limited(true);
        assert!(!response_retriable(RetryOn::GrpcResourceExhausted, &attrs));

        // Without the rate limit signal, the same status is retriable.
        let attrs = response(200).with_grpc_status(GRPC_RESOURCE_EXHAUSTED);
        assert!(response_retriable(RetryOn::GrpcResourceExhausted, &attrs));

        // Rate limiting alone does not block other conditions.
        let attrs = response(503).with_rate_limited(true);
        assert!(response_retriable(RetryOn::FiveXx, &attrs));
    }

    #[test]
    fn from_parts_reads_signal_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(OVERLOADED_HEADER, HeaderValue::from_static(""));
        headers.insert(GRPC_STATUS_HEADER, HeaderValue::from_static("14"));

        let attrs = ResponseAttributes::from_parts(StatusCode::OK, &headers);
        assert_eq!(attrs.status(), 200);
        assert!(attrs.is_overloaded());
        assert!(!attrs.is_rate_limited());
        assert_eq!(attrs.grpc_status(), Some(14));

        let mut headers = HeaderMap::new();
        headers.insert(RATE_LIMITED_HEADER, HeaderValue::from_static("true"));
        headers.insert(GRPC_STATUS_HEADER, HeaderValue::from_static("fourteen"));

        let attrs = ResponseAttributes::from_parts(StatusCode::TOO_MANY_REQUESTS, &headers);
        assert!(attrs.is_rate_limited());
        assert_eq!(attrs.grpc_status(), None);
    }

    #[test]
    fn from_response() {
        let response = Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("x-envoy-overloaded", "true")
            .body(())
            .unwrap();

        let attrs = ResponseAttributes::from(&response);
        assert_eq!(attrs.status(), 503);
        assert!(attrs.is_overloaded());
    }
}
