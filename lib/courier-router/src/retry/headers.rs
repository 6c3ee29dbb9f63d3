//! Per-request retry directives.
//!
//! Downstream clients can tune the retry behavior of an individual request with a small set of request headers. The
//! headers are always stripped before the request is forwarded, whether or not they were usable.
use http::{HeaderMap, HeaderName, HeaderValue};

use super::policy::{EffectivePolicy, RetryOn, RetryPolicy};

/// Request header replacing the route's HTTP retry conditions.
pub const RETRY_ON_HEADER: HeaderName = HeaderName::from_static("x-envoy-retry-on");

/// Request header adding gRPC retry conditions.
pub const RETRY_GRPC_ON_HEADER: HeaderName = HeaderName::from_static("x-envoy-retry-grpc-on");

/// Request header replacing the route's retriable status codes.
pub const RETRIABLE_STATUS_CODES_HEADER: HeaderName = HeaderName::from_static("x-envoy-retriable-status-codes");

/// Request header replacing the route's maximum number of retries.
pub const MAX_RETRIES_HEADER: HeaderName = HeaderName::from_static("x-envoy-max-retries");

/// Resolves the effective retry policy of a request.
///
/// Starts from the route's `policy` and applies any directives found in `headers`, removing them in the process:
///
/// - the retry-on directive replaces the route's conditions
/// - the gRPC retry-on directive is merged into whatever conditions are in effect after that
/// - the retriable status codes directive replaces the route's status codes
/// - the max retries directive replaces the route's retry limit, as long as it is a valid unsigned integer
///
/// A directive whose value is not visible ASCII is treated as if it carried no usable entries.
pub fn resolve_policy(policy: &RetryPolicy, headers: &mut HeaderMap) -> EffectivePolicy {
    let mut effective = EffectivePolicy::from_policy(policy);

    if let Some(value) = headers.remove(&RETRY_ON_HEADER) {
        effective.retry_on = directive_str(&value)
            .map(RetryOn::parse_http_conditions)
            .unwrap_or_default();
    }

    if let Some(value) = headers.remove(&RETRY_GRPC_ON_HEADER) {
        if let Some(value) = directive_str(&value) {
            effective.retry_on |= RetryOn::parse_grpc_conditions(value);
        }
    }

    if let Some(value) = headers.remove(&RETRIABLE_STATUS_CODES_HEADER) {
        effective.retriable_status_codes = directive_str(&value).map(parse_status_codes).unwrap_or_default();
    }

    if let Some(value) = headers.remove(&MAX_RETRIES_HEADER) {
        if let Some(num_retries) = directive_str(&value).and_then(|value| value.parse::<u32>().ok()) {
            effective.num_retries = num_retries;
        }
    }

    effective
}

fn directive_str(value: &HeaderValue) -> Option<&str> {
    value.to_str().ok()
}

/// Parses a comma-separated list of HTTP status codes.
///
/// Each entry is trimmed, and its leading run of decimal digits is used as the status code. Entries without leading
/// digits, or whose digits do not fit a status code, are dropped.
pub fn parse_status_codes(value: &str) -> Vec<u16> {
    value
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let digits_end = entry.find(|c: char| !c.is_ascii_digit()).unwrap_or(entry.len());
            entry[..digits_end].parse::<u16>().ok()
        })
        .collect()
}
