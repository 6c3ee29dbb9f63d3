use std::time::Duration;

use courier_config::GenericConfiguration;
use courier_error::{ErrorContext as _, GenericError};
use serde::Deserialize;

use super::policy::{PolicyError, RetryOn, RetryPolicy};

const fn default_num_retries() -> u32 {
    1
}

const fn default_host_selection_retry_max_attempts() -> u32 {
    1
}

/// Back-off configuration of a retry policy.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct RetryBackOffConfiguration {
    /// The base interval between retries, in milliseconds.
    ///
    /// Must be greater than zero. Defaults to 25 milliseconds.
    #[serde(default)]
    base_interval_ms: Option<u64>,

    /// The maximum interval between retries, in milliseconds.
    ///
    /// Must not be smaller than the base interval. Defaults to ten times the base interval.
    #[serde(default)]
    max_interval_ms: Option<u64>,
}

/// Retry policy configuration of a route.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct RetryPolicyConfiguration {
    /// Conditions under which requests are retried, as a comma-separated list of condition names.
    ///
    /// Both HTTP conditions (`5xx`, `gateway-error`, `reset`, `connect-failure`, `refused-stream`, `retriable-4xx`,
    /// `retriable-status-codes`) and gRPC conditions (`cancelled`, `deadline-exceeded`, `resource-exhausted`,
    /// `unavailable`, `internal`) are accepted. Unknown names are ignored.
    ///
    /// Defaults to no conditions, which disables retries unless requests opt in by header.
    #[serde(default)]
    retry_on: String,

    /// Maximum number of retries per request.
    ///
    /// Defaults to 1.
    #[serde(default = "default_num_retries")]
    num_retries: u32,

    /// Status codes retried under the `retriable-status-codes` condition.
    ///
    /// Defaults to no status codes.
    #[serde(default)]
    retriable_status_codes: Vec<u16>,

    /// Back-off between retries.
    #[serde(default)]
    retry_back_off: Option<RetryBackOffConfiguration>,

    /// Number of host selection attempts made for each retry.
    ///
    /// Defaults to 1.
    #[serde(default = "default_host_selection_retry_max_attempts")]
    host_selection_retry_max_attempts: u32,
}

impl RetryPolicyConfiguration {
    /// Reads the retry policy configuration under the `retry_policy` key.
    ///
    /// When the key is absent, the default configuration is returned.
    ///
    /// # Errors
    ///
    /// If the `retry_policy` key is present but cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let maybe_config = config
            .try_get_typed::<Self>("retry_policy")
            .error_context("Failed to load retry policy configuration.")?;
        Ok(maybe_config.unwrap_or_default())
    }

    /// Creates the [`RetryPolicy`] described by this configuration.
    ///
    /// # Errors
    ///
    /// If the back-off intervals are invalid, an error is returned.
    pub fn into_policy(self) -> Result<RetryPolicy, PolicyError> {
        let policy = RetryPolicy::default()
            .with_retry_on(RetryOn::parse_conditions(&self.retry_on))
            .with_num_retries(self.num_retries)
            .with_retriable_status_codes(self.retriable_status_codes)
            .with_host_selection_max_attempts(self.host_selection_retry_max_attempts);

        match self.retry_back_off {
            Some(RetryBackOffConfiguration {
                base_interval_ms: Some(base_ms),
                max_interval_ms,
            }) => policy.with_back_off(
                Duration::from_millis(base_ms),
                max_interval_ms.map(Duration::from_millis),
            ),
            Some(RetryBackOffConfiguration {
                base_interval_ms: None,
                max_interval_ms: Some(max_ms),
            }) => policy.with_max_back_off(Duration::from_millis(max_ms)),
            _ => Ok(policy),
        }
    }
}

impl Default for RetryPolicyConfiguration {
    fn default() -> Self {
        Self {
            retry_on: String::new(),
            num_retries: default_num_retries(),
            retriable_status_codes: Vec::new(),
            retry_back_off: None,
            host_selection_retry_max_attempts: default_host_selection_retry_max_attempts(),
        }
    }
}
