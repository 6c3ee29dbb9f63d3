//! Upstream clusters.
//!
//! A cluster is the group of upstream hosts a route forwards requests to. For retries, the cluster provides the retry
//! budgets that cap how many retries may be outstanding at once, and the statistics retry decisions are recorded in.
use std::{fmt, sync::Arc};

use courier_config::GenericConfiguration;
use courier_error::{generic_error, ErrorContext as _, GenericError};
use courier_metrics::static_metrics;
use serde::Deserialize;

mod budget;
pub use self::budget::{ConcurrencyLimit, RetryBudget, RetryTicket, DEFAULT_MAX_RETRIES};

/// Priority class of a request.
///
/// Each priority draws from its own retry budget.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ResourcePriority {
    /// Default priority.
    #[default]
    Default,

    /// High priority.
    High,
}

impl fmt::Display for ResourcePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePriority::Default => f.write_str("default"),
            ResourcePriority::High => f.write_str("high"),
        }
    }
}

static_metrics!(
    vis => pub(crate),
    name => RetryStatistics,
    prefix => upstream_rq,
    labels => [cluster_name: String],
    metrics => [
        counter(retry),
        counter(retry_success),
        counter(retry_overflow),
    ],
);

/// An upstream cluster.
pub struct UpstreamCluster {
    name: Arc<str>,
    default_budget: Arc<dyn RetryBudget>,
    high_budget: Arc<dyn RetryBudget>,
    retry_stats: RetryStatistics,
}

impl UpstreamCluster {
    /// Creates a new `UpstreamCluster` with the given name.
    ///
    /// Both priorities get a [`ConcurrencyLimit`] of [`DEFAULT_MAX_RETRIES`] outstanding retries.
    pub fn new<N>(name: N) -> Self
    where
        N: Into<Arc<str>>,
    {
        let name = name.into();
        let default_budget = Arc::new(ConcurrencyLimit::with_metrics(
            DEFAULT_MAX_RETRIES,
            &name,
            ResourcePriority::Default,
        ));
        let high_budget = Arc::new(ConcurrencyLimit::with_metrics(
            DEFAULT_MAX_RETRIES,
            &name,
            ResourcePriority::High,
        ));
        let retry_stats = RetryStatistics::new(name.to_string());

        Self {
            name,
            default_budget,
            high_budget,
            retry_stats,
        }
    }

    /// Replaces the retry budget of the given priority.
    pub fn with_retry_budget(mut self, priority: ResourcePriority, budget: Arc<dyn RetryBudget>) -> Self {
        match priority {
            ResourcePriority::Default => self.default_budget = budget,
            ResourcePriority::High => self.high_budget = budget,
        }
        self
    }

    /// Caps the number of outstanding retries for the given priority.
    pub fn with_max_retries(self, priority: ResourcePriority, max_retries: u64) -> Self {
        let budget = Arc::new(ConcurrencyLimit::with_metrics(max_retries, &self.name, priority));
        self.with_retry_budget(priority, budget)
    }

    /// Returns the name of the cluster.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Returns the retry budget of the given priority.
    pub fn retry_budget(&self, priority: ResourcePriority) -> &Arc<dyn RetryBudget> {
        match priority {
            ResourcePriority::Default => &self.default_budget,
            ResourcePriority::High => &self.high_budget,
        }
    }

    pub(crate) fn retry_stats(&self) -> &RetryStatistics {
        &self.retry_stats
    }
}

impl fmt::Debug for UpstreamCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCluster").field("name", &self.name).finish_non_exhaustive()
    }
}

const fn default_max_retries() -> u64 {
    DEFAULT_MAX_RETRIES
}

/// Retry circuit breaker thresholds of a cluster.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CircuitBreakerConfiguration {
    /// Maximum number of outstanding retries at default priority.
    ///
    /// Defaults to 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u64,

    /// Maximum number of outstanding retries at high priority.
    ///
    /// Defaults to 3.
    #[serde(default = "default_max_retries")]
    pub high_priority_max_retries: u64,
}

impl Default for CircuitBreakerConfiguration {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            high_priority_max_retries: default_max_retries(),
        }
    }
}

/// Upstream cluster configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct UpstreamClusterConfiguration {
    /// Name of the cluster.
    pub name: String,

    /// Retry circuit breaker thresholds.
    #[serde(default)]
    pub circuit_breakers: CircuitBreakerConfiguration,
}

impl UpstreamClusterConfiguration {
    /// Reads the cluster configuration under the `cluster` key.
    ///
    /// # Errors
    ///
    /// If the `cluster` key is missing or cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        config
            .get_typed("cluster")
            .error_context("Failed to load upstream cluster configuration.")
    }

    /// Builds the cluster described by this configuration.
    ///
    /// # Errors
    ///
    /// If the cluster name is empty, an error is returned.
    pub fn build(self) -> Result<UpstreamCluster, GenericError> {
        if self.name.trim().is_empty() {
            return Err(generic_error!("Upstream cluster name must not be empty."));
        }

        Ok(UpstreamCluster::new(self.name.as_str())
            .with_max_retries(ResourcePriority::Default, self.circuit_breakers.max_retries)
            .with_max_retries(ResourcePriority::High, self.circuit_breakers.high_priority_max_retries))
    }
}
