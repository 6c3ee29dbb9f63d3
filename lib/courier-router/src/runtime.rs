//! Runtime feature flags.
//!
//! Features are keyed by name and enabled for a percentage of the decisions that consult them. Operators can override
//! the percentage per key, which allows switching behavior such as retries off without touching route configuration.
use std::collections::HashMap;

use courier_config::GenericConfiguration;
use courier_error::{ErrorContext as _, GenericError};
use rand::RngCore as _;
use serde::Deserialize;
use tracing::debug;

/// Runtime key gating whether retries are performed at all.
pub const USE_RETRY_FEATURE: &str = "upstream.use_retry";

/// Default percentage of requests for which retries are enabled.
pub const USE_RETRY_DEFAULT_PERCENT: u8 = 100;

/// Source of runtime feature flags.
pub trait RuntimeFeatures {
    /// Returns `true` if the given feature is enabled for this decision.
    ///
    /// `default_percent` is used when the feature has no explicit setting. Percentages of 100 or more are always
    /// enabled, and 0 is always disabled.
    fn feature_enabled(&self, key: &str, default_percent: u8) -> bool;
}

/// Runtime feature flags with fixed percentages.
///
/// This reads its overrides from the `runtime` configuration key, a map of feature keys to percentages.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct StaticRuntimeFeatures {
    overrides: HashMap<String, u8>,
}

impl StaticRuntimeFeatures {
    /// Creates a new `StaticRuntimeFeatures` from the `runtime` configuration key.
    ///
    /// When the key is absent, no overrides are set.
    ///
    /// # Errors
    ///
    /// If the `runtime` key is present but cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let features = config
            .try_get_typed::<Self>("runtime")
            .error_context("Failed to load runtime feature overrides.")?
            .unwrap_or_default();
        debug!(overrides = features.overrides.len(), "Loaded runtime feature overrides.");
        Ok(features)
    }

    /// Sets the percentage for the given feature key.
    pub fn with_override<K>(mut self, key: K, percent: u8) -> Self
    where
        K: Into<String>,
    {
        self.overrides.insert(key.into(), percent);
        self
    }
}

impl RuntimeFeatures for StaticRuntimeFeatures {
    fn feature_enabled(&self, key: &str, default_percent: u8) -> bool {
        let percent = self.overrides.get(key).copied().unwrap_or(default_percent);
        is_sampled(percent, || rand::rng().next_u64())
    }
}

fn is_sampled<F>(percent: u8, draw: F) -> bool
where
    F: FnOnce() -> u64,
{
    match percent {
        0 => false,
        p if p >= 100 => true,
        p => draw() % 100 < u64::from(p),
    }
}

#[cfg(test)]
mod tests {
    use courier_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn default_percent_applies_without_override() {
        let features = StaticRuntimeFeatures::default();
        assert!(features.feature_enabled(USE_RETRY_FEATURE, 100));
        assert!(!features.feature_enabled(USE_RETRY_FEATURE, 0));
    }

    #[test]
    fn override_takes_precedence() {
        let features = StaticRuntimeFeatures::default().with_override(USE_RETRY_FEATURE, 0);
        assert!(!features.feature_enabled(USE_RETRY_FEATURE, 100));
        assert!(features.feature_enabled("some.other_feature", 100));
    }

    #[test]
    fn partial_percentages_sample_draws() {
        assert!(is_sampled(50, || 49));
        assert!(!is_sampled(50, || 50));
        assert!(is_sampled(50, || 149));
        assert!(is_sampled(1, || 0));
        assert!(!is_sampled(1, || 1));
        assert!(is_sampled(250, || unreachable!()));
        assert!(!is_sampled(0, || unreachable!()));
    }

    #[test]
    fn from_configuration() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("runtime:\n  \"upstream.use_retry\": 0\n")
            .unwrap()
            .into_generic();

        let features = StaticRuntimeFeatures::from_configuration(&config).unwrap();
        assert!(!features.feature_enabled(USE_RETRY_FEATURE, USE_RETRY_DEFAULT_PERCENT));
    }

    #[test]
    fn from_configuration_rejects_invalid_percentages() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("runtime:\n  \"upstream.use_retry\": all\n")
            .unwrap()
            .into_generic();

        assert!(StaticRuntimeFeatures::from_configuration(&config).is_err());
    }

    #[test]
    fn from_configuration_without_runtime_key() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("cluster:\n  name: backend\n")
            .unwrap()
            .into_generic();

        let features = StaticRuntimeFeatures::from_configuration(&config).unwrap();
        assert_eq!(features, StaticRuntimeFeatures::default());
    }
}
