use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{rng, RngCore};

/// Base interval used when neither the route nor its configuration specifies one.
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_millis(25);

/// Multiplier applied to the base interval to derive the maximum interval when no maximum is given.
pub const DEFAULT_MAX_INTERVAL_MULTIPLIER: u32 = 10;

/// Source of randomness for jittered backoff.
#[derive(Clone, Default)]
pub enum BackoffRng {
    /// A lazily-initialized, thread-local CSPRNG seeded by the operating system.
    ///
    /// Provided by [`rand::rngs::ThreadRng`][rand_threadrng].
    ///
    /// [rand_threadrng]: https://docs.rs/rand/latest/rand/rngs/struct.ThreadRng.html
    #[default]
    SecureDefault,

    /// A shared random number generator.
    ///
    /// Mostly useful in tests, where the draws need to be deterministic.
    Shared(Arc<Mutex<Box<dyn RngCore + Send>>>),
}

impl BackoffRng {
    /// Wraps the given generator so that it can be shared by clones of this `BackoffRng`.
    pub fn shared<R>(rng: R) -> Self
    where
        R: RngCore + Send + 'static,
    {
        Self::Shared(Arc::new(Mutex::new(Box::new(rng))))
    }
}

impl fmt::Debug for BackoffRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffRng::SecureDefault => f.debug_tuple("SecureDefault").finish(),
            BackoffRng::Shared(_) => f.debug_tuple("Shared").finish(),
        }
    }
}

impl RngCore for BackoffRng {
    fn next_u32(&mut self) -> u32 {
        match self {
            BackoffRng::SecureDefault => rng().next_u32(),
            BackoffRng::Shared(shared) => shared.lock().unwrap_or_else(PoisonError::into_inner).next_u32(),
        }
    }

    fn next_u64(&mut self) -> u64 {
        match self {
            BackoffRng::SecureDefault => rng().next_u64(),
            BackoffRng::Shared(shared) => shared.lock().unwrap_or_else(PoisonError::into_inner).next_u64(),
        }
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        match self {
            BackoffRng::SecureDefault => rng().fill_bytes(dest),
            BackoffRng::Shared(shared) => shared.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(dest),
        }
    }
}

/// A fully-jittered exponential backoff.
///
/// For the Nth retry of a request, the delay is drawn uniformly from `[0, base * (2^N - 1))`, measured in whole
/// milliseconds. Once that span reaches the maximum interval, the maximum interval is used as-is, without jitter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JitteredBackoff {
    base: Duration,
    max: Duration,
}

impl JitteredBackoff {
    /// Creates a new `JitteredBackoff`.
    ///
    /// When `base` is not given, [`DEFAULT_BASE_INTERVAL`] is used. When `max` is not given, it defaults to
    /// [`DEFAULT_MAX_INTERVAL_MULTIPLIER`] times the base interval.
    pub fn new(base: Option<Duration>, max: Option<Duration>) -> Self {
        let base = base.unwrap_or(DEFAULT_BASE_INTERVAL);
        let max = max.unwrap_or_else(|| base.saturating_mul(DEFAULT_MAX_INTERVAL_MULTIPLIER));
        Self { base, max }
    }

    /// Returns the base interval.
    pub fn base_interval(&self) -> Duration {
        self.base
    }

    /// Returns the maximum interval.
    pub fn max_interval(&self) -> Duration {
        self.max
    }

    /// Calculates the delay before the given retry attempt using a pre-drawn random value.
    ///
    /// `attempt` is one-based: the first retry of a request is attempt 1.
    pub fn delay_for(&self, attempt: u32, draw: u64) -> Duration {
        let base_ms = duration_as_millis(self.base);
        let max_ms = duration_as_millis(self.max);

        let multiplier = 2u64.checked_pow(attempt).map_or(u64::MAX, |n| n - 1);
        let span_ms = base_ms.saturating_mul(multiplier);

        if span_ms >= max_ms {
            return self.max;
        }
        if span_ms == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(draw % span_ms)
    }

    /// Calculates the delay before the given retry attempt, drawing exactly one value from `rng`.
    ///
    /// The value is drawn even when the delay ends up capped at the maximum interval, so the number of draws is
    /// always equal to the number of scheduled retries.
    pub fn next_delay<R>(&self, attempt: u32, rng: &mut R) -> Duration
    where
        R: RngCore + ?Sized,
    {
        let draw = rng.next_u64();
        self.delay_for(attempt, draw)
    }
}

impl Default for JitteredBackoff {
    fn default() -> Self {
        Self::new(None, None)
    }
}

fn duration_as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use rand::{rngs::StdRng, RngCore, SeedableRng as _};

    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn defaults() {
        let backoff = JitteredBackoff::default();
        assert_eq!(backoff.base_interval(), ms(25));
        assert_eq!(backoff.max_interval(), ms(250));

        let backoff = JitteredBackoff::new(Some(ms(100)), None);
        assert_eq!(backoff.max_interval(), ms(1000));
    }

    #[test]
    fn default_base_interval_sequence() {
        let backoff = JitteredBackoff::default();
        assert_eq!(backoff.delay_for(1, 49), ms(24));
        assert_eq!(backoff.delay_for(2, 149), ms(74));
        assert_eq!(backoff.delay_for(3, 349), ms(174));
    }

    #[test]
    fn custom_intervals_cap_at_max() {
        let backoff = JitteredBackoff::new(Some(ms(100)), Some(ms(1200)));
        assert_eq!(backoff.delay_for(1, 149), ms(49));
        assert_eq!(backoff.delay_for(2, 350), ms(50));
        assert_eq!(backoff.delay_for(3, 751), ms(51));
        // Span of 1500ms exceeds the maximum, so the draw is ignored.
        assert_eq!(backoff.delay_for(4, 1499), ms(1200));
    }

    #[test]
    fn derived_max_caps_fourth_retry() {
        let backoff = JitteredBackoff::new(Some(ms(100)), None);
        assert_eq!(backoff.delay_for(4, 1499), ms(1000));
    }

    #[test]
    fn very_large_attempts_saturate() {
        let backoff = JitteredBackoff::default();
        assert_eq!(backoff.delay_for(64, 12345), backoff.max_interval());
        assert_eq!(backoff.delay_for(u32::MAX, 0), backoff.max_interval());
    }

    #[test]
    fn zero_span_yields_zero_delay() {
        let backoff = JitteredBackoff::new(Some(ms(25)), Some(ms(250)));
        assert_eq!(backoff.delay_for(0, 7), Duration::ZERO);
    }

    #[test]
    fn next_delay_always_draws() {
        struct CountingRng(u32);

        impl RngCore for CountingRng {
            fn next_u32(&mut self) -> u32 {
                self.next_u64() as u32
            }

            fn next_u64(&mut self) -> u64 {
                self.0 += 1;
                0
            }

            fn fill_bytes(&mut self, dst: &mut [u8]) {
                rand::rand_core::impls::fill_bytes_via_next(self, dst)
            }
        }

        let backoff = JitteredBackoff::default();
        let mut rng = CountingRng(0);
        backoff.next_delay(1, &mut rng);
        backoff.next_delay(10, &mut rng);
        assert_eq!(rng.0, 2);
    }

    #[test]
    fn shared_rng_is_deterministic_across_clones() {
        let mut a = BackoffRng::shared(StdRng::seed_from_u64(42));
        let mut b = a.clone();
        let mut reference = StdRng::seed_from_u64(42);

        assert_eq!(a.next_u64(), reference.next_u64());
        assert_eq!(b.next_u64(), reference.next_u64());
    }

    proptest! {
        #[test]
        fn property_test_delay_within_bounds(
            base_ms in 1u64..10_000,
            max_extra_ms in 0u64..100_000,
            attempt in 1u32..80,
            draw in any::<u64>(),
        ) {
            let max_ms = base_ms + max_extra_ms;
            let backoff = JitteredBackoff::new(Some(ms(base_ms)), Some(ms(max_ms)));
            let delay = backoff.delay_for(attempt, draw);

            prop_assert!(delay <= backoff.max_interval());

            let span_ms = 2u64.checked_pow(attempt).map_or(u64::MAX, |n| n - 1).saturating_mul(base_ms);
            if span_ms < max_ms {
                prop_assert!(delay < ms(span_ms));
            } else {
                prop_assert_eq!(delay, backoff.max_interval());
            }
        }
    }
}
