//! Backoff strategies and the retry policy used by the façade.

use std::sync::Arc;
use std::time::Duration;

/// Pluggable backoff strategy.
pub trait IntervalFunction: Send + Sync {
    /// Delay before retry number `attempt` (0-based: `interval_for(0)` is
    /// the delay after the first failed attempt).
    fn interval_for(&self, attempt: usize) -> Duration;
}

/// The same delay before every retry.
pub struct FixedInterval(Duration);

impl FixedInterval {
    /// Creates a fixed interval.
    pub fn new(interval: Duration) -> Self {
        Self(interval)
    }
}

impl IntervalFunction for FixedInterval {
    fn interval_for(&self, _attempt: usize) -> Duration {
        self.0
    }
}

/// Exponentially growing delay.
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl ExponentialBackoff {
    /// Creates an exponential backoff with multiplier 2.0 capped at 30s.
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }

    /// Sets the growth multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }
}

impl IntervalFunction for ExponentialBackoff {
    fn interval_for(&self, attempt: usize) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max)
    }
}

/// Exponential backoff with uniform jitter around each delay.
pub struct ExponentialRandomBackoff {
    inner: ExponentialBackoff,
    randomization_factor: f64,
}

impl ExponentialRandomBackoff {
    /// Creates a jittered exponential backoff with randomization factor 0.5.
    pub fn new(initial: Duration) -> Self {
        Self {
            inner: ExponentialBackoff::new(initial),
            randomization_factor: 0.5,
        }
    }

    /// Sets the randomization factor in `[0.0, 1.0]`; each delay is drawn
    /// uniformly from `base ± base * factor`.
    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Sets the growth multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.inner = self.inner.with_multiplier(multiplier);
        self
    }

    /// Sets the delay cap.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.inner = self.inner.with_max(max);
        self
    }
}

impl IntervalFunction for ExponentialRandomBackoff {
    fn interval_for(&self, attempt: usize) -> Duration {
        use rand::Rng;

        let base = self.inner.interval_for(attempt).as_secs_f64();
        let delta = base * self.randomization_factor;
        let jittered = rand::rng().random_range((base - delta)..=(base + delta));
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// A function-based interval.
pub struct FnInterval<F>(F);

impl<F> FnInterval<F>
where
    F: Fn(usize) -> Duration + Send + Sync,
{
    /// Wraps a closure as an interval function.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> IntervalFunction for FnInterval<F>
where
    F: Fn(usize) -> Duration + Send + Sync,
{
    fn interval_for(&self, attempt: usize) -> Duration {
        (self.0)(attempt)
    }
}

/// Bounds and paces the attempts the façade makes for one call.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Arc<dyn IntervalFunction>,
}

impl RetryPolicy {
    /// Creates a new policy builder.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Total attempt budget, including the first attempt.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub(crate) fn backoff_for(&self, attempt: usize) -> Duration {
        self.backoff.interval_for(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Option<Arc<dyn IntervalFunction>>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    /// Creates a builder with defaults.
    ///
    /// Defaults:
    /// - max_attempts: 3
    /// - backoff: exponential with 100ms initial interval
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: None,
        }
    }

    /// Sets the total attempt budget, including the first attempt.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Uses a fixed backoff interval.
    pub fn fixed_backoff(mut self, interval: Duration) -> Self {
        self.backoff = Some(Arc::new(FixedInterval::new(interval)));
        self
    }

    /// Uses exponential backoff with default settings.
    pub fn exponential_backoff(mut self, initial: Duration) -> Self {
        self.backoff = Some(Arc::new(ExponentialBackoff::new(initial)));
        self
    }

    /// Uses a custom interval function.
    pub fn backoff<I>(mut self, interval_fn: I) -> Self
    where
        I: IntervalFunction + 'static,
    {
        self.backoff = Some(Arc::new(interval_fn));
        self
    }

    /// Builds the policy.
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self
                .backoff
                .unwrap_or_else(|| Arc::new(ExponentialBackoff::new(Duration::from_millis(100)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_is_constant() {
        let interval = FixedInterval::new(Duration::from_millis(50));
        assert_eq!(interval.interval_for(0), Duration::from_millis(50));
        assert_eq!(interval.interval_for(7), Duration::from_millis(50));
    }

    #[test]
    fn exponential_doubles_by_default() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100));
        assert_eq!(backoff.interval_for(0), Duration::from_millis(100));
        assert_eq!(backoff.interval_for(1), Duration::from_millis(200));
        assert_eq!(backoff.interval_for(2), Duration::from_millis(400));
    }

    #[test]
    fn exponential_is_capped() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(10)).with_max(Duration::from_secs(15));
        assert_eq!(backoff.interval_for(3), Duration::from_secs(15));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = ExponentialRandomBackoff::new(Duration::from_millis(100))
            .with_randomization_factor(0.5);
        for _ in 0..100 {
            let delay = backoff.interval_for(0);
            assert!(delay >= Duration::from_millis(50), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(150), "delay {delay:?}");
        }
    }

    #[test]
    fn custom_interval_function() {
        let backoff = FnInterval::new(|attempt| Duration::from_secs((attempt + 1) as u64));
        assert_eq!(backoff.interval_for(0), Duration::from_secs(1));
        assert_eq!(backoff.interval_for(2), Duration::from_secs(3));
    }
}
