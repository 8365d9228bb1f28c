use std::time::{Duration, Instant};

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Tracks the delay between consecutive retry attempts.
///
/// The first attempt after a reset runs immediately. Each following attempt waits
/// for the current base delay (grown by `multiplier` up to `max_delay`) plus up to
/// ±50% jitter, minus whatever time already passed since the previous attempt.
#[derive(Debug)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base: Duration,
    last_attempt: Instant,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
            last_attempt: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Forces the next attempt to wait the full maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Marks the moment the delayed operation actually ran.
    pub fn record_attempt(&mut self) {
        self.last_attempt = Instant::now();
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base_millis = self.current_base.as_secs_f64() * 1_000.0;
        let jitter = (rng.gen::<f64>() - 0.5) * base_millis;
        let max_millis = self.settings.max_delay.as_secs_f64() * 1_000.0;
        let desired = (base_millis + jitter).floor().clamp(0.0, max_millis);
        let elapsed = self.last_attempt.elapsed().as_secs_f64() * 1_000.0;
        let remaining = (desired - elapsed).max(0.0);

        let grown = self.current_base.mul_f64(self.settings.multiplier);
        self.current_base = grown.clamp(self.settings.initial_delay, self.settings.max_delay);

        Duration::from_millis(remaining as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_attempt_is_immediate() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = ExponentialBackoff::new(BackoffSettings::default());
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.current_base(), DEFAULT_INITIAL_DELAY);
    }

    #[test]
    fn base_grows_by_multiplier_and_caps() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = ExponentialBackoff::new(BackoffSettings::default());
        backoff.next_delay_with_rng(&mut rng);
        backoff.next_delay_with_rng(&mut rng);
        assert_eq!(backoff.current_base(), Duration::from_millis(1_500));

        for _ in 0..30 {
            let delay = backoff.next_delay_with_rng(&mut rng);
            assert!(delay <= DEFAULT_MAX_DELAY);
        }
        assert_eq!(backoff.current_base(), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn jitter_stays_within_half_of_base() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut backoff = ExponentialBackoff::new(BackoffSettings::default());
        backoff.next_delay_with_rng(&mut rng);
        let delay = backoff.next_delay_with_rng(&mut rng);
        assert!(delay <= Duration::from_millis(1_500));
    }

    #[test]
    fn reset_returns_to_immediate_retry() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut backoff = ExponentialBackoff::new(BackoffSettings::default());
        for _ in 0..4 {
            backoff.next_delay_with_rng(&mut rng);
        }
        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);

        backoff.reset_to_max();
        assert_eq!(backoff.current_base(), DEFAULT_MAX_DELAY);
    }
}
