use rand::Rng;
use std::cmp::max;
use std::time::{Duration, Instant};

/// Time Duration interval since last retry to consider a connection malfunctioning.
///
/// This determines if the backoff strategy should keep its sequence.
/// If duration is higher, then the backoff will reset its values to start a new sequence.
pub const LAST_RETRY_INTERVAL: Duration = Duration::new(30, 0);

/// Exponential backoff with an optional upper clamp and jitter.
///
/// Tracks its own retry count and resets the sequence once the caller has been
/// quiet for longer than `last_retry_interval`.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    last_retry: Instant,
    tries: usize,
    initial_delay: Duration,
    max_delay: Option<Duration>,
    max_retries: usize,
    last_retry_interval: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            last_retry: Instant::now(),
            tries: 0,
            initial_delay: Duration::new(1, 0),
            max_delay: None,
            max_retries: 0,
            last_retry_interval: LAST_RETRY_INTERVAL,
            jitter: false,
        }
    }
}

impl Backoff {
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_last_retry_interval(mut self, last_retry_interval: Duration) -> Self {
        self.last_retry_interval = last_retry_interval;
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Whether another retry is allowed. Resets the sequence after a quiet interval.
    pub fn should_backoff(&mut self) -> bool {
        if self.last_retry.elapsed() > self.last_retry_interval {
            self.tries = 0
        }

        self.max_retries == 0 || self.tries < self.max_retries
    }

    /// Computes the next delay and hands it to `sleep_func`.
    pub fn backoff<S>(&mut self, sleep_func: S)
    where
        S: FnOnce(Duration),
    {
        sleep_func(self.next_delay());
        self.last_retry = Instant::now();
        self.tries += 1;
    }

    fn next_delay(&self) -> Duration {
        let base: u32 = 2;
        let exponent = base.saturating_pow(max(self.tries as u32, 1) - 1);
        let mut delay = self.initial_delay.saturating_mul(exponent);
        if let Some(cap) = self.max_delay {
            delay = delay.min(cap);
        }
        if self.jitter && !delay.is_zero() {
            // Uniform over [delay/2, delay] so concurrent reconnects spread out.
            let half = delay / 2;
            delay = half + rand::thread_rng().gen_range(Duration::ZERO..=half);
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_backoff_exponential_sequence() {
        let mut slept = Duration::new(0, 0);
        let mut sleep_mock = |dur: Duration| slept += dur;

        let mut b = Backoff::default();
        for _ in 0..5 {
            assert!(b.should_backoff());
            b.backoff(&mut sleep_mock);
        }
        // 1 + 1 + 2 + 4 + 8
        assert_eq!(Duration::from_secs(16), slept)
    }

    #[test]
    fn test_backoff_max_retries_reached() {
        let mut b = Backoff::default().with_max_retries(3);
        let results = [true, true, true, false];

        for expected in results {
            let should_backoff = b.should_backoff();
            assert_eq!(expected, should_backoff);
            if should_backoff {
                b.backoff(|_| {});
            }
        }
    }

    #[test]
    fn test_backoff_max_retries_reached_but_interval_reset() {
        let mut b = Backoff::default()
            .with_max_retries(3)
            .with_last_retry_interval(Duration::from_micros(1));

        for _ in 0..4 {
            assert!(b.should_backoff());
            b.backoff(|_| {});
            // Quiet interval elapses, so the sequence resets every time.
            sleep(Duration::from_micros(2))
        }
    }

    #[test]
    fn test_backoff_clamped_by_max_delay() {
        let mut delays = Vec::new();
        let mut b = Backoff::default()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));
        for _ in 0..6 {
            b.backoff(|d| delays.push(d));
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(5)));
        assert_eq!(delays.last(), Some(&Duration::from_secs(5)));
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let mut b = Backoff::default()
            .with_initial_delay(Duration::from_secs(4))
            .with_max_delay(Duration::from_secs(4))
            .with_jitter();
        for _ in 0..20 {
            b.backoff(|d| {
                assert!(d >= Duration::from_secs(2));
                assert!(d <= Duration::from_secs(4));
            });
        }
    }
}
