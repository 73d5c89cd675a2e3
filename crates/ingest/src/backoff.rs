//! Reconnect backoff math for the stream client, split out from the client
//! so the exponent-saturation and jitter behavior can be tested without a
//! network.

use std::time::Duration;

/// Delay before reconnect attempt `n` (0-indexed). `unit_rand` is a value in
/// `[0.0, 1.0)` supplying the jitter draw — callers pass
/// `rand::thread_rng().gen()` in production and fixed values in tests.
///
/// `delay = min(max_delay, base_delay * 2^min(n, 30)) * (1 + U(-jitter/2, +jitter/2))`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: f64, unit_rand: f64) -> Duration {
    let exponent = attempt.min(30);
    let scale = 2u64.saturating_pow(exponent);
    let unjittered = base.saturating_mul(scale as u32).min(max);

    let jitter_factor = 1.0 + jitter * (unit_rand - 0.5);
    let jittered_nanos = (unjittered.as_secs_f64() * jitter_factor.max(0.0)).max(0.0);
    Duration::from_secs_f64(jittered_nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(60);
        let d0 = backoff_delay(0, base, max, 0.0, 0.5);
        let d1 = backoff_delay(1, base, max, 0.0, 0.5);
        let d2 = backoff_delay(2, base, max, 0.0, 0.5);
        assert_eq!(d0, Duration::from_millis(500));
        assert_eq!(d1, Duration::from_millis(1000));
        assert_eq!(d2, Duration::from_millis(2000));
    }

    #[test]
    fn saturates_at_exponent_30_without_overflow() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(60);
        let huge = backoff_delay(1_000_000, base, max, 0.0, 0.5);
        let at_30 = backoff_delay(30, base, max, 0.0, 0.5);
        assert_eq!(huge, at_30);
        assert_eq!(huge, max);
    }

    #[test]
    fn jitter_stays_within_the_configured_band() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let low = backoff_delay(0, base, max, 0.2, 0.0);
        let high = backoff_delay(0, base, max, 0.2, 1.0);
        assert!(low.as_secs_f64() >= 0.9 && low.as_secs_f64() <= 0.91);
        assert!(high.as_secs_f64() >= 1.09 && high.as_secs_f64() <= 1.1);
    }
}
