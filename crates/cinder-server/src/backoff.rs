//! Retry backoff and deadline helpers.

use std::time::Duration;

use tokio::time::Instant;

/// Quadratic capped backoff: `min(attempt² · min_delay, max_delay)`.
///
/// Attempt 0 yields zero, so the first retry after a reset is immediate.
pub(crate) fn backoff(attempt: u32, min_delay: Duration, max_delay: Duration) -> Duration {
    let delay = min_delay.saturating_mul(attempt.saturating_mul(attempt));
    delay.min(max_delay)
}

/// Converts a timeout into an absolute deadline, or `None` for "never".
pub(crate) fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    match timeout {
        Some(t) if !t.is_zero() => Some(Instant::now() + t),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_millis(1000);

    #[test]
    fn quadratic_growth() {
        assert_eq!(backoff(0, MIN, MAX), Duration::ZERO);
        assert_eq!(backoff(1, MIN, MAX), Duration::from_millis(10));
        assert_eq!(backoff(2, MIN, MAX), Duration::from_millis(40));
        assert_eq!(backoff(3, MIN, MAX), Duration::from_millis(90));
    }

    #[test]
    fn capped_at_max() {
        assert_eq!(backoff(10, MIN, MAX), MAX);
        assert_eq!(backoff(u32::MAX, MIN, MAX), MAX);
    }

    #[test]
    fn deadline_of_none_is_never() {
        assert!(deadline(None).is_none());
        assert!(deadline(Some(Duration::ZERO)).is_none());
    }

    #[test]
    fn deadline_is_in_the_future() {
        let before = Instant::now();
        let at = deadline(Some(Duration::from_secs(1))).unwrap();
        assert!(at >= before + Duration::from_secs(1));
    }
}
