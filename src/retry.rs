//! Capped exponential backoff for delivery faults
//!
//! Used by the stream workers when the bus or the write sink is
//! unavailable: each consecutive failure doubles the delay up to the cap,
//! and the first success resets it. There is no attempt limit; the offsets
//! are held, so waiting is always safe.

use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            current_attempt: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        let factor = 2u64.saturating_pow(self.current_attempt);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub async fn sleep(&mut self) {
        let delay = self.delay();
        log::warn!(
            "⏳ backing off {}ms (attempt {})",
            delay.as_millis(),
            self.current_attempt + 1
        );
        sleep(delay).await;
        self.current_attempt = self.current_attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_to_cap() {
        let mut backoff = ExponentialBackoff::new(1_000, 8_000);
        assert_eq!(backoff.delay(), Duration::from_millis(1_000));

        backoff.current_attempt = 1;
        assert_eq!(backoff.delay(), Duration::from_millis(2_000));

        backoff.current_attempt = 3;
        assert_eq!(backoff.delay(), Duration::from_millis(8_000));

        // Capped past the limit, no overflow even at absurd attempts
        backoff.current_attempt = 40;
        assert_eq!(backoff.delay(), Duration::from_millis(8_000));
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut backoff = ExponentialBackoff::new(500, 4_000);
        backoff.current_attempt = 3;
        backoff.reset();
        assert_eq!(backoff.delay(), Duration::from_millis(500));
    }
}
