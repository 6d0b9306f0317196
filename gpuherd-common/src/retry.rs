use std::time::Duration;

/// Explicit retry policy for provider API calls: bounded attempts with
/// exponential backoff, plus the request timeout the HTTP client is built
/// with. Passed into the provider wrapper instead of ad hoc retry loops.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (attempt is 1-based; no delay before
    /// the first attempt).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.base_delay * 2u32.saturating_pow(attempt - 2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
    }
}
