use std::thread::sleep;
use std::time::Duration;

use rand::Rng;

use crate::config::Config;
use crate::error::StudyResult;

/// Retry configuration for lost-update conflicts
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 500,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.conflict_retries,
            base_delay_ms: cfg.conflict_base_delay_ms,
            ..Default::default()
        }
    }

    /// Exponential backoff with ±jitter_factor jitter
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Re-run `operation` while it fails with a retryable error (a version
/// conflict). Any other error, or the last conflict, is returned unchanged.
pub fn retry_on_conflict<T, F>(config: &RetryConfig, operation_name: &str, mut operation: F) -> StudyResult<T>
where
    F: FnMut() -> StudyResult<T>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                eprintln!(
                    "[retry] {} attempt {}/{} failed: {}. Retrying in {:?}",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    e,
                    delay
                );
                sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StudyError;
    use std::cell::Cell;

    fn conflict() -> StudyError {
        StudyError::ConcurrencyConflict { participant_id: "p".to_string(), expected: 1, found: 2 }
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0, // no jitter for deterministic test
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(1000)); // clamped
    }

    #[test]
    fn test_retry_eventual_success() {
        let config = RetryConfig { base_delay_ms: 1, ..Default::default() };
        let calls = Cell::new(0);
        let result = retry_on_conflict(&config, "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(conflict())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_gives_up_after_max() {
        let config = RetryConfig { max_retries: 2, base_delay_ms: 1, ..Default::default() };
        let calls = Cell::new(0);
        let result: StudyResult<()> = retry_on_conflict(&config, "test", || {
            calls.set(calls.get() + 1);
            Err(conflict())
        });
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_non_conflict_not_retried() {
        let config = RetryConfig { base_delay_ms: 1, ..Default::default() };
        let calls = Cell::new(0);
        let result: StudyResult<()> = retry_on_conflict(&config, "test", || {
            calls.set(calls.get() + 1);
            Err(StudyError::not_found("p"))
        });
        assert_eq!(result.unwrap_err().kind(), "not_found");
        assert_eq!(calls.get(), 1);
    }
}
