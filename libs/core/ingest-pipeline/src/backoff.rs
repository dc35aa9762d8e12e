//! Exponential backoff schedule
//!
//! `delay(n) = min(initial * multiplier^(n-1), max)` for retry number `n >= 1`.
//! The schedule is stateless and monotonically non-decreasing.

use core_config::ConfigError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl BackoffPolicy {
    /// Rejects non-positive delays, `max < initial`, and multipliers below 1
    /// (which would make the schedule shrink).
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Result<Self, ConfigError> {
        if initial.is_zero() {
            return Err(ConfigError::invalid(
                "RETRY_INITIAL_DELAY_MS",
                "must be greater than 0",
            ));
        }
        if max.is_zero() {
            return Err(ConfigError::invalid(
                "RETRY_MAX_DELAY_MS",
                "must be greater than 0",
            ));
        }
        if max < initial {
            return Err(ConfigError::invalid(
                "RETRY_MAX_DELAY_MS",
                format!(
                    "must be >= initial delay ({}ms), got {}ms",
                    initial.as_millis(),
                    max.as_millis()
                ),
            ));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "RETRY_MULTIPLIER",
                format!("must be a finite number >= 1.0, got {multiplier}"),
            ));
        }

        Ok(Self {
            initial,
            multiplier,
            max,
        })
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `retry`. `delay(0)` is zero.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let scaled = (self.initial.as_nanos() as f64 * self.multiplier.powi(exponent)).round();
        if !scaled.is_finite() || scaled >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(scaled as u64).min(self.max)
    }

    /// Sum of delays for retries `1..=retries`.
    pub fn cumulative(&self, retries: u32) -> Duration {
        let mut total = Duration::ZERO;
        for n in 1..=retries {
            let step = self.delay(n);
            if step == self.max {
                // Every remaining step is capped
                let remaining = retries - n + 1;
                return total.saturating_add(self.max.saturating_mul(remaining));
            }
            total = total.saturating_add(step);
        }
        total
    }
}
