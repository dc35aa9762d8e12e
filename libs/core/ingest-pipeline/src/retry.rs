//! Retry Tracker
//!
//! Decides, for a transient persistence failure, whether a message gets
//! another attempt (and after how long) or is exhausted. State travels with
//! the message, so the tracker itself holds only the policy.

use chrono::{DateTime, Utc};
use core_config::{ConfigError, FromEnv, env_parse, env_parse_or};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

use crate::backoff::BackoffPolicy;

/// What a retry delay is measured from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum DelayBase {
    /// Each delay starts at the failure that scheduled it
    #[default]
    PerAttempt,
    /// Retry `n` is due at `first_failure + delay(1) + .. + delay(n)`
    FirstFailure,
}

/// Raw retry settings as configured. Signed so that negative input is
/// reported as invalid rather than as a parse error.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: i64,
    pub initial_delay_ms: i64,
    pub multiplier: f64,
    pub max_delay_ms: i64,
    pub delay_base: DelayBase,
}

impl RetryConfig {
    pub fn new(max_retries: i64, initial_delay_ms: i64, multiplier: f64, max_delay_ms: i64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            multiplier,
            max_delay_ms,
            delay_base: DelayBase::default(),
        }
    }

    pub fn with_delay_base(mut self, delay_base: DelayBase) -> Self {
        self.delay_base = delay_base;
        self
    }

    /// Validate and convert into the policy the tracker runs on.
    pub fn into_policy(self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::try_from(self)
    }
}

/// Environment variables (the four numeric values are required):
/// - `RETRY_MAX_RETRIES`
/// - `RETRY_INITIAL_DELAY_MS`
/// - `RETRY_MULTIPLIER`
/// - `RETRY_MAX_DELAY_MS`
/// - `RETRY_DELAY_BASE` (`per_attempt` | `first_failure`, default `per_attempt`)
impl FromEnv for RetryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            max_retries: env_parse("RETRY_MAX_RETRIES")?,
            initial_delay_ms: env_parse("RETRY_INITIAL_DELAY_MS")?,
            multiplier: env_parse("RETRY_MULTIPLIER")?,
            max_delay_ms: env_parse("RETRY_MAX_DELAY_MS")?,
            delay_base: env_parse_or("RETRY_DELAY_BASE", DelayBase::default())?,
        })
    }
}

/// Validated retry limits and backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub delay_base: DelayBase,
}

impl TryFrom<RetryConfig> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(config: RetryConfig) -> Result<Self, Self::Error> {
        let max_retries = u32::try_from(config.max_retries).map_err(|_| {
            ConfigError::invalid(
                "RETRY_MAX_RETRIES",
                format!("must be between 0 and {}, got {}", u32::MAX, config.max_retries),
            )
        })?;
        let initial = positive_ms("RETRY_INITIAL_DELAY_MS", config.initial_delay_ms)?;
        let max = positive_ms("RETRY_MAX_DELAY_MS", config.max_delay_ms)?;

        Ok(Self {
            max_retries,
            backoff: BackoffPolicy::new(initial, config.multiplier, max)?,
            delay_base: config.delay_base,
        })
    }
}

fn positive_ms(key: &str, value: i64) -> Result<Duration, ConfigError> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .map(Duration::from_millis)
        .ok_or_else(|| ConfigError::invalid(key, format!("must be greater than 0, got {value}")))
}

/// Per-message retry bookkeeping, carried with the message between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Retries already scheduled; never decreases
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(first_seen_at: DateTime<Utc>) -> Self {
        Self {
            attempts: 0,
            first_seen_at,
            first_failure_at: None,
            last_error: None,
        }
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run after `delay`; `state.attempts` already counts this retry
    Retry { state: RetryState, delay: Duration },
    /// Budget spent; route to the Error Router
    Exhausted { state: RetryState },
}

/// Applies a [`RetryPolicy`] to transient failures
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn on_transient_failure(&self, state: RetryState, error: &str) -> RetryDecision {
        self.on_transient_failure_at(state, error, Utc::now())
    }

    /// Same as [`Self::on_transient_failure`] with an explicit clock.
    pub fn on_transient_failure_at(
        &self,
        mut state: RetryState,
        error: &str,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        state.last_error = Some(error.to_string());
        let first_failure = *state.first_failure_at.get_or_insert(now);

        if state.attempts >= self.policy.max_retries {
            return RetryDecision::Exhausted { state };
        }

        state.attempts += 1;
        let delay = match self.policy.delay_base {
            DelayBase::PerAttempt => self.policy.backoff.delay(state.attempts),
            DelayBase::FirstFailure => {
                let schedule = self.policy.backoff.cumulative(state.attempts);
                let deadline = chrono::Duration::from_std(schedule)
                    .ok()
                    .and_then(|d| first_failure.checked_add_signed(d));
                match deadline {
                    Some(deadline) => (deadline - now).to_std().unwrap_or(Duration::ZERO),
                    None => self.policy.backoff.max(),
                }
            }
        };

        RetryDecision::Retry { state, delay }
    }
}
