//! Reconnect pacing for the consumer supervisor

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::debug;

/// Maximum backoff duration to prevent excessive delays
const MAX_BACKOFF_SECONDS: u64 = 3600; // 1 hour
/// Maximum multiplier to prevent exponential explosion
const MAX_MULTIPLIER: f64 = 100.0;
/// Maximum jitter factor
const MAX_JITTER_FACTOR: f64 = 1.0;

/// Validate backoff duration within reasonable bounds
fn validate_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let duration = Duration::deserialize(deserializer)?;
    if duration.as_secs() > MAX_BACKOFF_SECONDS {
        return Err(serde::de::Error::custom(format!(
            "duration {:?} exceeds maximum allowed {} seconds",
            duration, MAX_BACKOFF_SECONDS
        )));
    }
    Ok(duration)
}

fn check_multiplier(value: f64) -> Result<(), String> {
    if !value.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&value) {
        return Err(format!(
            "backoff_multiplier {} must be finite and between 1.0 and {}",
            value, MAX_MULTIPLIER
        ));
    }
    Ok(())
}

fn check_jitter(value: f64) -> Result<(), String> {
    if !value.is_finite() || !(0.0..=MAX_JITTER_FACTOR).contains(&value) {
        return Err(format!(
            "jitter_factor {} must be finite and between 0.0 and {}",
            value, MAX_JITTER_FACTOR
        ));
    }
    Ok(())
}

/// Validate multiplier within reasonable bounds
fn validate_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    check_multiplier(value).map_err(<D::Error as serde::de::Error>::custom)?;
    Ok(value)
}

/// Validate jitter factor within bounds [0.0, 1.0]
fn validate_jitter<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    check_jitter(value).map_err(<D::Error as serde::de::Error>::custom)?;
    Ok(value)
}

/// How long the supervisor waits before reconnecting
///
/// There is no attempt limit: the supervisor reconnects forever. The
/// attempt counter is reset every time a connection reaches streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect
    #[serde(deserialize_with = "validate_duration")]
    pub initial_backoff: Duration,
    /// Upper bound on the delay
    #[serde(deserialize_with = "validate_duration")]
    pub max_backoff: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential)
    #[serde(deserialize_with = "validate_multiplier")]
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(deserialize_with = "validate_jitter")]
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

impl ReconnectPolicy {
    /// Reconnect right away, every time
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Doubling delay from `initial` up to `max`, with 10% jitter
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial_backoff: initial,
            max_backoff: max,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Constant delay between reconnects
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_backoff: delay,
            max_backoff: delay,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Whether the policy never sleeps
    pub fn is_immediate(&self) -> bool {
        self.max_backoff.is_zero() || self.initial_backoff.is_zero()
    }

    /// Delay before reconnect number `attempt` (1-based; 0 means no wait)
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.is_immediate() {
            return Duration::ZERO;
        }

        let base_backoff = if attempt > 30 {
            self.max_backoff
        } else {
            let multiplier = self.backoff_multiplier.powi(attempt as i32 - 1);
            if multiplier.is_finite() && multiplier < 1e6 {
                Duration::try_from_secs_f64(self.initial_backoff.as_secs_f64() * multiplier)
                    .unwrap_or(self.max_backoff)
            } else {
                self.max_backoff
            }
        };

        let capped_backoff = base_backoff.min(self.max_backoff);

        let jitter = capped_backoff.as_secs_f64() * self.jitter_factor * rand::random::<f64>();
        let with_jitter = Duration::try_from_secs_f64(capped_backoff.as_secs_f64() + jitter)
            .unwrap_or(capped_backoff);

        debug!(
            "Calculated reconnect backoff for attempt {}: {:?} (base: {:?})",
            attempt, with_jitter, base_backoff
        );

        with_jitter
    }

    /// Check the bounds a deserialized policy is held to
    pub fn validate(&self) -> Result<(), String> {
        check_multiplier(self.backoff_multiplier)?;
        check_jitter(self.jitter_factor)?;
        if self.initial_backoff > self.max_backoff {
            return Err("Initial backoff cannot exceed max backoff".to_string());
        }
        if self.max_backoff.as_secs() > MAX_BACKOFF_SECONDS {
            return Err(format!(
                "Max backoff cannot exceed {} seconds",
                MAX_BACKOFF_SECONDS
            ));
        }
        Ok(())
    }
}
