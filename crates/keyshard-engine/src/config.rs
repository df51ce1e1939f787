//! Engine and job configuration.
//!
//! Values start from defaults and can be overridden from `KEYSHARD_*`
//! environment variables:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `KEYSHARD_BATCH_SIZE` | [`JobSettings::batch_size`] | 1000 |
//! | `KEYSHARD_LEASE_TIMEOUT_MS` | [`JobSettings::timeout`] | 60000 |
//! | `KEYSHARD_CLOCK_DRIFT_MS` | [`JobSettings::clock_drift`] | 2000 |
//! | `KEYSHARD_POLL_INTERVAL_MS` | [`EngineConfig::poll_interval`] | 1000 |
//! | `KEYSHARD_IDLE_POLL_LIMIT` | [`EngineConfig::idle_poll_limit`] | 10 |
//! | `KEYSHARD_RETRY_LIMIT` | [`RetryConfig::retry_limit`] | 12 |
//! | `KEYSHARD_RETRY_DELAY_MS` | [`RetryConfig::initial_delay`] | 5 |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use keyshard_core::{Error, Result};

/// Per-job settings persisted on the [`Job`](crate::job::Job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    /// Maximum keys a worker pulls per batch.
    pub batch_size: u32,
    /// Time without a progress report after which a lease expires.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Tolerance for clock differences between workers.
    #[serde(with = "duration_ms")]
    pub clock_drift: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            timeout: Duration::from_secs(60),
            clock_drift: Duration::from_secs(2),
        }
    }
}

impl JobSettings {
    /// Loads settings from the environment on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but malformed, or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads settings through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(batch_size) = env_u64(&lookup, "KEYSHARD_BATCH_SIZE")? {
            settings.batch_size = u32::try_from(batch_size).map_err(|_| {
                Error::InvalidInput(format!("KEYSHARD_BATCH_SIZE must fit a u32: {batch_size}"))
            })?;
        }
        if let Some(ms) = env_u64(&lookup, "KEYSHARD_LEASE_TIMEOUT_MS")? {
            settings.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64(&lookup, "KEYSHARD_CLOCK_DRIFT_MS")? {
            settings.clock_drift = Duration::from_millis(ms);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validates settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch size or lease timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch size must be positive".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidInput("lease timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Retry policy for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub retry_limit: u32,
    /// Delay before the first retry; doubled for every retry after it.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
}

impl Default for RetryConfig {
    /// 12 retries starting at 5ms add up to roughly 20 seconds of waiting.
    fn default() -> Self {
        Self {
            retry_limit: 12,
            initial_delay: Duration::from_millis(5),
        }
    }
}

/// Worker-side configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// How long an idle worker waits between polls of the store.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Polls an idle worker spends on one split request before requesting another.
    pub idle_poll_limit: u32,
    /// Retry policy applied by [`Engine::resilient`](crate::engine::Engine::resilient).
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            idle_poll_limit: 10,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the environment on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but malformed, or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = env_u64(&lookup, "KEYSHARD_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = env_u32(&lookup, "KEYSHARD_IDLE_POLL_LIMIT")? {
            config.idle_poll_limit = limit;
        }
        if let Some(limit) = env_u32(&lookup, "KEYSHARD_RETRY_LIMIT")? {
            config.retry.retry_limit = limit;
        }
        if let Some(ms) = env_u64(&lookup, "KEYSHARD_RETRY_DELAY_MS")? {
            config.retry.initial_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll interval or retry delay is zero.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll interval must be positive".to_string()));
        }
        if self.retry.initial_delay.is_zero() {
            return Err(Error::InvalidInput("retry delay must be positive".to_string()));
        }
        Ok(())
    }
}

fn env_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64<F>(lookup: &F, name: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(v) = env_string(lookup, name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_u32<F>(lookup: &F, name: &str) -> Result<Option<u32>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(v) = env_string(lookup, name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
}

/// Serializes a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
