//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::queue::{DEFAULT_MAX_RETRIES, DispatcherConfig, ReaperConfig, RetentionConfig, RetryPolicy};

const DAY_SECS: u64 = 86_400;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Retry budget for tasks enqueued without an explicit one.
    pub default_max_retries: u32,
    pub dispatcher: DispatcherConfig,
    pub retry: RetryPolicy,
    pub reaper: ReaperConfig,
    pub retention: RetentionConfig,
    /// Directory for daily rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/pipeline-queue.db"),
            default_max_retries: DEFAULT_MAX_RETRIES,
            dispatcher: DispatcherConfig::default(),
            retry: RetryPolicy::default(),
            reaper: ReaperConfig::default(),
            retention: RetentionConfig::default(),
            log_dir: None,
        }
    }
}

impl QueueConfig {
    /// Load from `PIPELINE_QUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key → value lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(&lookup);

        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(env
                .parse::<u64>(key)?
                .map_or(default, Duration::from_secs))
        };
        let days = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            match env.parse::<u64>(key)? {
                None => Ok(default),
                Some(d) => d
                    .checked_mul(DAY_SECS)
                    .map(Duration::from_secs)
                    .ok_or_else(|| invalid(key, "too many days")),
            }
        };

        let dispatcher = DispatcherConfig {
            workers: env
                .parse("PIPELINE_QUEUE_DISPATCHERS")?
                .unwrap_or(defaults.dispatcher.workers),
            poll_interval: env
                .parse::<u64>("PIPELINE_QUEUE_POLL_INTERVAL_MS")?
                .map_or(defaults.dispatcher.poll_interval, Duration::from_millis),
            batch_size: env
                .parse("PIPELINE_QUEUE_BATCH_SIZE")?
                .unwrap_or(defaults.dispatcher.batch_size),
        };
        if dispatcher.workers == 0 {
            return Err(invalid("PIPELINE_QUEUE_DISPATCHERS", "must be at least 1"));
        }
        if dispatcher.batch_size == 0 {
            return Err(invalid("PIPELINE_QUEUE_BATCH_SIZE", "must be at least 1"));
        }

        let jitter: f64 = env
            .parse("PIPELINE_QUEUE_RETRY_JITTER")?
            .unwrap_or(defaults.retry.jitter);
        if !(0.0..=1.0).contains(&jitter) {
            return Err(invalid("PIPELINE_QUEUE_RETRY_JITTER", "must be within 0.0..=1.0"));
        }
        let retry = RetryPolicy::new(
            secs("PIPELINE_QUEUE_RETRY_BASE_SECS", defaults.retry.base_delay)?,
            secs("PIPELINE_QUEUE_RETRY_MAX_SECS", defaults.retry.max_delay)?,
            jitter,
        );

        let reaper = ReaperConfig {
            interval: secs("PIPELINE_QUEUE_REAPER_INTERVAL_SECS", defaults.reaper.interval)?,
            stale_threshold: secs(
                "PIPELINE_QUEUE_STALE_AFTER_SECS",
                defaults.reaper.stale_threshold,
            )?,
        };

        let retention = RetentionConfig {
            interval: secs(
                "PIPELINE_QUEUE_RETENTION_INTERVAL_SECS",
                defaults.retention.interval,
            )?,
            completed_ttl: days(
                "PIPELINE_QUEUE_COMPLETED_RETENTION_DAYS",
                defaults.retention.completed_ttl,
            )?,
            failed_ttl: days(
                "PIPELINE_QUEUE_FAILED_RETENTION_DAYS",
                defaults.retention.failed_ttl,
            )?,
        };

        for (key, value) in [
            ("PIPELINE_QUEUE_REAPER_INTERVAL_SECS", reaper.interval),
            ("PIPELINE_QUEUE_RETENTION_INTERVAL_SECS", retention.interval),
            ("PIPELINE_QUEUE_POLL_INTERVAL_MS", dispatcher.poll_interval),
            // A zero threshold would reap tasks whose handlers are still running.
            ("PIPELINE_QUEUE_STALE_AFTER_SECS", reaper.stale_threshold),
        ] {
            // tokio::time::interval panics on a zero period.
            if value.is_zero() {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        Ok(Self {
            db_path: lookup("PIPELINE_QUEUE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            default_max_retries: env
                .parse("PIPELINE_QUEUE_MAX_RETRIES")?
                .unwrap_or(defaults.default_max_retries),
            dispatcher,
            retry,
            reaper,
            retention,
            log_dir: lookup("PIPELINE_QUEUE_LOG_DIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        })
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| invalid(key, &e.to_string())),
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
