//! Environment-driven configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::RetryPolicy;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_JOB_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 5000;
pub const DEFAULT_JOB_PRIORITY: u8 = 5;
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WORKER_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_QUEUE_CLAIM_IDLE_MS: u64 = 60_000;

/// Process configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Postgres connection string; in-memory persistence when unset.
    pub database_url: Option<String>,
    /// Redis connection string; in-memory queues when unset.
    pub redis_url: Option<String>,
    pub job_attempts: u32,
    pub job_backoff_delay: Duration,
    pub job_default_priority: u8,
    /// Bound on every queue broker call.
    pub queue_timeout: Duration,
    /// How long a reserved broker message may sit unsettled before another
    /// consumer reclaims it.
    pub queue_claim_idle: Duration,
    pub worker_poll_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            redis_url: None,
            job_attempts: DEFAULT_JOB_ATTEMPTS,
            job_backoff_delay: Duration::from_millis(DEFAULT_BACKOFF_DELAY_MS),
            job_default_priority: DEFAULT_JOB_PRIORITY,
            queue_timeout: Duration::from_millis(DEFAULT_QUEUE_TIMEOUT_MS),
            queue_claim_idle: Duration::from_millis(DEFAULT_QUEUE_CLAIM_IDLE_MS),
            worker_poll_interval: Duration::from_millis(DEFAULT_WORKER_POLL_INTERVAL_MS),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparsable values fall back to the
    /// default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr),
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            job_attempts: parse_or(&lookup, "JOB_ATTEMPTS", defaults.job_attempts).max(1),
            job_backoff_delay: Duration::from_millis(parse_or(
                &lookup,
                "JOB_BACKOFF_DELAY_MS",
                DEFAULT_BACKOFF_DELAY_MS,
            )),
            job_default_priority: parse_or(&lookup, "JOB_DEFAULT_PRIORITY", defaults.job_default_priority)
                .clamp(1, 10),
            queue_timeout: Duration::from_millis(parse_or(
                &lookup,
                "QUEUE_TIMEOUT_MS",
                DEFAULT_QUEUE_TIMEOUT_MS,
            )),
            queue_claim_idle: Duration::from_millis(parse_or(
                &lookup,
                "QUEUE_CLAIM_IDLE_MS",
                DEFAULT_QUEUE_CLAIM_IDLE_MS,
            )),
            worker_poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "WORKER_POLL_INTERVAL_MS",
                DEFAULT_WORKER_POLL_INTERVAL_MS,
            )),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.job_attempts, self.job_backoff_delay)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = ?default, "invalid config value; using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = AppConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
        assert_eq!(cfg.bind_addr.to_string(), DEFAULT_BIND_ADDR);
    }

    #[test]
    fn values_are_parsed_and_clamped() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/genflow"),
            ("REDIS_URL", "  "),
            ("JOB_ATTEMPTS", "0"),
            ("JOB_DEFAULT_PRIORITY", "99"),
            ("QUEUE_TIMEOUT_MS", "1500"),
            ("QUEUE_CLAIM_IDLE_MS", "30000"),
        ]));
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/genflow"));
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.job_attempts, 1);
        assert_eq!(cfg.job_default_priority, 10);
        assert_eq!(cfg.queue_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.queue_claim_idle, Duration::from_secs(30));
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let cfg = AppConfig::from_lookup(lookup(&[("JOB_BACKOFF_DELAY_MS", "soon")]));
        assert_eq!(cfg.job_backoff_delay, Duration::from_millis(DEFAULT_BACKOFF_DELAY_MS));
    }
}
