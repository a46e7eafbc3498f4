use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Engine configuration. Every knob has a default, so an empty file (or no
/// file at all) yields a working single-process setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub propagation: PropagationConfig,
    /// Present only in external-worker mode.
    #[serde(default)]
    pub external: Option<ExternalConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Fallback poll cadence; the processor normally wakes on notification.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Attempt ceiling per change. At the ceiling the change stays queued but
    /// is never claimed again without operator intervention.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// When set, claims older than this are considered abandoned and become
    /// reclaimable. Off by default: a crashed worker's claim then sticks.
    #[serde(with = "humantime_serde", default)]
    pub claim_lease_timeout: Option<Duration>,

    /// Retention for processed changes.
    #[serde(with = "humantime_serde", default = "default_processed_ttl")]
    pub processed_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_attempts: default_max_attempts(),
            claim_lease_timeout: None,
            processed_ttl: default_processed_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Concurrent affected-record writes per propagation step.
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,

    /// Attempts for a single record-store write before the step fails.
    #[serde(default = "default_write_retry_attempts")]
    pub write_retry_attempts: u32,

    #[serde(with = "humantime_serde", default = "default_write_retry_backoff")]
    pub write_retry_backoff: Duration,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            fanout_concurrency: default_fanout_concurrency(),
            write_retry_attempts: default_write_retry_attempts(),
            write_retry_backoff: default_write_retry_backoff(),
        }
    }
}

/// External-worker mode: mutations are logged ahead of commit and dispatched
/// to a remote queue instead of being processed in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    pub resource: String,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Entries older than this window are considered stranded on startup.
    #[serde(with = "humantime_serde", default = "default_health_check_window")]
    pub health_check_window: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_processed_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_fanout_concurrency() -> usize {
    5
}

fn default_write_retry_attempts() -> u32 {
    3
}

fn default_write_retry_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_queue_name() -> String {
    "konsistent".to_string()
}

fn default_health_check_window() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}
