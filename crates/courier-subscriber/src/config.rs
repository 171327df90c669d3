// Subscriber defaults plus env/YAML overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::error::SubscriberError;

pub const DEFAULT_STREAMS: usize = 1;
pub const DEFAULT_STREAM_ACK_DEADLINE_SECS: u32 = 60;
pub const DEFAULT_MAX_OUTSTANDING_MESSAGES: usize = 1000;
pub const DEFAULT_MAX_OUTSTANDING_BYTES: usize = 100 * 1024 * 1024;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_ACK_BATCH: usize = 2500;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 100;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

/// A lease is renewed once this fraction of its granted extension has passed.
pub(crate) const RENEWAL_FRACTION: f64 = 0.9;

/// Tunables for one `StreamSubscriber`.
///
/// ```
/// use courier_subscriber::SubscriberConfig;
///
/// let config = SubscriberConfig::default();
/// assert_eq!(config.streams, 1);
/// assert_eq!(config.stream_ack_deadline_secs, 60);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    // Number of independent pull streams.
    pub streams: usize,
    // Lease length requested on open and used for every extension.
    pub stream_ack_deadline_secs: u32,
    // Flow control: receivers block once this many messages are un-disposed.
    pub max_outstanding_messages: usize,
    // Flow control: receivers block once this many bytes are un-disposed.
    pub max_outstanding_bytes: usize,
    // Max concurrent callback invocations.
    pub workers: usize,
    // Scheduled ack/modack flush period.
    pub flush_interval_ms: u64,
    // Max ack ids per acknowledge/modify request.
    pub max_ack_batch: usize,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct SubscriberConfigOverride {
    streams: Option<usize>,
    stream_ack_deadline_secs: Option<u32>,
    max_outstanding_messages: Option<usize>,
    max_outstanding_bytes: Option<usize>,
    workers: Option<usize>,
    flush_interval_ms: Option<u64>,
    max_ack_batch: Option<usize>,
    max_reconnect_attempts: Option<u32>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            streams: DEFAULT_STREAMS,
            stream_ack_deadline_secs: DEFAULT_STREAM_ACK_DEADLINE_SECS,
            max_outstanding_messages: DEFAULT_MAX_OUTSTANDING_MESSAGES,
            max_outstanding_bytes: DEFAULT_MAX_OUTSTANDING_BYTES,
            workers: DEFAULT_WORKERS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_ack_batch: DEFAULT_MAX_ACK_BATCH,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
        }
    }
}

impl SubscriberConfig {
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_SUBSCRIBER_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read subscriber config: {path}"))?;
            let override_cfg: SubscriberConfigOverride =
                serde_yaml::from_str(&contents).context("parse subscriber config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_env::<usize>("COURIER_SUB_STREAMS") {
            config.streams = value;
        }
        if let Some(value) = read_env::<u32>("COURIER_SUB_ACK_DEADLINE_SECS") {
            config.stream_ack_deadline_secs = value;
        }
        if let Some(value) = read_env::<usize>("COURIER_SUB_MAX_OUTSTANDING_MESSAGES") {
            config.max_outstanding_messages = value;
        }
        if let Some(value) = read_env::<usize>("COURIER_SUB_MAX_OUTSTANDING_BYTES") {
            config.max_outstanding_bytes = value;
        }
        if let Some(value) = read_env::<usize>("COURIER_SUB_WORKERS") {
            config.workers = value;
        }
        if let Some(value) = read_env::<u64>("COURIER_SUB_FLUSH_INTERVAL_MS") {
            config.flush_interval_ms = value;
        }
        if let Some(value) = read_env::<usize>("COURIER_SUB_MAX_ACK_BATCH") {
            config.max_ack_batch = value;
        }
        if let Some(value) = read_env::<u32>("COURIER_SUB_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = value;
        }
        if let Some(value) = read_env::<u64>("COURIER_SUB_RECONNECT_BASE_MS") {
            config.reconnect_base_ms = value;
        }
        if let Some(value) = read_env::<u64>("COURIER_SUB_RECONNECT_MAX_MS") {
            config.reconnect_max_ms = value;
        }
        config
    }

    pub fn validate(&self) -> Result<(), SubscriberError> {
        if self.streams == 0 {
            return Err(SubscriberError::Config("streams must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(SubscriberError::Config("workers must be at least 1".into()));
        }
        if self.stream_ack_deadline_secs == 0 {
            return Err(SubscriberError::Config(
                "stream_ack_deadline_secs must be positive".into(),
            ));
        }
        if self.max_outstanding_messages == 0 || self.max_outstanding_bytes == 0 {
            return Err(SubscriberError::Config(
                "flow control limits must be positive".into(),
            ));
        }
        if self.flush_interval_ms == 0 || self.max_ack_batch == 0 {
            return Err(SubscriberError::Config(
                "flush interval and ack batch must be positive".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub(crate) fn stream_ack_deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.stream_ack_deadline_secs))
    }

    /// Longest the lease renewal task sleeps when nothing is due sooner.
    pub(crate) fn renewal_interval(&self) -> Duration {
        self.stream_ack_deadline().mul_f64(RENEWAL_FRACTION)
    }

    /// Reconnect delay after `failures` consecutive failures (1-based).
    pub(crate) fn reconnect_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self
            .reconnect_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_ms.max(self.reconnect_base_ms));
        Duration::from_millis(delay)
    }

    /// Queued dispositions at which the flusher is woken early and receivers
    /// stop leasing new messages until a flush makes room.
    pub(crate) fn ack_buffer_capacity(&self) -> usize {
        self.max_ack_batch
    }
}

impl SubscriberConfigOverride {
    fn apply(&self, config: &mut SubscriberConfig) {
        if let Some(value) = self.streams
            && value > 0
        {
            config.streams = value;
        }
        if let Some(value) = self.stream_ack_deadline_secs
            && value > 0
        {
            config.stream_ack_deadline_secs = value;
        }
        if let Some(value) = self.max_outstanding_messages
            && value > 0
        {
            config.max_outstanding_messages = value;
        }
        if let Some(value) = self.max_outstanding_bytes
            && value > 0
        {
            config.max_outstanding_bytes = value;
        }
        if let Some(value) = self.workers
            && value > 0
        {
            config.workers = value;
        }
        if let Some(value) = self.flush_interval_ms
            && value > 0
        {
            config.flush_interval_ms = value;
        }
        if let Some(value) = self.max_ack_batch
            && value > 0
        {
            config.max_ack_batch = value;
        }
        if let Some(value) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = value;
        }
        if let Some(value) = self.reconnect_base_ms
            && value > 0
        {
            config.reconnect_base_ms = value;
        }
        if let Some(value) = self.reconnect_max_ms
            && value > 0
        {
            config.reconnect_max_ms = value;
        }
    }
}

fn read_env<T: std::str::FromStr + PartialOrd + Default>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn renewal_interval_is_fraction_of_deadline() {
        let config = SubscriberConfig::default();
        assert_eq!(config.renewal_interval(), Duration::from_secs(54));
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let config = SubscriberConfig {
            reconnect_base_ms: 100,
            reconnect_max_ms: 1000,
            ..SubscriberConfig::default()
        };
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(200));
        assert_eq!(config.reconnect_delay(4), Duration::from_millis(800));
        assert_eq!(config.reconnect_delay(5), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(64), Duration::from_millis(1000));
    }

    #[test]
    fn validate_rejects_zero_streams_and_workers() {
        let config = SubscriberConfig {
            streams: 0,
            ..SubscriberConfig::default()
        };
        assert!(matches!(config.validate(), Err(SubscriberError::Config(_))));
        let config = SubscriberConfig {
            workers: 0,
            ..SubscriberConfig::default()
        };
        assert!(matches!(config.validate(), Err(SubscriberError::Config(_))));
    }

    #[test]
    #[serial_test::serial]
    fn config_from_yaml_file() {
        let yaml = r#"
streams: 3
stream_ack_deadline_secs: 30
max_outstanding_messages: 50
max_outstanding_bytes: 4096
workers: 2
flush_interval_ms: 25
max_ack_batch: 10
max_reconnect_attempts: 0
reconnect_base_ms: 5
reconnect_max_ms: 50
"#;
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(yaml.as_bytes()).expect("write");
        let path = temp_file.path().to_str().expect("path");

        let config = SubscriberConfig::from_env_or_yaml(Some(path)).expect("config");
        assert_eq!(config.streams, 3);
        assert_eq!(config.stream_ack_deadline_secs, 30);
        assert_eq!(config.max_outstanding_messages, 50);
        assert_eq!(config.max_outstanding_bytes, 4096);
        assert_eq!(config.workers, 2);
        assert_eq!(config.flush_interval_ms, 25);
        assert_eq!(config.max_ack_batch, 10);
        assert_eq!(config.max_reconnect_attempts, 0);
        assert_eq!(config.reconnect_base_ms, 5);
        assert_eq!(config.reconnect_max_ms, 50);
    }

    #[test]
    #[serial_test::serial]
    fn config_yaml_overrides_ignore_zero_values() {
        let yaml = r#"
streams: 0
workers: 4
stream_ack_deadline_secs: 0
"#;
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(yaml.as_bytes()).expect("write");
        let path = temp_file.path().to_str().expect("path");

        let config = SubscriberConfig::from_env_or_yaml(Some(path)).expect("config");
        assert_eq!(config.streams, DEFAULT_STREAMS);
        assert_eq!(config.workers, 4);
        assert_eq!(
            config.stream_ack_deadline_secs,
            DEFAULT_STREAM_ACK_DEADLINE_SECS
        );
    }

    #[test]
    #[serial_test::serial]
    fn config_invalid_yaml_file_returns_error() {
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file
            .write_all(b"streams: [invalid\n")
            .expect("write");
        let path = temp_file.path().to_str().expect("path");
        assert!(SubscriberConfig::from_env_or_yaml(Some(path)).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn config_nonexistent_file_returns_error() {
        let result = SubscriberConfig::from_env_or_yaml(Some("/nonexistent/path/config.yaml"));
        assert!(result.is_err());
    }

    #[test]
    #[serial_test::serial]
    fn config_from_env_reads_overrides() {
        struct EnvGuard;

        impl Drop for EnvGuard {
            fn drop(&mut self) {
                unsafe {
                    std::env::remove_var("COURIER_SUB_STREAMS");
                    std::env::remove_var("COURIER_SUB_WORKERS");
                    std::env::remove_var("COURIER_SUB_ACK_DEADLINE_SECS");
                }
            }
        }

        let _env_guard = EnvGuard;
        unsafe {
            std::env::set_var("COURIER_SUB_STREAMS", "4");
            std::env::set_var("COURIER_SUB_WORKERS", "not-a-number");
            std::env::set_var("COURIER_SUB_ACK_DEADLINE_SECS", "0");
        }
        let config = SubscriberConfig::from_env();
        assert_eq!(config.streams, 4);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(
            config.stream_ack_deadline_secs,
            DEFAULT_STREAM_ACK_DEADLINE_SECS
        );
    }
}
