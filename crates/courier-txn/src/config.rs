// Retry defaults plus env/YAML overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub const DEFAULT_BASE_DELAY_MS: u64 = 1300;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Backoff and deadline settings for `TransactionRunner`.
///
/// ```
/// use courier_txn::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::default();
/// assert_eq!(config.base_delay(), Duration::from_millis(1300));
/// assert_eq!(config.timeout(), Duration::from_secs(120));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    // First backoff delay when the server gives no hint.
    pub base_delay_ms: u64,
    // Growth factor per consecutive abort.
    pub multiplier: f64,
    // Used by `run_with_default_timeout`.
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct RetryConfigOverride {
    base_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    timeout_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl RetryConfig {
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_TXN_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read txn config: {path}"))?;
            let override_cfg: RetryConfigOverride =
                serde_yaml::from_str(&contents).context("parse txn config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = std::env::var("COURIER_TXN_BASE_DELAY_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
        {
            config.base_delay_ms = value;
        }
        if let Some(value) = std::env::var("COURIER_TXN_BACKOFF_MULTIPLIER")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| valid_multiplier(*value))
        {
            config.multiplier = value;
        }
        if let Some(value) = std::env::var("COURIER_TXN_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
        {
            config.timeout_secs = value;
        }
        config
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RetryConfigOverride {
    fn apply(&self, config: &mut RetryConfig) {
        if let Some(value) = self.base_delay_ms
            && value > 0
        {
            config.base_delay_ms = value;
        }
        if let Some(value) = self.multiplier
            && valid_multiplier(value)
        {
            config.multiplier = value;
        }
        if let Some(value) = self.timeout_secs
            && value > 0
        {
            config.timeout_secs = value;
        }
    }
}

fn valid_multiplier(value: f64) -> bool {
    value.is_finite() && value >= 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial_test::serial]
    fn config_from_yaml_file() {
        let yaml = r#"
base_delay_ms: 500
multiplier: 2.0
timeout_secs: 30
"#;
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(yaml.as_bytes()).expect("write");
        let path = temp_file.path().to_str().expect("path");

        let config = RetryConfig::from_env_or_yaml(Some(path)).expect("config");
        assert_eq!(config.base_delay(), Duration::from_millis(500));
        assert_eq!(config.multiplier, 2.0);
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    #[serial_test::serial]
    fn config_yaml_ignores_zero_and_shrinking_values() {
        let yaml = r#"
base_delay_ms: 0
multiplier: 0.5
timeout_secs: 0
"#;
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(yaml.as_bytes()).expect("write");
        let path = temp_file.path().to_str().expect("path");

        let config = RetryConfig::from_env_or_yaml(Some(path)).expect("config");
        assert_eq!(config, RetryConfig::default());
    }

    #[test]
    #[serial_test::serial]
    fn config_invalid_yaml_file_returns_error() {
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(b"multiplier: [1\n").expect("write");
        let path = temp_file.path().to_str().expect("path");
        assert!(RetryConfig::from_env_or_yaml(Some(path)).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn config_from_env_reads_overrides() {
        struct EnvGuard;

        impl Drop for EnvGuard {
            fn drop(&mut self) {
                unsafe {
                    std::env::remove_var("COURIER_TXN_BASE_DELAY_MS");
                    std::env::remove_var("COURIER_TXN_BACKOFF_MULTIPLIER");
                    std::env::remove_var("COURIER_TXN_TIMEOUT_SECS");
                }
            }
        }

        let _env_guard = EnvGuard;
        unsafe {
            std::env::set_var("COURIER_TXN_BASE_DELAY_MS", "250");
            std::env::set_var("COURIER_TXN_BACKOFF_MULTIPLIER", "nan");
            std::env::set_var("COURIER_TXN_TIMEOUT_SECS", "45");
        }
        let config = RetryConfig::from_env();
        assert_eq!(config.base_delay_ms, 250);
        assert_eq!(config.multiplier, DEFAULT_BACKOFF_MULTIPLIER);
        assert_eq!(config.timeout_secs, 45);
    }
}
