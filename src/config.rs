use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::backoff::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    /// Wildcard filter under the fixed namespace, e.g. `farm/sensors/#`.
    pub topic_filter: String,

    pub sink_base_url: String,
    pub sink_path_prefix: String,
    pub sink_auth_token: Option<String>,
    pub sink_timeout_ms: u64,

    pub connect_max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,

    pub write_max_attempts: u32,
    pub write_workers: usize,
    pub max_pending_writes: usize,
    pub dead_letter_capacity: usize,
    pub stop_grace_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingOrInvalid(name.to_string()))
}

fn parsed<T: FromStr>(name: &str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(format!("{name} must be a valid number")))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let config = Self {
            mqtt_host: required("MQTT_HOST")?,
            mqtt_port: parsed("MQTT_PORT", "1883")?,
            mqtt_username: env::var("MQTT_USERNAME").unwrap_or_default(),
            mqtt_password: env::var("MQTT_PASSWORD").unwrap_or_default(),
            topic_filter: env::var("MQTT_TOPIC_FILTER")
                .unwrap_or_else(|_| "farm/sensors/#".to_string()),

            sink_base_url: required("SINK_BASE_URL")?,
            sink_path_prefix: env::var("SINK_PATH_PREFIX")
                .unwrap_or_else(|_| "sensors".to_string()),
            sink_auth_token: env::var("SINK_AUTH_TOKEN").ok(),
            sink_timeout_ms: parsed("SINK_TIMEOUT_MS", "10000")?,

            connect_max_retries: parsed("CONNECT_MAX_RETRIES", "8")?,
            retry_base_ms: parsed("RETRY_BASE_MS", "1000")?,
            retry_cap_ms: parsed("RETRY_CAP_MS", "30000")?,

            write_max_attempts: parsed("WRITE_MAX_ATTEMPTS", "5")?,
            write_workers: parsed("WRITE_WORKERS", "4")?,
            max_pending_writes: parsed("MAX_PENDING_WRITES", "100")?,
            dead_letter_capacity: parsed("DEAD_LETTER_CAPACITY", "1000")?,
            stop_grace_ms: parsed("STOP_GRACE_MS", "5000")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate ranges before anything connects; these are the only fatal
    /// errors the relay ever reports.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const MIN_RETRY_MS: u64 = 100;
        const MAX_RETRY_MS: u64 = 600_000;

        if !(MIN_RETRY_MS..=MAX_RETRY_MS).contains(&self.retry_base_ms) {
            return Err(ConfigError::ParsingError(format!(
                "RETRY_BASE_MS must be between {MIN_RETRY_MS} and {MAX_RETRY_MS} ms"
            )));
        }
        if self.retry_cap_ms < self.retry_base_ms || self.retry_cap_ms > MAX_RETRY_MS {
            return Err(ConfigError::ParsingError(format!(
                "RETRY_CAP_MS must be between RETRY_BASE_MS and {MAX_RETRY_MS} ms"
            )));
        }
        if self.connect_max_retries == 0 || self.write_max_attempts == 0 {
            return Err(ConfigError::ParsingError(
                "CONNECT_MAX_RETRIES and WRITE_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.write_workers == 0 || self.write_workers > self.max_pending_writes {
            return Err(ConfigError::ParsingError(
                "WRITE_WORKERS must be between 1 and MAX_PENDING_WRITES".to_string(),
            ));
        }
        if self.dead_letter_capacity == 0 {
            return Err(ConfigError::ParsingError(
                "DEAD_LETTER_CAPACITY must be at least 1".to_string(),
            ));
        }
        if self.topic_filter.is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_TOPIC_FILTER".to_string()));
        }
        if reqwest::Url::parse(&self.sink_base_url).is_err() {
            return Err(ConfigError::MissingOrInvalid("SINK_BASE_URL".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_cap_ms),
        )
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            topic_filter: "farm/sensors/#".to_string(),
            sink_base_url: "https://farm-rtdb.example.com".to_string(),
            sink_path_prefix: "sensors".to_string(),
            sink_auth_token: None,
            sink_timeout_ms: 10_000,
            connect_max_retries: 8,
            retry_base_ms: 1_000,
            retry_cap_ms: 30_000,
            write_max_attempts: 5,
            write_workers: 4,
            max_pending_writes: 100,
            dead_letter_capacity: 1_000,
            stop_grace_ms: 5_000,
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_retry_interval() {
        let mut config = valid_config();
        config.retry_base_ms = 10;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.retry_cap_ms = 500; // below the base
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers_and_oversized_pools() {
        let mut config = valid_config();
        config.write_workers = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.write_workers = 200;
        config.max_pending_writes = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unparseable_sink_url() {
        let mut config = valid_config();
        config.sink_base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }
}
