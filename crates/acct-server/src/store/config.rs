//! Store connection configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Valkey/Redis connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValkeyConfig {
    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// AUTH password; empty means no authentication
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Dial timeout in milliseconds (default: 3000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-command timeout in milliseconds (default: 2000)
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Number of multiplexed connections (default: 10)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connections established at construction (default: 2)
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// Retries after a failed command (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay in milliseconds (default: 100)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound of the doubling retry delay in milliseconds (default: 1000)
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_pool_size() -> usize {
    10
}

fn default_min_idle() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    1000
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            pool_size: default_pool_size(),
            min_idle: default_min_idle(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

impl ValkeyConfig {
    /// Create a configuration for the given server with default tuning
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the AUTH password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Select the logical database
    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Set the connection pool size
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set how many connections are opened eagerly
    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get command timeout as Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based), doubling up to the cap
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        let delay = self.retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valkey_config_defaults() {
        let config = ValkeyConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.command_timeout(), Duration::from_secs(2));
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.min_idle, 2);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_retry_backoff_doubles_to_cap() {
        let config = ValkeyConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(1), Duration::from_millis(200));
        assert_eq!(config.retry_delay(2), Duration::from_millis(400));
        assert_eq!(config.retry_delay(3), Duration::from_millis(800));
        assert_eq!(config.retry_delay(4), Duration::from_secs(1));
        assert_eq!(config.retry_delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_valkey_config_builder() {
        let config = ValkeyConfig::new("valkey.internal", 6380)
            .with_password("hunter2")
            .with_db(3)
            .with_pool_size(4)
            .with_min_idle(1)
            .with_command_timeout(Duration::from_millis(500))
            .with_max_retries(0);

        assert_eq!(config.host, "valkey.internal");
        assert_eq!(config.port, 6380);
        assert_eq!(config.db, 3);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.min_idle, 1);
        assert_eq!(config.command_timeout_ms, 500);
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn test_password_not_serialized() {
        let config = ValkeyConfig::default().with_password("hunter2");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
