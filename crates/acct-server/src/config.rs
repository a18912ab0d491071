//! Environment configuration

use crate::store::ValkeyConfig;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr, ToSocketAddrs};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Newline-delimited JSON on stdout
    #[default]
    Json,
    /// Human-readable lines for local development
    Pretty,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub redis_host: String,
    pub redis_port: u16,
    #[serde(skip_serializing)]
    pub redis_password: String,
    #[serde(default)]
    pub redis_db: i64,

    /// UDP bind address as configured (`host:port`, `:port`, `[v6]:port`)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Fallback shared secret for clients without a `client:<ip>` entry
    #[serde(default, skip_serializing)]
    pub radius_secret: Option<String>,

    /// Mask IMSIs in log output (default: true)
    #[serde(default = "default_mask_imsi")]
    pub log_mask_imsi: bool,

    /// Default level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// JSON-lines audit file, in addition to stdout
    #[serde(default)]
    pub audit_log_path: Option<String>,
}

fn default_listen_addr() -> String {
    ":1813".to_string()
}

fn default_mask_imsi() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));
        let optional = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let redis_host = required("REDIS_HOST")?;
        let port = required("REDIS_PORT")?;
        let redis_port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: "REDIS_PORT",
            value: port.clone(),
        })?;
        let redis_password = required("REDIS_PASS")?;

        let redis_db = match optional("REDIS_DB") {
            Some(db) => db.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "REDIS_DB",
                value: db.clone(),
            })?,
            None => 0,
        };

        let log_mask_imsi = match optional("LOG_MASK_IMSI") {
            Some(value) => parse_bool("LOG_MASK_IMSI", &value)?,
            None => default_mask_imsi(),
        };

        let log_format = match optional("LOG_FORMAT").as_deref().map(str::to_ascii_lowercase) {
            None => LogFormat::Json,
            Some(f) if f == "json" => LogFormat::Json,
            Some(f) if f == "pretty" || f == "text" => LogFormat::Pretty,
            Some(f) => {
                return Err(ConfigError::InvalidValue {
                    name: "LOG_FORMAT",
                    value: f,
                })
            }
        };

        let config = Config {
            redis_host,
            redis_port,
            redis_password,
            redis_db,
            listen_addr: optional("LISTEN_ADDR").unwrap_or_else(default_listen_addr),
            radius_secret: optional("RADIUS_SECRET"),
            log_mask_imsi,
            log_level: optional("LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format,
            audit_log_path: optional("AUDIT_LOG_PATH"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_host.trim().is_empty() {
            return Err(ConfigError::Invalid("REDIS_HOST cannot be empty".to_string()));
        }

        if self.redis_port == 0 {
            return Err(ConfigError::Invalid("REDIS_PORT cannot be 0".to_string()));
        }

        self.listen_socket_addr()?;

        Ok(())
    }

    /// Resolve the UDP bind address
    ///
    /// `:1813` binds every interface, IPv4 and IPv6.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            name: "LISTEN_ADDR",
            value: self.listen_addr.clone(),
        };

        let addr = self.listen_addr.trim();
        if let Some(port) = addr.strip_prefix(':') {
            let port: u16 = port.parse().map_err(|_| invalid())?;
            return Ok(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)));
        }
        if let Ok(addr) = addr.parse::<SocketAddr>() {
            return Ok(addr);
        }

        addr.to_socket_addrs()
            .map_err(|_| invalid())?
            .next()
            .ok_or_else(invalid)
    }

    /// Store connection parameters
    pub fn valkey_config(&self) -> ValkeyConfig {
        ValkeyConfig::new(self.redis_host.clone(), self.redis_port)
            .with_password(self.redis_password.clone())
            .with_db(self.redis_db)
    }

    /// Fallback secret as bytes
    pub fn fallback_secret(&self) -> Option<Vec<u8>> {
        self.radius_secret.as_ref().map(|s| s.as_bytes().to_vec())
    }
}
