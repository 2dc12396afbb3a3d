//! Configuration loading for the sync client
//!
//! Every field has a default, so an empty file (or none at all) yields a
//! working local setup.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::clock::MAX_DELAY;
use crate::connection::ConnectionConfig;
use crate::error::SyncError;

pub const CONFIG_ENV: &str = "POWERDESK_CONFIG";
pub const TOKEN_ENV: &str = "POWERDESK_TOKEN";

/// Upper bound for every `*_ms` setting
pub const MAX_DELAY_MS: u64 = MAX_DELAY.as_millis() as u64;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub connection: ConnectionSection,
    pub cache: CacheSection,
    pub endpoints: EndpointsSection,
    pub credential: CredentialSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSection {
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub pong_timeout_ms: Option<u64>,
    pub event_buffer: usize,
    pub token_param: String,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: 5,
            pong_timeout_ms: None,
            event_buffer: 1024,
            token_param: "token".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub ttl_ms: u64,
    /// Defaults to half the TTL
    pub stale_time_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    /// Background refresh period for market summaries
    pub refetch_interval_ms: Option<u64>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            stale_time_ms: None,
            sweep_interval_ms: None,
            refetch_interval_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointsSection {
    pub api_base_url: String,
    pub market_ws_url: String,
    pub orders_ws_url: String,
    pub notifications_ws_url: String,
    pub regions: Vec<String>,
}

impl Default for EndpointsSection {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            market_ws_url: "ws://localhost:8080/ws/market".to_string(),
            orders_ws_url: "ws://localhost:8080/ws/orders".to_string(),
            notifications_ws_url: "ws://localhost:8080/ws/notifications".to_string(),
            regions: vec!["de".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialSection {
    pub token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl SyncConfig {
    /// `--config <path>`, then `POWERDESK_CONFIG`, then defaults.
    /// `POWERDESK_TOKEN` overrides the configured credential.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_path_from_args().or_else(config_path_from_env) {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.override_token(std::env::var(TOKEN_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn override_token(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.credential.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;
        if connection.heartbeat_interval_ms == 0 {
            return Err(invalid("connection.heartbeat_interval_ms", "must be > 0"));
        }
        if connection.reconnect_interval_ms == 0 {
            return Err(invalid("connection.reconnect_interval_ms", "must be > 0"));
        }
        if connection.pong_timeout_ms == Some(0) {
            return Err(invalid("connection.pong_timeout_ms", "must be > 0 when set"));
        }
        if connection.event_buffer == 0 {
            return Err(invalid("connection.event_buffer", "must be > 0"));
        }
        if connection.token_param.trim().is_empty() {
            return Err(invalid("connection.token_param", "must not be empty"));
        }
        if self.cache.ttl_ms == 0 {
            return Err(invalid("cache.ttl_ms", "must be > 0"));
        }
        if matches!(self.cache.stale_time_ms, Some(stale) if stale > self.cache.ttl_ms) {
            return Err(invalid("cache.stale_time_ms", "must not exceed ttl_ms"));
        }
        if self.cache.sweep_interval_ms == Some(0) {
            return Err(invalid("cache.sweep_interval_ms", "must be > 0 when set"));
        }
        if self.cache.refetch_interval_ms == Some(0) {
            return Err(invalid("cache.refetch_interval_ms", "must be > 0 when set"));
        }

        for (field, value) in [
            ("connection.heartbeat_interval_ms", Some(connection.heartbeat_interval_ms)),
            ("connection.reconnect_interval_ms", Some(connection.reconnect_interval_ms)),
            ("connection.pong_timeout_ms", connection.pong_timeout_ms),
            ("cache.ttl_ms", Some(self.cache.ttl_ms)),
            ("cache.stale_time_ms", self.cache.stale_time_ms),
            ("cache.sweep_interval_ms", self.cache.sweep_interval_ms),
            ("cache.refetch_interval_ms", self.cache.refetch_interval_ms),
        ] {
            if matches!(value, Some(ms) if ms > MAX_DELAY_MS) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("must not exceed {} ms", MAX_DELAY_MS),
                });
            }
        }

        check_url("endpoints.api_base_url", &self.endpoints.api_base_url, &["http", "https"])?;
        for (field, url) in [
            ("endpoints.market_ws_url", &self.endpoints.market_ws_url),
            ("endpoints.orders_ws_url", &self.endpoints.orders_ws_url),
            (
                "endpoints.notifications_ws_url",
                &self.endpoints.notifications_ws_url,
            ),
        ] {
            check_url(field, url, &["ws", "wss"])?;
        }
        if self.endpoints.regions.iter().any(|r| r.trim().is_empty()) {
            return Err(invalid("endpoints.regions", "region names must not be empty"));
        }
        Ok(())
    }

    /// Connection settings for the channel at `url`
    pub fn connection_config(&self, url: &str) -> ConnectionConfig {
        let section = &self.connection;
        ConnectionConfig {
            url: url.to_string(),
            heartbeat_interval: Duration::from_millis(section.heartbeat_interval_ms),
            reconnect_interval: Duration::from_millis(section.reconnect_interval_ms),
            max_reconnect_attempts: section.max_reconnect_attempts,
            pong_timeout: section.pong_timeout_ms.map(Duration::from_millis),
            event_buffer: section.event_buffer,
            token_param: section.token_param.clone(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.cache.ttl_ms)
    }

    pub fn stale_time(&self) -> Option<Duration> {
        self.cache.stale_time_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.cache.sweep_interval_ms.map(Duration::from_millis)
    }

    pub fn refetch_interval(&self) -> Option<Duration> {
        self.cache.refetch_interval_ms.map(Duration::from_millis)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn check_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidValue {
        field,
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("scheme must be one of {:?}", schemes),
        });
    }
    Ok(())
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
