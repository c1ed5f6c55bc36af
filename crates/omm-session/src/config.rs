// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session configuration.
//!
//! One [`SessionConfig`] is passed explicitly to every component that
//! needs it; nothing reads ambient global state.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::Credentials;
use crate::transport::{Compression, ConnectParams, ProtocolVersion};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// HTTP proxy used to tunnel the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            domain: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Credentials for the authentication schemes.
    pub fn credentials(&self) -> Credentials {
        let mut creds = Credentials::new();
        if let Some(user) = &self.username {
            creds.insert(crate::proxy::USERNAME, user.clone());
        }
        if let Some(pass) = &self.password {
            creds.insert(crate::proxy::PASSWORD, pass.clone());
        }
        if let Some(domain) = &self.domain {
            creds.insert(crate::proxy::DOMAIN, domain.clone());
        }
        creds
    }
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Provider host name or address
    #[serde(default = "default_host")]
    pub host: String,

    /// Provider port (default: 14002)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Ping timeout proposed during the handshake (seconds)
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u16,

    /// Largest message accepted for a single write (bytes)
    #[serde(default = "default_max_fragment_size")]
    pub max_fragment_size: u32,

    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    #[serde(default)]
    pub compression: Compression,

    /// First reconnect delay (milliseconds)
    #[serde(default = "default_reconnect_min_delay")]
    pub reconnect_min_delay_ms: u64,

    /// Reconnect delay ceiling (milliseconds)
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,

    /// Reconnect attempts before giving up (-1 = unlimited)
    #[serde(default = "default_reconnect_attempt_limit")]
    pub reconnect_attempt_limit: i32,

    /// Drop watchlist items on disconnect instead of replaying them
    #[serde(default)]
    pub remove_items_on_disconnect: bool,

    /// First stream id handed out to consumer item requests
    #[serde(default = "default_start_stream_id")]
    pub start_stream_id: i32,

    /// Watchlist capacity (0 = unbounded)
    #[serde(default)]
    pub max_items: usize,

    /// Login user name sent by consumers
    #[serde(default = "default_user_name")]
    pub user_name: String,

    /// Client sessions a provider serves
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_one")]
    pub login_slots_per_client: usize,

    #[serde(default = "default_one")]
    pub directory_slots_per_client: usize,

    /// Two per client: field dictionary and enum type dictionary
    #[serde(default = "default_dictionary_slots")]
    pub dictionary_slots_per_client: usize,

    /// Dictionary names a provider can serve / a consumer downloads
    #[serde(default = "default_dictionary_names")]
    pub dictionary_names: Vec<String>,

    /// Negotiate RTT monitoring on the login stream
    #[serde(default)]
    pub rtt_enabled: bool,

    /// RTT probe interval (milliseconds)
    #[serde(default = "default_rtt_interval")]
    pub rtt_interval_ms: u64,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

fn default_host() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    14002
}

fn default_ping_timeout() -> u16 {
    60
}

fn default_max_fragment_size() -> u32 {
    6144
}

fn default_reconnect_min_delay() -> u64 {
    1000
}

fn default_reconnect_max_delay() -> u64 {
    5000
}

fn default_reconnect_attempt_limit() -> i32 {
    -1
}

fn default_start_stream_id() -> i32 {
    5
}

fn default_user_name() -> String {
    "omm-user".into()
}

fn default_max_clients() -> usize {
    10
}

fn default_one() -> usize {
    1
}

fn default_dictionary_slots() -> usize {
    2
}

fn default_dictionary_names() -> Vec<String> {
    vec![
        crate::registry::FIELD_DICTIONARY_NAME.into(),
        crate::registry::ENUM_DICTIONARY_NAME.into(),
    ]
}

fn default_rtt_interval() -> u64 {
    5000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ping_timeout_secs: default_ping_timeout(),
            max_fragment_size: default_max_fragment_size(),
            protocol_version: ProtocolVersion::default(),
            compression: Compression::default(),
            reconnect_min_delay_ms: default_reconnect_min_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            reconnect_attempt_limit: default_reconnect_attempt_limit(),
            remove_items_on_disconnect: false,
            start_stream_id: default_start_stream_id(),
            max_items: 0,
            user_name: default_user_name(),
            max_clients: default_max_clients(),
            login_slots_per_client: default_one(),
            directory_slots_per_client: default_one(),
            dictionary_slots_per_client: default_dictionary_slots(),
            dictionary_names: default_dictionary_names(),
            rtt_enabled: false,
            rtt_interval_ms: default_rtt_interval(),
            proxy: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `host:port` of the provider.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn rtt_interval(&self) -> Duration {
        Duration::from_millis(self.rtt_interval_ms)
    }

    /// Parameters this side proposes (consumer) or offers (provider).
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            version: self.protocol_version,
            ping_timeout_secs: self.ping_timeout_secs,
            compression: self.compression,
            max_fragment_size: self.max_fragment_size,
        }
    }

    pub fn with_target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_rtt(mut self, enabled: bool) -> Self {
        self.rtt_enabled = enabled;
        self
    }

    pub fn with_remove_items_on_disconnect(mut self, remove: bool) -> Self {
        self.remove_items_on_disconnect = remove;
        self
    }

    pub fn with_start_stream_id(mut self, stream_id: i32) -> Self {
        self.start_stream_id = stream_id;
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self
    }

    pub fn with_reconnect(mut self, min_ms: u64, max_ms: u64, attempt_limit: i32) -> Self {
        self.reconnect_min_delay_ms = min_ms;
        self.reconnect_max_delay_ms = max_ms;
        self.reconnect_attempt_limit = attempt_limit;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".into()));
        }
        if self.ping_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ping_timeout_secs cannot be 0".into()));
        }
        if self.max_fragment_size == 0 {
            return Err(ConfigError::Invalid("max_fragment_size cannot be 0".into()));
        }
        if self.reconnect_min_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect_min_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                self.reconnect_min_delay_ms, self.reconnect_max_delay_ms
            )));
        }
        let first_item = crate::session::FIRST_DICTIONARY_STREAM_ID
            + self.dictionary_names.len() as i32;
        if self.start_stream_id < first_item {
            return Err(ConfigError::Invalid(format!(
                "start_stream_id must be at least {} (ids below are administrative)",
                first_item
            )));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients cannot be 0".into()));
        }
        if self.login_slots_per_client == 0
            || self.directory_slots_per_client == 0
            || self.dictionary_slots_per_client == 0
        {
            return Err(ConfigError::Invalid(
                "request slots per client cannot be 0".into(),
            ));
        }
        if self.rtt_enabled && self.rtt_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "rtt_interval_ms cannot be 0 when RTT is enabled".into(),
            ));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.is_empty() || proxy.port == 0 {
                return Err(ConfigError::Invalid(
                    "proxy host and port are required".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.target(), "localhost:14002");
        assert_eq!(config.dictionary_names, vec!["RWFFld", "RWFEnum"]);
        assert_eq!(config.rtt_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"host": "feed1", "rtt_enabled": true}"#).unwrap();
        assert_eq!(config.host, "feed1");
        assert_eq!(config.port, 14002);
        assert!(config.rtt_enabled);
        assert_eq!(config.reconnect_attempt_limit, -1);
        assert_eq!(config.compression, Compression::None);
    }

    #[test]
    fn test_invalid_values() {
        let config = SessionConfig::default().with_reconnect(5000, 1000, 3);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SessionConfig::default().with_start_stream_id(0);
        assert!(config.validate().is_err());

        // login, directory and two dictionaries occupy 1..=4
        let config = SessionConfig::default().with_start_stream_id(4);
        assert!(config.validate().is_err());

        let config = SessionConfig::default().with_proxy(ProxyConfig::new("", 8080));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let config = SessionConfig::default()
            .with_target("feed2", 14003)
            .with_proxy(ProxyConfig::new("proxy", 3128).with_credentials("u", "p"))
            .with_remove_items_on_disconnect(true);
        config.to_file(&path).unwrap();

        let loaded = SessionConfig::from_file(&path).unwrap();
        assert_eq!(loaded.target(), "feed2:14003");
        assert_eq!(loaded.proxy, config.proxy);
        assert!(loaded.remove_items_on_disconnect);
    }

    #[test]
    fn test_from_file_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            SessionConfig::from_file(&path),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_proxy_credentials() {
        let proxy = ProxyConfig::new("proxy", 3128).with_credentials("user", "pass");
        let creds = proxy.credentials();
        assert_eq!(creds.get(crate::proxy::USERNAME), Some("user"));
        assert_eq!(creds.get(crate::proxy::DOMAIN), None);
        assert_eq!(proxy.address(), "proxy:3128");
    }
}
