//! Configuration management for the LanChat peer.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/lanchat/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::{ChatKey, DISCOVERY_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("discovery_port must be between 1 and 65535, got {0}")]
    InvalidDiscoveryPort(u16),

    #[error("bind_host is not a valid IP address: {0}")]
    InvalidBindHost(String),

    #[error("broadcast_address is not a valid IPv4 address: {0}")]
    InvalidBroadcastAddress(String),

    #[error(
        "username must be non-blank, at most 64 bytes, without line breaks or surrounding whitespace, got {0:?}"
    )]
    InvalidUsername(String),

    #[error("shared_key is invalid: {0}")]
    InvalidSharedKey(String),

    #[error("set either shared_key or passphrase, not both")]
    ConflictingKeys,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Longest accepted username, in bytes.
pub const MAX_USERNAME_LEN: usize = 64;

/// Main configuration structure for a LanChat peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Who this peer announces itself as.
    pub identity: IdentityConfig,

    /// Sockets and addresses.
    pub network: NetworkConfig,

    /// Message sealing key.
    pub security: SecurityConfig,

    /// Log output.
    pub logging: LoggingConfig,
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct IdentityConfig {
    /// Display name. Empty means ask the operator at startup.
    pub username: String,
}

/// Network configuration for discovery and chat connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the connection server binds to.
    pub bind_host: String,

    /// TCP port for the connection server (0 = random high port).
    pub listen_port: u16,

    /// UDP port used for discovery broadcasts.
    pub discovery_port: u16,

    /// Destination address of discovery broadcasts.
    pub broadcast_address: String,
}

/// Security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// URL-safe base64 shared key (see `lanchat keygen`).
    pub shared_key: String,

    /// Passphrase to derive the shared key from, as an alternative.
    pub passphrase: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Log file. Unset means stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            listen_port: 0,
            discovery_port: DISCOVERY_PORT,
            broadcast_address: "255.255.255.255".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanchat")
        .join("config.toml")
}

impl NetworkConfig {
    /// Parsed bind address.
    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_host
            .parse()
            .map_err(|_| ConfigError::InvalidBindHost(self.bind_host.clone()))
    }

    /// Parsed broadcast destination.
    pub fn broadcast_ip(&self) -> Result<IpAddr, ConfigError> {
        match self.broadcast_address.parse::<IpAddr>() {
            Ok(ip @ IpAddr::V4(_)) => Ok(ip),
            _ => Err(ConfigError::InvalidBroadcastAddress(
                self.broadcast_address.clone(),
            )),
        }
    }
}

impl SecurityConfig {
    /// Resolves the configured key, if any.
    pub fn chat_key(&self) -> Result<Option<ChatKey>, ConfigError> {
        let key = self.shared_key.trim();
        let passphrase = self.passphrase.as_str();
        match (key.is_empty(), passphrase.is_empty()) {
            (false, false) => Err(ConfigError::ConflictingKeys),
            (false, true) => ChatKey::from_base64(key)
                .map(Some)
                .map_err(|e| ConfigError::InvalidSharedKey(e.to_string())),
            (true, false) => Ok(Some(ChatKey::from_passphrase(passphrase))),
            (true, true) => Ok(None),
        }
    }
}

/// Checks a username against what the request frame can carry.
///
/// Request frames trim the name, so a name with surrounding whitespace would
/// not match its own announcement.
pub fn validate_username(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty()
        || name.trim() != name
        || name.len() > MAX_USERNAME_LEN
        || name.contains(['\n', '\r'])
    {
        return Err(ConfigError::InvalidUsername(name.to_string()));
    }
    Ok(())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - LANCHAT_USERNAME: Override the announced name
    /// - LANCHAT_LISTEN_PORT: Override the connection server port
    /// - LANCHAT_DISCOVERY_PORT: Override the discovery port
    /// - LANCHAT_SHARED_KEY: Override the shared key (clears any passphrase)
    /// - LANCHAT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(name) = non_empty_env("LANCHAT_USERNAME") {
            tracing::info!("Overriding username from environment: {}", name);
            self.identity.username = name;
        }

        if let Some(port) = non_empty_env("LANCHAT_LISTEN_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.network.listen_port = p,
                Err(_) => tracing::warn!("Ignoring invalid LANCHAT_LISTEN_PORT: {}", port),
            }
        }

        if let Some(port) = non_empty_env("LANCHAT_DISCOVERY_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.network.discovery_port = p,
                Err(_) => tracing::warn!("Ignoring invalid LANCHAT_DISCOVERY_PORT: {}", port),
            }
        }

        if let Some(key) = non_empty_env("LANCHAT_SHARED_KEY") {
            tracing::info!("Using shared key from environment");
            self.security.shared_key = key;
            self.security.passphrase.clear();
        }

        if let Some(level) = non_empty_env("LANCHAT_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.logging.level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.discovery_port == 0 {
            return Err(ConfigError::InvalidDiscoveryPort(0));
        }

        self.network.bind_ip()?;
        self.network.broadcast_ip()?;
        // Blank means "ask at startup"
        let username = self.identity.username.trim();
        if !username.is_empty() {
            validate_username(username)?;
        }
        self.security.chat_key()?;

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "LANCHAT_USERNAME",
        "LANCHAT_LISTEN_PORT",
        "LANCHAT_DISCOVERY_PORT",
        "LANCHAT_SHARED_KEY",
        "LANCHAT_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.identity.username, "");
        assert_eq!(config.network.bind_host, "0.0.0.0");
        assert_eq!(config.network.listen_port, 0);
        assert_eq!(config.network.discovery_port, 54545);
        assert_eq!(config.network.broadcast_address, "255.255.255.255");
        assert!(config.security.shared_key.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[identity]
username = "alice"

[network]
listen_port = 50001
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.identity.username, "alice");
        assert_eq!(config.network.listen_port, 50001);
        assert_eq!(config.network.discovery_port, 54545);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[identity]
username = "bob"

[network]
bind_host = "192.168.1.20"
listen_port = 50002
discovery_port = 40000
broadcast_address = "192.168.1.255"

[security]
passphrase = "open sesame"

[logging]
level = "debug"
file = "/tmp/lanchat.log"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.identity.username, "bob");
        assert_eq!(config.network.bind_host, "192.168.1.20");
        assert_eq!(config.network.listen_port, 50002);
        assert_eq!(config.network.discovery_port, 40000);
        assert_eq!(config.network.broadcast_address, "192.168.1.255");
        assert_eq!(config.security.passphrase, "open sesame");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/lanchat.log")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[network
listen_port = 1
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[network]
listen_port = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.identity.username = "carol".to_string();
        original.network.listen_port = 51000;
        original.security.shared_key = ChatKey::generate().to_base64();
        original.logging.file = Some(PathBuf::from("/var/log/lanchat.log"));

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_to_toml_sections() {
        let toml = Config::default().to_toml().unwrap();
        assert!(toml.contains("[identity]"));
        assert!(toml.contains("[network]"));
        assert!(toml.contains("[security]"));
        assert!(toml.contains("[logging]"));
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.identity.username = "dave".to_string();
        original.logging.level = "warn".to_string();

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "this is not [valid toml").unwrap();

        let err = Config::load(&config_path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("lanchat/config.toml"));
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_discovery_port_zero() {
        let mut config = Config::default();
        config.network.discovery_port = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDiscoveryPort(0))
        );
    }

    #[test]
    fn test_validate_bind_host() {
        let mut config = Config::default();
        config.network.bind_host = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindHost("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_broadcast_address_must_be_ipv4() {
        let mut config = Config::default();
        config.network.broadcast_address = "ff02::1".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBroadcastAddress(_))
        ));
    }

    #[test]
    fn test_validate_username() {
        let mut config = Config::default();
        config.identity.username = "eve\nmallory".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUsername(_))
        ));

        config.identity.username = "x".repeat(MAX_USERNAME_LEN + 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUsername(_))
        ));

        config.identity.username = "x".repeat(MAX_USERNAME_LEN);
        assert!(config.validate().is_ok());

        // Unset, and padding around a configured name, are fine in the file
        config.identity.username = "   ".to_string();
        assert!(config.validate().is_ok());
        config.identity.username = " alice ".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_username_rejects_blank_and_padded() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("alice smith").is_ok());

        for name in ["", "   ", "\t", " alice", "alice ", "\talice"] {
            assert!(
                matches!(validate_username(name), Err(ConfigError::InvalidUsername(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_validate_shared_key() {
        let mut config = Config::default();
        config.security.shared_key = "too-short".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSharedKey(_))
        ));

        config.security.shared_key = ChatKey::generate().to_base64();
        assert!(config.validate().is_ok());

        config.security.passphrase = "also set".to_string();
        assert_eq!(config.validate(), Err(ConfigError::ConflictingKeys));
    }

    #[test]
    fn test_chat_key_resolution() {
        let mut security = SecurityConfig::default();
        assert!(security.chat_key().unwrap().is_none());

        security.passphrase = "hunter2".to_string();
        assert_eq!(
            security.chat_key().unwrap(),
            Some(ChatKey::from_passphrase("hunter2"))
        );

        let key = ChatKey::generate();
        security.passphrase.clear();
        security.shared_key = key.to_base64();
        assert_eq!(security.chat_key().unwrap(), Some(key));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        for level in VALID_LOG_LEVELS {
            config.logging.level = level.to_uppercase();
            assert!(config.validate().is_ok(), "{} should be valid", level);
        }

        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        let key = ChatKey::generate().to_base64();
        std::env::set_var("LANCHAT_USERNAME", "frank");
        std::env::set_var("LANCHAT_LISTEN_PORT", "50123");
        std::env::set_var("LANCHAT_DISCOVERY_PORT", "40404");
        std::env::set_var("LANCHAT_SHARED_KEY", &key);
        std::env::set_var("LANCHAT_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.security.passphrase = "from file".to_string();
        config.apply_env_overrides();

        assert_eq!(config.identity.username, "frank");
        assert_eq!(config.network.listen_port, 50123);
        assert_eq!(config.network.discovery_port, 40404);
        assert_eq!(config.security.shared_key, key);
        assert!(config.security.passphrase.is_empty());
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_or_invalid_is_ignored() {
        clear_env();
        std::env::set_var("LANCHAT_USERNAME", "");
        std::env::set_var("LANCHAT_LISTEN_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());

        clear_env();
    }
}
