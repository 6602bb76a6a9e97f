//! Configuration for the signaling relay
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use crate::registry::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Identifier registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Routing policy
    #[serde(default)]
    pub routing: RoutingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket port (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Envelopes queued per connection before new ones are dropped
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_outbound_queue() -> usize {
    128
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Identifier registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// What happens when an identifier is already registered
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
}

/// Routing policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Send `target-unavailable` when a `call` or `offer` cannot be delivered
    #[serde(default)]
    pub notify_unavailable: bool,

    /// Refuse `call`/`offer` to an endpoint already in a call with someone else
    #[serde(default)]
    pub reject_busy_targets: bool,

    /// Seconds after which an unanswered call stops counting as busy
    #[serde(default = "default_call_setup_timeout")]
    pub call_setup_timeout_secs: u64,
}

fn default_call_setup_timeout() -> u64 {
    30
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            notify_unavailable: false,
            reject_busy_targets: false,
            call_setup_timeout_secs: default_call_setup_timeout(),
        }
    }
}

impl RoutingConfig {
    pub fn call_setup_timeout(&self) -> Duration {
        Duration::from_secs(self.call_setup_timeout_secs)
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: RelayConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = RelayConfig::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load configuration from file if it exists, then apply the environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            _ => RelayConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `lookup` (normally the process environment)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PEERCALL_HOST") {
            self.server.host = host;
        }
        if let Some(p) = lookup("PEERCALL_PORT")
            .or_else(|| lookup("PORT"))
            .and_then(|v| v.parse().ok())
        {
            self.server.port = p;
        }
        if let Some(q) = lookup("PEERCALL_OUTBOUND_QUEUE").and_then(|v| v.parse().ok()) {
            self.server.outbound_queue = q;
        }

        if let Some(policy) = lookup("PEERCALL_ON_CONFLICT").and_then(|v| v.parse().ok()) {
            self.registry.on_conflict = policy;
        }

        if let Some(b) = lookup("PEERCALL_NOTIFY_UNAVAILABLE").and_then(|v| parse_bool(&v)) {
            self.routing.notify_unavailable = b;
        }
        if let Some(b) = lookup("PEERCALL_REJECT_BUSY").and_then(|v| parse_bool(&v)) {
            self.routing.reject_busy_targets = b;
        }
        if let Some(t) = lookup("PEERCALL_CALL_SETUP_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.routing.call_setup_timeout_secs = t;
        }
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty".to_string()));
        }
        if self.server.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "server.outbound_queue must be at least 1".to_string(),
            ));
        }
        if self.routing.call_setup_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "routing.call_setup_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` for the listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.outbound_queue, 128);
        assert_eq!(config.registry.on_conflict, ConflictPolicy::Reject);
        assert!(!config.routing.notify_unavailable);
        assert_eq!(config.routing.call_setup_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[server]
port = 8443

[registry]
on_conflict = "replace"

[routing]
notify_unavailable = true
"#;

        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.registry.on_conflict, ConflictPolicy::Replace);
        assert!(config.routing.notify_unavailable);
        assert!(!config.routing.reject_busy_targets);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nhost = \"127.0.0.1\"\nport = 0").unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn test_from_file_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            RelayConfig::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_apply_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "9000"),
            ("PEERCALL_ON_CONFLICT", "replace"),
            ("PEERCALL_NOTIFY_UNAVAILABLE", "yes"),
            ("PEERCALL_REJECT_BUSY", "not-a-bool"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.registry.on_conflict, ConflictPolicy::Replace);
        assert!(config.routing.notify_unavailable);
        assert!(!config.routing.reject_busy_targets);
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = RelayConfig::default();
        config.server.outbound_queue = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
