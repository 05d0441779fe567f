//! Listener configuration
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`LISTENER_` prefix, e.g. `LISTENER_PORT=5020`)
//! 2. Config file (TOML, YAML or JSON, chosen by extension)
//! 3. Default values

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::codec::Framing;
use crate::constants::{
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_RETRIES, DEFAULT_TIMEOUT_MS,
};
use crate::error::{ListenerError, Result};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "LISTENER_";

/// Listener configuration, immutable once handed to the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Wire framing
    pub framing: Framing,
    /// Response timeout per attempt in milliseconds
    pub timeout_ms: u64,
    /// Resends after a response timeout
    pub retries: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            framing: Framing::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl ListenerConfig {
    pub fn new(port: u16, framing: Framing) -> Self {
        Self {
            port,
            framing,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_encapsulated(&self) -> bool {
        self.framing == Framing::Encapsulated
    }

    /// Socket address the connection handler binds to. Accepts IP literals
    /// (v4 or v6) and resolvable host names; the first resolved address wins.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let invalid = |reason: String| {
            ListenerError::config(format!("Invalid bind address {}:{}: {}", self.host, self.port, reason))
        };

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("host resolved to no addresses".to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ListenerError::config("Listener port must not be 0"));
        }
        if self.timeout_ms == 0 {
            return Err(ListenerError::config("Response timeout must be positive"));
        }
        self.bind_addr().map(|_| ())
    }

    /// Load configuration from defaults, an optional file, and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ListenerConfig::default()));

        if let Some(path) = path {
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| ListenerError::config("Config file must have an extension"))?;

            figment = match extension {
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                "json" => figment.merge(Json::file(path)),
                _ => {
                    return Err(ListenerError::config(format!(
                        "Unsupported config file format: {}",
                        extension
                    )))
                },
            };
        }

        let config: ListenerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| ListenerError::config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults() {
        let config = ListenerConfig::default();
        assert_eq!(config.port, 502);
        assert_eq!(config.framing, Framing::Tagged);
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.retries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "port = 5020\nframing = \"encapsulated\"\ntimeout_ms = 250"
        )
        .unwrap();

        let config = ListenerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, 5020);
        assert!(config.is_encapsulated());
        assert_eq!(config.timeout_ms, 250);
        // Untouched keys keep their defaults
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "host: 127.0.0.1\nport: 1502\nframing: tagged").unwrap();

        let config = ListenerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:1502");
    }

    #[test]
    fn test_rejects_unknown_extension() {
        let file = Builder::new().suffix(".ini").tempfile().unwrap();
        let err = ListenerConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ListenerError::Config(_)));
    }

    #[test]
    fn test_validation() {
        assert!(ListenerConfig::new(0, Framing::Tagged).validate().is_err());

        let mut config = ListenerConfig::new(502, Framing::Tagged);
        config.timeout_ms = 0;
        assert!(config.validate().is_err());

        let config = ListenerConfig::new(502, Framing::Tagged).with_host("not a host");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_addr_forms() {
        let v6 = ListenerConfig::new(502, Framing::Tagged).with_host("::");
        assert_eq!(v6.bind_addr().unwrap().to_string(), "[::]:502");

        let v6_loopback = ListenerConfig::new(1502, Framing::Tagged).with_host("::1");
        assert_eq!(v6_loopback.bind_addr().unwrap().to_string(), "[::1]:1502");

        let named = ListenerConfig::new(5020, Framing::Tagged).with_host("localhost");
        let addr = named.bind_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 5020);
    }
}
