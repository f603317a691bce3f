//! Configuration Module
//!
//! Provides JSON-based configuration for mqrelay with support for:
//! - Source and destination broker endpoints (optionally mutual TLS)
//! - Ordered relay rules with content filters
//! - Relay behaviour (backoff, queueing, loop prevention)
//! - Logging and metrics
//! - Environment variable overrides (MQRELAY__* prefix)

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use uuid::Uuid;

pub use endpoint::{EndpointConfig, EndpointTlsConfig};
pub use relay::{normalize_prefix, RelayOptions};
pub use rule::{FiltersConfig, RuleConfig, RuleDirection};

use crate::session::TlsError;
use crate::topic::validate_pattern;

mod endpoint;
mod relay;
mod rule;


/// Smallest `max_packet_size` an endpoint may advertise
const MIN_PACKET_SIZE: u32 = 256;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// JSON parsing error
    Json(serde_json::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
    /// A rule's pattern, template or filters are invalid
    Rule { rule: String, message: String },
    /// Certificate or key could not be loaded
    Tls(TlsError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Json(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ConfigError::Rule { rule, message } => write!(f, "Rule '{}': {}", rule, message),
            ConfigError::Tls(e) => write!(f, "TLS error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Json(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            ConfigError::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<TlsError> for ConfigError {
    fn from(e: TlsError) -> Self {
        ConfigError::Tls(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Broker messages are read from
    pub source: EndpointConfig,
    /// Broker messages are written to
    pub destination: EndpointConfig,
    /// Relay rules in precedence order
    pub rules: Vec<RuleConfig>,
    /// Relay behaviour
    #[serde(default)]
    pub relay: RelayOptions,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the HTTP endpoint is served
    pub enabled: bool,
    /// HTTP bind address for metrics endpoint
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl Config {
    /// Build a configuration in code with default relay, log and metrics sections
    pub fn new(source: EndpointConfig, destination: EndpointConfig, rules: Vec<RuleConfig>) -> Self {
        Self {
            source,
            destination,
            rules,
            relay: RelayOptions::default(),
            log: LogConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Load configuration from a JSON file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the JSON file
    /// 2. Override via env vars: `MQRELAY__` prefix with double underscores for nesting:
    ///    - `MQRELAY__SOURCE__HOST=broker.local` overrides `source.host`
    ///    - `MQRELAY__RELAY__QUEUE_CAPACITY=4096` overrides `relay.queue_capacity`
    ///    - `MQRELAY__METRICS__ENABLED=true` overrides `metrics.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let substituted = substitute_env_vars(&content)?;

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Json))
            .add_source(
                Environment::with_prefix("MQRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Patterns and templates are checked when the rule registry is built;
    /// certificates are loaded when the relay is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, endpoint) in [("source", &self.source), ("destination", &self.destination)] {
            if endpoint.host.is_empty() {
                return Err(ConfigError::Validation(format!("{}.host is required", name)));
            }
            if endpoint.port == 0 {
                return Err(ConfigError::Validation(format!(
                    "{}.port must be non-zero",
                    name
                )));
            }
            if endpoint.max_packet_size < MIN_PACKET_SIZE {
                return Err(ConfigError::Validation(format!(
                    "{}.max_packet_size must be at least {} bytes",
                    name, MIN_PACKET_SIZE
                )));
            }
            if let Some(ref tls) = endpoint.tls {
                let missing = tls.missing();
                if !missing.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "{}.tls requires ca_cert, client_cert and client_key (missing: {})",
                        name,
                        missing.join(", ")
                    )));
                }
            }
        }

        if self.rules.is_empty() {
            return Err(ConfigError::Validation(
                "at least one rule is required".to_string(),
            ));
        }

        for (index, rule) in self.rules.iter().enumerate() {
            let rule_error = |message: String| ConfigError::Rule {
                rule: rule.name.clone().unwrap_or_else(|| index.to_string()),
                message,
            };
            if rule.qos > 2 {
                return Err(rule_error("qos must be 0, 1, or 2".to_string()));
            }
            if let Some(prefix) = rule.prefix.as_deref().and_then(normalize_prefix) {
                validate_prefix(prefix).map_err(|e| rule_error(format!("prefix: {}", e)))?;
            }
        }

        let relay = &self.relay;
        if relay.id.as_deref() == Some("") {
            return Err(ConfigError::Validation("relay.id cannot be empty".to_string()));
        }
        if relay.reconnect_min_secs == 0 {
            return Err(ConfigError::Validation(
                "relay.reconnect_min_secs must be at least 1".to_string(),
            ));
        }
        if relay.reconnect_min_secs > relay.reconnect_max_secs {
            return Err(ConfigError::Validation(
                "relay.reconnect_min_secs cannot exceed relay.reconnect_max_secs".to_string(),
            ));
        }
        if relay.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "relay.queue_capacity must be at least 1".to_string(),
            ));
        }
        if relay.ack_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "relay.ack_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some(prefix) = relay.normalized_prefix() {
            validate_prefix(prefix)
                .map_err(|e| ConfigError::Validation(format!("relay.topic_prefix: {}", e)))?;
        }

        Ok(())
    }

    /// Identity used for loop prevention: `relay.id` when set, else the
    /// source endpoint's client id, else a random id.
    ///
    /// Relays chained through a shared broker must not share an id, or each
    /// drops the other's traffic as its own. A random id is only stable for
    /// one process, so [`Relay`](crate::Relay) resolves it once.
    pub fn relay_id(&self) -> String {
        self.relay
            .id
            .clone()
            .or_else(|| self.source.client_id.clone())
            .unwrap_or_else(|| format!("mqrelay-{}", &Uuid::new_v4().simple().to_string()[..12]))
    }
}

/// A topic prefix is a plain topic: valid levels, no wildcards
fn validate_prefix(prefix: &str) -> Result<(), String> {
    validate_pattern(prefix).map_err(|e| e.to_string())?;
    if prefix.contains(['+', '#']) {
        return Err("cannot contain wildcards".to_string());
    }
    Ok(())
}
