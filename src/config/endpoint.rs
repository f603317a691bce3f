//! Broker Endpoint Configuration
//!
//! Connection settings for the source and destination brokers.

use std::time::Duration;

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_PACKET_SIZE;

/// One broker the relay connects to
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Broker host name or IP address
    pub host: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base client identifier; each session appends its own suffix
    #[serde(default)]
    pub client_id: Option<String>,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Keep alive interval in seconds (0 disables pings)
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Largest packet accepted from this broker, in bytes. Sent in CONNECT
    /// so the broker never delivers anything bigger.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Mutual TLS settings
    #[serde(default)]
    pub tls: Option<EndpointTlsConfig>,
}

/// Mutual TLS settings for an endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointTlsConfig {
    /// CA certificate used to verify the broker (PEM)
    #[serde(default)]
    pub ca_cert: Option<String>,

    /// Client certificate chain presented to the broker (PEM)
    #[serde(default)]
    pub client_cert: Option<String>,

    /// Private key for the client certificate (PEM)
    #[serde(default)]
    pub client_key: Option<String>,

    /// Server name for SNI and certificate verification (defaults to host)
    #[serde(default)]
    pub server_name: Option<String>,
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_packet_size() -> u32 {
    DEFAULT_MAX_PACKET_SIZE as u32
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: None,
            username: None,
            password: None,
            keepalive: default_keepalive(),
            connect_timeout: default_connect_timeout(),
            max_packet_size: default_max_packet_size(),
            tls: None,
        }
    }

    /// `host:port` for logs and socket connects
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Client identifier for one session on this endpoint
    pub fn session_client_id(&self, suffix: &str) -> String {
        match self.client_id {
            Some(ref base) => format!("{}-{}", base, suffix),
            None => format!("mqrelay-{}-{}", std::process::id(), suffix),
        }
    }

    /// SNI / verification name
    pub fn server_name(&self) -> &str {
        self.tls
            .as_ref()
            .and_then(|tls| tls.server_name.as_deref())
            .unwrap_or(&self.host)
    }
}

impl EndpointTlsConfig {
    /// All three PEM paths, when every one is set
    pub fn paths(&self) -> Option<(&str, &str, &str)> {
        match (&self.ca_cert, &self.client_cert, &self.client_key) {
            (Some(ca), Some(cert), Some(key)) => Some((ca, cert, key)),
            _ => None,
        }
    }

    /// Names of the PEM paths that are not set
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.ca_cert.as_deref().is_none_or(str::is_empty) {
            missing.push("ca_cert");
        }
        if self.client_cert.as_deref().is_none_or(str::is_empty) {
            missing.push("client_cert");
        }
        if self.client_key.as_deref().is_none_or(str::is_empty) {
            missing.push("client_key");
        }
        missing
    }
}
