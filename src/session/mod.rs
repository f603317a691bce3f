//! Broker Sessions
//!
//! Each relay direction owns two persistent MQTT sessions: a subscriber on
//! the broker messages come from and a publisher on the broker they go to.
//! Both reconnect on failure with capped exponential backoff and report
//! what happens to them as typed events and status updates.

mod connection;
mod publisher;
mod queue;
mod subscriber;
pub mod tls;
mod transport;

pub use connection::{MqttConnection, ServerLimits};
pub use publisher::PublisherSession;
pub use queue::{OutboundQueue, PushOutcome};
pub use subscriber::SubscriberSession;
pub use tls::TlsError;
pub use transport::{BoxedStream, BrokerStream, Connector};

use std::fmt;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::config::EndpointConfig;
use crate::protocol::{DecodeError, EncodeError, Properties, QoS, ReasonCode};

/// User property carrying the id of the relay that published a message
pub const ORIGIN_PROPERTY: &str = "x-mqrelay-origin";

/// Error type for session operations
#[derive(Debug)]
pub enum SessionError {
    /// Socket error
    Io(std::io::Error),
    /// TLS handshake failed
    Handshake(String),
    /// An operation did not finish in time
    Timeout(&'static str),
    /// Broker closed the connection or sent DISCONNECT
    ConnectionLost(String),
    /// Broker refused the connection
    Rejected(ReasonCode),
    /// Broker sent something a client cannot accept
    Protocol(String),
    /// Malformed packet from the broker
    Decode(DecodeError),
    /// Packet could not be encoded
    Encode(EncodeError),
    /// Encoded packet exceeds the broker's Maximum Packet Size; nothing was sent
    PacketTooLarge { size: usize, limit: u32 },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "IO error: {}", e),
            SessionError::Handshake(msg) => write!(f, "TLS handshake failed: {}", msg),
            SessionError::Timeout(what) => write!(f, "{} timed out", what),
            SessionError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            SessionError::Rejected(code) => write!(f, "Connection refused: {}", code),
            SessionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SessionError::Decode(e) => write!(f, "Decode error: {}", e),
            SessionError::Encode(e) => write!(f, "Encode error: {}", e),
            SessionError::PacketTooLarge { size, limit } => {
                write!(f, "Packet of {} bytes exceeds broker limit of {}", size, limit)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            SessionError::Decode(e) => Some(e),
            SessionError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        SessionError::Decode(e)
    }
}

impl From<EncodeError> for SessionError {
    fn from(e: EncodeError) -> Self {
        SessionError::Encode(e)
    }
}

/// Status of a broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Not connected, will attempt to connect
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
    /// Stopped for good
    Closed,
}

/// A PUBLISH received by a subscriber session
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
    pub received_at: SystemTime,
}

/// A message waiting in a publisher's queue
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

/// What a subscriber session reports to its relay loop
#[derive(Debug)]
pub enum SessionEvent {
    /// Attempting to connect
    Connecting,
    /// CONNACK accepted
    Connected { session_present: bool },
    /// SUBACK received for every rule filter. `refused` lists the
    /// subscription identifiers the broker did not grant.
    Subscribed { refused: Vec<u32> },
    /// Inbound message
    Message(Message),
    /// Connection failed or dropped; a reconnect follows
    ConnectionLost(String),
}

/// Connection parameters shared by both kinds of session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Short name used in logs and metrics, e.g. `forward/sub`
    pub name: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: u16,
    /// Time allowed for CONNACK after the stream is open
    pub connect_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Largest inbound packet, advertised in CONNECT
    pub max_packet_size: u32,
}

impl SessionSettings {
    pub fn new(
        name: impl Into<String>,
        endpoint: &EndpointConfig,
        client_suffix: &str,
        reconnect_min: Duration,
        reconnect_max: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            client_id: endpoint.session_client_id(client_suffix),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            keepalive: endpoint.keepalive,
            connect_timeout: endpoint.connect_timeout_duration(),
            reconnect_min,
            reconnect_max,
            max_packet_size: endpoint.max_packet_size,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_min, self.reconnect_max)
    }
}

/// Capped exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: min,
            min,
            max: max.max(min),
        }
    }

    /// Delay before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    /// Back to the minimum after a successful connection
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
