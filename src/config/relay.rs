//! Relay Behaviour Configuration
//!
//! The top-level `relay` section: identity, reconnect backoff, queueing and
//! shutdown limits shared by every direction.

use std::time::Duration;

use serde::Deserialize;

/// Options for the relay as a whole
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    /// Identity stamped on forwarded messages for loop prevention.
    /// See [`Config::relay_id`](super::Config::relay_id) for the default.
    pub id: Option<String>,

    /// Prepended to every forwarded topic, stripped from mirrored ones.
    /// A rule's own `prefix` takes precedence.
    pub topic_prefix: Option<String>,

    /// Tag forwarded messages and drop our own tags on receipt
    pub loop_prevention: bool,

    /// Initial reconnect delay in seconds
    pub reconnect_min_secs: u64,

    /// Reconnect delay cap in seconds
    pub reconnect_max_secs: u64,

    /// Bounded outbound queue length per publisher
    pub queue_capacity: usize,

    /// How long a full queue may block the relay loop before dropping the oldest entry
    pub queue_timeout_ms: u64,

    /// How long to wait for PUBACK / PUBREC / PUBCOMP
    pub ack_timeout_secs: u64,

    /// How long shutdown may spend draining queues
    pub shutdown_timeout_secs: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            id: None,
            topic_prefix: None,
            loop_prevention: true,
            reconnect_min_secs: 1,
            reconnect_max_secs: 60,
            queue_capacity: 1024,
            queue_timeout_ms: 1000,
            ack_timeout_secs: 10,
            shutdown_timeout_secs: 5,
        }
    }
}

impl RelayOptions {
    pub fn reconnect_min(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Configured prefix without surrounding slashes, if non-empty
    pub fn normalized_prefix(&self) -> Option<&str> {
        self.topic_prefix.as_deref().and_then(normalize_prefix)
    }
}

/// A topic prefix without surrounding slashes; `None` when nothing is left
pub fn normalize_prefix(prefix: &str) -> Option<&str> {
    Some(prefix.trim_matches('/')).filter(|p| !p.is_empty())
}
