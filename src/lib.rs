//! mqrelay - rule-driven MQTT topic relay
//!
//! Subscribes to a source broker, matches each message against an ordered
//! list of topic rules, filters it on its JSON content, rewrites its topic
//! and republishes it on a destination broker. Bidirectional rules mirror
//! the flow back. Both ends speak MQTT v5, optionally over mutual TLS.

pub mod codec;
pub mod config;
pub mod filter;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod rules;
pub mod session;
pub mod topic;

pub use config::Config;
pub use filter::{FilterChain, Verdict};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::QoS;
pub use relay::{Relay, RelayHandle, RelayState};
pub use rules::{Flow, RuleRegistry};
pub use topic::TopicPattern;
