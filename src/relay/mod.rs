//! Relay Orchestration
//!
//! A relay runs one direction per flow that has rules: forward always,
//! reverse only when a bidirectional rule exists. Each direction is three
//! tasks wired together with channels:
//!
//! ```text
//! SubscriberSession --SessionEvent--> RelayLoop --OutboundQueue--> PublisherSession
//! ```
//!
//! Directions share nothing but the rule registry and the metrics.

mod dispatch;

pub use dispatch::{Decision, RelayLoop};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{Config, ConfigError, EndpointConfig};
use crate::metrics::Metrics;
use crate::rules::{Flow, RuleRegistry};
use crate::session::{
    Connector, OutboundQueue, PublisherSession, SessionSettings, SubscriberSession,
};

/// Buffered events between a subscriber and its relay loop. The subscriber
/// acknowledges a message only after it is in this channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of one relay direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Subscribed,
    Relaying,
    ShuttingDown,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Disconnected => "disconnected",
            RelayState::Connecting => "connecting",
            RelayState::Subscribed => "subscribed",
            RelayState::Relaying => "relaying",
            RelayState::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, ready-to-start relay.
///
/// Everything that can fail for configuration reasons (rule compilation,
/// TLS material) fails in [`Relay::new`]; once built, a relay only meets
/// runtime errors, which it recovers from by reconnecting.
pub struct Relay {
    config: Config,
    /// Resolved once; tags published messages and names the relay in logs
    relay_id: String,
    registry: Arc<RuleRegistry>,
    source: Connector,
    destination: Connector,
    metrics: Arc<Metrics>,
}

impl Relay {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = RuleRegistry::build(&config)?;
        let source = Connector::new(&config.source)?;
        let destination = Connector::new(&config.destination)?;
        let relay_id = config.relay_id();

        Ok(Self {
            relay_id,
            config,
            registry: Arc::new(registry),
            source,
            destination,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Use an existing metrics registry instead of a private one
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn id(&self) -> &str {
        &self.relay_id
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Spawn every direction on the current runtime
    pub fn start(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay_opts = &self.config.relay;

        let mut directions = vec![self.spawn_direction(
            Flow::Forward,
            (&self.config.source, &self.source),
            (&self.config.destination, &self.destination),
            &shutdown_rx,
        )];
        if self.registry.has_reverse() {
            directions.push(self.spawn_direction(
                Flow::Reverse,
                (&self.config.destination, &self.destination),
                (&self.config.source, &self.source),
                &shutdown_rx,
            ));
        }

        info!(
            "Relay '{}' started: {} rules, {} directions",
            self.relay_id,
            self.registry.len(),
            directions.len()
        );

        RelayHandle {
            shutdown: shutdown_tx,
            directions,
            metrics: self.metrics.clone(),
            shutdown_timeout: relay_opts.shutdown_timeout(),
        }
    }

    fn spawn_direction(
        &self,
        flow: Flow,
        (from, from_connector): (&EndpointConfig, &Connector),
        (to, to_connector): (&EndpointConfig, &Connector),
        shutdown: &watch::Receiver<bool>,
    ) -> Direction {
        let opts = &self.config.relay;
        let (tag, name) = match flow {
            Flow::Forward => ("fwd", "forward"),
            Flow::Reverse => ("rev", "reverse"),
        };
        let relay_id = opts.loop_prevention.then(|| self.relay_id.clone());

        let queue = Arc::new(OutboundQueue::new(opts.queue_capacity));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let subscriber = SubscriberSession::new(
            SessionSettings::new(
                format!("{}/sub", name),
                from,
                &format!("{}-sub", tag),
                opts.reconnect_min(),
                opts.reconnect_max(),
            ),
            from_connector.clone(),
            self.registry.subscriptions(flow).to_vec(),
            relay_id.clone(),
            events_tx,
            self.metrics.clone(),
        );

        let publisher = PublisherSession::new(
            SessionSettings::new(
                format!("{}/pub", name),
                to,
                &format!("{}-pub", tag),
                opts.reconnect_min(),
                opts.reconnect_max(),
            ),
            to_connector.clone(),
            queue.clone(),
            flow,
            relay_id,
            opts.ack_timeout(),
            self.metrics.clone(),
        );
        let publisher_status = publisher.status();

        let relay_loop = RelayLoop::new(
            flow,
            self.registry.clone(),
            queue,
            opts.queue_timeout(),
            self.metrics.clone(),
        );
        let state = relay_loop.state();

        let tasks = vec![
            tokio::spawn(subscriber.run(shutdown.clone())),
            tokio::spawn(relay_loop.run(events_rx, publisher_status, shutdown.clone())),
            tokio::spawn(publisher.run(shutdown.clone())),
        ];

        Direction { flow, state, tasks }
    }
}

struct Direction {
    flow: Flow,
    state: watch::Receiver<RelayState>,
    tasks: Vec<JoinHandle<()>>,
}

/// Control handle for a running relay
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    directions: Vec<Direction>,
    metrics: Arc<Metrics>,
    shutdown_timeout: Duration,
}

impl RelayHandle {
    /// Current state of a direction, `None` if it is not running
    pub fn state(&self, flow: Flow) -> Option<RelayState> {
        self.direction(flow).map(|d| *d.state.borrow())
    }

    /// Follow state changes of a direction
    pub fn watch_state(&self, flow: Flow) -> Option<watch::Receiver<RelayState>> {
        self.direction(flow).map(|d| d.state.clone())
    }

    pub fn flows(&self) -> Vec<Flow> {
        self.directions.iter().map(|d| d.flow).collect()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Fires once shutdown begins; for tasks that live beside the relay
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn direction(&self, flow: Flow) -> Option<&Direction> {
        self.directions.iter().find(|d| d.flow == flow)
    }

    /// Stop intake, let publishers drain their queues for up to the
    /// shutdown timeout, then abort whatever is still running.
    pub async fn shutdown(self) {
        info!("Relay shutting down");
        self.shutdown.send_replace(true);

        let mut tasks: Vec<JoinHandle<()>> = self
            .directions
            .into_iter()
            .flat_map(|d| d.tasks)
            .collect();

        let drained = timeout(self.shutdown_timeout, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Relay did not drain within {:?}, aborting remaining tasks",
                self.shutdown_timeout
            );
            for task in &tasks {
                task.abort();
            }
        }

        info!(
            "Relay stopped after relaying {} messages",
            self.metrics.relayed_total()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuleConfig, RuleDirection};
    use pretty_assertions::assert_eq;

    fn config(rules: Vec<RuleConfig>) -> Config {
        Config::new(
            EndpointConfig::new("127.0.0.1", 1),
            EndpointConfig::new("127.0.0.1", 1),
            rules,
        )
    }

    #[test]
    fn test_new_rejects_bad_rule() {
        let result = Relay::new(config(vec![RuleConfig::new("a/+", "b/#")]));
        assert!(matches!(result, Err(ConfigError::Rule { .. })));
    }

    #[test]
    fn test_new_rejects_empty_rules() {
        assert!(matches!(
            Relay::new(config(vec![])),
            Err(ConfigError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_reverse_direction_only_with_bidirectional_rule() {
        let relay = Relay::new(config(vec![RuleConfig::new("a/+", "b/+")])).unwrap();
        let handle = relay.start();
        assert_eq!(handle.flows(), vec![Flow::Forward]);
        assert_eq!(handle.state(Flow::Reverse), None);
        handle.shutdown().await;

        let bidirectional = RuleConfig {
            direction: RuleDirection::Bidirectional,
            ..RuleConfig::new("a/+", "b/+")
        };
        let relay = Relay::new(config(vec![bidirectional])).unwrap();
        let handle = relay.start();
        assert_eq!(handle.flows(), vec![Flow::Forward, Flow::Reverse]);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_unreachable_brokers() {
        let relay = Relay::new(config(vec![RuleConfig::new("a/+", "b/+")])).unwrap();
        let handle = relay.start();
        let mut state = handle.watch_state(Flow::Forward).unwrap();

        tokio::time::timeout(Duration::from_secs(10), handle.shutdown())
            .await
            .unwrap();
        assert_eq!(*state.borrow_and_update(), RelayState::ShuttingDown);
    }

    #[test]
    fn test_relay_id_resolved_once() {
        let relay = Relay::new(config(vec![RuleConfig::new("a/+", "b/+")])).unwrap();
        let other = Relay::new(config(vec![RuleConfig::new("a/+", "b/+")])).unwrap();
        assert!(relay.id().starts_with("mqrelay-"));
        // Chained relays left on defaults must not share an origin tag
        assert_ne!(relay.id(), other.id());

        let mut named = config(vec![RuleConfig::new("a/+", "b/+")]);
        named.relay.id = Some("edge-7".to_string());
        assert_eq!(Relay::new(named).unwrap().id(), "edge-7");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(RelayState::ShuttingDown.to_string(), "shutting_down");
        assert_eq!(RelayState::Relaying.as_str(), "relaying");
    }
}
