//! Per-direction relay loop: match, filter, rewrite, enqueue

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::RelayState;
use crate::filter::{RejectReason, Verdict};
use crate::metrics::Metrics;
use crate::rules::{Flow, RuleRegistry};
use crate::session::{
    Message, OutboundMessage, OutboundQueue, PushOutcome, SessionEvent, SessionStatus,
};
use crate::topic::TopicError;

/// What happens to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No rule matched the topic
    Unmatched,
    /// A rule matched and one of its filters failed
    Rejected { rule: String, reason: RejectReason },
    /// The matched rule could not produce a topic
    RewriteFailed { rule: String, error: TopicError },
    /// Copy sent for an overlapping filter; another copy carries the message
    Duplicate,
    Forward {
        rule: String,
        message: OutboundMessage,
    },
}

/// Subscriber progress as seen by the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourcePhase {
    Down,
    Connecting,
    Subscribed,
    Relaying,
}

/// Consumes one subscriber's events and feeds one publisher's queue.
///
/// The loop ends when the subscriber stops; the queue is then closed so the
/// publisher drains what is left and disconnects.
pub struct RelayLoop {
    flow: Flow,
    registry: Arc<RuleRegistry>,
    queue: Arc<OutboundQueue>,
    queue_timeout: Duration,
    metrics: Arc<Metrics>,
    state: watch::Sender<RelayState>,
    source: SourcePhase,
    destination: SessionStatus,
    /// Subscription Identifiers the source broker refused
    refused: Vec<u32>,
    shutting_down: bool,
}

impl RelayLoop {
    pub fn new(
        flow: Flow,
        registry: Arc<RuleRegistry>,
        queue: Arc<OutboundQueue>,
        queue_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(RelayState::Disconnected);
        Self {
            flow,
            registry,
            queue,
            queue_timeout,
            metrics,
            state,
            source: SourcePhase::Down,
            destination: SessionStatus::Disconnected,
            refused: Vec::new(),
            shutting_down: false,
        }
    }

    pub fn state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// Decide the fate of `msg` at time `now`. Pure: no I/O, no metrics.
    pub fn decide(&self, msg: &Message, now: SystemTime) -> Decision {
        if self.is_duplicate(msg) {
            return Decision::Duplicate;
        }

        let Some(matched) = self.registry.find(self.flow, &msg.topic) else {
            return Decision::Unmatched;
        };
        let rule = matched.rule.id.clone();

        if let Verdict::Reject(reason) = matched.rule.filters.evaluate(&msg.payload, now) {
            return Decision::Rejected { rule, reason };
        }

        match self.registry.rewrite(self.flow, &matched) {
            Ok(topic) => Decision::Forward {
                rule,
                message: OutboundMessage {
                    topic,
                    payload: msg.payload.clone(),
                    qos: msg.qos,
                    retain: msg.retain,
                    properties: msg.properties.forwardable(),
                },
            },
            Err(error) => Decision::RewriteFailed { rule, error },
        }
    }

    /// A copy is kept only when it was sent for the first granted filter
    /// matching its topic. Copies without identifiers are always kept.
    fn is_duplicate(&self, msg: &Message) -> bool {
        let ids = &msg.properties.subscription_identifiers;
        if ids.is_empty() {
            return false;
        }
        match self
            .registry
            .owning_subscription(self.flow, &msg.topic, &self.refused)
        {
            Some(owner) => !ids.contains(&owner),
            None => false,
        }
    }

    /// Apply a decision to one inbound message
    pub async fn handle(&self, msg: Message) {
        self.metrics.message_received(self.flow.as_str());

        match self.decide(&msg, SystemTime::now()) {
            Decision::Unmatched => {
                debug!("Relay '{}': No rule for '{}'", self.flow, msg.topic);
                self.metrics.message_unmatched(self.flow.as_str());
            }
            Decision::Rejected { rule, reason } => {
                debug!(
                    "Relay '{}': Rule '{}' filtered '{}': {}",
                    self.flow, rule, msg.topic, reason
                );
                self.metrics.message_filtered(reason.as_str());
            }
            Decision::RewriteFailed { rule, error } => {
                warn!(
                    "Relay '{}': Rule '{}' cannot rewrite '{}': {}",
                    self.flow, rule, msg.topic, error
                );
                self.metrics.rewrite_failed(self.flow.as_str());
            }
            Decision::Duplicate => {
                debug!(
                    "Relay '{}': Dropping overlapping copy of '{}'",
                    self.flow, msg.topic
                );
                self.metrics.duplicate_dropped(self.flow.as_str());
            }
            Decision::Forward { rule, message } => {
                debug!(
                    "Relay '{}': Rule '{}' maps '{}' -> '{}'",
                    self.flow, rule, msg.topic, message.topic
                );
                match self.queue.push(message, self.queue_timeout).await {
                    PushOutcome::Queued => {}
                    PushOutcome::DroppedOldest => {
                        warn!(
                            "Relay '{}': Outbound queue full for {:?}, dropped oldest message",
                            self.flow, self.queue_timeout
                        );
                        self.metrics.backpressure_drop(self.flow.as_str());
                    }
                    PushOutcome::Closed => {
                        debug!("Relay '{}': Queue closed, discarding message", self.flow);
                    }
                }
            }
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SessionEvent>,
        mut destination: watch::Receiver<SessionStatus>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut destination_open = true;
        let mut shutdown_open = true;
        self.destination = *destination.borrow_and_update();
        if *shutdown.borrow_and_update() {
            self.shutting_down = true;
            shutdown_open = false;
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                changed = destination.changed(), if destination_open => {
                    if changed.is_err() {
                        destination_open = false;
                    }
                    self.destination = *destination.borrow_and_update();
                    self.publish_state();
                }
                changed = shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                    } else if *shutdown.borrow_and_update() {
                        shutdown_open = false;
                        info!("Relay '{}': Shutting down", self.flow);
                        self.shutting_down = true;
                        self.publish_state();
                    }
                }
            }
        }

        self.queue.close();
        self.shutting_down = true;
        self.publish_state();
        debug!(
            "Relay '{}': Source closed, {} messages left to publish",
            self.flow,
            self.queue.len()
        );
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connecting => self.source = SourcePhase::Connecting,
            SessionEvent::Connected { session_present } => {
                debug!(
                    "Relay '{}': Source connected (session present: {})",
                    self.flow, session_present
                );
            }
            SessionEvent::Subscribed { refused } => {
                info!("Relay '{}': Subscribed", self.flow);
                self.source = SourcePhase::Subscribed;
                self.refused = refused;
            }
            SessionEvent::Message(msg) => {
                self.source = SourcePhase::Relaying;
                self.publish_state();
                self.handle(msg).await;
                return;
            }
            SessionEvent::ConnectionLost(reason) => {
                debug!("Relay '{}': Source lost: {}", self.flow, reason);
                self.source = SourcePhase::Down;
            }
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let state = derive_state(self.source, self.destination, self.shutting_down);
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

fn derive_state(source: SourcePhase, destination: SessionStatus, shutting_down: bool) -> RelayState {
    if shutting_down {
        return RelayState::ShuttingDown;
    }
    match (source, destination) {
        (SourcePhase::Down, _) => RelayState::Disconnected,
        (SourcePhase::Connecting, _) => RelayState::Connecting,
        (_, status) if status != SessionStatus::Connected => RelayState::Connecting,
        (SourcePhase::Subscribed, _) => RelayState::Subscribed,
        (SourcePhase::Relaying, _) => RelayState::Relaying,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FiltersConfig, RelayOptions, RuleConfig, RuleDirection};
    use crate::protocol::{Properties, QoS};
    use crate::session::ORIGIN_PROPERTY;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::time::UNIX_EPOCH;

    fn registry(rules: Vec<RuleConfig>, prefix: Option<&str>) -> Arc<RuleRegistry> {
        let options = RelayOptions {
            topic_prefix: prefix.map(str::to_string),
            ..Default::default()
        };
        Arc::new(RuleRegistry::from_config(&rules, &options).unwrap())
    }

    fn relay_loop(flow: Flow, registry: Arc<RuleRegistry>, capacity: usize) -> RelayLoop {
        RelayLoop::new(
            flow,
            registry,
            Arc::new(OutboundQueue::new(capacity)),
            Duration::from_millis(10),
            Arc::new(Metrics::new()),
        )
    }

    fn message(topic: &str, payload: &'static str) -> Message {
        Message {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload.as_bytes()),
            qos: QoS::ExactlyOnce,
            retain: true,
            properties: Properties::default(),
            received_at: SystemTime::now(),
        }
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_forward_preserves_qos_retain_and_payload() {
        let relay = relay_loop(
            Flow::Forward,
            registry(vec![RuleConfig::new("data/sensors/+", "forwarded/sensors/+")], None),
            4,
        );

        let mut msg = message("data/sensors/temperature", "21.5");
        msg.properties.content_type = Some("text/plain".to_string());
        msg.properties.topic_alias = Some(3);

        match relay.decide(&msg, SystemTime::now()) {
            Decision::Forward { rule, message } => {
                assert_eq!(rule, "0");
                assert_eq!(message.topic, "forwarded/sensors/temperature");
                assert_eq!(message.qos, QoS::ExactlyOnce);
                assert!(message.retain);
                assert_eq!(message.payload, Bytes::from_static(b"21.5"));
                assert_eq!(message.properties.content_type.as_deref(), Some("text/plain"));
                assert_eq!(message.properties.topic_alias, None);
            }
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn test_unmatched_topic() {
        let relay = relay_loop(
            Flow::Forward,
            registry(vec![RuleConfig::new("data/+", "out/+")], None),
            4,
        );
        assert_eq!(
            relay.decide(&message("other/x", "{}"), SystemTime::now()),
            Decision::Unmatched
        );
    }

    #[test]
    fn test_filter_rejection_names_rule_and_reason() {
        let rule = RuleConfig {
            name: Some("alerts".to_string()),
            filters: FiltersConfig {
                max_age_seconds: Some(300),
                ..Default::default()
            },
            ..RuleConfig::new("alerts/#", "out/alerts/#")
        };
        let relay = relay_loop(Flow::Forward, registry(vec![rule], None), 4);

        let stale = message("alerts/a", r#"{"timestamp": 1000}"#);
        assert_eq!(
            relay.decide(&stale, at(1400)),
            Decision::Rejected {
                rule: "alerts".to_string(),
                reason: RejectReason::TooOld,
            }
        );

        let fresh = message("alerts/a", r#"{"timestamp": 1390}"#);
        assert!(matches!(
            relay.decide(&fresh, at(1400)),
            Decision::Forward { .. }
        ));
    }

    #[test]
    fn test_first_declared_rule_wins() {
        let relay = relay_loop(
            Flow::Forward,
            registry(
                vec![
                    RuleConfig::new("data/#", "first/#"),
                    RuleConfig::new("data/sensors/+", "second/+"),
                ],
                None,
            ),
            4,
        );
        match relay.decide(&message("data/sensors/t", "{}"), SystemTime::now()) {
            Decision::Forward { message, .. } => assert_eq!(message.topic, "first/sensors/t"),
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn test_reverse_flow_round_trip() {
        let rules = vec![RuleConfig {
            direction: RuleDirection::Bidirectional,
            ..RuleConfig::new("cmd/+/set", "remote/+/set")
        }];
        let registry = registry(rules, Some("site-a"));
        let forward = relay_loop(Flow::Forward, registry.clone(), 4);
        let reverse = relay_loop(Flow::Reverse, registry, 4);

        let out = match forward.decide(&message("cmd/lamp/set", "{}"), SystemTime::now()) {
            Decision::Forward { message, .. } => message.topic,
            other => panic!("expected forward, got {:?}", other),
        };
        assert_eq!(out, "site-a/remote/lamp/set");

        match reverse.decide(&message(&out, "{}"), SystemTime::now()) {
            Decision::Forward { message, .. } => assert_eq!(message.topic, "cmd/lamp/set"),
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn test_other_relays_tags_travel_with_message() {
        let relay = relay_loop(
            Flow::Forward,
            registry(vec![RuleConfig::new("a/#", "b/#")], None),
            4,
        );
        let mut msg = message("a/x", "{}");
        msg.properties
            .user_properties
            .push((ORIGIN_PROPERTY.to_string(), "upstream".to_string()));

        match relay.decide(&msg, SystemTime::now()) {
            Decision::Forward { message, .. } => {
                assert_eq!(
                    message.properties.user_property(ORIGIN_PROPERTY),
                    Some("upstream")
                );
            }
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_counts_outcomes() {
        let rule = RuleConfig {
            filters: FiltersConfig {
                type_blocklist: vec!["debug".to_string()],
                ..Default::default()
            },
            ..RuleConfig::new("logs/+", "out/logs/+")
        };
        let relay = relay_loop(Flow::Forward, registry(vec![rule], None), 4);

        relay.handle(message("logs/app", r#"{"type":"debug"}"#)).await;
        relay.handle(message("logs/app", r#"{"type":"info"}"#)).await;
        relay.handle(message("nope", "{}")).await;

        let metrics = &relay.metrics;
        assert_eq!(
            metrics.messages_received.with_label_values(&["forward"]).get(),
            3
        );
        assert_eq!(
            metrics
                .messages_filtered
                .with_label_values(&["type_blocked"])
                .get(),
            1
        );
        assert_eq!(
            metrics.messages_unmatched.with_label_values(&["forward"]).get(),
            1
        );
        assert_eq!(relay.queue.try_pop().unwrap().topic, "out/logs/app");
    }

    #[test]
    fn test_overlapping_copies_forwarded_once() {
        let relay = relay_loop(
            Flow::Forward,
            registry(
                vec![
                    RuleConfig::new("data/#", "all/#"),
                    RuleConfig::new("data/sensors/+", "sensors/+"),
                ],
                None,
            ),
            4,
        );
        let copy = |ids: Vec<u32>| {
            let mut msg = message("data/sensors/t", "{}");
            msg.properties.subscription_identifiers = ids;
            msg
        };

        assert!(matches!(
            relay.decide(&copy(vec![1]), SystemTime::now()),
            Decision::Forward { .. }
        ));
        assert_eq!(
            relay.decide(&copy(vec![2]), SystemTime::now()),
            Decision::Duplicate
        );
        // One copy carrying both identifiers
        assert!(matches!(
            relay.decide(&copy(vec![2, 1]), SystemTime::now()),
            Decision::Forward { .. }
        ));
        // Only the catch-all covers this topic
        let mut other = message("data/x", "{}");
        other.properties.subscription_identifiers = vec![1];
        assert!(matches!(
            relay.decide(&other, SystemTime::now()),
            Decision::Forward { .. }
        ));
    }

    #[tokio::test]
    async fn test_refused_filter_hands_over_copies() {
        let mut relay = relay_loop(
            Flow::Forward,
            registry(
                vec![
                    RuleConfig::new("data/#", "all/#"),
                    RuleConfig::new("data/sensors/+", "sensors/+"),
                ],
                None,
            ),
            4,
        );
        relay
            .on_event(SessionEvent::Subscribed { refused: vec![1] })
            .await;

        let mut msg = message("data/sensors/t", "{}");
        msg.properties.subscription_identifiers = vec![2];
        // Rule order still picks the rewrite
        match relay.decide(&msg, SystemTime::now()) {
            Decision::Forward { message, .. } => assert_eq!(message.topic, "all/sensors/t"),
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rewrite_failure_and_duplicates_counted() {
        let relay = relay_loop(
            Flow::Forward,
            registry(
                vec![RuleConfig::new("a/#", "#"), RuleConfig::new("a/+", "b/+")],
                None,
            ),
            4,
        );

        // `a` leaves `#` with nothing to fill
        relay.handle(message("a", "{}")).await;
        let mut dup = message("a/x", "{}");
        dup.properties.subscription_identifiers = vec![2];
        relay.handle(dup).await;

        let metrics = &relay.metrics;
        assert_eq!(
            metrics.rewrite_failures.with_label_values(&["forward"]).get(),
            1
        );
        assert_eq!(
            metrics.duplicate_copies.with_label_values(&["forward"]).get(),
            1
        );
        assert!(relay.queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_backpressure_drops_oldest() {
        let relay = relay_loop(
            Flow::Forward,
            registry(vec![RuleConfig::new("in/+", "out/+")], None),
            1,
        );

        relay.handle(message("in/1", "{}")).await;
        relay.handle(message("in/2", "{}")).await;

        assert_eq!(
            relay
                .metrics
                .backpressure_drops
                .with_label_values(&["forward"])
                .get(),
            1
        );
        assert_eq!(relay.queue.try_pop().unwrap().topic, "out/2");
    }

    #[test]
    fn test_state_derivation() {
        use SessionStatus::*;
        assert_eq!(
            derive_state(SourcePhase::Down, Connected, false),
            RelayState::Disconnected
        );
        assert_eq!(
            derive_state(SourcePhase::Subscribed, Backoff, false),
            RelayState::Connecting
        );
        assert_eq!(
            derive_state(SourcePhase::Subscribed, Connected, false),
            RelayState::Subscribed
        );
        assert_eq!(
            derive_state(SourcePhase::Relaying, Connected, false),
            RelayState::Relaying
        );
        assert_eq!(
            derive_state(SourcePhase::Relaying, Connected, true),
            RelayState::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_run_tracks_state_and_closes_queue() {
        let relay = relay_loop(
            Flow::Forward,
            registry(vec![RuleConfig::new("in/+", "out/+")], None),
            4,
        );
        let queue = relay.queue.clone();
        let mut state = relay.state();

        let (events_tx, events_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Connected);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(relay.run(events_rx, status_rx, shutdown_rx));

        events_tx.send(SessionEvent::Connecting).await.unwrap();
        events_tx
            .send(SessionEvent::Subscribed { refused: vec![] })
            .await
            .unwrap();
        state
            .wait_for(|s| *s == RelayState::Subscribed)
            .await
            .unwrap();

        events_tx
            .send(SessionEvent::Message(message("in/a", "{}")))
            .await
            .unwrap();
        state.wait_for(|s| *s == RelayState::Relaying).await.unwrap();

        drop(events_tx);
        task.await.unwrap();
        assert!(queue.is_closed());
        assert_eq!(queue.pop().await.unwrap().topic, "out/a");
        assert!(queue.pop().await.is_none());
        assert_eq!(*state.borrow(), RelayState::ShuttingDown);
        drop(status_tx);
    }
}
