//! Subscriber session on the source broker of a relay direction

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    Backoff, Connector, Message, MqttConnection, SessionError, SessionEvent, SessionSettings,
    ORIGIN_PROPERTY,
};
use crate::metrics::Metrics;
use crate::protocol::{
    Ack, Packet, Properties, Publish, QoS, ReasonCode, SubAck, Subscribe, Subscription,
    SubscriptionOptions,
};
use crate::rules::RuleSubscription;

/// Session expiry requested from the source broker, in seconds. QoS 1/2
/// messages published while the relay reconnects are kept for this long.
const SESSION_EXPIRY_SECS: u32 = 300;

/// Why the packet loop stopped without an error
enum Stop {
    Shutdown,
    /// The relay loop dropped its receiver
    ReceiverGone,
}

/// Persistent subscription to every rule filter of one direction.
///
/// Each filter goes in its own SUBSCRIBE tagged with its Subscription
/// Identifier, so the relay loop can tell which filter a copy was sent
/// for. Inbound PUBLISHes are handed to the relay loop as [`SessionEvent`]s and
/// acknowledged once the loop has accepted them.
pub struct SubscriberSession {
    settings: SessionSettings,
    connector: Connector,
    subscriptions: Vec<RuleSubscription>,
    /// Set when loop prevention is on
    relay_id: Option<String>,
    events: mpsc::Sender<SessionEvent>,
    metrics: Arc<Metrics>,
}

impl SubscriberSession {
    pub fn new(
        settings: SessionSettings,
        connector: Connector,
        subscriptions: Vec<RuleSubscription>,
        relay_id: Option<String>,
        events: mpsc::Sender<SessionEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            connector,
            subscriptions,
            relay_id,
            events,
            metrics,
        }
    }

    /// Connect, subscribe and deliver messages until shutdown, reconnecting
    /// with backoff whenever the connection fails.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.settings.name.clone();
        let mut backoff = self.settings.backoff();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.events.send(SessionEvent::Connecting).await.is_err() {
                break;
            }
            debug!(
                "Session '{}': Connecting to {}",
                name,
                self.connector.address()
            );

            match self.connect_and_run(&mut backoff, &mut shutdown).await {
                Ok(Stop::Shutdown) => {
                    info!("Session '{}': Disconnected gracefully", name);
                    break;
                }
                Ok(Stop::ReceiverGone) => {
                    debug!("Session '{}': Relay loop gone, stopping", name);
                    break;
                }
                Err(e) => {
                    warn!("Session '{}': Connection failed: {}", name, e);
                    let lost = SessionEvent::ConnectionLost(e.to_string());
                    if self.events.send(lost).await.is_err() {
                        break;
                    }
                }
            }

            let delay = backoff.next_delay();
            debug!("Session '{}': Reconnecting in {:?}", name, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            self.metrics.session_reconnect(&name);
        }
    }

    async fn connect_and_run(
        &self,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Stop, SessionError> {
        let stream = self.connector.connect().await?;
        let connect = self
            .settings
            .connect_packet(false, Some(SESSION_EXPIRY_SECS));
        let (mut conn, connack) =
            MqttConnection::handshake(stream, connect, self.settings.connect_timeout).await?;

        backoff.reset();
        self.metrics.session_connected();
        info!(
            "Session '{}': Connected to {} (session present: {})",
            self.settings.name,
            self.connector.address(),
            connack.session_present
        );

        let keepalive = connack
            .properties
            .server_keep_alive
            .unwrap_or(self.settings.keepalive);

        let result = self
            .serve(&mut conn, connack.session_present, keepalive, shutdown)
            .await;
        self.metrics.session_disconnected();

        if result.is_ok() {
            conn.disconnect().await;
        }
        result
    }

    async fn serve(
        &self,
        conn: &mut MqttConnection,
        session_present: bool,
        keepalive: u16,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Stop, SessionError> {
        if self
            .events
            .send(SessionEvent::Connected { session_present })
            .await
            .is_err()
        {
            return Ok(Stop::ReceiverGone);
        }

        let with_ids = conn.limits().subscription_identifiers;
        if !with_ids {
            warn!(
                "Session '{}': Broker has no subscription identifiers, overlapping filters may deliver duplicates",
                self.settings.name
            );
        }

        // SUBSCRIBE packet id to Subscription Identifier
        let mut pending: HashMap<u16, u32> = HashMap::new();
        for subscription in &self.subscriptions {
            let packet_id = conn.next_packet_id();
            conn.send(&Packet::Subscribe(subscribe_packet(
                packet_id,
                subscription,
                with_ids,
            )))
            .await?;
            pending.insert(packet_id, subscription.id);
        }
        let mut refused: Vec<u32> = Vec::new();
        if pending.is_empty() && !self.subscribed(&mut refused).await? {
            return Ok(Stop::ReceiverGone);
        }

        // Packet ids of QoS 2 messages delivered but not yet released
        let mut awaiting_release: HashSet<u16> = HashSet::new();

        let ping_period = Duration::from_secs(u64::from(keepalive.max(1)));
        let mut ping = interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_outstanding = false;

        loop {
            tokio::select! {
                packet = conn.recv() => {
                    match packet? {
                        Packet::Publish(publish) => {
                            if !self.handle_publish(conn, publish, &mut awaiting_release).await? {
                                return Ok(Stop::ReceiverGone);
                            }
                        }
                        Packet::PubRel(rel) => {
                            let reason_code = if awaiting_release.remove(&rel.packet_id) {
                                ReasonCode::SUCCESS
                            } else {
                                ReasonCode::PACKET_ID_NOT_FOUND
                            };
                            conn.send(&Packet::PubComp(Ack {
                                packet_id: rel.packet_id,
                                reason_code,
                            }))
                            .await?;
                        }
                        Packet::SubAck(suback) if pending.contains_key(&suback.packet_id) => {
                            if let Some(id) = pending.remove(&suback.packet_id) {
                                if !self.check_suback(id, &suback) {
                                    refused.push(id);
                                }
                            }
                            if pending.is_empty() && !self.subscribed(&mut refused).await? {
                                return Ok(Stop::ReceiverGone);
                            }
                        }
                        Packet::PingResp => ping_outstanding = false,
                        Packet::Disconnect(disconnect) => {
                            return Err(SessionError::ConnectionLost(format!(
                                "broker sent DISCONNECT: {}",
                                disconnect.reason_code
                            )));
                        }
                        other => {
                            debug!(
                                "Session '{}': Ignoring unexpected {}",
                                self.settings.name,
                                other.name()
                            );
                        }
                    }
                }
                _ = ping.tick(), if keepalive > 0 => {
                    if ping_outstanding {
                        return Err(SessionError::Timeout("PINGRESP"));
                    }
                    conn.send(&Packet::PingReq).await?;
                    ping_outstanding = true;
                }
                _ = shutdown.changed() => return Ok(Stop::Shutdown),
            }
        }
    }

    /// Deliver one inbound PUBLISH and acknowledge it. Returns false when
    /// the relay loop is gone.
    async fn handle_publish(
        &self,
        conn: &mut MqttConnection,
        publish: Publish,
        awaiting_release: &mut HashSet<u16>,
    ) -> Result<bool, SessionError> {
        let packet_id = publish.packet_id;

        // Redelivered QoS 2 message we already handed over
        if let (QoS::ExactlyOnce, Some(id)) = (publish.qos, packet_id) {
            if awaiting_release.contains(&id) {
                conn.send(&Packet::PubRec(Ack::success(id))).await?;
                return Ok(true);
            }
        }

        if self.is_own_message(&publish) {
            debug!(
                "Session '{}': Dropping {} published by this relay",
                self.settings.name, publish.topic
            );
            self.metrics.loop_dropped();
        } else {
            let qos = publish.qos;
            let message = Message {
                topic: publish.topic,
                payload: publish.payload,
                qos,
                retain: publish.retain,
                properties: publish.properties,
                received_at: SystemTime::now(),
            };
            if self.events.send(SessionEvent::Message(message)).await.is_err() {
                return Ok(false);
            }
        }

        match (publish.qos, packet_id) {
            (QoS::AtLeastOnce, Some(id)) => conn.send(&Packet::PubAck(Ack::success(id))).await?,
            (QoS::ExactlyOnce, Some(id)) => {
                awaiting_release.insert(id);
                conn.send(&Packet::PubRec(Ack::success(id))).await?;
            }
            _ => {}
        }

        Ok(true)
    }

    /// Any origin tag may match: a message relayed through several relays
    /// carries one tag per hop.
    fn is_own_message(&self, publish: &Publish) -> bool {
        let Some(ref id) = self.relay_id else {
            return false;
        };
        publish
            .properties
            .user_properties
            .iter()
            .any(|(key, value)| key == ORIGIN_PROPERTY && value == id)
    }

    /// Whether the broker granted subscription `id`
    fn check_suback(&self, id: u32, suback: &SubAck) -> bool {
        let filter = self
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .map_or("?", |s| s.filter.as_str());

        match suback.reason_codes.first() {
            Some(code) if code.is_success() => true,
            Some(code) => {
                warn!(
                    "Session '{}': Subscription to '{}' refused: {}",
                    self.settings.name, filter, code
                );
                false
            }
            None => {
                warn!(
                    "Session '{}': Empty SUBACK for '{}'",
                    self.settings.name, filter
                );
                false
            }
        }
    }

    /// Report the finished subscription round. Returns false when the relay
    /// loop is gone.
    async fn subscribed(&self, refused: &mut Vec<u32>) -> Result<bool, SessionError> {
        let total = self.subscriptions.len();
        if total > 0 && refused.len() == total {
            return Err(SessionError::Protocol(
                "broker refused every subscription".to_string(),
            ));
        }

        debug!(
            "Session '{}': Subscribed to {}/{} filters",
            self.settings.name,
            total - refused.len(),
            total
        );
        let refused = std::mem::take(refused);
        Ok(self
            .events
            .send(SessionEvent::Subscribed { refused })
            .await
            .is_ok())
    }
}

fn subscribe_packet(packet_id: u16, subscription: &RuleSubscription, with_id: bool) -> Subscribe {
    let mut properties = Properties::default();
    if with_id {
        properties.subscription_identifiers.push(subscription.id);
    }

    Subscribe {
        packet_id,
        subscriptions: vec![Subscription {
            filter: subscription.filter.to_string(),
            options: SubscriptionOptions {
                qos: subscription.qos,
                retain_as_published: true,
                ..Default::default()
            },
        }],
        properties,
    }
}
