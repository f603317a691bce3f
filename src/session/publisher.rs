//! Publisher session on the destination broker of a relay direction

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    Backoff, Connector, MqttConnection, OutboundMessage, OutboundQueue, SessionError,
    SessionSettings, SessionStatus, ORIGIN_PROPERTY,
};
use crate::metrics::Metrics;
use crate::protocol::{Ack, Packet, Publish, QoS, ReasonCode};
use crate::rules::Flow;

/// Drains an [`OutboundQueue`] into the destination broker, one message in
/// flight at a time so ordering is kept per direction.
///
/// A message whose write or acknowledgement fails is counted and dropped;
/// the session then reconnects. The loop ends once the queue is closed and
/// empty.
pub struct PublisherSession {
    settings: SessionSettings,
    connector: Connector,
    queue: Arc<OutboundQueue>,
    flow: Flow,
    /// Origin tag added to every PUBLISH when loop prevention is on
    relay_id: Option<String>,
    ack_timeout: Duration,
    status: watch::Sender<SessionStatus>,
    metrics: Arc<Metrics>,
}

impl PublisherSession {
    pub fn new(
        settings: SessionSettings,
        connector: Connector,
        queue: Arc<OutboundQueue>,
        flow: Flow,
        relay_id: Option<String>,
        ack_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        Self {
            settings,
            connector,
            queue,
            flow,
            relay_id,
            ack_timeout,
            status,
            metrics,
        }
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Publish until the queue is closed and drained. Shutdown only cuts
    /// the loop short while no connection is up.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.settings.name.clone();
        let mut backoff = self.settings.backoff();

        loop {
            if *shutdown.borrow() || (self.queue.is_closed() && self.queue.is_empty()) {
                if !self.queue.is_empty() {
                    warn!(
                        "Session '{}': Dropping {} queued messages at shutdown",
                        name,
                        self.queue.len()
                    );
                }
                break;
            }

            self.status.send_replace(SessionStatus::Connecting);
            debug!(
                "Session '{}': Connecting to {}",
                name,
                self.connector.address()
            );

            match self.connect_and_run(&mut backoff).await {
                Ok(()) => {
                    info!("Session '{}': Queue drained, disconnected", name);
                    break;
                }
                Err(e) => {
                    warn!("Session '{}': Connection failed: {}", name, e);
                    self.status.send_replace(SessionStatus::Backoff);
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

        self.status.send_replace(SessionStatus::Closed);
    }

    async fn connect_and_run(&self, backoff: &mut Backoff) -> Result<(), SessionError> {
        let stream = self.connector.connect().await?;
        let connect = self.settings.connect_packet(true, None);
        let (mut conn, connack) =
            MqttConnection::handshake(stream, connect, self.settings.connect_timeout).await?;

        backoff.reset();
        self.metrics.session_connected();
        self.status.send_replace(SessionStatus::Connected);
        info!(
            "Session '{}': Connected to {}",
            self.settings.name,
            self.connector.address()
        );

        let keepalive = connack
            .properties
            .server_keep_alive
            .unwrap_or(self.settings.keepalive);

        let result = self.pump(&mut conn, keepalive).await;
        self.metrics.session_disconnected();

        if result.is_ok() {
            conn.disconnect().await;
        }
        result
    }

    async fn pump(&self, conn: &mut MqttConnection, keepalive: u16) -> Result<(), SessionError> {
        let ping_period = Duration::from_secs(u64::from(keepalive.max(1)));
        let mut ping = interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_outstanding = false;

        loop {
            let msg = tokio::select! {
                msg = self.queue.pop() => match msg {
                    Some(msg) => msg,
                    None => return Ok(()),
                },
                packet = conn.recv() => {
                    match packet? {
                        Packet::PingResp => ping_outstanding = false,
                        Packet::Disconnect(disconnect) => {
                            return Err(SessionError::ConnectionLost(format!(
                                "broker sent DISCONNECT: {}",
                                disconnect.reason_code
                            )));
                        }
                        other => debug!(
                            "Session '{}': Ignoring unexpected {}",
                            self.settings.name,
                            other.name()
                        ),
                    }
                    continue;
                }
                _ = ping.tick(), if keepalive > 0 => {
                    if ping_outstanding {
                        return Err(SessionError::Timeout("PINGRESP"));
                    }
                    conn.send(&Packet::PingReq).await?;
                    ping_outstanding = true;
                    continue;
                }
            };

            self.publish(conn, msg).await?;
            // Any acknowledgement proves the broker is alive
            ping_outstanding = false;
        }
    }

    /// Publish one message and wait for its final acknowledgement.
    ///
    /// QoS is capped at the broker's Maximum QoS and the retain flag is
    /// cleared when the broker has retain unavailable.
    async fn publish(
        &self,
        conn: &mut MqttConnection,
        msg: OutboundMessage,
    ) -> Result<(), SessionError> {
        let limits = conn.limits();
        let qos = msg.qos.min(limits.maximum_qos);
        let retain = msg.retain && limits.retain_available;
        let topic = msg.topic.clone();
        let packet_id = (qos != QoS::AtMostOnce).then(|| conn.next_packet_id());

        let mut properties = msg.properties;
        if let Some(ref id) = self.relay_id {
            properties
                .user_properties
                .push((ORIGIN_PROPERTY.to_string(), id.clone()));
        }

        let started = Instant::now();
        let sent = conn
            .send(&Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic: msg.topic,
                packet_id,
                payload: msg.payload,
                properties,
            }))
            .await;
        match sent {
            Ok(()) => {}
            Err(SessionError::PacketTooLarge { size, limit }) => {
                warn!(
                    "Session '{}': Dropping '{}': {} bytes exceeds broker limit of {}",
                    self.settings.name, topic, size, limit
                );
                self.metrics.publish_failed(self.flow.as_str());
                return Ok(());
            }
            Err(e) => {
                self.metrics.publish_failed(self.flow.as_str());
                return Err(e);
            }
        }

        let Some(packet_id) = packet_id else {
            self.delivered(started);
            return Ok(());
        };

        let expected = if qos == QoS::ExactlyOnce {
            "PUBCOMP"
        } else {
            "PUBACK"
        };
        let outcome = timeout(self.ack_timeout, Self::complete(conn, qos, packet_id)).await;

        match outcome {
            Ok(Ok(code)) if code.is_success() => {
                self.delivered(started);
                Ok(())
            }
            Ok(Ok(code)) => {
                warn!(
                    "Session '{}': Broker refused '{}': {}",
                    self.settings.name, topic, code
                );
                self.metrics.publish_failed(self.flow.as_str());
                Ok(())
            }
            Ok(Err(e)) => {
                self.metrics.publish_failed(self.flow.as_str());
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Session '{}': No {} for '{}' within {:?}",
                    self.settings.name, expected, topic, self.ack_timeout
                );
                self.metrics.publish_failed(self.flow.as_str());
                Err(SessionError::Timeout(expected))
            }
        }
    }

    /// Run the acknowledgement exchange for `packet_id`, returning the
    /// broker's final reason code
    async fn complete(
        conn: &mut MqttConnection,
        qos: QoS,
        packet_id: u16,
    ) -> Result<ReasonCode, SessionError> {
        loop {
            match conn.recv().await? {
                Packet::PubAck(ack) if qos == QoS::AtLeastOnce && ack.packet_id == packet_id => {
                    return Ok(ack.reason_code);
                }
                Packet::PubRec(rec) if qos == QoS::ExactlyOnce && rec.packet_id == packet_id => {
                    if !rec.reason_code.is_success() {
                        return Ok(rec.reason_code);
                    }
                    conn.send(&Packet::PubRel(Ack::success(packet_id))).await?;
                }
                Packet::PubComp(comp) if qos == QoS::ExactlyOnce && comp.packet_id == packet_id => {
                    return Ok(comp.reason_code);
                }
                Packet::Disconnect(disconnect) => {
                    return Err(SessionError::ConnectionLost(format!(
                        "broker sent DISCONNECT: {}",
                        disconnect.reason_code
                    )));
                }
                other => debug!("Ignoring {} while awaiting acknowledgement", other.name()),
            }
        }
    }

    fn delivered(&self, started: Instant) {
        self.metrics
            .message_forwarded(self.flow.as_str(), started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use crate::config::EndpointConfig;
    use crate::protocol::Properties;
    use bytes::{Bytes, BytesMut};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK: [u8; 5] = [0x20, 0x03, 0x00, 0x00, 0x00];

    async fn read_raw(stream: &mut TcpStream) -> Vec<u8> {
        let mut packet = vec![stream.read_u8().await.unwrap()];
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            packet.push(byte);
            len |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let start = packet.len();
        packet.resize(start + len, 0);
        stream.read_exact(&mut packet[start..]).await.unwrap();
        packet
    }

    async fn read_publish(stream: &mut TcpStream) -> Publish {
        let mut buf = BytesMut::from(&read_raw(stream).await[..]);
        match Decoder::new().decode(&mut buf).unwrap() {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn accept(listener: &TcpListener) -> TcpStream {
        accept_with(listener, &CONNACK).await
    }

    async fn accept_with(listener: &TcpListener, connack: &[u8]) -> TcpStream {
        let (mut broker, _) = listener.accept().await.unwrap();
        assert_eq!(read_raw(&mut broker).await[0], 0x10);
        broker.write_all(connack).await.unwrap();
        broker
    }

    fn msg(topic: &str, qos: QoS) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"{\"v\":1}"),
            qos,
            retain: true,
            properties: Properties::default(),
        }
    }

    struct Harness {
        listener: TcpListener,
        queue: Arc<OutboundQueue>,
        metrics: Arc<Metrics>,
        status: watch::Receiver<SessionStatus>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn start(relay_id: Option<&str>, ack_timeout: Duration) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = EndpointConfig::new("127.0.0.1", port);

        let settings = SessionSettings::new(
            "forward/pub",
            &endpoint,
            "fwd-pub",
            Duration::from_millis(50),
            Duration::from_millis(200),
        );
        let queue = Arc::new(OutboundQueue::new(8));
        let metrics = Arc::new(Metrics::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let session = PublisherSession::new(
            settings,
            Connector::new(&endpoint).unwrap(),
            queue.clone(),
            Flow::Forward,
            relay_id.map(str::to_string),
            ack_timeout,
            metrics.clone(),
        );
        let status = session.status();
        let handle = tokio::spawn(session.run(shutdown_rx));

        Harness {
            listener,
            queue,
            metrics,
            status,
            shutdown,
            handle,
        }
    }

    fn forwarded(metrics: &Metrics) -> u64 {
        metrics
            .messages_forwarded
            .with_label_values(&["forward"])
            .get()
    }

    fn failed(metrics: &Metrics) -> u64 {
        metrics.publish_failures.with_label_values(&["forward"]).get()
    }

    #[tokio::test]
    async fn test_qos1_publish_tagged_and_acked() {
        let h = start(Some("edge-1"), Duration::from_secs(5)).await;
        h.queue
            .push(msg("out/a", QoS::AtLeastOnce), Duration::ZERO)
            .await;

        let mut broker = accept(&h.listener).await;
        let publish = read_publish(&mut broker).await;
        assert_eq!(publish.topic, "out/a");
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert!(publish.retain);
        assert_eq!(publish.payload, Bytes::from_static(b"{\"v\":1}"));
        assert_eq!(publish.properties.user_property(ORIGIN_PROPERTY), Some("edge-1"));

        let id = publish.packet_id.unwrap();
        broker
            .write_all(&[0x40, 0x02, (id >> 8) as u8, id as u8])
            .await
            .unwrap();

        h.queue.close();
        // DISCONNECT once the queue is drained
        assert_eq!(read_raw(&mut broker).await, vec![0xE0, 0x00]);
        h.handle.await.unwrap();

        assert_eq!(forwarded(&h.metrics), 1);
        assert_eq!(*h.status.borrow(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_qos2_exchange() {
        let h = start(None, Duration::from_secs(5)).await;
        h.queue
            .push(msg("out/b", QoS::ExactlyOnce), Duration::ZERO)
            .await;

        let mut broker = accept(&h.listener).await;
        let publish = read_publish(&mut broker).await;
        assert!(publish.properties.user_property(ORIGIN_PROPERTY).is_none());
        let id = publish.packet_id.unwrap();
        let (hi, lo) = ((id >> 8) as u8, id as u8);

        broker.write_all(&[0x50, 0x02, hi, lo]).await.unwrap();
        assert_eq!(read_raw(&mut broker).await, vec![0x62, 0x02, hi, lo]);
        broker.write_all(&[0x70, 0x02, hi, lo]).await.unwrap();

        h.queue.close();
        assert_eq!(read_raw(&mut broker).await[0], 0xE0);
        h.handle.await.unwrap();
        assert_eq!(forwarded(&h.metrics), 1);
    }

    #[tokio::test]
    async fn test_refused_publish_is_counted_and_skipped() {
        let h = start(None, Duration::from_secs(5)).await;
        h.queue
            .push(msg("out/denied", QoS::AtLeastOnce), Duration::ZERO)
            .await;
        h.queue
            .push(msg("out/next", QoS::AtLeastOnce), Duration::ZERO)
            .await;

        let mut broker = accept(&h.listener).await;
        let first = read_publish(&mut broker).await;
        let id = first.packet_id.unwrap();
        broker
            .write_all(&[0x40, 0x03, (id >> 8) as u8, id as u8, 0x87])
            .await
            .unwrap();

        // Same connection carries on with the next message
        let second = read_publish(&mut broker).await;
        assert_eq!(second.topic, "out/next");
        let id = second.packet_id.unwrap();
        broker
            .write_all(&[0x40, 0x02, (id >> 8) as u8, id as u8])
            .await
            .unwrap();

        h.queue.close();
        h.handle.await.unwrap();
        assert_eq!(failed(&h.metrics), 1);
        assert_eq!(forwarded(&h.metrics), 1);
    }

    #[tokio::test]
    async fn test_ack_timeout_reconnects_without_retry() {
        let h = start(None, Duration::from_millis(100)).await;
        h.queue
            .push(msg("out/lost", QoS::AtLeastOnce), Duration::ZERO)
            .await;

        let mut broker = accept(&h.listener).await;
        assert_eq!(read_publish(&mut broker).await.topic, "out/lost");

        // No PUBACK: the session gives up and comes back on a new connection
        let mut broker2 = accept(&h.listener).await;
        h.queue
            .push(msg("out/after", QoS::AtMostOnce), Duration::ZERO)
            .await;
        assert_eq!(read_publish(&mut broker2).await.topic, "out/after");

        h.queue.close();
        h.handle.await.unwrap();
        assert_eq!(failed(&h.metrics), 1);
        assert_eq!(
            h.metrics
                .session_reconnects
                .with_label_values(&["forward/pub"])
                .get(),
            1
        );
        drop(broker);
    }

    #[tokio::test]
    async fn test_connack_limits_cap_qos_and_retain() {
        let h = start(None, Duration::from_secs(5)).await;
        h.queue
            .push(msg("out/capped", QoS::ExactlyOnce), Duration::ZERO)
            .await;

        // Maximum QoS 1, Retain Available 0
        let mut broker = accept_with(
            &h.listener,
            &[0x20, 0x07, 0x00, 0x00, 0x04, 0x24, 0x01, 0x25, 0x00],
        )
        .await;
        let publish = read_publish(&mut broker).await;
        assert_eq!(publish.topic, "out/capped");
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert!(!publish.retain);

        let id = publish.packet_id.unwrap();
        broker
            .write_all(&[0x40, 0x02, (id >> 8) as u8, id as u8])
            .await
            .unwrap();

        h.queue.close();
        assert_eq!(read_raw(&mut broker).await[0], 0xE0);
        h.handle.await.unwrap();
        assert_eq!(forwarded(&h.metrics), 1);
        assert_eq!(failed(&h.metrics), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_skipped_without_reconnect() {
        let h = start(None, Duration::from_secs(5)).await;
        let mut big = msg("out/big", QoS::AtMostOnce);
        big.payload = Bytes::from(vec![0x41; 200]);
        h.queue.push(big, Duration::ZERO).await;
        h.queue
            .push(msg("out/small", QoS::AtMostOnce), Duration::ZERO)
            .await;

        // Maximum Packet Size 64
        let mut broker = accept_with(
            &h.listener,
            &[0x20, 0x08, 0x00, 0x00, 0x05, 0x27, 0x00, 0x00, 0x00, 0x40],
        )
        .await;
        assert_eq!(read_publish(&mut broker).await.topic, "out/small");

        h.queue.close();
        h.handle.await.unwrap();
        assert_eq!(failed(&h.metrics), 1);
        assert_eq!(forwarded(&h.metrics), 1);
        assert_eq!(
            h.metrics
                .session_reconnects
                .with_label_values(&["forward/pub"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_shutdown_while_unreachable() {
        let h = start(None, Duration::from_secs(5)).await;
        drop(h.listener);

        h.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), h.handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*h.status.borrow(), SessionStatus::Closed);
    }
}
