//! Framed MQTT connection over a broker stream

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use super::{BoxedStream, SessionError, SessionSettings};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{ConnAck, Connect, Disconnect, Packet, Properties, QoS};

const READ_BUFFER_SIZE: usize = 4096;

/// What the broker lets this client send, taken from CONNACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLimits {
    pub maximum_qos: QoS,
    pub retain_available: bool,
    /// `None` when the broker sets no limit
    pub maximum_packet_size: Option<u32>,
    pub subscription_identifiers: bool,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            maximum_qos: QoS::ExactlyOnce,
            retain_available: true,
            maximum_packet_size: None,
            subscription_identifiers: true,
        }
    }
}

impl ServerLimits {
    /// Absent properties mean the feature is fully supported
    pub fn from_connack(properties: &Properties) -> Self {
        Self {
            maximum_qos: properties
                .maximum_qos
                .and_then(QoS::from_u8)
                .unwrap_or(QoS::ExactlyOnce),
            retain_available: properties.retain_available != Some(0),
            maximum_packet_size: properties.maximum_packet_size,
            subscription_identifiers: properties.subscription_identifiers_available != Some(0),
        }
    }
}

/// An MQTT connection: a stream plus an accumulating read buffer.
///
/// `recv` is cancel-safe. Partial packets stay in the buffer when a
/// `select!` branch loses, so no bytes are lost between calls.
pub struct MqttConnection {
    stream: BoxedStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
    limits: ServerLimits,
    next_packet_id: u16,
}

impl MqttConnection {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            limits: ServerLimits::default(),
            next_packet_id: 1,
        }
    }

    /// Send CONNECT and wait for an accepting CONNACK.
    ///
    /// Inbound packets are capped at the Maximum Packet Size the CONNECT
    /// advertises; outbound ones at whatever the CONNACK allows.
    pub async fn handshake(
        stream: BoxedStream,
        connect: Connect,
        connack_timeout: Duration,
    ) -> Result<(Self, ConnAck), SessionError> {
        let mut conn = Self::new(stream);
        if let Some(max) = connect.properties.maximum_packet_size {
            conn.decoder = conn.decoder.with_max_packet_size(max as usize);
        }
        conn.send(&Packet::Connect(Box::new(connect))).await?;

        let packet = timeout(connack_timeout, conn.recv())
            .await
            .map_err(|_| SessionError::Timeout("CONNACK"))??;

        match packet {
            Packet::ConnAck(connack) if connack.reason_code.is_success() => {
                conn.limits = ServerLimits::from_connack(&connack.properties);
                Ok((conn, connack))
            }
            Packet::ConnAck(connack) => Err(SessionError::Rejected(connack.reason_code)),
            other => Err(SessionError::Protocol(format!(
                "expected CONNACK, got {}",
                other.name()
            ))),
        }
    }

    pub fn limits(&self) -> ServerLimits {
        self.limits
    }

    /// Encode and write one packet. A packet over the broker's limit is not
    /// written and the connection stays usable.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), SessionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        if let Some(limit) = self.limits.maximum_packet_size {
            if self.write_buf.len() > limit as usize {
                return Err(SessionError::PacketTooLarge {
                    size: self.write_buf.len(),
                    limit,
                });
            }
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next packet from the broker
    pub async fn recv(&mut self) -> Result<Packet, SessionError> {
        loop {
            if let Some(packet) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(packet);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(SessionError::ConnectionLost(
                    "connection closed by broker".to_string(),
                ));
            }
        }
    }

    /// Allocate a packet identifier, skipping 0
    pub fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }

    /// Best-effort DISCONNECT and stream shutdown
    pub async fn disconnect(&mut self) {
        let _ = self
            .send(&Packet::Disconnect(Disconnect::default()))
            .await;
        let _ = self.stream.shutdown().await;
    }
}

impl SessionSettings {
    /// CONNECT packet for this session
    pub fn connect_packet(&self, clean_start: bool, session_expiry: Option<u32>) -> Connect {
        Connect {
            client_id: self.client_id.clone(),
            clean_start,
            keep_alive: self.keepalive,
            username: self.username.clone(),
            password: self.password.as_ref().map(|p| p.clone().into_bytes().into()),
            properties: Properties {
                session_expiry_interval: session_expiry,
                maximum_packet_size: Some(self.max_packet_size),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::protocol::{Ack, Publish, ReasonCode};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, DuplexStream};

    fn connect() -> Connect {
        Connect {
            client_id: "c".to_string(),
            clean_start: true,
            keep_alive: 0,
            username: None,
            password: None,
            properties: Properties::default(),
        }
    }

    async fn read_some(broker: &mut DuplexStream) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let n = broker.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_handshake_accepted() {
        let (client, mut broker) = duplex(1024);

        let server = tokio::spawn(async move {
            let connect = read_some(&mut broker).await;
            assert_eq!(connect[0], 0x10);
            broker.write_all(&[0x20, 0x03, 0x01, 0x00, 0x00]).await.unwrap();
            broker
        });

        let (_conn, connack) =
            MqttConnection::handshake(Box::new(client), connect(), Duration::from_secs(5))
                .await
                .unwrap();
        assert!(connack.session_present);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (client, mut broker) = duplex(1024);

        tokio::spawn(async move {
            read_some(&mut broker).await;
            broker.write_all(&[0x20, 0x03, 0x00, 0x87, 0x00]).await.unwrap();
            broker
        });

        let result =
            MqttConnection::handshake(Box::new(client), connect(), Duration::from_secs(5)).await;
        match result {
            Err(SessionError::Rejected(code)) => assert_eq!(code, ReasonCode::NOT_AUTHORIZED),
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let (client, _broker) = duplex(1024);
        let result =
            MqttConnection::handshake(Box::new(client), connect(), Duration::from_millis(50))
                .await;
        assert!(matches!(result, Err(SessionError::Timeout("CONNACK"))));
    }

    #[tokio::test]
    async fn test_recv_reassembles_split_packets() {
        let (client, mut broker) = duplex(1024);
        let mut conn = MqttConnection::new(Box::new(client));

        broker.write_all(&[0x40, 0x02]).await.unwrap();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            broker.write_all(&[0x00, 0x07, 0xD0, 0x00]).await.unwrap();
            broker
        });

        assert_eq!(conn.recv().await.unwrap(), Packet::PubAck(Ack::success(7)));
        assert_eq!(conn.recv().await.unwrap(), Packet::PingResp);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_reports_closed_stream() {
        let (client, broker) = duplex(1024);
        let mut conn = MqttConnection::new(Box::new(client));
        drop(broker);
        assert!(matches!(
            conn.recv().await,
            Err(SessionError::ConnectionLost(_))
        ));
    }

    fn publish(payload_len: usize) -> Packet {
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "data/blob".to_string(),
            packet_id: Some(1),
            payload: Bytes::from(vec![0x5A; payload_len]),
            properties: Properties::default(),
        })
    }

    #[test]
    fn test_connect_advertises_maximum_packet_size() {
        let mut endpoint = EndpointConfig::new("broker", 1883);
        endpoint.max_packet_size = 4 * 1024 * 1024;
        let settings = SessionSettings::new(
            "forward/sub",
            &endpoint,
            "fwd-sub",
            Duration::from_secs(1),
            Duration::from_secs(2),
        );

        let connect = settings.connect_packet(false, Some(300));
        assert_eq!(connect.properties.maximum_packet_size, Some(4 * 1024 * 1024));
        assert_eq!(connect.properties.session_expiry_interval, Some(300));
    }

    #[tokio::test]
    async fn test_large_publish_within_advertised_limit() {
        let (client, mut broker) = duplex(64 * 1024);

        // Just over the default 1 MiB cap
        let big = publish(1_200_000);
        let server = tokio::spawn(async move {
            read_some(&mut broker).await;
            broker.write_all(&[0x20, 0x03, 0x00, 0x00, 0x00]).await.unwrap();
            let mut buf = BytesMut::new();
            Encoder::new().encode(&big, &mut buf).unwrap();
            broker.write_all(&buf).await.unwrap();
            broker
        });

        let mut connect = connect();
        connect.properties.maximum_packet_size = Some(2 * 1024 * 1024);
        let (mut conn, _) = MqttConnection::handshake(Box::new(client), connect, Duration::from_secs(5))
            .await
            .unwrap();

        match conn.recv().await.unwrap() {
            Packet::Publish(p) => assert_eq!(p.payload.len(), 1_200_000),
            other => panic!("expected PUBLISH, got {}", other.name()),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_packet_over_default_limit_rejected() {
        let (client, mut broker) = duplex(1024);
        let mut conn = MqttConnection::new(Box::new(client));

        // PUBLISH header announcing 1,200,000 bytes
        broker.write_all(&[0x30, 0x80, 0x9F, 0x49]).await.unwrap();
        assert!(matches!(
            conn.recv().await,
            Err(SessionError::Decode(crate::protocol::DecodeError::PacketTooLarge))
        ));
    }

    #[tokio::test]
    async fn test_connack_limits_applied_to_sends() {
        let (client, mut broker) = duplex(1024);

        let server = tokio::spawn(async move {
            read_some(&mut broker).await;
            // maximum QoS 1, retain unavailable, maximum packet size 64
            broker
                .write_all(&[
                    0x20, 0x0C, 0x00, 0x00, 0x09, 0x24, 0x01, 0x25, 0x00, 0x27, 0x00, 0x00, 0x00,
                    0x40,
                ])
                .await
                .unwrap();
            broker
        });

        let (mut conn, _) =
            MqttConnection::handshake(Box::new(client), connect(), Duration::from_secs(5))
                .await
                .unwrap();
        let _broker = server.await.unwrap();
        assert_eq!(
            conn.limits(),
            ServerLimits {
                maximum_qos: QoS::AtLeastOnce,
                retain_available: false,
                maximum_packet_size: Some(64),
                subscription_identifiers: true,
            }
        );

        assert!(matches!(
            conn.send(&publish(100)).await,
            Err(SessionError::PacketTooLarge { limit: 64, .. })
        ));
        conn.send(&publish(10)).await.unwrap();
    }

    #[test]
    fn test_packet_ids_skip_zero() {
        let (client, _broker) = duplex(16);
        let mut conn = MqttConnection::new(Box::new(client));
        conn.next_packet_id = u16::MAX;
        assert_eq!(conn.next_packet_id(), u16::MAX);
        assert_eq!(conn.next_packet_id(), 1);
    }
}
