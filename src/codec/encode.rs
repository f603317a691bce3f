//! MQTT Packet Encoder
//!
//! Encodes the packets a client sends to a broker.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    Ack, Connect, Disconnect, EncodeError, Packet, Publish, QoS, ReasonCode, Subscribe,
    PROTOCOL_LEVEL,
};

/// MQTT Packet Encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => self.encode_ack(0x40, p, buf),
            Packet::PubRec(p) => self.encode_ack(0x50, p, buf),
            // PUBREL carries the mandatory 0b0010 flags
            Packet::PubRel(p) => self.encode_ack(0x62, p, buf),
            Packet::PubComp(p) => self.encode_ack(0x70, p, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect(p) => self.encode_disconnect(p, buf),
            other => Err(EncodeError::UnsupportedPacket(other.name())),
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Protocol name (2 + 4) + level (1) + flags (1) + keep alive (2)
        let mut remaining_length = 10;
        remaining_length += packet.properties.wire_size();
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, "MQTT")?;
        buf.put_u8(PROTOCOL_LEVEL);

        let mut connect_flags: u8 = 0;
        if packet.clean_start {
            connect_flags |= 0x02;
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);

        packet.properties.encode(buf)?;

        write_string(buf, &packet.client_id)?;
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.topic.len();
        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }
        remaining_length += packet.properties.wire_size();
        remaining_length += packet.payload.len();

        let mut first_byte: u8 = 0x30;
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, &packet.topic)?;
        if packet.qos != QoS::AtMostOnce {
            buf.put_u16(packet.packet_id.unwrap_or(0));
        }
        packet.properties.encode(buf)?;
        buf.put_slice(&packet.payload);

        Ok(())
    }

    fn encode_ack(&self, header: u8, ack: &Ack, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(header);
        // Reason code may be omitted on success when there are no properties
        if ack.reason_code == ReasonCode::SUCCESS {
            buf.put_u8(0x02);
            buf.put_u16(ack.packet_id);
        } else {
            buf.put_u8(0x03);
            buf.put_u16(ack.packet_id);
            buf.put_u8(ack.reason_code.0);
        }
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.properties.wire_size();
        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1;
        }

        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        packet.properties.encode(buf)?;

        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.options.to_byte());
        }

        Ok(())
    }

    fn encode_disconnect(
        &self,
        packet: &Disconnect,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(0xE0);
        if packet.reason_code == ReasonCode::SUCCESS && packet.properties == Default::default() {
            buf.put_u8(0x00);
            return Ok(());
        }

        let remaining_length = 1 + packet.properties.wire_size();
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u8(packet.reason_code.0);
        packet.properties.encode(buf)?;
        Ok(())
    }
}
