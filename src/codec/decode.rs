//! MQTT Packet Decoder
//!
//! Decodes the packets a broker sends to a client.

use bytes::{Buf, Bytes, BytesMut};

use super::{read_variable_int, Cursor, DEFAULT_MAX_PACKET_SIZE, MAX_PACKET_SIZE};
use crate::protocol::{
    Ack, ConnAck, DecodeError, Disconnect, Packet, Properties, Publish, QoS, ReasonCode, SubAck,
};

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_PACKET_SIZE);
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode one packet from the front of an accumulating read buffer.
    ///
    /// On success the packet's bytes are consumed from `buf`; `Ok(None)`
    /// means more data is needed and `buf` is left untouched.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        match self.decode_slice(buf)? {
            Some((packet, consumed)) => {
                buf.advance(consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Decode one packet from a byte slice.
    /// Returns (packet, bytes_consumed) when a complete packet is present.
    pub fn decode_slice(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Maximum Packet Size counts the whole packet, fixed header included
        let total_len = 1 + len_bytes + remaining_length as usize;
        if total_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        if buf.len() < total_len {
            return Ok(None);
        }

        let mut body = Cursor::new(&buf[1 + len_bytes..total_len]);

        let packet = match packet_type {
            2 => Self::decode_connack(flags, &mut body)?,
            3 => Self::decode_publish(flags, &mut body)?,
            4 => Packet::PubAck(Self::decode_ack(flags, 0x00, &mut body)?),
            5 => Packet::PubRec(Self::decode_ack(flags, 0x00, &mut body)?),
            6 => Packet::PubRel(Self::decode_ack(flags, 0x02, &mut body)?),
            7 => Packet::PubComp(Self::decode_ack(flags, 0x00, &mut body)?),
            9 => Self::decode_suback(flags, &mut body)?,
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingResp
            }
            14 => Self::decode_disconnect(flags, &mut body)?,
            other => return Err(DecodeError::UnexpectedPacketType(other)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connack(flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let acknowledge_flags = body.read_u8()?;
        if acknowledge_flags & 0xFE != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let reason_code = ReasonCode(body.read_u8()?);
        let properties = if body.is_empty() {
            Properties::default()
        } else {
            Properties::decode(body)?
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present: acknowledge_flags & 0x01 != 0,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        let dup = flags & 0x08 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = flags & 0x01 != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let topic = body.read_string()?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = body.read_u16()?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            Some(id)
        } else {
            None
        };

        let properties = Properties::decode(body)?;

        // Sessions advertise no topic aliases, so a broker must always send the name
        if topic.is_empty() {
            return Err(DecodeError::MalformedPacket("empty topic name"));
        }

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(body.rest()),
            properties,
        }))
    }

    fn decode_ack(flags: u8, expected: u8, body: &mut Cursor<'_>) -> Result<Ack, DecodeError> {
        if flags != expected {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = body.read_u16()?;
        let reason_code = if body.is_empty() {
            ReasonCode::SUCCESS
        } else {
            ReasonCode(body.read_u8()?)
        };
        if !body.is_empty() {
            // Reason string / user properties are not acted on
            Properties::decode(body)?;
        }

        Ok(Ack {
            packet_id,
            reason_code,
        })
    }

    fn decode_suback(flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = body.read_u16()?;
        let properties = Properties::decode(body)?;
        let reason_codes: Vec<ReasonCode> = body.rest().iter().map(|b| ReasonCode(*b)).collect();
        if reason_codes.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBACK without reason codes"));
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        if body.is_empty() {
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        let reason_code = ReasonCode(body.read_u8()?);
        let properties = if body.is_empty() {
            Properties::default()
        } else {
            Properties::decode(body)?
        };

        Ok(Packet::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }
}
