//! MQTT v5.0 Properties
//!
//! Only the properties a relay acts on or forwards are kept. Every other
//! identifier is still parsed to its correct width and then skipped, so
//! packets from brokers that send more than we need decode cleanly.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{variable_int_len, write_binary, write_string, write_variable_int, Cursor};
use crate::protocol::{DecodeError, EncodeError};

const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
const CONTENT_TYPE: u8 = 0x03;
const RESPONSE_TOPIC: u8 = 0x08;
const CORRELATION_DATA: u8 = 0x09;
const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
const SERVER_KEEP_ALIVE: u8 = 0x13;
const REASON_STRING: u8 = 0x1F;
const RECEIVE_MAXIMUM: u8 = 0x21;
const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
const TOPIC_ALIAS: u8 = 0x23;
const MAXIMUM_QOS: u8 = 0x24;
const RETAIN_AVAILABLE: u8 = 0x25;
const USER_PROPERTY: u8 = 0x26;
const MAXIMUM_PACKET_SIZE: u8 = 0x27;
const SUBSCRIPTION_IDENTIFIERS_AVAILABLE: u8 = 0x29;

/// Collection of MQTT v5.0 properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub subscription_identifiers_available: Option<u8>,
}

impl Properties {
    /// First value of a user property
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Properties of an inbound PUBLISH that travel with the message when it
    /// is republished elsewhere. Session-scoped ones (topic alias,
    /// subscription identifiers) stay behind.
    pub fn forwardable(&self) -> Properties {
        Properties {
            payload_format_indicator: self.payload_format_indicator,
            message_expiry_interval: self.message_expiry_interval,
            content_type: self.content_type.clone(),
            response_topic: self.response_topic.clone(),
            correlation_data: self.correlation_data.clone(),
            user_properties: self.user_properties.clone(),
            ..Default::default()
        }
    }

    /// Size of the encoded property list, excluding its length prefix
    pub fn encoded_size(&self) -> usize {
        let mut size = 0;
        size += self.payload_format_indicator.map_or(0, |_| 2);
        size += self.message_expiry_interval.map_or(0, |_| 5);
        size += self.content_type.as_ref().map_or(0, |s| 3 + s.len());
        size += self.response_topic.as_ref().map_or(0, |s| 3 + s.len());
        size += self.correlation_data.as_ref().map_or(0, |d| 3 + d.len());
        size += self
            .subscription_identifiers
            .iter()
            .map(|id| 1 + variable_int_len(*id))
            .sum::<usize>();
        size += self.session_expiry_interval.map_or(0, |_| 5);
        size += self
            .assigned_client_identifier
            .as_ref()
            .map_or(0, |s| 3 + s.len());
        size += self.server_keep_alive.map_or(0, |_| 3);
        size += self.reason_string.as_ref().map_or(0, |s| 3 + s.len());
        size += self.receive_maximum.map_or(0, |_| 3);
        size += self.topic_alias_maximum.map_or(0, |_| 3);
        size += self.topic_alias.map_or(0, |_| 3);
        size += self.maximum_qos.map_or(0, |_| 2);
        size += self.retain_available.map_or(0, |_| 2);
        size += self
            .user_properties
            .iter()
            .map(|(k, v)| 5 + k.len() + v.len())
            .sum::<usize>();
        size += self.maximum_packet_size.map_or(0, |_| 5);
        size += self.subscription_identifiers_available.map_or(0, |_| 2);
        size
    }

    /// Size including the variable-length prefix
    pub fn wire_size(&self) -> usize {
        let len = self.encoded_size();
        variable_int_len(len as u32) + len
    }

    /// Write the length prefix followed by every present property
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        if let Some(v) = self.payload_format_indicator {
            buf.put_u8(PAYLOAD_FORMAT_INDICATOR);
            buf.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            buf.put_u8(MESSAGE_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.content_type {
            buf.put_u8(CONTENT_TYPE);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.response_topic {
            buf.put_u8(RESPONSE_TOPIC);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.correlation_data {
            buf.put_u8(CORRELATION_DATA);
            write_binary(buf, d)?;
        }
        for id in &self.subscription_identifiers {
            buf.put_u8(SUBSCRIPTION_IDENTIFIER);
            write_variable_int(buf, *id)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(SESSION_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(ASSIGNED_CLIENT_IDENTIFIER);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(SERVER_KEEP_ALIVE);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(REASON_STRING);
            write_string(buf, s)?;
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(RECEIVE_MAXIMUM);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            buf.put_u8(TOPIC_ALIAS_MAXIMUM);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias {
            buf.put_u8(TOPIC_ALIAS);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            buf.put_u8(MAXIMUM_QOS);
            buf.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            buf.put_u8(RETAIN_AVAILABLE);
            buf.put_u8(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(USER_PROPERTY);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(MAXIMUM_PACKET_SIZE);
            buf.put_u32(v);
        }
        if let Some(v) = self.subscription_identifiers_available {
            buf.put_u8(SUBSCRIPTION_IDENTIFIERS_AVAILABLE);
            buf.put_u8(v);
        }

        Ok(())
    }

    /// Decode a length-prefixed property list
    pub fn decode(cursor: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let len = cursor.read_variable_int()? as usize;
        let mut props = Cursor::new(cursor.take(len)?);
        let mut out = Properties::default();

        while !props.is_empty() {
            let id = props.read_u8()?;
            match id {
                PAYLOAD_FORMAT_INDICATOR => out.payload_format_indicator = Some(props.read_u8()?),
                MESSAGE_EXPIRY_INTERVAL => out.message_expiry_interval = Some(props.read_u32()?),
                CONTENT_TYPE => out.content_type = Some(props.read_string()?.to_string()),
                RESPONSE_TOPIC => out.response_topic = Some(props.read_string()?.to_string()),
                CORRELATION_DATA => {
                    out.correlation_data = Some(Bytes::copy_from_slice(props.read_binary()?))
                }
                SUBSCRIPTION_IDENTIFIER => {
                    out.subscription_identifiers.push(props.read_variable_int()?)
                }
                SESSION_EXPIRY_INTERVAL => out.session_expiry_interval = Some(props.read_u32()?),
                ASSIGNED_CLIENT_IDENTIFIER => {
                    out.assigned_client_identifier = Some(props.read_string()?.to_string())
                }
                SERVER_KEEP_ALIVE => out.server_keep_alive = Some(props.read_u16()?),
                REASON_STRING => out.reason_string = Some(props.read_string()?.to_string()),
                RECEIVE_MAXIMUM => out.receive_maximum = Some(props.read_u16()?),
                TOPIC_ALIAS_MAXIMUM => out.topic_alias_maximum = Some(props.read_u16()?),
                TOPIC_ALIAS => out.topic_alias = Some(props.read_u16()?),
                MAXIMUM_QOS => out.maximum_qos = Some(props.read_u8()?),
                RETAIN_AVAILABLE => out.retain_available = Some(props.read_u8()?),
                MAXIMUM_PACKET_SIZE => out.maximum_packet_size = Some(props.read_u32()?),
                SUBSCRIPTION_IDENTIFIERS_AVAILABLE => {
                    out.subscription_identifiers_available = Some(props.read_u8()?)
                }
                USER_PROPERTY => {
                    let key = props.read_string()?.to_string();
                    let value = props.read_string()?.to_string();
                    out.user_properties.push((key, value));
                }
                // Wildcard/shared availability flags, request flags
                0x17 | 0x19 | 0x28 | 0x2A => {
                    props.read_u8()?;
                }
                // Will delay interval
                0x18 => {
                    props.read_u32()?;
                }
                // Authentication method, response information, server reference
                0x15 | 0x1A | 0x1C => {
                    props.read_string()?;
                }
                // Authentication data
                0x16 => {
                    props.read_binary()?;
                }
                other => return Err(DecodeError::InvalidPropertyId(other)),
            }
        }

        Ok(out)
    }
}
