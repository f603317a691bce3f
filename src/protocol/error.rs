//! Protocol error types

use std::fmt;

/// Errors that can occur while decoding a packet received from a broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Packet type a broker never sends to a client
    UnexpectedPacketType(u8),
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid property identifier
    InvalidPropertyId(u8),
    /// Invalid packet flags
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet too large
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::UnexpectedPacketType(t) => write!(f, "unexpected packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidPropertyId(id) => write!(f, "invalid property identifier: {}", id),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur while encoding a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Packet too large
    PacketTooLarge,
    /// String or binary field longer than 65535 bytes
    StringTooLong,
    /// Encoder was asked to encode a packet only brokers send
    UnsupportedPacket(&'static str),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::UnsupportedPacket(name) => write!(f, "cannot encode {} as a client", name),
        }
    }
}

impl std::error::Error for EncodeError {}
