//! MQTT Protocol definitions and types
//!
//! Client-side view of MQTT v5.0: the packets a relay session sends to a
//! broker and the packets it expects back.

mod error;
mod packet;
mod properties;
mod reason;

pub use error::{DecodeError, EncodeError};
pub use packet::*;
pub use properties::Properties;
pub use reason::ReasonCode;

/// Protocol level byte sent in CONNECT (MQTT v5.0)
pub const PROTOCOL_LEVEL: u8 = 5;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// Retain handling options for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    /// Send retained messages at subscription time
    #[default]
    SendAtSubscribe = 0,
    /// Send retained messages only for new subscriptions
    SendAtSubscribeIfNew = 1,
    /// Do not send retained messages
    DoNotSend = 2,
}

/// Subscription options byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    /// Keep the publisher's retain flag on forwarded messages.
    /// Relays set this so the destination sees retained messages as retained.
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    pub fn to_byte(self) -> u8 {
        (self.qos as u8)
            | ((self.no_local as u8) << 2)
            | ((self.retain_as_published as u8) << 3)
            | ((self.retain_handling as u8) << 4)
    }
}
