//! MQTT v5.0 reason codes

use std::fmt;

/// Reason code carried by CONNACK, PUBACK, PUBREC, PUBREL, PUBCOMP, SUBACK
/// and DISCONNECT.
///
/// Kept as a raw byte: a relay only needs to tell success from failure and
/// log the failure, so unknown codes are preserved instead of rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReasonCode(pub u8);

impl ReasonCode {
    pub const SUCCESS: ReasonCode = ReasonCode(0x00);
    pub const GRANTED_QOS_1: ReasonCode = ReasonCode(0x01);
    pub const GRANTED_QOS_2: ReasonCode = ReasonCode(0x02);
    pub const NO_MATCHING_SUBSCRIBERS: ReasonCode = ReasonCode(0x10);
    pub const UNSPECIFIED_ERROR: ReasonCode = ReasonCode(0x80);
    pub const NOT_AUTHORIZED: ReasonCode = ReasonCode(0x87);
    pub const SERVER_SHUTTING_DOWN: ReasonCode = ReasonCode(0x8B);
    pub const KEEP_ALIVE_TIMEOUT: ReasonCode = ReasonCode(0x8D);
    pub const SESSION_TAKEN_OVER: ReasonCode = ReasonCode(0x8E);
    pub const PACKET_ID_NOT_FOUND: ReasonCode = ReasonCode(0x92);

    /// Codes below 0x80 indicate success
    pub fn is_success(self) -> bool {
        self.0 < 0x80
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0x00 => "success",
            0x01 => "granted QoS 1",
            0x02 => "granted QoS 2",
            0x10 => "no matching subscribers",
            0x80 => "unspecified error",
            0x81 => "malformed packet",
            0x82 => "protocol error",
            0x84 => "unsupported protocol version",
            0x85 => "client identifier not valid",
            0x86 => "bad user name or password",
            0x87 => "not authorized",
            0x88 => "server unavailable",
            0x89 => "server busy",
            0x8B => "server shutting down",
            0x8D => "keep alive timeout",
            0x8E => "session taken over",
            0x8F => "topic filter invalid",
            0x90 => "topic name invalid",
            0x92 => "packet identifier not found",
            0x97 => "quota exceeded",
            0x99 => "payload format invalid",
            0x9A => "retain not supported",
            0x9B => "QoS not supported",
            0x9E => "shared subscriptions not supported",
            0xA2 => "wildcard subscriptions not supported",
            _ => return None,
        })
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:02X})", name, self.0),
            None => write!(f, "0x{:02X}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_boundary() {
        assert!(ReasonCode::SUCCESS.is_success());
        assert!(ReasonCode::GRANTED_QOS_2.is_success());
        assert!(ReasonCode::NO_MATCHING_SUBSCRIBERS.is_success());
        assert!(!ReasonCode::UNSPECIFIED_ERROR.is_success());
        assert!(!ReasonCode::NOT_AUTHORIZED.is_success());
    }

    #[test]
    fn test_display() {
        assert_eq!(ReasonCode::NOT_AUTHORIZED.to_string(), "not authorized (0x87)");
        assert_eq!(ReasonCode(0xFE).to_string(), "0xFE");
    }
}
