use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use crate::error::BrokerError;
use crate::PacketId;

/// Protocol name announced by MQTT 3.1.1 clients.
pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level of MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// QoS a subscriber receives for a message published at `self`.
    pub fn downgrade(self, requested: QoS) -> QoS {
        self.min(requested)
    }
}

impl TryFrom<u8> for QoS {
    type Error = BrokerError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(BrokerError::InvalidQoS(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

/// Will declared in the CONNECT payload.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub qos: QoS,
}

/// Parsed CONNECT request as handed over by the framing layer.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConnectPacket {
    pub protocol_name: String,
    pub protocol_level: u8,
    /// Value of bit 0 of the connect flags, must be zero.
    pub reserved: bool,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl ConnectPacket {
    /// A well-formed MQTT 3.1.1 CONNECT without will or credentials.
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> ConnectPacket {
        ConnectPacket {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_level: PROTOCOL_LEVEL,
            reserved: false,
            clean_session,
            keep_alive: 60,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConnackPacket {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PublishPacket {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<PacketId>,
}

impl PublishPacket {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> PublishPacket {
        PublishPacket {
            topic: topic.into(),
            qos,
            payload: payload.into(),
            retain: false,
            dup: false,
            packet_id: None,
        }
    }

    pub fn with_packet_id(mut self, packet_id: PacketId) -> PublishPacket {
        self.packet_id = Some(packet_id);
        self
    }

    pub fn retained(mut self) -> PublishPacket {
        self.retain = true;
        self
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub topic: String,
    pub qos: QoS,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SubscribePacket {
    pub packet_id: PacketId,
    pub subscriptions: Vec<SubscriptionRequest>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SubackPacket {
    pub packet_id: PacketId,
    /// One entry per requested filter, `None` is the 0x80 failure code.
    pub granted: Vec<Option<QoS>>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct UnsubscribePacket {
    pub packet_id: PacketId,
    pub topics: Vec<String>,
}

/// Packets the core asks a connection to write.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum Packet {
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Puback(PacketId),
    Pubrec(PacketId),
    Pubrel(PacketId),
    Pubcomp(PacketId),
    Suback(SubackPacket),
    Unsuback(PacketId),
}

impl Packet {
    pub fn connack(code: ConnectReturnCode, session_present: bool) -> Packet {
        Packet::Connack(ConnackPacket {
            session_present,
            code,
        })
    }
}

/// Identifies who a log line or error is about.
pub fn describe(client_id: &str, packet: &Packet) -> String {
    match packet {
        Packet::Connack(c) => format!("CONNACK({:?}) to {}", c.code, client_id),
        Packet::Publish(p) => format!(
            "PUBLISH({}, {:?}, {:?}) to {}",
            p.topic, p.qos, p.packet_id, client_id
        ),
        Packet::Puback(id) => format!("PUBACK({}) to {}", id, client_id),
        Packet::Pubrec(id) => format!("PUBREC({}) to {}", id, client_id),
        Packet::Pubrel(id) => format!("PUBREL({}) to {}", id, client_id),
        Packet::Pubcomp(id) => format!("PUBCOMP({}) to {}", id, client_id),
        Packet::Suback(s) => format!("SUBACK({}) to {}", s.packet_id, client_id),
        Packet::Unsuback(id) => format!("UNSUBACK({}) to {}", id, client_id),
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_is_ordered() {
        assert!(QoS::AtMostOnce < QoS::AtLeastOnce);
        assert!(QoS::AtLeastOnce < QoS::ExactlyOnce);
    }

    #[test]
    fn downgrade_takes_minimum() {
        assert_eq!(QoS::ExactlyOnce.downgrade(QoS::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(QoS::AtLeastOnce.downgrade(QoS::ExactlyOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::ExactlyOnce.downgrade(QoS::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn qos_from_byte() {
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert!(matches!(QoS::try_from(3), Err(BrokerError::InvalidQoS(3))));
    }

    #[test]
    fn default_connect_is_valid_v311() {
        let packet = ConnectPacket::new("dev-1", false);
        assert_eq!(packet.protocol_name, "MQTT");
        assert_eq!(packet.protocol_level, 4);
        assert!(!packet.reserved);
    }
}
