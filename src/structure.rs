use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::mqtt::{LastWill, PublishPacket, QoS};
use crate::{ClientId, PacketId};

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retained: bool,
    pub qos: QoS,
}

impl From<LastWill> for WillMessage {
    fn from(will: LastWill) -> WillMessage {
        WillMessage {
            topic: will.topic,
            payload: will.payload,
            retained: will.retain,
            qos: will.qos,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub client_id: ClientId,
    pub topic_filter: String,
    pub requested_qos: QoS,
}

impl Subscription {
    pub fn new(client_id: impl Into<ClientId>, topic_filter: impl Into<String>, qos: QoS) -> Self {
        Subscription {
            client_id: client_id.into(),
            topic_filter: topic_filter.into(),
            requested_qos: qos,
        }
    }
}

/// A publish as accepted by the broker. Never mutated after construction,
/// per-recipient copies are derived with [`PublishEvent::for_recipient`].
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PublishEvent {
    pub id: Uuid,
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    pub retain: bool,
    pub origin: ClientId,
    /// Only present when `qos` is not `AtMostOnce`.
    pub packet_id: Option<PacketId>,
    pub received_at: SystemTime,
}

impl PublishEvent {
    pub fn new(
        topic: String,
        qos: QoS,
        payload: Bytes,
        retain: bool,
        origin: ClientId,
        packet_id: Option<PacketId>,
    ) -> PublishEvent {
        PublishEvent {
            id: Uuid::new_v4(),
            topic,
            qos,
            payload,
            retain,
            origin,
            packet_id: if qos == QoS::AtMostOnce {
                None
            } else {
                packet_id
            },
            received_at: SystemTime::now(),
        }
    }

    pub fn from_packet(origin: &str, packet: PublishPacket) -> PublishEvent {
        PublishEvent::new(
            packet.topic,
            packet.qos,
            packet.payload,
            packet.retain,
            origin.to_string(),
            packet.packet_id,
        )
    }

    /// Copy addressed to one subscriber, keeps the id so acknowledgments can be
    /// correlated with the original publish.
    pub fn for_recipient(&self, qos: QoS, packet_id: Option<PacketId>) -> PublishEvent {
        PublishEvent {
            qos,
            packet_id: if qos == QoS::AtMostOnce {
                None
            } else {
                packet_id
            },
            ..self.clone()
        }
    }

    pub fn to_packet(&self, dup: bool) -> PublishPacket {
        PublishPacket {
            topic: self.topic.clone(),
            qos: self.qos,
            payload: self.payload.clone(),
            retain: self.retain,
            dup,
            packet_id: self.packet_id,
        }
    }
}

/// Progress of a publish received from the record owner.
/// Completion removes the record from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundState {
    Received,
    PubrecSent,
    PubrelReceived,
}

/// Progress of a copy addressed to the record owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundState {
    /// Owner was offline, nothing written yet.
    Queued,
    /// PUBLISH written, waiting for PUBACK or PUBREC.
    Sent,
    /// PUBREL written, waiting for PUBCOMP.
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Inbound(InboundState),
    Outbound(OutboundState),
}

/// Entry of the offline message store, kept per owning client in insertion order.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: Uuid,
    pub owner: ClientId,
    pub event: PublishEvent,
    pub state: DeliveryState,
}

impl PendingMessage {
    pub fn inbound(owner: &str, event: PublishEvent) -> PendingMessage {
        PendingMessage {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            event,
            state: DeliveryState::Inbound(InboundState::Received),
        }
    }

    pub fn outbound(owner: &str, event: PublishEvent, state: OutboundState) -> PendingMessage {
        PendingMessage {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            event,
            state: DeliveryState::Outbound(state),
        }
    }

    pub fn packet_id(&self) -> Option<PacketId> {
        self.event.packet_id
    }
}
