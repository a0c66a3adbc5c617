use log::{debug, error, info, trace};
use std::sync::Arc;

use super::ack::Completed;
use super::{desynchronized, Coordinator};
use crate::config::AckMode;
use crate::connection::ConnectionHandle;
use crate::error::{BrokerError, Result};
use crate::mqtt::{Packet, PublishPacket, QoS};
use crate::structure::{
    DeliveryState, InboundState, OutboundState, PendingMessage, PublishEvent, WillMessage,
};
use crate::topic_tree::is_valid_topic;
use crate::{ClientId, PacketId};

impl Coordinator {
    /// Handles a PUBLISH sent by `client_id`.
    ///
    /// Fails with `InvalidTopic` or `MissingPacketId` for malformed publishes,
    /// the transport is expected to close the connection. `Desynchronized` is
    /// returned after every other subscriber has been served.
    pub fn on_publish(&self, client_id: &str, packet: PublishPacket) -> Result<()> {
        self.metrics.packet();
        let handle = self.live_handle(client_id)?;
        if !is_valid_topic(&packet.topic) {
            return Err(BrokerError::InvalidTopic(packet.topic));
        }
        let event = PublishEvent::from_packet(client_id, packet);
        trace!(
            "[Coordinator->Publish] {} published {:?} on {}",
            client_id,
            event.qos,
            event.topic
        );
        match event.qos {
            QoS::AtMostOnce => desynchronized(self.route(&event)?),
            QoS::AtLeastOnce => {
                let packet_id = require_packet_id(&event)?;
                let record = PendingMessage::inbound(client_id, event);
                self.messages.store(record.clone())?;
                desynchronized(self.forward_at_least_once(client_id, &handle, record, packet_id)?)
            }
            QoS::ExactlyOnce => {
                let packet_id = require_packet_id(&event)?;
                self.receive_exactly_once(client_id, &handle, event, packet_id)
            }
        }
    }

    /// Fans out a stored QoS 1 publish and acknowledges it according to the
    /// configured ack mode.
    pub(super) fn forward_at_least_once(
        &self,
        client_id: &str,
        handle: &Arc<dyn ConnectionHandle>,
        record: PendingMessage,
        packet_id: PacketId,
    ) -> Result<Vec<ClientId>> {
        match self.config.ack_mode {
            AckMode::Confirmed => {
                let event_id = record.event.id;
                self.acks.begin(event_id, client_id, packet_id, record.id);
                let missing = match self.route(&record.event) {
                    Ok(missing) => missing,
                    Err(e) => {
                        self.acks.abandon(event_id);
                        return Err(e);
                    }
                };
                if let Some(done) = self.acks.seal(event_id) {
                    self.complete(done)?;
                } else {
                    debug!(
                        "[Coordinator->Publish] PUBACK({}) to {} waits on recipients",
                        packet_id, client_id
                    );
                }
                Ok(missing)
            }
            AckMode::Optimistic => {
                let missing = self.route(&record.event)?;
                self.messages.remove(client_id, record.id)?;
                handle.send(Packet::Puback(packet_id))?;
                Ok(missing)
            }
        }
    }

    /// Acknowledges the publisher of a QoS 1 message once all recipients did.
    pub(super) fn complete(&self, done: Completed) -> Result<()> {
        self.messages.remove(&done.publisher, done.record)?;
        match self.connections.handle(&done.publisher) {
            Some(handle) => {
                self.transmit(&done.publisher, &handle, Packet::Puback(done.packet_id));
            }
            None => debug!(
                "[Coordinator->Publish] {} left before PUBACK({})",
                done.publisher, done.packet_id
            ),
        }
        Ok(())
    }

    fn receive_exactly_once(
        &self,
        client_id: &str,
        handle: &Arc<dyn ConnectionHandle>,
        event: PublishEvent,
        packet_id: PacketId,
    ) -> Result<()> {
        let existing = self.find_pending(
            client_id,
            packet_id,
            QoS::ExactlyOnce,
            &[
                DeliveryState::Inbound(InboundState::Received),
                DeliveryState::Inbound(InboundState::PubrecSent),
            ],
        )?;
        let record = match existing {
            Some(record) => {
                debug!(
                    "[Coordinator->Publish] duplicate PUBLISH({}) from {}",
                    packet_id, client_id
                );
                record
            }
            None => {
                let record = PendingMessage::inbound(client_id, event);
                self.messages.store(record.clone())?;
                record
            }
        };
        handle.send(Packet::Pubrec(packet_id))?;
        if record.state == DeliveryState::Inbound(InboundState::Received) {
            self.messages.update(
                client_id,
                record.id,
                DeliveryState::Inbound(InboundState::PubrecSent),
            )?;
        }
        Ok(())
    }

    /// Handles PUBREL from a QoS 2 publisher. Unknown ids are completed too,
    /// the publisher may be retrying after a lost PUBCOMP.
    pub fn on_pubrel(&self, client_id: &str, packet_id: PacketId) -> Result<()> {
        self.metrics.packet();
        let handle = self.live_handle(client_id)?;
        let record = self.find_pending(
            client_id,
            packet_id,
            QoS::ExactlyOnce,
            &[
                DeliveryState::Inbound(InboundState::PubrecSent),
                DeliveryState::Inbound(InboundState::Received),
            ],
        )?;
        match record {
            Some(record) => {
                self.messages.update(
                    client_id,
                    record.id,
                    DeliveryState::Inbound(InboundState::PubrelReceived),
                )?;
                desynchronized(self.release_exactly_once(client_id, &handle, record, packet_id)?)
            }
            None => {
                debug!(
                    "[Coordinator->Publish] PUBREL({}) from {} matches no message",
                    packet_id, client_id
                );
                handle.send(Packet::Pubcomp(packet_id))?;
                Ok(())
            }
        }
    }

    /// Fans out a released QoS 2 message, then completes it.
    pub(super) fn release_exactly_once(
        &self,
        client_id: &str,
        handle: &Arc<dyn ConnectionHandle>,
        record: PendingMessage,
        packet_id: PacketId,
    ) -> Result<Vec<ClientId>> {
        let missing = self.route(&record.event)?;
        self.messages.remove(client_id, record.id)?;
        handle.send(Packet::Pubcomp(packet_id))?;
        Ok(missing)
    }

    /// PUBACK from a recipient of a QoS 1 copy.
    pub fn on_puback(&self, client_id: &str, packet_id: PacketId) -> Result<()> {
        self.metrics.packet();
        let record = self.find_pending(
            client_id,
            packet_id,
            QoS::AtLeastOnce,
            &[DeliveryState::Outbound(OutboundState::Sent)],
        )?;
        match record {
            Some(record) => {
                self.messages.remove(client_id, record.id)?;
                if let Some(done) = self.acks.confirm(record.event.id, client_id) {
                    self.complete(done)?;
                }
            }
            None => debug!(
                "[Coordinator->Publish] PUBACK({}) from {} matches no message",
                packet_id, client_id
            ),
        }
        Ok(())
    }

    /// PUBREC from a recipient of a QoS 2 copy, answered with PUBREL.
    pub fn on_pubrec(&self, client_id: &str, packet_id: PacketId) -> Result<()> {
        self.metrics.packet();
        let handle = self.live_handle(client_id)?;
        let record = self.find_pending(
            client_id,
            packet_id,
            QoS::ExactlyOnce,
            &[DeliveryState::Outbound(OutboundState::Sent)],
        )?;
        let record = match record {
            Some(record) => record,
            None => {
                // retransmitted PUBREC for a copy that was already released
                let released = self.find_pending(
                    client_id,
                    packet_id,
                    QoS::ExactlyOnce,
                    &[DeliveryState::Outbound(OutboundState::Released)],
                )?;
                match released {
                    Some(_) => handle.send(Packet::Pubrel(packet_id))?,
                    None => debug!(
                        "[Coordinator->Publish] PUBREC({}) from {} matches no message",
                        packet_id, client_id
                    ),
                }
                return Ok(());
            }
        };
        self.messages.update(
            client_id,
            record.id,
            DeliveryState::Outbound(OutboundState::Released),
        )?;
        handle.send(Packet::Pubrel(packet_id))?;
        if let Some(done) = self.acks.confirm(record.event.id, client_id) {
            self.complete(done)?;
        }
        Ok(())
    }

    /// PUBCOMP from a recipient, ends the QoS 2 flow of its copy.
    pub fn on_pubcomp(&self, client_id: &str, packet_id: PacketId) -> Result<()> {
        self.metrics.packet();
        let record = self.find_pending(
            client_id,
            packet_id,
            QoS::ExactlyOnce,
            &[DeliveryState::Outbound(OutboundState::Released)],
        )?;
        match record {
            Some(record) => {
                self.messages.remove(client_id, record.id)?;
            }
            None => debug!(
                "[Coordinator->Publish] PUBCOMP({}) from {} matches no message",
                packet_id, client_id
            ),
        }
        Ok(())
    }

    /// Updates the retained store when flagged, then fans out.
    pub(super) fn route(&self, event: &PublishEvent) -> Result<Vec<ClientId>> {
        if event.retain && self.config.retain_available {
            self.retained.retain(event)?;
        }
        self.fan_out(event)
    }

    /// Sends a copy of `event` to every matching subscriber. Returns the
    /// subscribers that have neither a connection nor a persistent session.
    fn fan_out(&self, event: &PublishEvent) -> Result<Vec<ClientId>> {
        let subscribers = self.subscriptions.subscribers_of(&event.topic)?;
        let mut missing = vec![];
        for subscription in subscribers {
            let qos = event.qos.downgrade(subscription.requested_qos);
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                _ => Some(
                    event
                        .packet_id
                        .unwrap_or_else(|| self.allocate_packet_id()),
                ),
            };
            let copy = event.for_recipient(qos, packet_id);
            if !self.deliver(&subscription.client_id, copy)? {
                missing.push(subscription.client_id);
            }
        }
        Ok(missing)
    }

    /// Delivers one recipient copy. False when the recipient is unknown.
    pub(super) fn deliver(&self, client_id: &str, copy: PublishEvent) -> Result<bool> {
        match self.connections.handle(client_id) {
            Some(handle) => {
                if copy.qos != QoS::AtMostOnce {
                    self.acks.expect(copy.id, client_id);
                    self.messages.store(PendingMessage::outbound(
                        client_id,
                        copy.clone(),
                        OutboundState::Sent,
                    ))?;
                }
                let (qos, received_at) = (copy.qos, copy.received_at);
                if self.transmit(client_id, &handle, Packet::Publish(copy.to_packet(false))) {
                    self.metrics.delivered(qos, received_at);
                }
                Ok(true)
            }
            None if self.sessions.is_persistent(client_id)? => {
                if copy.qos == QoS::AtMostOnce {
                    trace!(
                        "[Coordinator->Publish] dropping QoS 0 {} for offline {}",
                        copy.topic,
                        client_id
                    );
                } else {
                    debug!(
                        "[Coordinator->Publish] queueing {} for offline {}",
                        copy.topic, client_id
                    );
                    self.messages.store(PendingMessage::outbound(
                        client_id,
                        copy,
                        OutboundState::Queued,
                    ))?;
                }
                Ok(true)
            }
            None => {
                error!(
                    "[Coordinator->Publish] subscriber {} has no connection nor session",
                    client_id
                );
                Ok(false)
            }
        }
    }

    /// Publishes a will on behalf of `client_id`.
    pub(super) fn publish_will(&self, client_id: &str, will: WillMessage) -> Result<Vec<ClientId>> {
        info!(
            "[Coordinator->Publish] publishing will of {} on {}",
            client_id, will.topic
        );
        let event = PublishEvent::new(
            will.topic,
            will.qos,
            will.payload,
            will.retained,
            client_id.to_string(),
            None,
        );
        self.route(&event)
    }
}

fn require_packet_id(event: &PublishEvent) -> Result<PacketId> {
    event
        .packet_id
        .ok_or_else(|| BrokerError::MissingPacketId(event.topic.clone()))
}
