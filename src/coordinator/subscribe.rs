use log::{debug, warn};
use uuid::Uuid;

use super::{desynchronized, Coordinator};
use crate::error::Result;
use crate::mqtt::{Packet, QoS, SubackPacket, SubscribePacket, UnsubscribePacket};
use crate::structure::{PublishEvent, Subscription};
use crate::topic_tree::is_valid_filter;

impl Coordinator {
    /// Stores the requested subscriptions, answers with SUBACK, then replays
    /// retained messages matching the accepted filters.
    pub fn on_subscribe(&self, client_id: &str, packet: SubscribePacket) -> Result<()> {
        self.metrics.packet();
        let handle = self.live_handle(client_id)?;
        let mut granted = Vec::with_capacity(packet.subscriptions.len());
        let mut accepted = vec![];
        for request in packet.subscriptions {
            if !is_valid_filter(&request.topic) {
                warn!(
                    "[Coordinator->Subscribe] {} requested invalid filter {:?}",
                    client_id, request.topic
                );
                granted.push(None);
                continue;
            }
            self.subscriptions.subscribe(Subscription::new(
                client_id,
                request.topic.as_str(),
                request.qos,
            ))?;
            self.sessions
                .add_subscription(client_id, &request.topic, request.qos)?;
            debug!(
                "[Coordinator->Subscribe] {} subscribed to {} at {:?}",
                client_id, request.topic, request.qos
            );
            granted.push(Some(request.qos));
            accepted.push(request);
        }
        handle.send(Packet::Suback(SubackPacket {
            packet_id: packet.packet_id,
            granted,
        }))?;

        if !self.config.retain_available {
            return Ok(());
        }
        let mut missing = vec![];
        for request in accepted {
            for retained in self.retained.matching(&request.topic)? {
                let qos = retained.qos.downgrade(request.qos);
                let packet_id = match qos {
                    QoS::AtMostOnce => None,
                    _ => Some(self.allocate_packet_id()),
                };
                // replays never count towards the publisher's PUBACK
                let copy = PublishEvent {
                    id: Uuid::new_v4(),
                    retain: true,
                    ..retained.for_recipient(qos, packet_id)
                };
                if !self.deliver(client_id, copy)? {
                    missing.push(client_id.to_string());
                }
            }
        }
        desynchronized(missing)
    }

    pub fn on_unsubscribe(&self, client_id: &str, packet: UnsubscribePacket) -> Result<()> {
        self.metrics.packet();
        let handle = self.live_handle(client_id)?;
        for topic in &packet.topics {
            if self.subscriptions.unsubscribe(client_id, topic)? {
                debug!(
                    "[Coordinator->Subscribe] {} unsubscribed from {}",
                    client_id, topic
                );
            }
            self.sessions.remove_subscription(client_id, topic)?;
        }
        handle.send(Packet::Unsuback(packet.packet_id))?;
        Ok(())
    }
}
