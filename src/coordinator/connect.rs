use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{desynchronized, Coordinator};
use crate::config::AckMode;
use crate::connection::{ConnectionDescriptor, ConnectionHandle};
use crate::error::{BrokerError, Result};
use crate::mqtt::{ConnectPacket, ConnectReturnCode, Packet, QoS};
use crate::structure::{DeliveryState, InboundState, OutboundState};
use crate::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Bit 0 of the connect flags was set.
    ReservedFlag,
    UnacceptableProtocol,
    IdentifierRejected,
    BadCredentials,
    NotAuthorized,
    /// The session could not be set up.
    ServerUnavailable,
}

impl RejectReason {
    /// CONNACK code sent before closing, `None` closes silently.
    pub fn return_code(self) -> Option<ConnectReturnCode> {
        match self {
            RejectReason::ReservedFlag => None,
            RejectReason::UnacceptableProtocol => {
                Some(ConnectReturnCode::UnacceptableProtocolVersion)
            }
            RejectReason::IdentifierRejected => Some(ConnectReturnCode::IdentifierRejected),
            RejectReason::BadCredentials => Some(ConnectReturnCode::BadUsernameOrPassword),
            RejectReason::NotAuthorized => Some(ConnectReturnCode::NotAuthorized),
            RejectReason::ServerUnavailable => Some(ConnectReturnCode::ServerUnavailable),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectOutcome {
    Accepted {
        client_id: ClientId,
        /// Passed back to [`Coordinator::on_disconnect`].
        connection_id: Uuid,
        session_present: bool,
    },
    Rejected(RejectReason),
}

impl Coordinator {
    /// Admits or rejects a CONNECT received on `handle`.
    ///
    /// A rejected connection is closed before returning and nothing about it
    /// is registered. An accepted one has received its CONNACK, and for
    /// persistent sessions every stored message has been redelivered.
    pub fn on_connect(
        &self,
        handle: Arc<dyn ConnectionHandle>,
        packet: ConnectPacket,
    ) -> Result<ConnectOutcome> {
        self.metrics.packet();
        if packet.reserved {
            return Ok(self.reject(&handle, &packet.client_id, RejectReason::ReservedFlag));
        }
        if packet.protocol_name != self.config.protocol_name
            || packet.protocol_level != self.config.protocol_level
        {
            debug!(
                "[Coordinator->Connect] unsupported protocol {:?} level {}",
                packet.protocol_name, packet.protocol_level
            );
            return Ok(self.reject(
                &handle,
                &packet.client_id,
                RejectReason::UnacceptableProtocol,
            ));
        }

        let clean_session = packet.clean_session;
        let client_id = if packet.client_id.is_empty() {
            if !clean_session {
                return Ok(self.reject(&handle, "", RejectReason::IdentifierRejected));
            }
            self.generate_client_id()
        } else {
            packet.client_id.clone()
        };

        if let Some(reason) = self.authenticate(&packet) {
            return Ok(self.reject(&handle, &client_id, reason));
        }

        let descriptor = ConnectionDescriptor::new(
            client_id.clone(),
            handle.clone(),
            clean_session,
            packet.keep_alive,
        );
        let connection_id = descriptor.connection_id;
        let superseded_clean = match self.connections.register(descriptor) {
            Some(previous) => {
                info!(
                    "[Coordinator->Connect] {} taken over, closing connection {}",
                    client_id, previous.connection_id
                );
                previous.handle.close();
                for done in self.acks.release_recipient(&client_id) {
                    self.complete(done)?;
                }
                previous.clean_session
            }
            None => {
                self.metrics.connected();
                false
            }
        };

        match packet.will {
            Some(will) => {
                debug!(
                    "[Coordinator->Connect] {} registered will on {}",
                    client_id, will.topic
                );
                self.wills.register(&client_id, will.into());
            }
            None => {
                self.wills.take(&client_id);
            }
        }

        let session_present = match self.open_session(&client_id, clean_session, superseded_clean)
        {
            Ok(session_present) => session_present,
            Err(e) => {
                error!(
                    "[Coordinator->Connect] failed to open session of {}: {}",
                    client_id, e
                );
                self.withdraw(&client_id, connection_id);
                return Ok(self.reject(&handle, &client_id, RejectReason::ServerUnavailable));
            }
        };

        if let Err(e) = handle.send(Packet::connack(ConnectReturnCode::Accepted, session_present)) {
            warn!(
                "[Coordinator->Connect] failed to send CONNACK to {}: {}",
                client_id, e
            );
            self.withdraw(&client_id, connection_id);
            handle.close();
            return Err(e);
        }
        info!(
            "[Coordinator->Connect] accepted {} (clean_session: {}, session_present: {})",
            client_id, clean_session, session_present
        );

        if !clean_session {
            self.restore_subscriptions(&client_id)?;
            self.redeliver(&client_id)?;
        }

        Ok(ConnectOutcome::Accepted {
            client_id,
            connection_id,
            session_present,
        })
    }

    /// Wipes what a clean session left behind, either the new one or the one
    /// it superseded, then opens the session record. Returns session present.
    fn open_session(
        &self,
        client_id: &str,
        clean_session: bool,
        superseded_clean: bool,
    ) -> Result<bool> {
        if clean_session || superseded_clean {
            self.wipe_session(client_id)?;
        }
        let session_present = !clean_session && self.sessions.contains(client_id)?;
        self.sessions.open(client_id, clean_session)?;
        Ok(session_present)
    }

    /// Undoes the registration of a connection that never got its CONNACK.
    fn withdraw(&self, client_id: &str, connection_id: Uuid) {
        if self.connections.remove(client_id, connection_id).is_some() {
            self.metrics.disconnected();
        }
        self.wills.take(client_id);
    }

    fn reject(
        &self,
        handle: &Arc<dyn ConnectionHandle>,
        client_id: &str,
        reason: RejectReason,
    ) -> ConnectOutcome {
        info!(
            "[Coordinator->Connect] rejected {:?}: {:?}",
            client_id, reason
        );
        self.metrics.rejected();
        if let Some(code) = reason.return_code() {
            if let Err(e) = handle.send(Packet::connack(code, false)) {
                warn!(
                    "[Coordinator->Connect] failed to send CONNACK({:?}) to {:?}: {}",
                    code, client_id, e
                );
            }
        }
        handle.close();
        ConnectOutcome::Rejected(reason)
    }

    fn authenticate(&self, packet: &ConnectPacket) -> Option<RejectReason> {
        match (&packet.username, &packet.password) {
            (None, Some(_)) => Some(RejectReason::BadCredentials),
            (None, None) if !self.config.allow_anonymous => Some(RejectReason::NotAuthorized),
            (None, None) => None,
            (Some(username), password) => {
                if self.authenticator.check_valid(username, password.as_deref()) {
                    None
                } else {
                    Some(RejectReason::BadCredentials)
                }
            }
        }
    }

    fn generate_client_id(&self) -> ClientId {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(self.config.generated_id_length);
        id
    }

    /// Brings the subscription registry in line with the session store, the
    /// registry may have lost them across a restart.
    fn restore_subscriptions(&self, client_id: &str) -> Result<()> {
        for subscription in self.sessions.subscriptions(client_id)? {
            self.subscriptions.subscribe(subscription)?;
        }
        Ok(())
    }

    /// Resumes every stored record of `client_id`, oldest first.
    fn redeliver(&self, client_id: &str) -> Result<()> {
        let pending = self.messages.list_pending(client_id)?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(
            "[Coordinator->Connect] redelivering {} messages to {}",
            pending.len(),
            client_id
        );
        let handle = self.live_handle(client_id)?;
        let optimistic = self.config.ack_mode == AckMode::Optimistic;
        let mut missing = vec![];

        for message in pending {
            let packet_id = message
                .packet_id()
                .ok_or_else(|| BrokerError::MissingPacketId(message.event.topic.clone()))?;
            match message.state {
                DeliveryState::Outbound(OutboundState::Queued) => {
                    let packet = Packet::Publish(message.event.to_packet(false));
                    if self.transmit(client_id, &handle, packet) {
                        self.metrics
                            .delivered(message.event.qos, message.event.received_at);
                        if optimistic {
                            self.messages.remove(client_id, message.id)?;
                        } else {
                            self.messages.update(
                                client_id,
                                message.id,
                                DeliveryState::Outbound(OutboundState::Sent),
                            )?;
                        }
                    }
                }
                DeliveryState::Outbound(OutboundState::Sent) => {
                    let packet = Packet::Publish(message.event.to_packet(true));
                    if self.transmit(client_id, &handle, packet) && optimistic {
                        self.messages.remove(client_id, message.id)?;
                    }
                }
                DeliveryState::Outbound(OutboundState::Released) => {
                    if self.transmit(client_id, &handle, Packet::Pubrel(packet_id)) && optimistic
                    {
                        self.messages.remove(client_id, message.id)?;
                    }
                }
                DeliveryState::Inbound(InboundState::Received) => match message.event.qos {
                    QoS::ExactlyOnce => {
                        if self.transmit(client_id, &handle, Packet::Pubrec(packet_id)) {
                            self.messages.update(
                                client_id,
                                message.id,
                                DeliveryState::Inbound(InboundState::PubrecSent),
                            )?;
                        }
                    }
                    _ if self.acks.is_tracking(message.event.id) => {
                        debug!(
                            "[Coordinator->Connect] {} still waits on recipients of {}",
                            client_id, packet_id
                        );
                    }
                    _ => missing.extend(self.forward_at_least_once(
                        client_id,
                        &handle,
                        message,
                        packet_id,
                    )?),
                },
                DeliveryState::Inbound(InboundState::PubrecSent) => {
                    debug!(
                        "[Coordinator->Connect] {} awaiting PUBREL({}) from {}",
                        message.event.topic, packet_id, client_id
                    );
                }
                DeliveryState::Inbound(InboundState::PubrelReceived) => {
                    missing.extend(self.release_exactly_once(client_id, &handle, message, packet_id)?);
                }
            }
        }
        desynchronized(missing)
    }
}
