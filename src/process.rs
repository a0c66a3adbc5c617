//! Hosts a [`Coordinator`] inside a lunatic process. Connection processes talk
//! to it with requests and receive outbound packets in their mailbox.

use log::{error, warn};
use lunatic::{
    host,
    process::{AbstractProcess, ProcessMessage, ProcessRef, ProcessRequest},
    supervisor::Supervisor,
    Process,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::connection::ConnectionHandle;
use crate::coordinator::{ConnectOutcome, Coordinator, DisconnectReason};
use crate::error::Result;
use crate::mqtt::{ConnectPacket, Packet, PublishPacket, SubscribePacket, UnsubscribePacket};
use crate::{ClientId, PacketId};

/// What a connection process finds in its mailbox.
#[derive(Debug, Serialize, Deserialize)]
pub enum Outbound {
    Packet(Packet),
    Close,
}

/// Connection handle backed by the mailbox of a connection process.
pub struct MailboxHandle(pub Process<Outbound>);

impl ConnectionHandle for MailboxHandle {
    fn send(&self, packet: Packet) -> Result<()> {
        self.0.send(Outbound::Packet(packet));
        Ok(())
    }

    fn close(&self) {
        self.0.send(Outbound::Close);
    }
}

/// The `BrokerSup` is supervising one global instance of the `BrokerProcess`.
pub struct BrokerSup;
impl Supervisor for BrokerSup {
    type Arg = (String, BrokerConfig);
    type Children = BrokerProcess;

    fn init(config: &mut lunatic::supervisor::SupervisorConfig<Self>, (name, broker): Self::Arg) {
        // Always register the `BrokerProcess` under the name passed to the supervisor.
        config.children_args((broker, Some(name)))
    }
}

pub struct BrokerProcess {
    coordinator: Coordinator,
}

impl AbstractProcess for BrokerProcess {
    type Arg = BrokerConfig;
    type State = Self;

    fn init(_: ProcessRef<Self>, config: Self::Arg) -> Self::State {
        // Broker shouldn't die when a client dies. This makes the link one-directional.
        unsafe { host::api::process::die_when_link_dies(0) };

        match Coordinator::from_config(config) {
            Ok(coordinator) => BrokerProcess { coordinator },
            Err(e) => {
                error!("[BrokerProcess] failed to start: {}", e);
                panic!("broker failed to start: {}", e)
            }
        }
    }
}

fn reply<T>(result: Result<T>) -> std::result::Result<T, String> {
    result.map_err(|e| {
        warn!("[BrokerProcess] request failed: {}", e);
        e.to_string()
    })
}

#[derive(Serialize, Deserialize)]
pub struct Connect(pub Process<Outbound>, pub ConnectPacket);
impl ProcessRequest<Connect> for BrokerProcess {
    type Response = std::result::Result<ConnectOutcome, String>;

    fn handle(state: &mut Self::State, Connect(mailbox, packet): Connect) -> Self::Response {
        let handle: Arc<dyn ConnectionHandle> = Arc::new(MailboxHandle(mailbox));
        reply(state.coordinator.on_connect(handle, packet))
    }
}

#[derive(Serialize, Deserialize)]
pub struct Publish(pub ClientId, pub PublishPacket);
impl ProcessRequest<Publish> for BrokerProcess {
    type Response = std::result::Result<(), String>;

    fn handle(state: &mut Self::State, Publish(client_id, packet): Publish) -> Self::Response {
        reply(state.coordinator.on_publish(&client_id, packet))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum AckKind {
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
}

#[derive(Serialize, Deserialize)]
pub struct Ack(pub ClientId, pub AckKind, pub PacketId);
impl ProcessRequest<Ack> for BrokerProcess {
    type Response = std::result::Result<(), String>;

    fn handle(state: &mut Self::State, Ack(client_id, kind, packet_id): Ack) -> Self::Response {
        let coordinator = &state.coordinator;
        reply(match kind {
            AckKind::Puback => coordinator.on_puback(&client_id, packet_id),
            AckKind::Pubrec => coordinator.on_pubrec(&client_id, packet_id),
            AckKind::Pubrel => coordinator.on_pubrel(&client_id, packet_id),
            AckKind::Pubcomp => coordinator.on_pubcomp(&client_id, packet_id),
        })
    }
}

#[derive(Serialize, Deserialize)]
pub struct Subscribe(pub ClientId, pub SubscribePacket);
impl ProcessRequest<Subscribe> for BrokerProcess {
    type Response = std::result::Result<(), String>;

    fn handle(state: &mut Self::State, Subscribe(client_id, packet): Subscribe) -> Self::Response {
        reply(state.coordinator.on_subscribe(&client_id, packet))
    }
}

#[derive(Serialize, Deserialize)]
pub struct Unsubscribe(pub ClientId, pub UnsubscribePacket);
impl ProcessRequest<Unsubscribe> for BrokerProcess {
    type Response = std::result::Result<(), String>;

    fn handle(state: &mut Self::State, Unsubscribe(client_id, packet): Unsubscribe) -> Self::Response {
        reply(state.coordinator.on_unsubscribe(&client_id, packet))
    }
}

#[derive(Serialize, Deserialize)]
pub struct Disconnect(pub ClientId, pub Uuid, pub DisconnectReason);
impl ProcessMessage<Disconnect> for BrokerProcess {
    fn handle(state: &mut Self::State, Disconnect(client_id, connection_id, reason): Disconnect) {
        if let Err(e) = state
            .coordinator
            .on_disconnect(&client_id, connection_id, reason)
        {
            error!(
                "[BrokerProcess] disconnect of {} failed: {}",
                client_id, e
            );
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct Gather;
impl ProcessRequest<Gather> for BrokerProcess {
    type Response = Vec<u8>;

    fn handle(state: &mut Self::State, _: Gather) -> Vec<u8> {
        match state.coordinator.metrics().gather() {
            Ok(buffer) => buffer,
            Err(e) => {
                error!("[BrokerProcess] failed to gather metrics: {}", e);
                vec![]
            }
        }
    }
}
