use dashmap::DashMap;
use log::debug;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::error::Result;
use crate::mqtt::Packet;
use crate::ClientId;

/// Live transport session owned by the transport layer.
pub trait ConnectionHandle: Send + Sync {
    fn send(&self, packet: Packet) -> Result<()>;
    fn close(&self);
}

#[derive(Clone)]
pub struct ConnectionDescriptor {
    pub client_id: ClientId,
    /// Distinguishes successive connections of the same client.
    pub connection_id: Uuid,
    pub handle: Arc<dyn ConnectionHandle>,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub connected_at: SystemTime,
}

impl ConnectionDescriptor {
    pub fn new(
        client_id: ClientId,
        handle: Arc<dyn ConnectionHandle>,
        clean_session: bool,
        keep_alive: u16,
    ) -> ConnectionDescriptor {
        ConnectionDescriptor {
            client_id,
            connection_id: Uuid::new_v4(),
            handle,
            clean_session,
            keep_alive,
            connected_at: SystemTime::now(),
        }
    }

    /// The connection is considered dead after 1.5 keep alive periods without
    /// traffic. `None` when keep alive is disabled.
    pub fn keep_alive_deadline(&self) -> Option<Duration> {
        if self.keep_alive == 0 {
            return None;
        }
        Some(Duration::from_millis(u64::from(self.keep_alive) * 1500))
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("client_id", &self.client_id)
            .field("connection_id", &self.connection_id)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Client id -> live connection. Last writer wins.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, ConnectionDescriptor>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    /// Registers `descriptor` and returns the one it superseded.
    pub fn register(&self, descriptor: ConnectionDescriptor) -> Option<ConnectionDescriptor> {
        debug!(
            "[Connections] registering {} ({})",
            descriptor.client_id, descriptor.connection_id
        );
        self.clients.insert(descriptor.client_id.clone(), descriptor)
    }

    pub fn handle(&self, client_id: &str) -> Option<Arc<dyn ConnectionHandle>> {
        self.clients.get(client_id).map(|d| d.handle.clone())
    }

    pub fn descriptor(&self, client_id: &str) -> Option<ConnectionDescriptor> {
        self.clients.get(client_id).map(|d| d.clone())
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Removes the descriptor only while `connection_id` is still the current
    /// connection of `client_id`.
    pub fn remove(&self, client_id: &str, connection_id: Uuid) -> Option<ConnectionDescriptor> {
        self.clients
            .remove_if(client_id, |_, d| d.connection_id == connection_id)
            .map(|(_, d)| d)
    }

    pub fn keep_alive_deadline(&self, client_id: &str) -> Option<Duration> {
        self.clients
            .get(client_id)
            .and_then(|d| d.keep_alive_deadline())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
