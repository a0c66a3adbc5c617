use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::auth::{AllowAll, Authenticator, StaticAuthenticator};
use crate::config::BrokerConfig;
use crate::connection::{ConnectionHandle, ConnectionRegistry};
use crate::error::{BrokerError, Result};
use crate::message_store::{InMemoryMessageStore, OfflineMessageStore};
use crate::metrics::BrokerMetrics;
use crate::mqtt::{describe, Packet, QoS};
use crate::persistence::FileMessageStore;
use crate::retained::{InMemoryRetainedStore, RetainedStore};
use crate::session::{InMemorySessionStore, SessionStore};
use crate::structure::{DeliveryState, PendingMessage};
use crate::topic_tree::{SubscriptionRegistry, TopicTree};
use crate::will::WillRegistry;
use crate::{ClientId, PacketId};

mod ack;
mod connect;
mod disconnect;
mod publish;
mod subscribe;


pub use ack::{AckTracker, Completed};
pub use connect::{ConnectOutcome, RejectReason};
pub use disconnect::DisconnectReason;

/// Protocol decisions for every connection of one broker.
///
/// Shared by all connection tasks behind an `Arc`. Registries are concurrent
/// maps and the stores guard themselves, no lock of the coordinator is held
/// while a store is called.
pub struct Coordinator {
    config: BrokerConfig,
    connections: ConnectionRegistry,
    wills: WillRegistry,
    sessions: Arc<dyn SessionStore>,
    subscriptions: Arc<dyn SubscriptionRegistry>,
    messages: Arc<dyn OfflineMessageStore>,
    retained: Arc<dyn RetainedStore>,
    authenticator: Arc<dyn Authenticator>,
    acks: AckTracker,
    metrics: BrokerMetrics,
    next_packet_id: AtomicU16,
    started_at: SystemTime,
}

/// Collaborators left unset fall back to the in-memory implementations.
pub struct CoordinatorBuilder {
    config: BrokerConfig,
    sessions: Option<Arc<dyn SessionStore>>,
    subscriptions: Option<Arc<dyn SubscriptionRegistry>>,
    messages: Option<Arc<dyn OfflineMessageStore>>,
    retained: Option<Arc<dyn RetainedStore>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    metrics: Option<BrokerMetrics>,
}

impl CoordinatorBuilder {
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn subscription_registry(mut self, registry: Arc<dyn SubscriptionRegistry>) -> Self {
        self.subscriptions = Some(registry);
        self
    }

    pub fn message_store(mut self, store: Arc<dyn OfflineMessageStore>) -> Self {
        self.messages = Some(store);
        self
    }

    pub fn retained_store(mut self, store: Arc<dyn RetainedStore>) -> Self {
        self.retained = Some(store);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn metrics(mut self, metrics: BrokerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        let messages: Arc<dyn OfflineMessageStore> = match (self.messages, &self.config.persistence)
        {
            (Some(store), _) => store,
            (None, Some(persistence)) => {
                info!(
                    "[Coordinator] journaling offline messages to {:?}",
                    persistence.dir.join(&persistence.file_name)
                );
                Arc::new(FileMessageStore::open(
                    &persistence.dir,
                    &persistence.file_name,
                )?)
            }
            (None, None) => Arc::new(InMemoryMessageStore::new()),
        };
        let authenticator: Arc<dyn Authenticator> = match self.authenticator {
            Some(authenticator) => authenticator,
            None if self.config.credentials.is_empty() => Arc::new(AllowAll),
            None => Arc::new(StaticAuthenticator::new(self.config.credentials.clone())),
        };
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => BrokerMetrics::new()?,
        };
        Ok(Coordinator {
            connections: ConnectionRegistry::new(),
            wills: WillRegistry::new(),
            sessions: self
                .sessions
                .unwrap_or_else(|| Arc::new(InMemorySessionStore::new())),
            subscriptions: self
                .subscriptions
                .unwrap_or_else(|| Arc::new(TopicTree::new())),
            messages,
            retained: self
                .retained
                .unwrap_or_else(|| Arc::new(InMemoryRetainedStore::new())),
            authenticator,
            acks: AckTracker::new(),
            metrics,
            next_packet_id: AtomicU16::new(1),
            started_at: SystemTime::now(),
            config: self.config,
        })
    }
}

impl Coordinator {
    pub fn builder(config: BrokerConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            sessions: None,
            subscriptions: None,
            messages: None,
            retained: None,
            authenticator: None,
            metrics: None,
        }
    }

    pub fn from_config(config: BrokerConfig) -> Result<Coordinator> {
        Coordinator::builder(config).build()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn wills(&self) -> &WillRegistry {
        &self.wills
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Packet id for copies whose event carries none, never zero.
    fn allocate_packet_id(&self) -> PacketId {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn live_handle(&self, client_id: &str) -> Result<Arc<dyn ConnectionHandle>> {
        self.connections
            .handle(client_id)
            .ok_or_else(|| BrokerError::MissingConnection(client_id.to_string()))
    }

    /// Writes to a connection on behalf of another client's action. Failures
    /// are logged, the caller keeps whatever record allows a retry.
    fn transmit(&self, client_id: &str, handle: &Arc<dyn ConnectionHandle>, packet: Packet) -> bool {
        let description = describe(client_id, &packet);
        match handle.send(packet) {
            Ok(()) => {
                debug!("[Coordinator] sent {}", description);
                true
            }
            Err(e) => {
                warn!("[Coordinator] failed to send {}: {}", description, e);
                false
            }
        }
    }

    /// Oldest record of `client_id` for `packet_id` at `qos` in one of `states`.
    fn find_pending(
        &self,
        client_id: &str,
        packet_id: PacketId,
        qos: QoS,
        states: &[DeliveryState],
    ) -> Result<Option<PendingMessage>> {
        Ok(self
            .messages
            .list_pending(client_id)?
            .into_iter()
            .find(|m| {
                m.packet_id() == Some(packet_id)
                    && m.event.qos == qos
                    && states.contains(&m.state)
            }))
    }

    /// Clears subscriptions, session record and stored messages of `client_id`.
    fn wipe_session(&self, client_id: &str) -> Result<()> {
        self.subscriptions.remove_all_for(client_id)?;
        self.sessions.wipe_subscriptions(client_id)?;
        let dropped = self.messages.clear(client_id)?;
        self.acks.forget_publisher(client_id);
        debug!(
            "[Coordinator] wiped session of {}, dropped {} stored messages",
            client_id, dropped
        );
        Ok(())
    }
}

fn desynchronized(missing: Vec<ClientId>) -> Result<()> {
    if missing.is_empty() {
        return Ok(());
    }
    error!(
        "[Coordinator] subscriptions reference clients without connection or session: {:?}",
        missing
    );
    Err(BrokerError::Desynchronized(missing))
}
