use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Result;
use crate::mqtt::QoS;
use crate::structure::Subscription;
use crate::ClientId;

/// Durable record of client sessions and the subscriptions they own.
pub trait SessionStore: Send + Sync {
    fn contains(&self, client_id: &str) -> Result<bool>;

    /// Creates the session record if absent and refreshes its clean flag.
    fn open(&self, client_id: &str, clean_session: bool) -> Result<()>;

    /// True for sessions that outlive their connection (clean flag unset).
    fn is_persistent(&self, client_id: &str) -> Result<bool>;

    fn add_subscription(&self, client_id: &str, topic_filter: &str, qos: QoS) -> Result<()>;

    fn remove_subscription(&self, client_id: &str, topic_filter: &str) -> Result<()>;

    fn subscriptions(&self, client_id: &str) -> Result<Vec<Subscription>>;

    /// Drops the session record together with its subscriptions.
    fn wipe_subscriptions(&self, client_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct SessionRecord {
    clean_session: bool,
    subscriptions: HashMap<String, QoS>,
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<ClientId, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> InMemorySessionStore {
        InMemorySessionStore::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn contains(&self, client_id: &str) -> Result<bool> {
        Ok(self.sessions.read().contains_key(client_id))
    }

    fn open(&self, client_id: &str, clean_session: bool) -> Result<()> {
        self.sessions
            .write()
            .entry(client_id.to_string())
            .or_insert_with(|| SessionRecord {
                clean_session,
                subscriptions: HashMap::new(),
            })
            .clean_session = clean_session;
        Ok(())
    }

    fn is_persistent(&self, client_id: &str) -> Result<bool> {
        Ok(self
            .sessions
            .read()
            .get(client_id)
            .map(|s| !s.clean_session)
            .unwrap_or(false))
    }

    fn add_subscription(&self, client_id: &str, topic_filter: &str, qos: QoS) -> Result<()> {
        if let Some(session) = self.sessions.write().get_mut(client_id) {
            session.subscriptions.insert(topic_filter.to_string(), qos);
        }
        Ok(())
    }

    fn remove_subscription(&self, client_id: &str, topic_filter: &str) -> Result<()> {
        if let Some(session) = self.sessions.write().get_mut(client_id) {
            session.subscriptions.remove(topic_filter);
        }
        Ok(())
    }

    fn subscriptions(&self, client_id: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .sessions
            .read()
            .get(client_id)
            .map(|s| {
                s.subscriptions
                    .iter()
                    .map(|(filter, qos)| Subscription::new(client_id, filter.as_str(), *qos))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn wipe_subscriptions(&self, client_id: &str) -> Result<()> {
        self.sessions.write().remove(client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_contains() {
        let store = InMemorySessionStore::new();
        assert!(!store.contains("dev-1").unwrap());
        store.open("dev-1", false).unwrap();
        assert!(store.contains("dev-1").unwrap());
        assert!(store.is_persistent("dev-1").unwrap());
        store.open("dev-1", true).unwrap();
        assert!(!store.is_persistent("dev-1").unwrap());
    }

    #[test]
    fn resubscribe_overwrites_qos() {
        let store = InMemorySessionStore::new();
        store.open("c", false).unwrap();
        store.add_subscription("c", "a/#", QoS::AtMostOnce).unwrap();
        store.add_subscription("c", "a/#", QoS::ExactlyOnce).unwrap();
        let subs = store.subscriptions("c").unwrap();
        assert_eq!(subs, vec![Subscription::new("c", "a/#", QoS::ExactlyOnce)]);
    }

    #[test]
    fn wipe_removes_record_and_subscriptions() {
        let store = InMemorySessionStore::new();
        store.open("c", false).unwrap();
        store.add_subscription("c", "a", QoS::AtLeastOnce).unwrap();
        store.wipe_subscriptions("c").unwrap();
        assert!(!store.contains("c").unwrap());
        assert!(store.subscriptions("c").unwrap().is_empty());
    }
}
