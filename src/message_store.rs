use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::structure::{DeliveryState, PendingMessage};
use crate::ClientId;

/// Per-client queue of QoS 1/2 publishes that are not finished yet.
///
/// Records are grouped by owner and always listed in insertion order, which is
/// the order the broker redelivers them in.
pub trait OfflineMessageStore: Send + Sync {
    fn list_pending(&self, owner: &str) -> Result<Vec<PendingMessage>>;

    fn store(&self, message: PendingMessage) -> Result<()>;

    /// Moves a record to `state` without changing its position.
    fn update(&self, owner: &str, id: Uuid, state: DeliveryState) -> Result<bool>;

    fn remove(&self, owner: &str, id: Uuid) -> Result<Option<PendingMessage>>;

    /// Drops every record of `owner`, returns how many were dropped.
    fn clear(&self, owner: &str) -> Result<usize>;
}

#[derive(Default, Debug)]
pub struct InMemoryMessageStore {
    messages: Mutex<HashMap<ClientId, Vec<PendingMessage>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> InMemoryMessageStore {
        InMemoryMessageStore::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record of every owner, used when compacting a journal.
    pub fn snapshot(&self) -> Vec<PendingMessage> {
        self.messages.lock().values().flatten().cloned().collect()
    }
}

impl OfflineMessageStore for InMemoryMessageStore {
    fn list_pending(&self, owner: &str) -> Result<Vec<PendingMessage>> {
        Ok(self
            .messages
            .lock()
            .get(owner)
            .cloned()
            .unwrap_or_default())
    }

    fn store(&self, message: PendingMessage) -> Result<()> {
        self.messages
            .lock()
            .entry(message.owner.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    fn update(&self, owner: &str, id: Uuid, state: DeliveryState) -> Result<bool> {
        let mut messages = self.messages.lock();
        let found = messages
            .get_mut(owner)
            .and_then(|queue| queue.iter_mut().find(|m| m.id == id));
        Ok(match found {
            Some(message) => {
                message.state = state;
                true
            }
            None => false,
        })
    }

    fn remove(&self, owner: &str, id: Uuid) -> Result<Option<PendingMessage>> {
        let mut messages = self.messages.lock();
        let removed = match messages.get_mut(owner) {
            Some(queue) => queue
                .iter()
                .position(|m| m.id == id)
                .map(|idx| queue.remove(idx)),
            None => None,
        };
        if messages.get(owner).map_or(false, |q| q.is_empty()) {
            messages.remove(owner);
        }
        Ok(removed)
    }

    fn clear(&self, owner: &str) -> Result<usize> {
        Ok(self
            .messages
            .lock()
            .remove(owner)
            .map(|q| q.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::QoS;
    use crate::structure::{OutboundState, PublishEvent};
    use bytes::Bytes;

    fn pending(owner: &str, payload: &'static [u8]) -> PendingMessage {
        let event = PublishEvent::new(
            "t".to_string(),
            QoS::AtLeastOnce,
            Bytes::from_static(payload),
            false,
            "pub".to_string(),
            Some(1),
        );
        PendingMessage::outbound(owner, event, OutboundState::Queued)
    }

    #[test]
    fn lists_in_insertion_order() {
        let store = InMemoryMessageStore::new();
        store.store(pending("c", b"1")).unwrap();
        store.store(pending("c", b"2")).unwrap();
        store.store(pending("other", b"x")).unwrap();
        store.store(pending("c", b"3")).unwrap();
        let payloads: Vec<Bytes> = store
            .list_pending("c")
            .unwrap()
            .into_iter()
            .map(|m| m.event.payload)
            .collect();
        assert_eq!(
            payloads,
            vec![
                Bytes::from_static(b"1"),
                Bytes::from_static(b"2"),
                Bytes::from_static(b"3")
            ]
        );
    }

    #[test]
    fn update_keeps_position() {
        let store = InMemoryMessageStore::new();
        let first = pending("c", b"1");
        store.store(first.clone()).unwrap();
        store.store(pending("c", b"2")).unwrap();
        let sent = DeliveryState::Outbound(OutboundState::Sent);
        assert!(store.update("c", first.id, sent).unwrap());
        let listed = store.list_pending("c").unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[0].state, sent);
        assert!(!store.update("c", Uuid::new_v4(), sent).unwrap());
    }

    #[test]
    fn remove_and_clear() {
        let store = InMemoryMessageStore::new();
        let first = pending("c", b"1");
        store.store(first.clone()).unwrap();
        store.store(pending("c", b"2")).unwrap();
        assert_eq!(store.remove("c", first.id).unwrap().unwrap().id, first.id);
        assert!(store.remove("c", first.id).unwrap().is_none());
        assert_eq!(store.clear("c").unwrap(), 1);
        assert!(store.is_empty());
    }
}
