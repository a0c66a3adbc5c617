use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Result;
use crate::structure::PublishEvent;
use crate::topic_tree::match_topic;

/// Last retained publish per topic.
pub trait RetainedStore: Send + Sync {
    /// Keeps `event` as the retained message of its topic. An empty payload
    /// clears the topic instead.
    fn retain(&self, event: &PublishEvent) -> Result<()>;

    /// Retained messages whose topic matches `filter`, ordered by topic.
    fn matching(&self, filter: &str) -> Result<Vec<PublishEvent>>;
}

#[derive(Default)]
pub struct InMemoryRetainedStore {
    topics: RwLock<HashMap<String, PublishEvent>>,
}

impl InMemoryRetainedStore {
    pub fn new() -> InMemoryRetainedStore {
        InMemoryRetainedStore::default()
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RetainedStore for InMemoryRetainedStore {
    fn retain(&self, event: &PublishEvent) -> Result<()> {
        let mut topics = self.topics.write();
        if event.payload.is_empty() {
            topics.remove(&event.topic);
        } else {
            topics.insert(event.topic.clone(), event.clone());
        }
        Ok(())
    }

    fn matching(&self, filter: &str) -> Result<Vec<PublishEvent>> {
        let mut matched: Vec<PublishEvent> = self
            .topics
            .read()
            .values()
            .filter(|e| match_topic(filter, &e.topic))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::QoS;
    use bytes::Bytes;

    fn retained(topic: &str, payload: &'static [u8]) -> PublishEvent {
        PublishEvent::new(
            topic.to_string(),
            QoS::AtLeastOnce,
            Bytes::from_static(payload),
            true,
            "pub".to_string(),
            Some(3),
        )
    }

    #[test]
    fn latest_retained_wins() {
        let store = InMemoryRetainedStore::new();
        store.retain(&retained("a/b", b"1")).unwrap();
        store.retain(&retained("a/b", b"2")).unwrap();
        store.retain(&retained("a/c", b"3")).unwrap();
        let matched = store.matching("a/+").unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].payload, Bytes::from_static(b"2"));
        assert_eq!(matched[1].topic, "a/c");
    }

    #[test]
    fn empty_payload_clears() {
        let store = InMemoryRetainedStore::new();
        store.retain(&retained("a/b", b"1")).unwrap();
        store.retain(&retained("a/b", b"")).unwrap();
        assert!(store.is_empty());
        assert!(store.matching("#").unwrap().is_empty());
    }
}
