use dashmap::DashMap;

use crate::structure::WillMessage;
use crate::ClientId;

/// Last wills keyed by client id.
#[derive(Default)]
pub struct WillRegistry {
    wills: DashMap<ClientId, WillMessage>,
}

impl WillRegistry {
    pub fn new() -> WillRegistry {
        WillRegistry::default()
    }

    pub fn register(&self, client_id: &str, will: WillMessage) -> Option<WillMessage> {
        self.wills.insert(client_id.to_string(), will)
    }

    pub fn get(&self, client_id: &str) -> Option<WillMessage> {
        self.wills.get(client_id).map(|w| w.clone())
    }

    /// Removes and returns the will, used both for discarding and for publishing it.
    pub fn take(&self, client_id: &str) -> Option<WillMessage> {
        self.wills.remove(client_id).map(|(_, w)| w)
    }

    pub fn len(&self) -> usize {
        self.wills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wills.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::QoS;
    use bytes::Bytes;

    #[test]
    fn will_round_trip() {
        let registry = WillRegistry::new();
        let will = WillMessage {
            topic: "status/dev-1".to_string(),
            payload: Bytes::from_static(b"offline"),
            retained: true,
            qos: QoS::AtLeastOnce,
        };
        registry.register("dev-1", will.clone());
        assert_eq!(registry.get("dev-1"), Some(will.clone()));
        assert_eq!(registry.take("dev-1"), Some(will));
        assert!(registry.get("dev-1").is_none());
        assert!(registry.is_empty());
    }
}
