use log::trace;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::mqtt::QoS;
use crate::structure::Subscription;
use crate::ClientId;

/// Topic filter -> subscriber lookups.
pub trait SubscriptionRegistry: Send + Sync {
    /// Adds or overwrites the subscription of a client to a filter.
    fn subscribe(&self, subscription: Subscription) -> Result<()>;

    fn unsubscribe(&self, client_id: &str, topic_filter: &str) -> Result<bool>;

    /// Subscriptions matching `topic`, at most one per client carrying the
    /// highest QoS among the client's matching filters.
    fn subscribers_of(&self, topic: &str) -> Result<Vec<Subscription>>;

    fn subscriptions_of(&self, client_id: &str) -> Result<Vec<Subscription>>;

    fn remove_all_for(&self, client_id: &str) -> Result<()>;
}

/// Topic names may not be empty nor contain wildcards.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(&['#', '+', '\0'][..])
}

/// `#` only as the whole last level, `+` only as a whole level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| {
        if level.contains('#') {
            return *level == "#" && i == last;
        }
        !level.contains('+') || *level == "+"
    })
}

/// Matches a topic name against a subscription filter. Invalid filters or
/// topics never match, and wildcards in the first level never match topics
/// starting with `$`.
pub fn match_topic(filter: &str, topic: &str) -> bool {
    if !is_valid_filter(filter) || !is_valid_topic(topic) {
        return false;
    }
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            // `#` also matches the parent level, "a/#" matches "a"
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(level)) if expected == level => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Default, Debug)]
pub struct TopicTree {
    filters: RwLock<HashMap<String, HashMap<ClientId, QoS>>>,
}

impl TopicTree {
    pub fn new() -> TopicTree {
        TopicTree::default()
    }

    pub fn len(&self) -> usize {
        self.filters.read().values().map(|subs| subs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SubscriptionRegistry for TopicTree {
    fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.filters
            .write()
            .entry(subscription.topic_filter)
            .or_default()
            .insert(subscription.client_id, subscription.requested_qos);
        Ok(())
    }

    fn unsubscribe(&self, client_id: &str, topic_filter: &str) -> Result<bool> {
        let mut filters = self.filters.write();
        let removed = match filters.get_mut(topic_filter) {
            Some(subs) => subs.remove(client_id).is_some(),
            None => false,
        };
        filters.retain(|_, subs| !subs.is_empty());
        Ok(removed)
    }

    fn subscribers_of(&self, topic: &str) -> Result<Vec<Subscription>> {
        let filters = self.filters.read();
        let mut matched: BTreeMap<&str, Subscription> = BTreeMap::new();
        for (filter, subs) in filters.iter().filter(|(f, _)| match_topic(f, topic)) {
            for (client_id, qos) in subs {
                matched
                    .entry(client_id.as_str())
                    .and_modify(|s| {
                        if *qos > s.requested_qos {
                            s.requested_qos = *qos;
                            s.topic_filter = filter.clone();
                        }
                    })
                    .or_insert_with(|| Subscription::new(client_id.as_str(), filter.as_str(), *qos));
            }
        }
        trace!("[TopicTree] {} matched {} subscribers", topic, matched.len());
        Ok(matched.into_values().collect())
    }

    fn subscriptions_of(&self, client_id: &str) -> Result<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .filters
            .read()
            .iter()
            .filter_map(|(filter, subs)| {
                subs.get(client_id)
                    .map(|qos| Subscription::new(client_id, filter.as_str(), *qos))
            })
            .collect();
        subs.sort_by(|a, b| a.topic_filter.cmp(&b.topic_filter));
        Ok(subs)
    }

    fn remove_all_for(&self, client_id: &str) -> Result<()> {
        let mut filters = self.filters.write();
        for subs in filters.values_mut() {
            subs.remove(client_id);
        }
        filters.retain(|_, subs| !subs.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod simple_tests {
    use super::*;

    // Matching subscriptions with literals and wildcards
    #[test]
    fn literal_subscription() {
        let subscription_matcher = "finance";
        let prefix_subscription_matcher = "/finance";
        assert!(match_topic(subscription_matcher, "finance"));
        assert!(!match_topic(subscription_matcher, "finances"));
        assert!(!match_topic(subscription_matcher, "finance/"));
        assert!(!match_topic(subscription_matcher, "/finance"));
        assert!(match_topic(prefix_subscription_matcher, "/finance"));
    }

    #[test]
    fn single_level_wildcard() {
        let subscription_matcher = "finance/+";
        assert!(match_topic(subscription_matcher, "finance/stocks"));
        assert!(match_topic(subscription_matcher, "finance/commodities"));
        // should not match these
        assert!(!match_topic(subscription_matcher, "finance/commodities/oil"));
        assert!(!match_topic(subscription_matcher, "/finance/stocks"));
        assert!(!match_topic(subscription_matcher, "finance"));
    }

    #[test]
    fn complex_cases() {
        let subscription_matcher = "users/+/device/+/permissions/#";
        assert!(match_topic(
            subscription_matcher,
            "users/john_123/device/samsung_galaxy/permissions"
        ));
        assert!(match_topic(
            subscription_matcher,
            "users/john_123/device/samsung galaxy/permissions/account/can_delete"
        ));
        assert!(match_topic(
            subscription_matcher,
            "users/john_123/device/samsung_galaxy/permissions/is_admin!!"
        ));
        // should not match these
        assert!(!match_topic(
            subscription_matcher,
            "users/john_123/device/samsung_galaxy/permission"
        ));
        assert!(!match_topic(
            subscription_matcher,
            "users/john_123/4/device/samsung_galaxy/permissions/is_admin!!"
        ));
        assert!(!match_topic(
            subscription_matcher,
            "users/john_123/device/permissions/is_admin!!"
        ));
    }

    #[test]
    fn special_cases() {
        let subscription_matcher = "#";
        assert!(match_topic(
            subscription_matcher,
            "users/john_123/device/samsung_galaxy/permissions"
        ));
        assert!(match_topic(subscription_matcher, "users"));
        assert!(match_topic(subscription_matcher, "/users"));
        assert!(match_topic(subscription_matcher, "finance/"));
        // handle +
        let subscription_matcher = "+";
        assert!(match_topic(subscription_matcher, "users"));
        assert!(!match_topic(subscription_matcher, "users/john_123"));
        // handle +/+
        let subscription_matcher = "+/+";
        assert!(match_topic(subscription_matcher, "users/bob"));
        assert!(match_topic(subscription_matcher, "/users"));
        // handle /+
        let subscription_matcher = "/+";
        assert!(match_topic(subscription_matcher, "/users"));
        assert!(!match_topic(subscription_matcher, "users"));
        // handle other combinations
        assert!(match_topic("+/#", "users/bob"));
        assert!(match_topic("+/bob/#", "users/bob"));
    }

    #[test]
    fn system_topics_hidden_from_leading_wildcards() {
        assert!(!match_topic("#", "$SYS/broker/uptime"));
        assert!(!match_topic("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(match_topic("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn invalid_wildcards() {
        assert!(!match_topic("//+", "finance"));
        assert!(!match_topic("#+", "finances"));
        assert!(!match_topic("#/+", "finance"));
        assert!(!match_topic("+/#e", "finance"));
        assert!(!match_topic("#/#", "/finance/other"));
        assert!(!match_topic("/finance/+/", "/finance/hello"));
    }

    #[test]
    fn invalid_topics() {
        assert!(!match_topic("#", "++"));
        assert!(!match_topic("#", "#/#"));
        assert!(!match_topic("#", ""));
        assert!(!match_topic("#", "/finance/hello+"));
    }

    #[test]
    fn filter_validation() {
        assert!(is_valid_filter("a/+/b/#"));
        assert!(is_valid_filter("+"));
        assert!(!is_valid_filter("a/b#"));
        assert!(!is_valid_filter("a/#/b"));
        assert!(!is_valid_filter("a+/b"));
        assert!(!is_valid_filter(""));
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn resubscription_overwrites() {
        let tree = TopicTree::new();
        tree.subscribe(Subscription::new("c", "a/b", QoS::AtMostOnce))
            .unwrap();
        tree.subscribe(Subscription::new("c", "a/b", QoS::ExactlyOnce))
            .unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(
            tree.subscribers_of("a/b").unwrap(),
            vec![Subscription::new("c", "a/b", QoS::ExactlyOnce)]
        );
    }

    #[test]
    fn overlapping_filters_deliver_once_with_highest_qos() {
        let tree = TopicTree::new();
        tree.subscribe(Subscription::new("c", "a/+", QoS::AtMostOnce))
            .unwrap();
        tree.subscribe(Subscription::new("c", "a/#", QoS::AtLeastOnce))
            .unwrap();
        tree.subscribe(Subscription::new("d", "a/b", QoS::ExactlyOnce))
            .unwrap();
        let subs = tree.subscribers_of("a/b").unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].client_id, "c");
        assert_eq!(subs[0].requested_qos, QoS::AtLeastOnce);
        assert_eq!(subs[1].client_id, "d");
    }

    #[test]
    fn remove_all_for_client() {
        let tree = TopicTree::new();
        tree.subscribe(Subscription::new("c", "a", QoS::AtMostOnce))
            .unwrap();
        tree.subscribe(Subscription::new("c", "b/#", QoS::AtMostOnce))
            .unwrap();
        tree.subscribe(Subscription::new("d", "a", QoS::AtMostOnce))
            .unwrap();
        tree.remove_all_for("c").unwrap();
        assert!(tree.subscriptions_of("c").unwrap().is_empty());
        assert_eq!(tree.subscribers_of("a").unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_reports_removal() {
        let tree = TopicTree::new();
        tree.subscribe(Subscription::new("c", "a", QoS::AtMostOnce))
            .unwrap();
        assert!(tree.unsubscribe("c", "a").unwrap());
        assert!(!tree.unsubscribe("c", "a").unwrap());
        assert!(tree.is_empty());
    }
}
