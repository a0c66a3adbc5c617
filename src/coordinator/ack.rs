use log::trace;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::{ClientId, PacketId};

/// The publisher side of a QoS 1 message whose recipients all confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub publisher: ClientId,
    pub packet_id: PacketId,
    /// Inbound record held for the publisher until PUBACK.
    pub record: Uuid,
}

#[derive(Debug)]
struct Obligation {
    completed: Completed,
    waiting: HashSet<ClientId>,
    sealed: bool,
}

/// Live recipients that still owe an acknowledgment, keyed by publish event id.
///
/// An obligation is opened with [`AckTracker::begin`] before fan-out, grows
/// with [`AckTracker::expect`] during fan-out and can only complete after
/// [`AckTracker::seal`].
#[derive(Debug, Default)]
pub struct AckTracker {
    obligations: Mutex<HashMap<Uuid, Obligation>>,
}

impl AckTracker {
    pub fn new() -> AckTracker {
        AckTracker::default()
    }

    pub fn begin(&self, event: Uuid, publisher: &str, packet_id: PacketId, record: Uuid) {
        self.obligations.lock().insert(
            event,
            Obligation {
                completed: Completed {
                    publisher: publisher.to_string(),
                    packet_id,
                    record,
                },
                waiting: HashSet::new(),
                sealed: false,
            },
        );
    }

    /// No-op for events that are not tracked.
    pub fn expect(&self, event: Uuid, recipient: &str) {
        if let Some(obligation) = self.obligations.lock().get_mut(&event) {
            obligation.waiting.insert(recipient.to_string());
        }
    }

    /// Ends fan-out for `event`. Completes at once when nobody is waited for.
    pub fn seal(&self, event: Uuid) -> Option<Completed> {
        let mut obligations = self.obligations.lock();
        let done = match obligations.get_mut(&event) {
            Some(obligation) => {
                obligation.sealed = true;
                obligation.waiting.is_empty()
            }
            None => false,
        };
        if done {
            return obligations.remove(&event).map(|o| o.completed);
        }
        None
    }

    /// Drops an obligation whose fan-out failed.
    pub fn abandon(&self, event: Uuid) {
        self.obligations.lock().remove(&event);
    }

    pub fn confirm(&self, event: Uuid, recipient: &str) -> Option<Completed> {
        let mut obligations = self.obligations.lock();
        let done = match obligations.get_mut(&event) {
            Some(obligation) => {
                obligation.waiting.remove(recipient);
                obligation.sealed && obligation.waiting.is_empty()
            }
            None => false,
        };
        if done {
            trace!("[AckTracker] {} confirmed last copy of {}", recipient, event);
            return obligations.remove(&event).map(|o| o.completed);
        }
        None
    }

    /// Stops waiting on `recipient` everywhere, its copies stay in the store.
    pub fn release_recipient(&self, recipient: &str) -> Vec<Completed> {
        let mut obligations = self.obligations.lock();
        let mut finished = vec![];
        for (event, obligation) in obligations.iter_mut() {
            if obligation.waiting.remove(recipient)
                && obligation.sealed
                && obligation.waiting.is_empty()
            {
                finished.push(*event);
            }
        }
        finished
            .into_iter()
            .filter_map(|event| obligations.remove(&event).map(|o| o.completed))
            .collect()
    }

    /// Drops every obligation opened by `publisher`.
    pub fn forget_publisher(&self, publisher: &str) {
        self.obligations
            .lock()
            .retain(|_, o| o.completed.publisher != publisher);
    }

    pub fn is_tracking(&self, event: Uuid) -> bool {
        self.obligations.lock().contains_key(&event)
    }

    pub fn len(&self) -> usize {
        self.obligations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
