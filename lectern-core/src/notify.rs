use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use dashmap::DashMap;
use tokio::sync::mpsc::{error::TryRecvError, unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{ChangeEvent, Id, Topic};

type SubscriberId = Id<Subscriber>;

/// Fans change notifications out to interested subscribers.
///
/// Delivery is unbounded and per-subscriber, so a slow consumer only delays
/// itself.
pub struct ChangeBus {
    me: Weak<Self>,
    subscribers: DashMap<SubscriberId, Subscriber>,
}

struct Subscriber {
    topic: Topic,
    sender: UnboundedSender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            subscribers: Default::default(),
        })
    }

    /// Delivers an event to every subscriber whose topic matches it.
    pub fn publish(&self, event: ChangeEvent) {
        for subscriber in self.subscribers.iter() {
            if subscriber.topic.matches(&event) {
                // A closed receiver just means the subscription is being
                // torn down concurrently.
                let _ = subscriber.sender.send(event.clone());
            }
        }
    }

    /// Registers a subscriber for the given topic.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (sender, receiver) = unbounded_channel();
        let id = SubscriberId::new();

        self.subscribers.insert(id, Subscriber { topic, sender });

        Subscription {
            id,
            receiver,
            bus: self.me.clone(),
            released: AtomicBool::new(false),
        }
    }

    fn release(&self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }
}

/// A live registration on a [ChangeBus].
///
/// Must be released exactly once, either explicitly via [Self::unsubscribe]
/// or by dropping it. Releasing more than once, or after the bus itself is
/// gone, is a no-op.
pub struct Subscription {
    id: SubscriberId,
    receiver: UnboundedReceiver<ChangeEvent>,
    bus: Weak<ChangeBus>,
    released: AtomicBool,
}

impl Subscription {
    /// Waits for the next matching event. Returns [None] once the
    /// subscription is released and drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Returns a pending event without waiting, if one is queued.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(bus) = self.bus.upgrade() {
            bus.release(self.id)
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::{ChangeKind, Table};

    use super::*;

    fn insert_event(table: Table, row: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            table,
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    #[tokio::test]
    async fn test_events_reach_matching_subscribers() {
        let bus = ChangeBus::new();

        let mut sessions = bus.subscribe(Topic::table(Table::LiveSessions));
        let mut scoped = bus.subscribe(Topic::scoped(Table::LiveSessions, "id", "s1"));

        bus.publish(insert_event(Table::LiveSessions, json!({ "id": "s1" })));
        bus.publish(insert_event(Table::LiveSessions, json!({ "id": "s2" })));
        bus.publish(insert_event(Table::Profiles, json!({ "id": "p1" })));

        assert_eq!(sessions.recv().await.unwrap().row(), Some(&json!({ "id": "s1" })));
        assert_eq!(sessions.recv().await.unwrap().row(), Some(&json!({ "id": "s2" })));
        assert!(sessions.try_recv().is_none());

        assert_eq!(scoped.recv().await.unwrap().row(), Some(&json!({ "id": "s1" })));
        assert!(scoped.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = ChangeBus::new();
        let subscription = bus.subscribe(Topic::table(Table::LiveSessions));

        subscription.unsubscribe();
        subscription.unsubscribe();

        bus.publish(insert_event(Table::LiveSessions, json!({ "id": "s1" })));
    }

    #[tokio::test]
    async fn test_unsubscribe_after_bus_is_gone() {
        let bus = ChangeBus::new();
        let subscription = bus.subscribe(Topic::table(Table::LiveSessions));

        drop(bus);

        subscription.unsubscribe();
        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn test_released_subscriber_receives_nothing_new() {
        let bus = ChangeBus::new();
        let mut subscription = bus.subscribe(Topic::table(Table::LiveSessions));

        subscription.unsubscribe();
        bus.publish(insert_event(Table::LiveSessions, json!({ "id": "s1" })));

        assert!(subscription.try_recv().is_none());
    }
}
