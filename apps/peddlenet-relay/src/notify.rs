use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::rooms::now_millis;

#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection_id: String,
    pub display_name: String,
    pub subscribed_at: i64,
}

/// Who wants to hear about messages in rooms they have not joined.
///
/// Kept separate from room membership on purpose: a subscriber that later
/// joins the room keeps its subscription, and fan-out consults both so the
/// connection still receives each message exactly once.
#[derive(Clone, Default)]
pub struct SubscriptionIndex {
    inner: Arc<IndexInner>,
}

#[derive(Default)]
struct IndexInner {
    rooms: DashMap<String, HashMap<String, Subscriber>>,
    by_connection: DashMap<String, HashSet<String>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a room. Re-subscribing refreshes the
    /// display name; the subscription count is unchanged.
    pub fn subscribe(&self, room_id: &str, connection_id: &str, display_name: &str) -> usize {
        let mut room = self.inner.rooms.entry(room_id.to_string()).or_default();
        room.insert(
            connection_id.to_string(),
            Subscriber {
                connection_id: connection_id.to_string(),
                display_name: display_name.to_string(),
                subscribed_at: now_millis(),
            },
        );
        let count = room.len();
        drop(room);

        self.inner
            .by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(room_id.to_string());

        debug!(room = %room_id, connection = %connection_id, subscribers = count, "subscribed");
        count
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, room_id: &str, connection_id: &str) -> bool {
        let removed = match self.inner.rooms.get_mut(room_id) {
            Some(mut room) => room.remove(connection_id).is_some(),
            None => false,
        };
        self.inner
            .rooms
            .remove_if(room_id, |_, subs| subs.is_empty());

        if let Some(mut rooms) = self.inner.by_connection.get_mut(connection_id) {
            rooms.remove(room_id);
        }
        self.inner
            .by_connection
            .remove_if(connection_id, |_, rooms| rooms.is_empty());

        removed
    }

    /// Drop every subscription a connection holds. Called on disconnect.
    pub fn cleanup_connection(&self, connection_id: &str) -> Vec<String> {
        let Some((_, rooms)) = self.inner.by_connection.remove(connection_id) else {
            return Vec::new();
        };
        let mut cleared = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            if let Some(mut room) = self.inner.rooms.get_mut(&room_id) {
                room.remove(connection_id);
            }
            self.inner
                .rooms
                .remove_if(&room_id, |_, subs| subs.is_empty());
            cleared.push(room_id);
        }
        cleared
    }

    /// Subscribers of a room that are not in the given member set. These are
    /// the extra recipients of a fan-out; members already got the message.
    pub fn subscribers_excluding(
        &self,
        room_id: &str,
        members: &HashSet<String>,
    ) -> Vec<Subscriber> {
        match self.inner.rooms.get(room_id) {
            Some(room) => room
                .values()
                .filter(|sub| !members.contains(&sub.connection_id))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.inner
            .rooms
            .get(room_id)
            .map(|room| room.len())
            .unwrap_or(0)
    }

    pub fn total_subscriptions(&self) -> usize {
        self.inner.rooms.iter().map(|room| room.len()).sum()
    }

    pub fn reset(&self) {
        self.inner.rooms.clear();
        self.inner.by_connection.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_then_unsubscribe_round_trip() {
        let index = SubscriptionIndex::new();
        assert_eq!(index.subscribe("main-stage", "c1", "Ana"), 1);
        assert_eq!(index.subscribe("main-stage", "c2", "Ben"), 2);
        assert_eq!(index.subscriber_count("main-stage"), 2);

        assert!(index.unsubscribe("main-stage", "c1"));
        assert!(!index.unsubscribe("main-stage", "c1"));
        assert_eq!(index.subscriber_count("main-stage"), 1);
    }

    #[test]
    fn resubscribing_updates_name_without_duplicating() {
        let index = SubscriptionIndex::new();
        index.subscribe("main-stage", "c1", "Ana");
        assert_eq!(index.subscribe("main-stage", "c1", "Ana Banana"), 1);

        let subs = index.subscribers_excluding("main-stage", &HashSet::new());
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].display_name, "Ana Banana");
    }

    #[test]
    fn members_are_excluded_from_notification_targets() {
        let index = SubscriptionIndex::new();
        index.subscribe("main-stage", "c1", "Ana");
        index.subscribe("main-stage", "c2", "Ben");

        // c1 joined the room in the meantime; only c2 gets notified.
        let members: HashSet<String> = ["c1".to_string()].into_iter().collect();
        let subs = index.subscribers_excluding("main-stage", &members);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].connection_id, "c2");
    }

    #[test]
    fn cleanup_drops_every_room_for_a_connection() {
        let index = SubscriptionIndex::new();
        index.subscribe("main-stage", "c1", "Ana");
        index.subscribe("chill-tent", "c1", "Ana");
        index.subscribe("chill-tent", "c2", "Ben");

        let mut cleared = index.cleanup_connection("c1");
        cleared.sort();
        assert_eq!(cleared, vec!["chill-tent".to_string(), "main-stage".to_string()]);
        assert_eq!(index.subscriber_count("main-stage"), 0);
        assert_eq!(index.subscriber_count("chill-tent"), 1);
        assert_eq!(index.total_subscriptions(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let index = SubscriptionIndex::new();
        index.subscribe("main-stage", "c1", "Ana");
        index.subscribe("chill-tent", "c2", "Ben");
        index.reset();
        assert_eq!(index.total_subscriptions(), 0);
        assert!(index.cleanup_connection("c1").is_empty());
    }
}
