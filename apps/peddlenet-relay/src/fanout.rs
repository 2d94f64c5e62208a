use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use tracing::debug;

use crate::activity::{ActivityKind, ActivityLog};
use crate::notify::SubscriptionIndex;
use crate::protocol::{ChatMessage, ChatPayload, RelayError, ServerEvent};
use crate::rooms::{Outbound, RoomRegistry};
use crate::store::MessageStore;

/// Runs each chat message through validate, stamp, persist, broadcast and
/// acknowledge. The sender is part of the broadcast audience; its UI
/// reconciles the echo by message id, which keeps one ordering source.
#[derive(Clone)]
pub struct FanoutEngine {
    registry: RoomRegistry,
    subscriptions: SubscriptionIndex,
    store: Arc<dyn MessageStore>,
    activity: ActivityLog,
}

impl FanoutEngine {
    pub fn new(
        registry: RoomRegistry,
        subscriptions: SubscriptionIndex,
        store: Arc<dyn MessageStore>,
        activity: ActivityLog,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            store,
            activity,
        }
    }

    /// Accept a message from a member, deliver it to the room, and send the
    /// sender a private delivery acknowledgement.
    pub async fn submit(
        &self,
        connection_id: &str,
        room_id: &str,
        payload: ChatPayload,
    ) -> Result<ChatMessage, RelayError> {
        if payload.content.trim().is_empty() {
            return Err(RelayError::EmptyMessage);
        }
        if !self.registry.is_member(connection_id, room_id) {
            return Err(RelayError::NotInRoom(room_id.to_string()));
        }
        let handle = self
            .registry
            .connection(connection_id)
            .ok_or_else(|| RelayError::UnknownConnection(connection_id.to_string()))?;

        // Sender identity comes from the registry, not the payload.
        let sender = handle
            .display_name
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        let message = ChatMessage::stamp(room_id, &sender, handle.peer_id.clone(), payload);

        // Persistence failures are logged inside the store and never block
        // delivery.
        self.store.append(&message).await;

        let delivered = self.broadcast(room_id, &message).await;

        let _ = self.registry.send_to_connection(
            connection_id,
            ServerEvent::MessageDelivered {
                message_id: message.id.clone(),
                timestamp: message.timestamp,
            },
        );

        self.registry.record_message(room_id);
        self.activity.record(
            ActivityKind::MessageSent,
            json!({ "roomId": room_id, "sender": sender }),
        );
        counter!("peddlenet_messages_total", 1);
        debug!(room = %room_id, message = %message.id, delivered, "message fanned out");
        Ok(message)
    }

    /// Deliver a stamped message to every member plus any subscribers that
    /// are not members. Returns the number of connections written to.
    async fn broadcast(&self, room_id: &str, message: &ChatMessage) -> usize {
        let Some(targets) = self.registry.room_targets(room_id).await else {
            return 0;
        };
        let event = ServerEvent::ChatMessage {
            room_id: room_id.to_string(),
            message: message.clone(),
        };
        for (_, tx) in &targets.senders {
            let _ = tx.send(Outbound::Event(event.clone()));
        }
        let subscribers = self
            .subscriptions
            .subscribers_excluding(room_id, &targets.member_ids);
        for subscriber in &subscribers {
            let _ = self
                .registry
                .send_to_connection(&subscriber.connection_id, event.clone());
        }
        targets.senders.len() + subscribers.len()
    }

    /// Synthesize a system message and run it through the broadcast step,
    /// skipping membership validation. Used by operator announcements and
    /// clear notices; these count as messages like any other.
    pub async fn broadcast_system(&self, room_id: &str, content: &str) -> usize {
        let message = ChatMessage::system(room_id, content);
        self.store.append(&message).await;
        let delivered = self.broadcast(room_id, &message).await;
        self.registry.record_message(room_id);
        self.activity.record(
            ActivityKind::MessageSent,
            json!({ "roomId": room_id, "sender": "system" }),
        );
        counter!("peddlenet_messages_total", 1);
        delivered
    }

    /// Empty one room's history and walk the counters back by exactly the
    /// number of messages removed. Members still present get a notice.
    pub async fn clear_room(&self, room_id: &str) -> usize {
        let cleared = self.store.purge_room(room_id).await;
        self.registry.discount_room_messages(room_id, cleared as u64);
        self.activity.discount_messages(cleared as u64);
        self.activity.record(
            ActivityKind::AdminRoomClear,
            json!({ "roomId": room_id, "messagesCleared": cleared }),
        );
        if self.registry.is_room_active(room_id) {
            self.broadcast_system(room_id, "Chat history was cleared by an operator")
                .await;
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    type Fixture = (
        FanoutEngine,
        RoomRegistry,
        SubscriptionIndex,
        Arc<dyn MessageStore>,
        ActivityLog,
    );

    fn engine() -> Fixture {
        let registry = RoomRegistry::new();
        let subscriptions = SubscriptionIndex::new();
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new(100));
        let activity = ActivityLog::new();
        let fanout = FanoutEngine::new(
            registry.clone(),
            subscriptions.clone(),
            store.clone(),
            activity.clone(),
        );
        (fanout, registry, subscriptions, store, activity)
    }

    fn open_connection(registry: &RoomRegistry) -> (String, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register_connection(tx), rx)
    }

    fn drain_events(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Event(event) = outbound {
                events.push(event);
            }
        }
        events
    }

    fn payload(content: &str) -> ChatPayload {
        ChatPayload {
            content: content.to_string(),
            id: None,
        }
    }

    #[tokio::test]
    async fn sender_gets_the_broadcast_and_exactly_one_ack() {
        let (fanout, registry, _, _, _) = engine();
        let (c1, mut rx1) = open_connection(&registry);
        let (c2, mut rx2) = open_connection(&registry);
        registry.join_room(&c1, "main-stage", "p1", "Ana").await.unwrap();
        registry.join_room(&c2, "main-stage", "p2", "Ben").await.unwrap();
        drain_events(&mut rx1);
        drain_events(&mut rx2);

        let message = fanout.submit(&c1, "main-stage", payload("hello")).await.unwrap();

        let sender_events = drain_events(&mut rx1);
        let echoes = sender_events
            .iter()
            .filter(|event| matches!(event, ServerEvent::ChatMessage { .. }))
            .count();
        let acks: Vec<_> = sender_events
            .iter()
            .filter_map(|event| match event {
                ServerEvent::MessageDelivered { message_id, .. } => Some(message_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(echoes, 1);
        assert_eq!(acks, vec![message.id.clone()]);

        let peer_events = drain_events(&mut rx2);
        assert!(peer_events.iter().any(|event| matches!(
            event,
            ServerEvent::ChatMessage { message: m, .. } if m.content == "hello"
        )));
        assert!(!peer_events
            .iter()
            .any(|event| matches!(event, ServerEvent::MessageDelivered { .. })));
    }

    #[tokio::test]
    async fn non_members_cannot_submit() {
        let (fanout, registry, _, store, _) = engine();
        let (c1, _rx1) = open_connection(&registry);
        let (c2, _rx2) = open_connection(&registry);
        registry.join_room(&c1, "main-stage", "p1", "Ana").await.unwrap();

        let err = fanout
            .submit(&c2, "main-stage", payload("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotInRoom(_)));

        let err = fanout
            .submit(&c1, "chill-tent", payload("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotInRoom(_)));
        assert_eq!(store.buffered_len("main-stage").await, 0);
    }

    #[tokio::test]
    async fn blank_content_is_rejected_before_any_side_effect() {
        let (fanout, registry, _, store, activity) = engine();
        let (c1, _rx1) = open_connection(&registry);
        registry.join_room(&c1, "main-stage", "p1", "Ana").await.unwrap();

        let err = fanout
            .submit(&c1, "main-stage", payload("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::EmptyMessage));
        assert_eq!(store.buffered_len("main-stage").await, 0);
        assert_eq!(activity.messages_total(), 0);
    }

    #[tokio::test]
    async fn sender_identity_comes_from_the_registry() {
        let (fanout, registry, _, _, _) = engine();
        let (c1, _rx1) = open_connection(&registry);
        registry.join_room(&c1, "main-stage", "p1", "Ana").await.unwrap();

        let supplied = ChatPayload {
            content: "keep my id".to_string(),
            id: Some("client-id-7".to_string()),
        };
        let message = fanout.submit(&c1, "main-stage", supplied).await.unwrap();
        assert_eq!(message.id, "client-id-7");
        assert_eq!(message.sender, "Ana");
        assert_eq!(message.sender_peer_id.as_deref(), Some("p1"));
        assert!(message.timestamp > 0);
    }

    #[tokio::test]
    async fn subscribers_outside_the_room_get_one_copy() {
        let (fanout, registry, subscriptions, _, _) = engine();
        let (c1, _rx1) = open_connection(&registry);
        let (c2, mut rx2) = open_connection(&registry);
        let (c3, mut rx3) = open_connection(&registry);
        registry.join_room(&c1, "main-stage", "p1", "Ana").await.unwrap();
        registry.join_room(&c2, "main-stage", "p2", "Ben").await.unwrap();
        drain_events(&mut rx2);

        // Ben is a member who also subscribed; Cam only subscribed.
        subscriptions.subscribe("main-stage", &c2, "Ben");
        subscriptions.subscribe("main-stage", &c3, "Cam");

        fanout.submit(&c1, "main-stage", payload("hello")).await.unwrap();

        let ben = drain_events(&mut rx2);
        assert_eq!(
            ben.iter()
                .filter(|event| matches!(event, ServerEvent::ChatMessage { .. }))
                .count(),
            1
        );
        let cam = drain_events(&mut rx3);
        assert_eq!(
            cam.iter()
                .filter(|event| matches!(event, ServerEvent::ChatMessage { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn system_broadcast_counts_as_a_message() {
        let (fanout, registry, _, store, activity) = engine();
        let (c1, mut rx1) = open_connection(&registry);
        registry.join_room(&c1, "main-stage", "p1", "Ana").await.unwrap();

        let delivered = fanout
            .broadcast_system("main-stage", "Festival gates close at midnight")
            .await;
        assert_eq!(delivered, 1);

        let events = drain_events(&mut rx1);
        assert!(events.iter().any(|event| matches!(
            event,
            ServerEvent::ChatMessage { message, .. }
                if message.sender == "system" && message.kind == crate::protocol::MessageKind::System
        )));
        assert_eq!(store.buffered_len("main-stage").await, 1);
        assert_eq!(activity.messages_total(), 1);
        assert_eq!(registry.room_record("main-stage").unwrap().total_messages, 1);
    }

    #[tokio::test]
    async fn clearing_walks_the_counters_back() {
        let (fanout, registry, _, store, activity) = engine();
        let (c1, mut rx1) = open_connection(&registry);
        registry.join_room(&c1, "main-stage", "p1", "Ana").await.unwrap();

        for n in 0..3 {
            fanout
                .submit(&c1, "main-stage", payload(&format!("msg {n}")))
                .await
                .unwrap();
        }
        assert_eq!(activity.messages_total(), 3);
        drain_events(&mut rx1);

        let cleared = fanout.clear_room("main-stage").await;
        assert_eq!(cleared, 3);

        // Only the clear notice remains, in history and in the counters.
        assert_eq!(store.buffered_len("main-stage").await, 1);
        assert_eq!(activity.messages_total(), 1);
        assert_eq!(registry.room_record("main-stage").unwrap().total_messages, 1);
        let events = drain_events(&mut rx1);
        assert!(events.iter().any(|event| matches!(
            event,
            ServerEvent::ChatMessage { message, .. } if message.sender == "system"
        )));
    }
}
