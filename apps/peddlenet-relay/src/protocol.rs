use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Messages sent from client to relay over the WebSocket.
///
/// Event names are kebab-case and payload fields camelCase; this is the wire
/// format the browser clients speak.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join a room, leaving any previously joined room.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        peer_id: String,
        display_name: String,
    },
    /// Submit a chat message for fan-out to the room.
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        message: ChatPayload,
    },
    /// Ask the relay to forward a WebRTC connection request to another peer.
    #[serde(rename_all = "camelCase")]
    RequestConnection {
        target_connection_id: String,
        from_peer_id: String,
    },
    /// Answer a previously forwarded connection request.
    #[serde(rename_all = "camelCase")]
    ConnectionResponse {
        target_connection_id: String,
        accepted: bool,
        to_peer_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Receive message notifications for a room without joining it.
    #[serde(rename_all = "camelCase")]
    SubscribeNotifications {
        room_id: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    UnsubscribeNotifications { room_id: String },
    /// Application-level health probe.
    HealthPing { timestamp: i64 },
    /// Heartbeat to keep the connection alive.
    Ping { timestamp: i64 },
}

/// Client-supplied portion of a chat message. The relay assigns the id when
/// absent and always stamps the timestamp and sender identity itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub content: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Membership snapshot delivered to a joiner; excludes the joiner itself.
    #[serde(rename_all = "camelCase")]
    RoomPeers {
        room_id: String,
        peers: Vec<PeerSummary>,
    },
    /// Buffered recent messages, sent to a joiner after the peer snapshot.
    #[serde(rename_all = "camelCase")]
    MessageHistory {
        room_id: String,
        messages: Vec<ChatMessage>,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined { room_id: String, peer: PeerSummary },
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        room_id: String,
        peer_id: String,
        display_name: String,
    },
    /// A chat or system message broadcast to the room. The sender receives
    /// its own message back and reconciles by id.
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        message: ChatMessage,
    },
    /// Private delivery acknowledgement to the sender of a message.
    #[serde(rename_all = "camelCase")]
    MessageDelivered { message_id: String, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    ConnectionRequest {
        from_connection_id: String,
        from_peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionResponse {
        from_connection_id: String,
        accepted: bool,
        to_peer_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The peer never answered a forwarded connection request. Retryable.
    #[serde(rename_all = "camelCase")]
    ConnectionTimeout { target_connection_id: String },
    #[serde(rename_all = "camelCase")]
    SubscriptionConfirmed { room_id: String },
    #[serde(rename_all = "camelCase")]
    UnsubscriptionConfirmed { room_id: String },
    HealthPong { timestamp: i64 },
    Pong { timestamp: i64 },
    Error { code: ErrorCode, message: String },
    SystemShutdown { message: String },
}

/// One member of a room as reported in snapshots and join notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    pub display_name: String,
    pub connection_id: String,
    pub joined_at: i64,
}

/// A fully stamped chat message as persisted and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_peer_id: Option<String>,
    pub content: String,
    /// Milliseconds since the Unix epoch, assigned by the relay.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::System => "system",
        }
    }
}

impl ChatMessage {
    /// Stamp a client payload into a broadcastable message. A client-supplied
    /// id is kept so reconnecting senders can reconcile resends.
    pub fn stamp(
        room_id: &str,
        sender: &str,
        sender_peer_id: Option<String>,
        payload: ChatPayload,
    ) -> Self {
        Self {
            id: payload.id.unwrap_or_else(generate_id),
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            sender_peer_id,
            content: payload.content,
            timestamp: Utc::now().timestamp_millis(),
            kind: MessageKind::Chat,
        }
    }

    pub fn system(room_id: &str, content: &str) -> Self {
        Self {
            id: generate_id(),
            room_id: room_id.to_string(),
            sender: "system".to_string(),
            sender_peer_id: None,
            content: content.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            kind: MessageKind::System,
        }
    }
}

/// Wire error codes surfaced in `error` events and admin responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidJoin,
    EmptyMessage,
    NotInRoom,
    PeerNotFound,
    RoomCodeNotFound,
    ConfirmationRequired,
    InvalidEvent,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("join request missing {0}")]
    InvalidJoin(&'static str),
    #[error("message content is empty")]
    EmptyMessage,
    #[error("connection has not joined room {0}")]
    NotInRoom(String),
    #[error("peer {0} not found")]
    PeerNotFound(String),
    #[error("room code {0} is not registered")]
    RoomCodeNotFound(String),
    #[error("destructive operation requires confirmation")]
    ConfirmationRequired,
    #[error("unknown connection {0}")]
    UnknownConnection(String),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::InvalidJoin(_) => ErrorCode::InvalidJoin,
            RelayError::EmptyMessage => ErrorCode::EmptyMessage,
            RelayError::NotInRoom(_) => ErrorCode::NotInRoom,
            RelayError::PeerNotFound(_) => ErrorCode::PeerNotFound,
            RelayError::UnknownConnection(_) => ErrorCode::PeerNotFound,
            RelayError::RoomCodeNotFound(_) => ErrorCode::RoomCodeNotFound,
            RelayError::ConfirmationRequired => ErrorCode::ConfirmationRequired,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::InvalidJoin(_) => "invalid_join",
            RelayError::EmptyMessage => "empty_message",
            RelayError::NotInRoom(_) => "not_in_room",
            RelayError::PeerNotFound(_) => "peer_not_found",
            RelayError::UnknownConnection(_) => "unknown_connection",
            RelayError::RoomCodeNotFound(_) => "room_code_not_found",
            RelayError::ConfirmationRequired => "confirmation_required",
        }
    }
}

/// Generate a unique connection or message id.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_kebab_case_tags() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"join-room","roomId":"main-stage","peerId":"p1","displayName":"Ana"}"#,
        )
        .unwrap();
        match event {
            ClientEvent::JoinRoom {
                room_id,
                peer_id,
                display_name,
            } => {
                assert_eq!(room_id, "main-stage");
                assert_eq!(peer_id, "p1");
                assert_eq!(display_name, "Ana");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn chat_message_event_accepts_optional_id() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"chat-message","roomId":"main-stage","message":{"content":"hi"}}"#,
        )
        .unwrap();
        match event {
            ClientEvent::ChatMessage { message, .. } => {
                assert_eq!(message.content, "hi");
                assert!(message.id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn server_events_serialize_camel_case_payloads() {
        let event = ServerEvent::MessageDelivered {
            message_id: "m1".into(),
            timestamp: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message-delivered");
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["timestamp"], 42);
    }

    #[test]
    fn error_codes_serialize_screaming_snake_case() {
        let json = serde_json::to_value(ErrorCode::PeerNotFound).unwrap();
        assert_eq!(json, "PEER_NOT_FOUND");
        let json = serde_json::to_value(ErrorCode::InvalidJoin).unwrap();
        assert_eq!(json, "INVALID_JOIN");
    }

    #[test]
    fn stamped_message_keeps_client_id() {
        let payload = ChatPayload {
            content: "hello".into(),
            id: Some("client-id-1".into()),
        };
        let message = ChatMessage::stamp("main-stage", "Ana", Some("p1".into()), payload);
        assert_eq!(message.id, "client-id-1");
        assert_eq!(message.kind, MessageKind::Chat);
        assert!(message.timestamp > 0);
    }

    #[test]
    fn message_kind_round_trips_as_lowercase() {
        let message = ChatMessage::system("main-stage", "maintenance in 5 minutes");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "system");
        assert_eq!(json["sender"], "system");
        let back: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, MessageKind::System);
    }
}
