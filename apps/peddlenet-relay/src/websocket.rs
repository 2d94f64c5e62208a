use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{ClientEvent, ErrorCode, RelayError, ServerEvent};
use crate::rooms::Outbound;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let connection_id = state.registry.register_connection(tx);
    info!(connection = %connection_id, "websocket connected");

    // Writer task: everything outbound funnels through one channel so the
    // registry and sweepers never touch the socket directly.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to serialize outbound event"),
                },
                Outbound::Shutdown => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "connection closed by relay".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => {
                state.registry.touch(&connection_id);
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        if let Err(err) = dispatch(&state, &connection_id, event).await {
                            counter!("peddlenet_errors_total", 1, "code" => err.metric_label());
                            debug!(connection = %connection_id, error = %err, "event rejected");
                            let _ = state.registry.send_to_connection(
                                &connection_id,
                                ServerEvent::Error {
                                    code: err.code(),
                                    message: err.to_string(),
                                },
                            );
                        }
                    }
                    Err(err) => {
                        counter!("peddlenet_errors_total", 1, "code" => "invalid_event");
                        debug!(connection = %connection_id, error = %err, "unparseable event");
                        let _ = state.registry.send_to_connection(
                            &connection_id,
                            ServerEvent::Error {
                                code: ErrorCode::InvalidEvent,
                                message: "unrecognized event".to_string(),
                            },
                        );
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => state.registry.touch(&connection_id),
            Message::Close(_) => break,
            _ => {}
        }
    }

    state
        .teardown_connection(&connection_id, "socket-closed")
        .await;
    writer.abort();
    info!(connection = %connection_id, "websocket disconnected");
}

async fn dispatch(
    state: &AppState,
    connection_id: &str,
    event: ClientEvent,
) -> Result<(), RelayError> {
    match event {
        ClientEvent::JoinRoom {
            room_id,
            peer_id,
            display_name,
        } => {
            let summary = state
                .join_room(connection_id, &room_id, &peer_id, &display_name)
                .await?;
            state.registry.send_to_connection(
                connection_id,
                ServerEvent::RoomPeers {
                    room_id: room_id.clone(),
                    peers: summary.roster,
                },
            )?;
            let messages = state
                .store
                .recent(&room_id, state.config.message_history_cap)
                .await;
            state.registry.send_to_connection(
                connection_id,
                ServerEvent::MessageHistory { room_id, messages },
            )
        }
        ClientEvent::ChatMessage { room_id, message } => state
            .fanout
            .submit(connection_id, &room_id, message)
            .await
            .map(|_| ()),
        ClientEvent::RequestConnection {
            target_connection_id,
            from_peer_id,
        } => state
            .relay
            .request_connection(connection_id, &target_connection_id, &from_peer_id),
        ClientEvent::ConnectionResponse {
            target_connection_id,
            accepted,
            to_peer_id,
            reason,
        } => state.relay.respond_connection(
            connection_id,
            &target_connection_id,
            accepted,
            &to_peer_id,
            reason,
        ),
        ClientEvent::SubscribeNotifications {
            room_id,
            display_name,
        } => {
            state
                .subscriptions
                .subscribe(&room_id, connection_id, &display_name);
            state
                .registry
                .send_to_connection(connection_id, ServerEvent::SubscriptionConfirmed { room_id })
        }
        ClientEvent::UnsubscribeNotifications { room_id } => {
            state.subscriptions.unsubscribe(&room_id, connection_id);
            state.registry.send_to_connection(
                connection_id,
                ServerEvent::UnsubscriptionConfirmed { room_id },
            )
        }
        ClientEvent::HealthPing { timestamp } => {
            state.registry.touch(connection_id);
            state
                .registry
                .send_to_connection(connection_id, ServerEvent::HealthPong { timestamp })
        }
        ClientEvent::Ping { timestamp } => {
            state.registry.touch(connection_id);
            state
                .registry
                .send_to_connection(connection_id, ServerEvent::Pong { timestamp })
        }
    }
}
