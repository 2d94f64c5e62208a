use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{ActivityKind, ActivityLog};
use crate::config::Config;
use crate::fanout::FanoutEngine;
use crate::notify::SubscriptionIndex;
use crate::protocol::RelayError;
use crate::relay::SignalingRelay;
use crate::room_code::RoomCodeMap;
use crate::rooms::{Outbound, RoomRegistry};
use crate::store::MessageStore;

pub const WIPE_CONFIRM_TOKEN: &str = "wipe-everything";

/// Everything the HTTP handlers and the WebSocket layer share.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: RoomRegistry,
    pub codes: RoomCodeMap,
    pub subscriptions: SubscriptionIndex,
    pub relay: SignalingRelay,
    pub store: Arc<dyn MessageStore>,
    pub activity: ActivityLog,
    pub fanout: FanoutEngine,
    pub started_at: Instant,
    pub prometheus: Option<PrometheusHandle>,
    admin_password_digest: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub rooms: usize,
    pub delivered: usize,
}

/// Per-target result of an admin broadcast; failures are collected, not
/// short-circuited.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub delivered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WipeReport {
    pub disconnected: usize,
    pub messages_cleared: usize,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let registry = RoomRegistry::new();
        let subscriptions = SubscriptionIndex::new();
        let activity = ActivityLog::new();
        let store =
            crate::store::open(config.message_history_cap, config.database_url.as_deref()).await?;
        let relay = SignalingRelay::new(
            registry.clone(),
            Duration::from_secs(config.signaling_timeout_seconds),
        );
        let fanout = FanoutEngine::new(
            registry.clone(),
            subscriptions.clone(),
            store.clone(),
            activity.clone(),
        );
        let admin_password_digest = digest_hex(&config.admin_password);
        Ok(Self {
            config: Arc::new(config),
            registry,
            codes: RoomCodeMap::new(),
            subscriptions,
            relay,
            store,
            activity,
            fanout,
            started_at: Instant::now(),
            prometheus: None,
            admin_password_digest,
        })
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Shared-credential check for the admin surface. The password is
    /// compared by digest so the plaintext never sits in this struct.
    pub fn verify_admin(&self, username: &str, password: &str) -> bool {
        username == self.config.admin_username && digest_hex(password) == self.admin_password_digest
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Full join bookkeeping: registry membership plus the room code, the
    /// durable room row and the activity feed. The WebSocket layer replies
    /// to the joiner from the returned summary.
    pub async fn join_room(
        &self,
        connection_id: &str,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
    ) -> Result<crate::rooms::JoinSummary, RelayError> {
        let summary = self
            .registry
            .join_room(connection_id, room_id, peer_id, display_name)
            .await?;
        if summary.created_room {
            let code = self.codes.register_derived(room_id);
            self.store
                .note_room(room_id, crate::rooms::now_millis())
                .await;
            self.activity.record(
                ActivityKind::RoomCreated,
                json!({ "roomId": room_id, "roomCode": code }),
            );
        }
        self.store
            .note_participants(room_id, summary.member_count)
            .await;
        self.activity.record(
            ActivityKind::UserJoined,
            json!({
                "roomId": room_id,
                "peerId": peer_id,
                "displayName": display_name,
            }),
        );
        Ok(summary)
    }

    /// Undo every trace of a connection. Safe to call twice; the second
    /// caller finds nothing to remove.
    pub async fn teardown_connection(&self, connection_id: &str, reason: &str) {
        self.relay.cancel_for_connection(connection_id);
        self.subscriptions.cleanup_connection(connection_id);
        if let Some(summary) = self.registry.disconnect(connection_id).await {
            if let Some(room_id) = &summary.room_id {
                self.store
                    .note_participants(room_id, summary.remaining_members)
                    .await;
                self.activity.record(
                    ActivityKind::UserLeft,
                    json!({
                        "roomId": room_id,
                        "peerId": summary.peer_id,
                        "displayName": summary.display_name,
                        "reason": reason,
                    }),
                );
            }
            debug!(connection = %connection_id, reason, "connection torn down");
        }
    }

    /// Resolve an admin-supplied room target: code first, then exact id,
    /// then substring match over every room ever seen.
    pub fn resolve_target(&self, target: &str) -> Option<String> {
        if let Some(room_id) = self.codes.resolve(target) {
            return Some(room_id);
        }
        if self.registry.room_record(target).is_some() {
            return Some(target.to_string());
        }
        let needle = target.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        let mut candidates: Vec<_> = self
            .registry
            .room_records()
            .into_iter()
            .filter(|record| record.room_id.to_lowercase().contains(&needle))
            .collect();
        candidates.sort_by(|a, b| {
            let a_active = self.registry.is_room_active(&a.room_id);
            let b_active = self.registry.is_room_active(&b.room_id);
            b_active
                .cmp(&a_active)
                .then(b.last_activity.cmp(&a.last_activity))
        });
        candidates.first().map(|record| record.room_id.clone())
    }

    pub async fn broadcast_to_all_rooms(&self, content: &str) -> BroadcastReport {
        let rooms = self.registry.active_room_ids();
        let mut delivered = 0;
        for room_id in &rooms {
            delivered += self.fanout.broadcast_system(room_id, content).await;
        }
        self.activity.record(
            ActivityKind::AdminBroadcast,
            json!({ "scope": "all", "rooms": rooms.len(), "delivered": delivered }),
        );
        info!(rooms = rooms.len(), delivered, "broadcast to all rooms");
        BroadcastReport {
            rooms: rooms.len(),
            delivered,
        }
    }

    pub async fn broadcast_to_rooms(&self, content: &str, targets: &[String]) -> Vec<TargetOutcome> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            match self.resolve_target(target) {
                Some(room_id) => {
                    let delivered = self.fanout.broadcast_system(&room_id, content).await;
                    outcomes.push(TargetOutcome {
                        target: target.clone(),
                        room_id: Some(room_id),
                        delivered,
                        error: None,
                    });
                }
                None => outcomes.push(TargetOutcome {
                    target: target.clone(),
                    room_id: None,
                    delivered: 0,
                    error: Some("no matching room".to_string()),
                }),
            }
        }
        self.activity.record(
            ActivityKind::AdminBroadcast,
            json!({ "scope": "targets", "targets": targets.len() }),
        );
        outcomes
    }

    /// Clear one room's history. Destructive, so the target must resolve as
    /// a code or an exact id; no fuzzy matching here.
    pub async fn clear_room_by_target(&self, target: &str) -> Result<(String, usize), RelayError> {
        let room_id = if let Some(room_id) = self.codes.resolve(target) {
            room_id
        } else if self.registry.room_record(target).is_some() {
            target.to_string()
        } else {
            return Err(RelayError::RoomCodeNotFound(target.to_string()));
        };
        let cleared = self.fanout.clear_room(&room_id).await;
        Ok((room_id, cleared))
    }

    /// Disconnect everyone and drop all in-memory state. Requires the exact
    /// confirmation token before anything destructive happens.
    pub async fn wipe_all(&self, confirm: &str) -> Result<WipeReport, RelayError> {
        if confirm != WIPE_CONFIRM_TOKEN {
            return Err(RelayError::ConfirmationRequired);
        }
        let disconnected = self
            .registry
            .shutdown_all("The relay is resetting; please reconnect shortly");
        let messages_cleared = self.store.purge_all().await;
        self.registry.reset();
        self.subscriptions.reset();
        self.codes.reset();
        self.relay.reset();
        self.activity.reset();
        self.activity.record(
            ActivityKind::AdminWipe,
            json!({ "disconnected": disconnected, "messagesCleared": messages_cleared }),
        );
        warn!(disconnected, messages_cleared, "wiped all relay state");
        Ok(WipeReport {
            disconnected,
            messages_cleared,
        })
    }
}

fn digest_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Background maintenance: heartbeat timeouts and stale-room buffer
/// reclamation. Returned handles are aborted on shutdown.
pub fn spawn_sweepers(state: &AppState) -> Vec<JoinHandle<()>> {
    vec![
        spawn_heartbeat_monitor(state.clone()),
        spawn_room_sweeper(state.clone()),
    ]
}

fn spawn_heartbeat_monitor(state: AppState) -> JoinHandle<()> {
    let timeout = Duration::from_secs(state.config.heartbeat_timeout_seconds);
    let interval = (timeout / 3).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for connection_id in state.registry.stale_connections(timeout) {
                if let Some(handle) = state.registry.connection(&connection_id) {
                    let _ = handle.tx.send(Outbound::Shutdown);
                }
                info!(connection = %connection_id, "dropping silent connection");
                counter!("peddlenet_heartbeat_disconnects_total", 1);
                state
                    .teardown_connection(&connection_id, "heartbeat-timeout")
                    .await;
            }
        }
    })
}

fn spawn_room_sweeper(state: AppState) -> JoinHandle<()> {
    let interval = Duration::from_secs(state.config.sweep_interval_seconds);
    let stale_after = Duration::from_secs(state.config.room_stale_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let pruned = state.registry.prune_empty_rooms();
            let mut released = 0;
            for room_id in state.registry.stale_room_ids(stale_after) {
                released += state.store.release_buffer(&room_id).await;
            }
            if pruned > 0 || released > 0 {
                debug!(pruned, released, "reclaimed stale room state");
            }
        }
    })
}
