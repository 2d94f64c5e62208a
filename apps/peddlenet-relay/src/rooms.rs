use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::protocol::{generate_id, PeerSummary, RelayError, ServerEvent};

/// What the per-connection writer task consumes: either a wire event or an
/// instruction to close the socket (eviction, idle sweep, admin wipe).
#[derive(Debug)]
pub enum Outbound {
    Event(ServerEvent),
    Shutdown,
}

/// State tracked for a single live WebSocket connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub peer_id: Option<String>,
    pub display_name: Option<String>,
    pub room_id: Option<String>,
    pub joined_at: Option<i64>,
    pub connected_at: i64,
    pub last_seen: Arc<AtomicI64>,
}

/// Permanent directory entry for a room. Survives the room emptying; removed
/// only by an administrative wipe.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub room_id: String,
    pub created_at: i64,
    pub last_activity: i64,
    pub total_users: u64,
    pub total_messages: u64,
}

impl RoomRecord {
    fn new(room_id: &str, now: i64) -> Self {
        Self {
            room_id: room_id.to_string(),
            created_at: now,
            last_activity: now,
            total_users: 0,
            total_messages: 0,
        }
    }
}

struct MemberEntry {
    connection_id: String,
    peer_id: String,
    display_name: String,
    joined_at: i64,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Live membership of one room. All same-room mutations run under this lock
/// so joins, leaves and fan-outs observe each other atomically.
struct RoomState {
    members: Mutex<HashMap<String, MemberEntry>>,
}

impl RoomState {
    fn new() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Debug)]
pub struct JoinSummary {
    pub room_id: String,
    pub peer_id: String,
    pub display_name: String,
    /// Members present immediately before the join, excluding the joiner.
    pub roster: Vec<PeerSummary>,
    /// True only the first time this room id has ever been seen.
    pub created_room: bool,
    /// Connection evicted because it held the same peer id in this room.
    pub evicted_connection: Option<String>,
    pub member_count: usize,
}

pub struct DisconnectSummary {
    pub connection_id: String,
    pub peer_id: Option<String>,
    pub display_name: Option<String>,
    pub room_id: Option<String>,
    pub remaining_members: usize,
    pub room_emptied: bool,
}

struct LeaveOutcome {
    peer_id: String,
    display_name: String,
    remaining: usize,
}

/// Fan-out targets for a room: every member's sender (the message sender
/// included) plus the member connection-id set for subscriber deduplication.
pub struct RoomTargets {
    pub senders: Vec<(String, mpsc::UnboundedSender<Outbound>)>,
    pub member_ids: HashSet<String>,
}

/// Tracks every live connection and the room each one has joined.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connections: DashMap<String, ConnectionHandle>,
    rooms: DashMap<String, Arc<RoomState>>,
    directory: DashMap<String, RoomRecord>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                rooms: DashMap::new(),
                directory: DashMap::new(),
            }),
        }
    }

    /// Register a freshly upgraded connection with no room association yet.
    pub fn register_connection(&self, tx: mpsc::UnboundedSender<Outbound>) -> String {
        let connection_id = generate_id();
        let now = now_millis();
        self.inner.connections.insert(
            connection_id.clone(),
            ConnectionHandle {
                connection_id: connection_id.clone(),
                tx,
                peer_id: None,
                display_name: None,
                room_id: None,
                joined_at: None,
                connected_at: now,
                last_seen: Arc::new(AtomicI64::new(now)),
            },
        );
        counter!("peddlenet_connections_total", 1);
        gauge!(
            "peddlenet_connections_active",
            self.inner.connections.len() as f64
        );
        connection_id
    }

    /// Mark heartbeat activity on a connection.
    pub fn touch(&self, connection_id: &str) {
        if let Some(handle) = self.inner.connections.get(connection_id) {
            handle.last_seen.store(now_millis(), Ordering::Relaxed);
        }
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.inner
            .connections
            .get(connection_id)
            .map(|handle| handle.clone())
    }

    /// Send one event to one connection. The target missing is the caller's
    /// problem; a closed channel is not (the disconnect sweep will catch it).
    pub fn send_to_connection(
        &self,
        connection_id: &str,
        event: ServerEvent,
    ) -> Result<(), RelayError> {
        match self.inner.connections.get(connection_id) {
            Some(handle) => {
                let _ = handle.tx.send(Outbound::Event(event));
                Ok(())
            }
            None => Err(RelayError::PeerNotFound(connection_id.to_string())),
        }
    }

    /// Join a room, implicitly leaving the previous one. A live connection
    /// holding the same peer id in the target room is evicted first; it is a
    /// stale duplicate left behind by a page refresh.
    pub async fn join_room(
        &self,
        connection_id: &str,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
    ) -> Result<JoinSummary, RelayError> {
        if room_id.trim().is_empty() {
            return Err(RelayError::InvalidJoin("roomId"));
        }
        if peer_id.trim().is_empty() {
            return Err(RelayError::InvalidJoin("peerId"));
        }
        if display_name.trim().is_empty() {
            return Err(RelayError::InvalidJoin("displayName"));
        }

        let (tx, previous_room) = {
            let handle = self
                .inner
                .connections
                .get(connection_id)
                .ok_or_else(|| RelayError::UnknownConnection(connection_id.to_string()))?;
            (handle.tx.clone(), handle.room_id.clone())
        };

        if let Some(previous) = previous_room {
            if previous != room_id {
                if let Some(outcome) = self.leave_room(connection_id, &previous).await {
                    debug!(
                        connection = %connection_id,
                        from = %previous,
                        to = %room_id,
                        remaining = outcome.remaining,
                        "connection switched rooms"
                    );
                }
            }
        }

        let now = now_millis();
        let created_room = match self.inner.directory.entry(room_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(RoomRecord::new(room_id, now));
                true
            }
        };

        let state = match self.inner.rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let state = Arc::new(RoomState::new());
                entry.insert(Arc::clone(&state));
                state
            }
        };

        let (roster, evicted, peer_notify, member_count) = {
            let mut members = state.members.lock().await;

            let duplicate = members
                .iter()
                .find(|(cid, member)| member.peer_id == peer_id && cid.as_str() != connection_id)
                .map(|(cid, _)| cid.clone());
            let evicted = duplicate.and_then(|cid| members.remove(&cid));

            // A connection re-joining its current room replaces its entry.
            members.remove(connection_id);

            let roster = snapshot_members(&members);
            let peer_notify: Vec<mpsc::UnboundedSender<Outbound>> =
                members.values().map(|member| member.tx.clone()).collect();

            members.insert(
                connection_id.to_string(),
                MemberEntry {
                    connection_id: connection_id.to_string(),
                    peer_id: peer_id.to_string(),
                    display_name: display_name.to_string(),
                    joined_at: now,
                    tx: tx.clone(),
                },
            );
            (roster, evicted, peer_notify, members.len())
        };

        // A concurrent leave may have dropped the (then empty) room entry
        // between our lookup and the insert above.
        self.inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::clone(&state));

        let evicted_connection = evicted.map(|stale| {
            if let Some(mut handle) = self.inner.connections.get_mut(&stale.connection_id) {
                handle.room_id = None;
                handle.joined_at = None;
            }
            let _ = stale.tx.send(Outbound::Shutdown);
            counter!("peddlenet_duplicate_evictions_total", 1);
            info!(
                room = %room_id,
                peer = %peer_id,
                stale_connection = %stale.connection_id,
                "evicted stale duplicate connection"
            );
            stale.connection_id
        });

        if let Some(mut handle) = self.inner.connections.get_mut(connection_id) {
            handle.peer_id = Some(peer_id.to_string());
            handle.display_name = Some(display_name.to_string());
            handle.room_id = Some(room_id.to_string());
            handle.joined_at = Some(now);
            handle.last_seen.store(now, Ordering::Relaxed);
        }

        if let Some(mut record) = self.inner.directory.get_mut(room_id) {
            record.total_users += 1;
            record.last_activity = now;
        }

        let joiner = PeerSummary {
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            connection_id: connection_id.to_string(),
            joined_at: now,
        };
        for tx in peer_notify {
            let _ = tx.send(Outbound::Event(ServerEvent::PeerJoined {
                room_id: room_id.to_string(),
                peer: joiner.clone(),
            }));
        }

        counter!("peddlenet_joins_total", 1);
        gauge!("peddlenet_rooms_active", self.inner.rooms.len() as f64);

        Ok(JoinSummary {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            roster,
            created_room,
            evicted_connection,
            member_count,
        })
    }

    /// Remove a connection entirely: leave its room, notify the remainder,
    /// and drop the handle. Idempotent; the heartbeat sweep and the socket
    /// teardown can both call it.
    pub async fn disconnect(&self, connection_id: &str) -> Option<DisconnectSummary> {
        let (_, handle) = self.inner.connections.remove(connection_id)?;

        let mut summary = DisconnectSummary {
            connection_id: connection_id.to_string(),
            peer_id: handle.peer_id.clone(),
            display_name: handle.display_name.clone(),
            room_id: None,
            remaining_members: 0,
            room_emptied: false,
        };

        if let Some(room_id) = handle.room_id {
            if let Some(outcome) = self.leave_room(connection_id, &room_id).await {
                summary.remaining_members = outcome.remaining;
                summary.room_emptied = outcome.remaining == 0;
                summary.room_id = Some(room_id);
            }
        }

        gauge!(
            "peddlenet_connections_active",
            self.inner.connections.len() as f64
        );
        gauge!("peddlenet_rooms_active", self.inner.rooms.len() as f64);

        Some(summary)
    }

    async fn leave_room(&self, connection_id: &str, room_id: &str) -> Option<LeaveOutcome> {
        let state = self
            .inner
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))?;

        let (removed, remaining_txs, remaining) = {
            let mut members = state.members.lock().await;
            let removed = members.remove(connection_id)?;
            let txs: Vec<mpsc::UnboundedSender<Outbound>> =
                members.values().map(|member| member.tx.clone()).collect();
            let remaining = members.len();
            (removed, txs, remaining)
        };

        if remaining == 0 {
            // Empty rooms leave the active index; the directory record stays.
            self.remove_room_if_empty(room_id, &state);
        }

        for tx in remaining_txs {
            let _ = tx.send(Outbound::Event(ServerEvent::PeerLeft {
                room_id: room_id.to_string(),
                peer_id: removed.peer_id.clone(),
                display_name: removed.display_name.clone(),
            }));
        }

        Some(LeaveOutcome {
            peer_id: removed.peer_id,
            display_name: removed.display_name,
            remaining,
        })
    }

    /// Drop the room's index entry only while it is still the same state
    /// and still empty. The emptiness re-check runs inside the map guard:
    /// a join can land in this room between the caller's observation and
    /// the removal here. On members-lock contention the entry stays; the
    /// periodic prune catches entries that stay hollow.
    fn remove_room_if_empty(&self, room_id: &str, state: &Arc<RoomState>) {
        self.inner.rooms.remove_if(room_id, |_, arc| {
            Arc::ptr_eq(arc, state)
                && arc
                    .members
                    .try_lock()
                    .map(|members| members.is_empty())
                    .unwrap_or(false)
        });
    }

    /// Drop every index entry whose room has no members. Leaves already do
    /// this inline; the sweep calls it to reap entries skipped there under
    /// lock contention. Returns how many entries went.
    pub fn prune_empty_rooms(&self) -> usize {
        let before = self.inner.rooms.len();
        self.inner.rooms.retain(|_, state| {
            state
                .members
                .try_lock()
                .map(|members| !members.is_empty())
                .unwrap_or(true)
        });
        let pruned = before.saturating_sub(self.inner.rooms.len());
        if pruned > 0 {
            gauge!("peddlenet_rooms_active", self.inner.rooms.len() as f64);
        }
        pruned
    }

    /// True when the connection is currently a member of the room.
    pub fn is_member(&self, connection_id: &str, room_id: &str) -> bool {
        self.inner
            .connections
            .get(connection_id)
            .map(|handle| handle.room_id.as_deref() == Some(room_id))
            .unwrap_or(false)
    }

    pub async fn room_targets(&self, room_id: &str) -> Option<RoomTargets> {
        let state = self
            .inner
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))?;
        let members = state.members.lock().await;
        let senders = members
            .values()
            .map(|member| (member.connection_id.clone(), member.tx.clone()))
            .collect();
        let member_ids = members.keys().cloned().collect();
        Some(RoomTargets { senders, member_ids })
    }

    pub async fn member_snapshot(&self, room_id: &str) -> Vec<PeerSummary> {
        let Some(state) = self
            .inner
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return Vec::new();
        };
        let members = state.members.lock().await;
        snapshot_members(&members)
    }

    /// Bump the room's message counters after a successful fan-out.
    pub fn record_message(&self, room_id: &str) {
        if let Some(mut record) = self.inner.directory.get_mut(room_id) {
            record.total_messages += 1;
            record.last_activity = now_millis();
        }
    }

    /// Administrative clear support: room totals only ever decrease here.
    pub fn discount_room_messages(&self, room_id: &str, cleared: u64) {
        if let Some(mut record) = self.inner.directory.get_mut(room_id) {
            record.total_messages = record.total_messages.saturating_sub(cleared);
        }
    }

    pub fn room_record(&self, room_id: &str) -> Option<RoomRecord> {
        self.inner
            .directory
            .get(room_id)
            .map(|record| record.clone())
    }

    pub fn active_room_ids(&self) -> Vec<String> {
        self.inner
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn room_records(&self) -> Vec<RoomRecord> {
        self.inner
            .directory
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_room_active(&self, room_id: &str) -> bool {
        self.inner.rooms.contains_key(room_id)
    }

    pub fn connections_snapshot(&self) -> Vec<ConnectionHandle> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn active_room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn rooms_ever_created(&self) -> usize {
        self.inner.directory.len()
    }

    /// Distinct peer ids across all live connections. A peer with two tabs
    /// open counts once.
    pub fn unique_peer_count(&self) -> usize {
        let mut peers = HashSet::new();
        for entry in self.inner.connections.iter() {
            if let Some(peer_id) = &entry.peer_id {
                peers.insert(peer_id.clone());
            }
        }
        peers.len()
    }

    /// Connections whose last heartbeat is older than the timeout.
    pub fn stale_connections(&self, timeout: Duration) -> Vec<String> {
        let cutoff = now_millis().saturating_sub(timeout.as_millis() as i64);
        self.inner
            .connections
            .iter()
            .filter(|entry| entry.last_seen.load(Ordering::Relaxed) < cutoff)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Rooms whose directory entry has gone stale while no one is joined.
    /// Candidates for message-buffer reclamation, never for record removal.
    pub fn stale_room_ids(&self, stale_after: Duration) -> Vec<String> {
        let cutoff = now_millis().saturating_sub(stale_after.as_millis() as i64);
        self.inner
            .directory
            .iter()
            .filter(|entry| {
                entry.last_activity < cutoff && !self.inner.rooms.contains_key(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Tell every connection the relay is going away and close its socket.
    pub fn shutdown_all(&self, notice: &str) -> usize {
        let mut notified = 0;
        for entry in self.inner.connections.iter() {
            let _ = entry.tx.send(Outbound::Event(ServerEvent::SystemShutdown {
                message: notice.to_string(),
            }));
            let _ = entry.tx.send(Outbound::Shutdown);
            notified += 1;
        }
        notified
    }

    /// Drop all live and historical state. Only the administrative wipe
    /// calls this.
    pub fn reset(&self) {
        self.inner.connections.clear();
        self.inner.rooms.clear();
        self.inner.directory.clear();
        gauge!("peddlenet_connections_active", 0.0);
        gauge!("peddlenet_rooms_active", 0.0);
    }
}

fn snapshot_members(members: &HashMap<String, MemberEntry>) -> Vec<PeerSummary> {
    let mut by_peer: HashMap<&str, &MemberEntry> = HashMap::new();
    for member in members.values() {
        match by_peer.get(member.peer_id.as_str()) {
            Some(existing) if existing.joined_at >= member.joined_at => {}
            _ => {
                by_peer.insert(member.peer_id.as_str(), member);
            }
        }
    }
    let mut roster: Vec<PeerSummary> = by_peer
        .into_values()
        .map(|member| PeerSummary {
            peer_id: member.peer_id.clone(),
            display_name: member.display_name.clone(),
            connection_id: member.connection_id.clone(),
            joined_at: member.joined_at,
        })
        .collect();
    roster.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.peer_id.cmp(&b.peer_id)));
    roster
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
