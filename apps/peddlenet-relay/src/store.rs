use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::protocol::ChatMessage;

/// Room message history. The relay core only talks to history through this
/// trait, so a deployment can swap the backend without touching the
/// broadcast path.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message to the room's history, dropping the oldest entries
    /// beyond the per-room cap. Durable writes must not block the caller;
    /// a persistence failure is logged, never surfaced.
    async fn append(&self, message: &ChatMessage);

    /// The most recent `limit` messages for a room, oldest first.
    async fn recent(&self, room_id: &str, limit: usize) -> Vec<ChatMessage>;

    /// Number of messages currently buffered for a room.
    async fn buffered_len(&self, room_id: &str) -> usize;

    /// Administrative clear of one room's history, memory and durable rows.
    /// Returns the number of buffered messages removed.
    async fn purge_room(&self, room_id: &str) -> usize;

    /// Full wipe of every room's history.
    async fn purge_all(&self) -> usize;

    /// Reclaim a stale room's buffer without touching durable rows. Used by
    /// the background sweep; not an administrative clear.
    async fn release_buffer(&self, room_id: &str) -> usize;

    /// Record a newly created room. Backends with no durable room metadata
    /// ignore this.
    async fn note_room(&self, _room_id: &str, _created_at_ms: i64) {}

    /// Keep the stored participant count roughly current after joins and
    /// leaves.
    async fn note_participants(&self, _room_id: &str, _count: usize) {}
}

/// Pick the history backend for this deployment: SQLite write-through when
/// a database URL is configured, plain in-memory buffers otherwise.
pub async fn open(cap: usize, database_url: Option<&str>) -> Result<Arc<dyn MessageStore>> {
    match database_url {
        Some(url) => {
            let store = SqliteStore::open(cap, url).await?;
            info!("message history persisted to sqlite");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new(cap))),
    }
}

/// Default backend: per-room ring buffers, nothing durable.
pub struct MemoryStore {
    buffers: DashMap<String, VecDeque<ChatMessage>>,
    cap: usize,
}

impl MemoryStore {
    pub fn new(cap: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            cap,
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: &ChatMessage) {
        let mut buffer = self.buffers.entry(message.room_id.clone()).or_default();
        buffer.push_back(message.clone());
        while buffer.len() > self.cap {
            buffer.pop_front();
        }
    }

    async fn recent(&self, room_id: &str, limit: usize) -> Vec<ChatMessage> {
        self.buffers
            .get(room_id)
            .map(|buffer| {
                let skip = buffer.len().saturating_sub(limit);
                buffer.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    async fn buffered_len(&self, room_id: &str) -> usize {
        self.buffers
            .get(room_id)
            .map(|buffer| buffer.len())
            .unwrap_or(0)
    }

    async fn purge_room(&self, room_id: &str) -> usize {
        self.buffers
            .remove(room_id)
            .map(|(_, buffer)| buffer.len())
            .unwrap_or(0)
    }

    async fn purge_all(&self) -> usize {
        let mut cleared = 0;
        for entry in self.buffers.iter() {
            cleared += entry.value().len();
        }
        self.buffers.clear();
        cleared
    }

    async fn release_buffer(&self, room_id: &str) -> usize {
        let released = self
            .buffers
            .remove(room_id)
            .map(|(_, buffer)| buffer.len())
            .unwrap_or(0);
        if released > 0 {
            debug!(room = %room_id, released, "released stale room buffer");
        }
        released
    }
}

/// Write-through backend: serves reads from the in-memory buffers and
/// mirrors every mutation to SQLite so history survives a restart.
pub struct SqliteStore {
    cache: MemoryStore,
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(cap: usize, database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .with_context(|| format!("failed to open message database {database_url}"))?;
        init_schema(&pool).await?;
        Ok(Self {
            cache: MemoryStore::new(cap),
            pool,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: &ChatMessage) {
        self.cache.append(message).await;
        let pool = self.pool.clone();
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(err) = persist_message(&pool, &message).await {
                warn!(
                    error = %err,
                    message_id = %message.id,
                    room = %message.room_id,
                    "failed to persist message"
                );
            }
        });
    }

    async fn recent(&self, room_id: &str, limit: usize) -> Vec<ChatMessage> {
        self.cache.recent(room_id, limit).await
    }

    async fn buffered_len(&self, room_id: &str) -> usize {
        self.cache.buffered_len(room_id).await
    }

    async fn purge_room(&self, room_id: &str) -> usize {
        let cleared = self.cache.purge_room(room_id).await;
        let pool = self.pool.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = sqlx::query("DELETE FROM messages WHERE room_id = ?")
                .bind(&room_id)
                .execute(&pool)
                .await
            {
                warn!(error = %err, room = %room_id, "failed to clear persisted messages");
            }
        });
        cleared
    }

    async fn purge_all(&self) -> usize {
        let cleared = self.cache.purge_all().await;
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let result = async {
                sqlx::query("DELETE FROM messages").execute(&pool).await?;
                sqlx::query("DELETE FROM rooms").execute(&pool).await?;
                Ok::<_, sqlx::Error>(())
            }
            .await;
            if let Err(err) = result {
                warn!(error = %err, "failed to wipe persisted history");
            }
        });
        cleared
    }

    async fn release_buffer(&self, room_id: &str) -> usize {
        self.cache.release_buffer(room_id).await
    }

    async fn note_room(&self, room_id: &str, created_at_ms: i64) {
        let pool = self.pool.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = sqlx::query(
                "INSERT OR IGNORE INTO rooms (id, created_at, last_activity, participant_count)
                 VALUES (?, ?, ?, 0)",
            )
            .bind(&room_id)
            .bind(created_at_ms)
            .bind(created_at_ms)
            .execute(&pool)
            .await
            {
                warn!(error = %err, room = %room_id, "failed to record room");
            }
        });
    }

    async fn note_participants(&self, room_id: &str, count: usize) {
        let pool = self.pool.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = sqlx::query("UPDATE rooms SET participant_count = ? WHERE id = ?")
                .bind(count as i64)
                .bind(&room_id)
                .execute(&pool)
                .await
            {
                warn!(error = %err, room = %room_id, "failed to update participant count");
            }
        });
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rooms (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            last_activity INTEGER NOT NULL,
            participant_count INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await
    .context("failed to create rooms table")?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            room_id TEXT NOT NULL,
            content TEXT NOT NULL,
            sender TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            type TEXT NOT NULL DEFAULT 'chat'
        )",
    )
    .execute(pool)
    .await
    .context("failed to create messages table")?;
    Ok(())
}

async fn persist_message(pool: &SqlitePool, message: &ChatMessage) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR REPLACE INTO messages (id, room_id, content, sender, timestamp, type)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.room_id)
    .bind(&message.content)
    .bind(&message.sender)
    .bind(message.timestamp)
    .bind(message.kind.as_str())
    .execute(pool)
    .await?;

    sqlx::query("UPDATE rooms SET last_activity = ? WHERE id = ?")
        .bind(message.timestamp)
        .bind(&message.room_id)
        .execute(pool)
        .await?;

    Ok(())
}
