use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::rooms::now_millis;

const DEFAULT_LOG_CAP: usize = 1000;
const RATE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityKind {
    RoomCreated,
    UserJoined,
    UserLeft,
    MessageSent,
    AdminBroadcast,
    AdminRoomClear,
    AdminWipe,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub payload: Value,
    pub timestamp: i64,
}

/// Bounded newest-first log of notable relay events, plus the global
/// message counter the analytics endpoints report.
#[derive(Clone)]
pub struct ActivityLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    events: Mutex<VecDeque<ActivityEvent>>,
    cap: usize,
    messages_total: AtomicU64,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAP)
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Arc::new(LogInner {
                events: Mutex::new(VecDeque::with_capacity(cap.min(DEFAULT_LOG_CAP))),
                cap,
                messages_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn record(&self, kind: ActivityKind, payload: Value) {
        self.record_with_timestamp(kind, payload, now_millis());
    }

    fn record_with_timestamp(&self, kind: ActivityKind, payload: Value, timestamp: i64) {
        if kind == ActivityKind::MessageSent {
            self.inner.messages_total.fetch_add(1, Ordering::Relaxed);
        }
        let mut events = self.inner.events.lock();
        events.push_front(ActivityEvent {
            kind,
            payload,
            timestamp,
        });
        events.truncate(self.inner.cap);
    }

    /// Newest first, at most `limit` entries.
    pub fn recent(&self, limit: usize) -> Vec<ActivityEvent> {
        let events = self.inner.events.lock();
        events.iter().take(limit).cloned().collect()
    }

    pub fn messages_total(&self) -> u64 {
        self.inner.messages_total.load(Ordering::Relaxed)
    }

    /// Administrative clears subtract what they removed; the counter never
    /// underflows.
    pub fn discount_messages(&self, cleared: u64) {
        let _ = self
            .inner
            .messages_total
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_sub(cleared))
            });
    }

    /// Message-sent entries observed in the trailing sixty seconds.
    pub fn messages_per_minute(&self) -> usize {
        let cutoff = now_millis() - RATE_WINDOW_MS;
        let events = self.inner.events.lock();
        events
            .iter()
            .take_while(|event| event.timestamp >= cutoff)
            .filter(|event| event.kind == ActivityKind::MessageSent)
            .count()
    }

    pub fn reset(&self) {
        self.inner.events.lock().clear();
        self.inner.messages_total.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_is_newest_first_and_bounded() {
        let log = ActivityLog::with_capacity(3);
        for n in 0..5 {
            log.record(ActivityKind::UserJoined, json!({ "seq": n }));
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].payload["seq"], 4);
        assert_eq!(recent[2].payload["seq"], 2);
    }

    #[test]
    fn message_rate_covers_the_trailing_minute() {
        let log = ActivityLog::new();
        let now = now_millis();
        log.record_with_timestamp(ActivityKind::MessageSent, json!({}), now - 120_000);
        log.record_with_timestamp(ActivityKind::MessageSent, json!({}), now - 10_000);
        log.record_with_timestamp(ActivityKind::UserJoined, json!({}), now - 5_000);
        log.record_with_timestamp(ActivityKind::MessageSent, json!({}), now - 1_000);

        assert_eq!(log.messages_per_minute(), 2);
        // All three message-sent entries still count toward the total.
        assert_eq!(log.messages_total(), 3);
    }

    #[test]
    fn clears_discount_without_underflow() {
        let log = ActivityLog::new();
        for _ in 0..3 {
            log.record(ActivityKind::MessageSent, json!({}));
        }
        log.discount_messages(2);
        assert_eq!(log.messages_total(), 1);
        log.discount_messages(10);
        assert_eq!(log.messages_total(), 0);
    }

    #[test]
    fn reset_drops_log_and_counter() {
        let log = ActivityLog::new();
        log.record(ActivityKind::MessageSent, json!({ "roomId": "main-stage" }));
        log.record(ActivityKind::AdminWipe, json!({}));
        log.reset();
        assert!(log.recent(10).is_empty());
        assert_eq!(log.messages_total(), 0);
    }

    #[test]
    fn kinds_serialize_kebab_case() {
        let event = ActivityEvent {
            kind: ActivityKind::AdminRoomClear,
            payload: json!({ "roomId": "main-stage" }),
            timestamp: 1,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "admin-room-clear");
        assert_eq!(value["payload"]["roomId"], "main-stage");
    }
}
