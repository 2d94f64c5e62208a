use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::{RelayError, ServerEvent};
use crate::rooms::RoomRegistry;

/// Keyed by (requester connection, target connection).
type PendingKey = (String, String);

/// Forwards WebRTC signaling envelopes between connections and tracks a
/// timeout per outstanding request. Payload bodies are opaque here; the
/// relay never looks inside an offer or answer.
#[derive(Clone)]
pub struct SignalingRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    registry: RoomRegistry,
    timeout: Duration,
    pending: DashMap<PendingKey, JoinHandle<()>>,
}

impl SignalingRelay {
    pub fn new(registry: RoomRegistry, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                registry,
                timeout,
                pending: DashMap::new(),
            }),
        }
    }

    /// Forward a connection request and arm the response timeout. A missing
    /// target fails immediately; the requester should not retry that one.
    pub fn request_connection(
        &self,
        from_connection_id: &str,
        target_connection_id: &str,
        from_peer_id: &str,
    ) -> Result<(), RelayError> {
        self.inner.registry.send_to_connection(
            target_connection_id,
            ServerEvent::ConnectionRequest {
                from_connection_id: from_connection_id.to_string(),
                from_peer_id: from_peer_id.to_string(),
            },
        )?;
        counter!("peddlenet_signaling_requests_total", 1);

        let key = (
            from_connection_id.to_string(),
            target_connection_id.to_string(),
        );
        let inner = Arc::clone(&self.inner);
        let requester = from_connection_id.to_string();
        let target = target_connection_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            if inner
                .pending
                .remove(&(requester.clone(), target.clone()))
                .is_some()
            {
                counter!("peddlenet_signaling_timeouts_total", 1);
                debug!(
                    requester = %requester,
                    target = %target,
                    "signaling request timed out"
                );
                let _ = inner.registry.send_to_connection(
                    &requester,
                    ServerEvent::ConnectionTimeout {
                        target_connection_id: target,
                    },
                );
            }
        });

        // A re-request to the same target restarts the clock.
        if let Some(previous) = self.inner.pending.insert(key, timer) {
            previous.abort();
        }
        Ok(())
    }

    /// Forward a response to the original requester and cancel its timeout.
    pub fn respond_connection(
        &self,
        from_connection_id: &str,
        target_connection_id: &str,
        accepted: bool,
        to_peer_id: &str,
        reason: Option<String>,
    ) -> Result<(), RelayError> {
        self.inner.registry.send_to_connection(
            target_connection_id,
            ServerEvent::ConnectionResponse {
                from_connection_id: from_connection_id.to_string(),
                accepted,
                to_peer_id: to_peer_id.to_string(),
                reason,
            },
        )?;

        let key = (
            target_connection_id.to_string(),
            from_connection_id.to_string(),
        );
        if let Some((_, timer)) = self.inner.pending.remove(&key) {
            timer.abort();
        }
        Ok(())
    }

    /// Drop every pending request the connection participates in, either
    /// side. Called on disconnect so no timeout fires at a ghost.
    pub fn cancel_for_connection(&self, connection_id: &str) {
        self.inner.pending.retain(|(requester, target), timer| {
            if requester == connection_id || target == connection_id {
                timer.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn reset(&self) {
        self.inner.pending.retain(|_, timer| {
            timer.abort();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::Outbound;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

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

    #[tokio::test]
    async fn request_is_forwarded_to_the_target() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = open_connection(&registry);
        let (b, mut rx_b) = open_connection(&registry);
        let relay = SignalingRelay::new(registry, Duration::from_secs(30));

        relay.request_connection(&a, &b, "p1").unwrap();

        let events = drain_events(&mut rx_b);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::ConnectionRequest {
                from_connection_id,
                from_peer_id,
            } => {
                assert_eq!(from_connection_id, &a);
                assert_eq!(from_peer_id, "p1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(relay.pending_count(), 1);
    }

    #[tokio::test]
    async fn missing_target_fails_without_arming_a_timer() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = open_connection(&registry);
        let relay = SignalingRelay::new(registry, Duration::from_secs(30));

        let err = relay.request_connection(&a, "nope", "p1").unwrap_err();
        assert!(matches!(err, RelayError::PeerNotFound(_)));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn unanswered_request_times_out_back_to_the_requester() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = open_connection(&registry);
        let (b, _rx_b) = open_connection(&registry);
        let relay = SignalingRelay::new(registry, Duration::from_millis(50));

        relay.request_connection(&a, &b, "p1").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let events = drain_events(&mut rx_a);
        assert!(events.iter().any(|event| matches!(
            event,
            ServerEvent::ConnectionTimeout { target_connection_id } if target_connection_id == &b
        )));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn response_cancels_the_timeout() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = open_connection(&registry);
        let (b, _rx_b) = open_connection(&registry);
        let relay = SignalingRelay::new(registry, Duration::from_millis(80));

        relay.request_connection(&a, &b, "p1").unwrap();
        relay
            .respond_connection(&b, &a, true, "p2", None)
            .unwrap();
        assert_eq!(relay.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = drain_events(&mut rx_a);
        assert!(events.iter().any(|event| matches!(
            event,
            ServerEvent::ConnectionResponse { accepted: true, .. }
        )));
        assert!(!events
            .iter()
            .any(|event| matches!(event, ServerEvent::ConnectionTimeout { .. })));
    }

    #[tokio::test]
    async fn declined_response_carries_the_reason() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = open_connection(&registry);
        let (b, _rx_b) = open_connection(&registry);
        let relay = SignalingRelay::new(registry, Duration::from_secs(30));

        relay.request_connection(&a, &b, "p1").unwrap();
        relay
            .respond_connection(&b, &a, false, "p2", Some("busy".to_string()))
            .unwrap();

        let events = drain_events(&mut rx_a);
        assert!(events.iter().any(|event| matches!(
            event,
            ServerEvent::ConnectionResponse { accepted: false, reason: Some(r), .. } if r == "busy"
        )));
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_requests() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = open_connection(&registry);
        let (b, _rx_b) = open_connection(&registry);
        let relay = SignalingRelay::new(registry, Duration::from_millis(50));

        relay.request_connection(&a, &b, "p1").unwrap();
        relay.cancel_for_connection(&b);
        assert_eq!(relay.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let events = drain_events(&mut rx_a);
        assert!(!events
            .iter()
            .any(|event| matches!(event, ServerEvent::ConnectionTimeout { .. })));
    }
}
