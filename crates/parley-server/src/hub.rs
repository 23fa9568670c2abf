//! Conversation fan-out hub.
//!
//! A single task owns the connection → conversation map. Registration,
//! unregistration and broadcast all arrive through one mailbox and are
//! handled one at a time in arrival order, so the map needs no lock.
//!
//! A send failure during a broadcast never aborts delivery to the other
//! recipients; the failing connection is scheduled for removal by appending
//! an `Unregister` to the hub's own mailbox.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::{ConnectionId, ConversationId, MessagePayload, Transport, TransportError};

use crate::metrics::{
    HUB_BROADCASTS_TOTAL, HUB_CONNECTIONS, HUB_DELIVERIES_TOTAL, HUB_SEND_FAILURES_TOTAL,
};

/// The hub task is gone; nothing more can be submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("hub has stopped")]
    Stopped,
}

/// A request processed by the hub task.
pub enum HubRequest {
    Register {
        id: ConnectionId,
        conversation_id: ConversationId,
        transport: Arc<dyn Transport>,
    },
    Unregister {
        id: ConnectionId,
    },
    Broadcast {
        payload: MessagePayload,
    },
    Snapshot {
        reply: oneshot::Sender<HubSnapshot>,
    },
}

/// Point-in-time view of the registry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HubSnapshot {
    /// Registered connections.
    pub connections: usize,
    /// Subscriber count per conversation with at least one subscriber.
    pub conversations: BTreeMap<ConversationId, usize>,
}

impl HubSnapshot {
    pub fn subscribers(&self, conversation_id: ConversationId) -> usize {
        self.conversations.get(&conversation_id).copied().unwrap_or(0)
    }
}

/// Result of one broadcast.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    /// Connections subscribed to the payload's conversation.
    pub recipients: usize,
    /// Sends that succeeded.
    pub delivered: usize,
    /// Connections whose send failed, with the failure.
    pub failed: Vec<(ConnectionId, TransportError)>,
}

/// Counters returned when the hub task stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HubReport {
    pub requests: u64,
    pub broadcasts: u64,
    pub delivered: u64,
    pub send_failures: u64,
    /// Connections still registered when the hub stopped.
    pub closed_at_shutdown: usize,
}

struct Subscriber {
    conversation_id: ConversationId,
    transport: Arc<dyn Transport>,
}

/// Registry state. Only the hub task touches it.
#[derive(Default)]
pub struct Hub {
    subscribers: HashMap<ConnectionId, Subscriber>,
    report: HubReport,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.subscribers.contains_key(id)
    }

    pub fn conversation_of(&self, id: &ConnectionId) -> Option<ConversationId> {
        self.subscribers.get(id).map(|s| s.conversation_id)
    }

    /// Insert or replace the entry for `id`.
    pub fn register(
        &mut self,
        id: ConnectionId,
        conversation_id: ConversationId,
        transport: Arc<dyn Transport>,
    ) {
        let previous = self.subscribers.insert(
            id.clone(),
            Subscriber {
                conversation_id,
                transport,
            },
        );
        match previous {
            Some(prev) => debug!(
                connection_id = %id,
                from = %prev.conversation_id,
                to = %conversation_id,
                "connection re-registered"
            ),
            None => debug!(connection_id = %id, %conversation_id, "connection registered"),
        }
        gauge!(HUB_CONNECTIONS).set(self.subscribers.len() as f64);
    }

    /// Remove `id` and close its transport. Returns `false` if it was absent.
    pub fn unregister(&mut self, id: &ConnectionId) -> bool {
        let Some(subscriber) = self.subscribers.remove(id) else {
            return false;
        };
        subscriber.transport.close();
        debug!(connection_id = %id, conversation_id = %subscriber.conversation_id, "connection unregistered");
        gauge!(HUB_CONNECTIONS).set(self.subscribers.len() as f64);
        true
    }

    /// Send `payload` to every subscriber of its conversation.
    ///
    /// Does not mutate the map; failed connections are reported to the
    /// caller for deferred removal.
    pub fn broadcast(&mut self, payload: &MessagePayload) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        for (id, subscriber) in &self.subscribers {
            if subscriber.conversation_id != payload.conversation_id {
                continue;
            }
            outcome.recipients += 1;
            match subscriber.transport.send(payload) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    counter!(HUB_SEND_FAILURES_TOTAL, "kind" => e.kind()).increment(1);
                    outcome.failed.push((id.clone(), e));
                }
            }
        }

        self.report.broadcasts += 1;
        self.report.delivered += outcome.delivered as u64;
        self.report.send_failures += outcome.failed.len() as u64;
        counter!(HUB_BROADCASTS_TOTAL).increment(1);
        counter!(HUB_DELIVERIES_TOTAL).increment(outcome.delivered as u64);

        debug!(
            conversation_id = %payload.conversation_id,
            recipients = outcome.recipients,
            delivered = outcome.delivered,
            failed = outcome.failed.len(),
            "broadcast"
        );
        outcome
    }

    pub fn snapshot(&self) -> HubSnapshot {
        let mut conversations = BTreeMap::new();
        for subscriber in self.subscribers.values() {
            *conversations.entry(subscriber.conversation_id).or_insert(0) += 1;
        }
        HubSnapshot {
            connections: self.subscribers.len(),
            conversations,
        }
    }

    /// Close every remaining transport and clear the map.
    fn close_all(&mut self) -> usize {
        let count = self.subscribers.len();
        for (_, subscriber) in self.subscribers.drain() {
            subscriber.transport.close();
        }
        gauge!(HUB_CONNECTIONS).set(0.0);
        count
    }

    fn handle(&mut self, request: HubRequest, mailbox: &mpsc::WeakUnboundedSender<HubRequest>) {
        self.report.requests += 1;
        match request {
            HubRequest::Register {
                id,
                conversation_id,
                transport,
            } => self.register(id, conversation_id, transport),
            HubRequest::Unregister { id } => {
                let _ = self.unregister(&id);
            }
            HubRequest::Broadcast { payload } => {
                let outcome = self.broadcast(&payload);
                for (id, error) in outcome.failed {
                    warn!(connection_id = %id, error = %error, "send failed, scheduling unregister");
                    let queued = mailbox
                        .upgrade()
                        .is_some_and(|tx| tx.send(HubRequest::Unregister { id: id.clone() }).is_ok());
                    if !queued {
                        // Mailbox closed (draining): nothing else will run after us.
                        let _ = self.unregister(&id);
                    }
                }
            }
            HubRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Process requests until `cancel` fires or every handle is dropped,
    /// then drain what is already queued and close every transport.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<HubRequest>,
        mailbox: mpsc::WeakUnboundedSender<HubRequest>,
        cancel: CancellationToken,
    ) -> HubReport {
        info!("hub started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => self.handle(request, &mailbox),
                    None => break,
                },
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Ok(request) = rx.try_recv() {
            self.handle(request, &mailbox);
            drained += 1;
        }
        self.report.closed_at_shutdown = self.close_all();

        info!(
            drained,
            closed = self.report.closed_at_shutdown,
            requests = self.report.requests,
            broadcasts = self.report.broadcasts,
            "hub stopped"
        );
        self.report
    }
}

/// Cloneable submission handle for the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubRequest>,
}

impl HubHandle {
    pub fn register(
        &self,
        id: ConnectionId,
        conversation_id: ConversationId,
        transport: Arc<dyn Transport>,
    ) -> Result<(), HubError> {
        self.submit(HubRequest::Register {
            id,
            conversation_id,
            transport,
        })
    }

    pub fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.submit(HubRequest::Unregister { id })
    }

    pub fn broadcast(&self, payload: MessagePayload) -> Result<(), HubError> {
        self.submit(HubRequest::Broadcast { payload })
    }

    /// Ask the hub for its current state. Answered in mailbox order.
    pub async fn snapshot(&self) -> Result<HubSnapshot, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubRequest::Snapshot { reply })?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    fn submit(&self, request: HubRequest) -> Result<(), HubError> {
        self.tx.send(request).map_err(|_| HubError::Stopped)
    }
}

/// Spawn the hub task. The returned join handle yields the final report.
pub fn spawn_hub(cancel: CancellationToken) -> (HubHandle, JoinHandle<HubReport>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mailbox = tx.downgrade();
    let task = tokio::spawn(Hub::new().run(rx, mailbox, cancel));
    (HubHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockTransport;

    fn conv(n: i64) -> ConversationId {
        ConversationId::new(n)
    }

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from_raw(s)
    }

    // ── Registry state ──────────────────────────────────────────────

    #[test]
    fn register_then_unregister() {
        let mut hub = Hub::new();
        let t = MockTransport::new();
        hub.register(id("a"), conv(7), t.clone());
        assert!(hub.contains(&id("a")));
        assert_eq!(hub.conversation_of(&id("a")), Some(conv(7)));

        assert!(hub.unregister(&id("a")));
        assert!(hub.is_empty());
        assert!(t.is_closed());
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut hub = Hub::new();
        let t = MockTransport::new();
        hub.register(id("a"), conv(1), t.clone());
        assert!(hub.unregister(&id("a")));
        assert!(!hub.unregister(&id("a")));
        assert!(!hub.unregister(&id("never")));
        assert_eq!(t.close_calls(), 1);
    }

    #[test]
    fn re_register_replaces_entry() {
        let mut hub = Hub::new();
        hub.register(id("a"), conv(1), MockTransport::new());
        hub.register(id("a"), conv(2), MockTransport::new());
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.conversation_of(&id("a")), Some(conv(2)));
    }

    #[test]
    fn snapshot_counts_per_conversation() {
        let mut hub = Hub::new();
        hub.register(id("a"), conv(7), MockTransport::new());
        hub.register(id("b"), conv(7), MockTransport::new());
        hub.register(id("c"), conv(9), MockTransport::new());

        let snap = hub.snapshot();
        assert_eq!(snap.connections, 3);
        assert_eq!(snap.subscribers(conv(7)), 2);
        assert_eq!(snap.subscribers(conv(9)), 1);
        assert_eq!(snap.subscribers(conv(42)), 0);
    }

    // ── Broadcast ───────────────────────────────────────────────────

    #[test]
    fn broadcast_routes_by_conversation() {
        let mut hub = Hub::new();
        let (a, b, c) = (MockTransport::new(), MockTransport::new(), MockTransport::new());
        hub.register(id("a"), conv(7), a.clone());
        hub.register(id("b"), conv(7), b.clone());
        hub.register(id("c"), conv(9), c.clone());

        let payload = MessagePayload::new(7, 1, "hello seven");
        let outcome = hub.broadcast(&payload);

        assert_eq!(outcome.recipients, 2);
        assert_eq!(outcome.delivered, 2);
        assert_eq!(a.sent(), vec![payload.clone()]);
        assert_eq!(b.sent(), vec![payload]);
        assert!(c.sent().is_empty());
    }

    #[test]
    fn broadcast_to_empty_conversation_is_noop() {
        let mut hub = Hub::new();
        hub.register(id("a"), conv(1), MockTransport::new());
        let outcome = hub.broadcast(&MessagePayload::new(2, 1, "nobody"));
        assert_eq!(outcome.recipients, 0);
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn failing_send_does_not_abort_others() {
        let mut hub = Hub::new();
        let broken = MockTransport::failing();
        let healthy = MockTransport::new();
        hub.register(id("broken"), conv(7), broken);
        hub.register(id("healthy"), conv(7), healthy.clone());

        let outcome = hub.broadcast(&MessagePayload::new(7, 1, "x"));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, id("broken"));
        assert_eq!(healthy.sent().len(), 1);
        // Removal is deferred to the mailbox.
        assert!(hub.contains(&id("broken")));
    }

    #[tokio::test]
    async fn full_outbound_queue_fails_only_that_peer() {
        use crate::ws::{WsOptions, WsTransport};
        use futures::channel::mpsc as fmpsc;
        use std::time::Duration;

        let (wire_tx, _wire_rx) = fmpsc::unbounded::<axum::extract::ws::Message>();
        let (_peer_tx, peer_rx) = fmpsc::unbounded::<Result<axum::extract::ws::Message, axum::Error>>();
        let (slow, _inbound) = WsTransport::spawn(
            id("slow"),
            wire_tx,
            peer_rx,
            WsOptions {
                outbound_queue: 1,
                heartbeat_interval: Duration::from_secs(30),
                heartbeat_timeout: Duration::from_secs(90),
            },
        );

        let mut hub = Hub::new();
        let healthy = MockTransport::new();
        hub.register(id("slow"), conv(7), slow.clone());
        hub.register(id("healthy"), conv(7), healthy.clone());

        // The writer task has not run yet on the current-thread runtime, so
        // the first frame fills the one-slot queue.
        let first = hub.broadcast(&MessagePayload::new(7, 1, "first"));
        assert!(first.failed.is_empty());
        let second = hub.broadcast(&MessagePayload::new(7, 1, "second"));
        assert_eq!(second.delivered, 1);
        assert_eq!(second.failed, vec![(id("slow"), TransportError::Backpressure)]);
        assert_eq!(healthy.sent().len(), 2);
    }

    // ── Actor ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn backpressured_peer_is_evicted_while_others_receive() {
        let cancel = CancellationToken::new();
        let (hub, task) = spawn_hub(cancel.clone());
        let slow = MockTransport::backpressured();
        let fast = MockTransport::new();
        hub.register(id("slow"), conv(4), slow.clone()).unwrap();
        hub.register(id("fast"), conv(4), fast.clone()).unwrap();

        hub.broadcast(MessagePayload::new(4, 1, "one")).unwrap();
        let _ = hub.snapshot().await.unwrap();
        let snap = hub.snapshot().await.unwrap();
        assert_eq!(snap.connections, 1);
        assert!(slow.is_closed());

        hub.broadcast(MessagePayload::new(4, 1, "two")).unwrap();
        let _ = hub.snapshot().await.unwrap();
        let texts: Vec<_> = fast.sent().into_iter().map(|p| p.text).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert!(slow.sent().is_empty());

        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.send_failures, 1);
    }

    #[tokio::test]
    async fn failed_connection_is_removed_and_skipped_afterwards() {
        let cancel = CancellationToken::new();
        let (hub, task) = spawn_hub(cancel.clone());
        let a = MockTransport::failing();
        let b = MockTransport::new();
        hub.register(id("a"), conv(7), a.clone()).unwrap();
        hub.register(id("b"), conv(7), b.clone()).unwrap();

        hub.broadcast(MessagePayload::new(7, 1, "first")).unwrap();
        // The deferred unregister is queued behind this snapshot.
        let _ = hub.snapshot().await.unwrap();
        let snap = hub.snapshot().await.unwrap();
        assert_eq!(snap.connections, 1);
        assert_eq!(snap.subscribers(conv(7)), 1);
        assert!(a.is_closed());

        hub.broadcast(MessagePayload::new(7, 1, "second")).unwrap();
        let _ = hub.snapshot().await.unwrap();
        let texts: Vec<_> = b.sent().into_iter().map(|p| p.text).collect();
        assert_eq!(texts, vec!["first", "second"]);

        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.broadcasts, 2);
        assert_eq!(report.send_failures, 1);
        assert_eq!(report.delivered, 2);
    }

    #[tokio::test]
    async fn requests_are_processed_in_order() {
        let cancel = CancellationToken::new();
        let (hub, task) = spawn_hub(cancel.clone());
        let t = MockTransport::new();

        hub.register(id("a"), conv(1), t.clone()).unwrap();
        hub.broadcast(MessagePayload::new(1, 1, "delivered")).unwrap();
        hub.unregister(id("a")).unwrap();
        hub.broadcast(MessagePayload::new(1, 1, "dropped")).unwrap();
        let snap = hub.snapshot().await.unwrap();

        assert_eq!(snap.connections, 0);
        assert_eq!(t.sent().len(), 1);
        assert_eq!(t.sent()[0].text, "delivered");

        cancel.cancel();
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_closes_transports() {
        let cancel = CancellationToken::new();
        let (hub, task) = spawn_hub(cancel.clone());
        let a = MockTransport::new();
        let b = MockTransport::new();

        hub.register(id("a"), conv(3), a.clone()).unwrap();
        hub.register(id("b"), conv(3), b.clone()).unwrap();
        hub.broadcast(MessagePayload::new(3, 1, "last words")).unwrap();
        cancel.cancel();

        let report = task.await.unwrap();
        assert_eq!(report.requests, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.closed_at_shutdown, 2);
        assert_eq!(a.sent().len(), 1);
        assert!(a.is_closed());
        assert!(b.is_closed());

        assert_eq!(hub.broadcast(MessagePayload::new(3, 1, "late")), Err(HubError::Stopped));
        assert_eq!(hub.snapshot().await, Err(HubError::Stopped));
        assert!(hub.is_stopped());
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_hub() {
        let (hub, task) = spawn_hub(CancellationToken::new());
        let t = MockTransport::new();
        hub.register(id("a"), conv(1), t.clone()).unwrap();
        drop(hub);

        let report = task.await.unwrap();
        assert_eq!(report.closed_at_shutdown, 1);
        assert!(t.is_closed());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            Register(u8, i64),
            Unregister(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..8, 0i64..3).prop_map(|(c, v)| Op::Register(c, v)),
                (0u8..8).prop_map(Op::Unregister),
            ]
        }

        fn key(c: u8) -> ConnectionId {
            id(&format!("c{c}"))
        }

        proptest! {
            #[test]
            fn mapping_tracks_any_register_unregister_sequence(
                ops in proptest::collection::vec(op(), 0..64),
            ) {
                let mut hub = Hub::new();
                let mut model: HashMap<u8, i64> = HashMap::new();

                for op in ops {
                    match op {
                        Op::Register(c, v) => {
                            hub.register(key(c), conv(v), MockTransport::new());
                            let _ = model.insert(c, v);
                        }
                        Op::Unregister(c) => {
                            prop_assert_eq!(hub.unregister(&key(c)), model.remove(&c).is_some());
                        }
                    }
                    prop_assert_eq!(hub.len(), model.len());
                }

                for c in 0u8..8 {
                    prop_assert_eq!(hub.contains(&key(c)), model.contains_key(&c));
                    prop_assert_eq!(hub.conversation_of(&key(c)), model.get(&c).map(|v| conv(*v)));
                }
                let snap = hub.snapshot();
                prop_assert_eq!(snap.connections, model.len());
                prop_assert_eq!(snap.conversations.values().sum::<usize>(), model.len());
            }
        }
    }
}
