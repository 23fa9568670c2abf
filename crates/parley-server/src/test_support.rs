//! In-memory doubles for hub and session tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use parley_core::{Inbound, MessagePayload, Transport, TransportError, UserId};
use parley_store::{MessageStore, StoreError};

/// Records every payload it is handed; can be built to fail every send.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<MessagePayload>>,
    fail_with: Mutex<Option<TransportError>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Self::failing_with(TransportError::Socket("broken pipe".into()))
    }

    /// A peer whose outbound queue is always full.
    pub fn backpressured() -> Arc<Self> {
        Self::failing_with(TransportError::Backpressure)
    }

    fn failing_with(error: TransportError) -> Arc<Self> {
        let t = Self::default();
        *t.fail_with.lock() = Some(error);
        Arc::new(t)
    }

    pub fn sent(&self) -> Vec<MessagePayload> {
        self.sent.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn send(&self, payload: &MessagePayload) -> Result<(), TransportError> {
        if let Some(error) = self.fail_with.lock().clone() {
            return Err(error);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(payload.clone());
        Ok(())
    }

    fn close(&self) {
        let _ = self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Inbound half fed from a channel; a dropped sender reads as peer close.
pub struct MockInbound {
    rx: mpsc::UnboundedReceiver<Result<MessagePayload, TransportError>>,
}

impl MockInbound {
    pub fn new() -> (
        mpsc::UnboundedSender<Result<MessagePayload, TransportError>>,
        Self,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl Inbound for MockInbound {
    async fn receive(&mut self) -> Result<MessagePayload, TransportError> {
        self.rx.recv().await.unwrap_or(Err(TransportError::Closed))
    }
}

/// Store that records what it was asked to persist, optionally failing.
#[derive(Default)]
pub struct RecordingStore {
    persisted: Mutex<Vec<(UserId, String)>>,
    failing: bool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    pub fn persisted(&self) -> Vec<(UserId, String)> {
        self.persisted.lock().clone()
    }
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn persist(&self, participant_id: UserId, text: &str) -> Result<i64, StoreError> {
        if self.failing {
            return Err(StoreError::Database("disk I/O error".into()));
        }
        let mut persisted = self.persisted.lock();
        persisted.push((participant_id, text.to_string()));
        Ok(persisted.len() as i64)
    }
}
