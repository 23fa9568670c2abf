//! Per-connection session: register, relay inbound messages, clean up.

use std::fmt;
use std::sync::Arc;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_core::{ConnectionId, ConversationId, Inbound, MessagePayload, Transport, TransportError};
use parley_store::MessageStore;

use crate::hub::{HubError, HubHandle};
use crate::metrics::{
    STORE_ERRORS_TOTAL, STORE_PERSISTED_TOTAL, WS_CONNECTION_DURATION_SECONDS,
    WS_DISCONNECTIONS_TOTAL,
};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Move to `next`, rejecting backward or skipped transitions.
    pub fn advance(self, next: SessionState) -> Result<SessionState, SessionError> {
        use SessionState::*;
        let allowed = matches!(
            (self, next),
            (Connecting, Registered)
                | (Connecting, Closing)
                | (Registered, Active)
                | (Registered, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        );
        if allowed {
            Ok(next)
        } else {
            Err(SessionError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport was closed, by the peer or by the hub.
    Closed,
    /// The transport failed.
    Transport(TransportError),
    /// Server shutdown.
    Shutdown,
    /// The hub stopped accepting requests.
    HubStopped,
}

impl CloseReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Transport(e) => e.kind(),
            Self::Shutdown => "shutdown",
            Self::HubStopped => "hub_stopped",
        }
    }
}

/// What a finished session did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub reason: CloseReason,
    pub forwarded: u64,
    pub persist_failures: u64,
}

/// One subscriber bound to one conversation for its whole life.
pub struct ConnectionSession<I> {
    id: ConnectionId,
    conversation_id: ConversationId,
    transport: Arc<dyn Transport>,
    inbound: I,
    hub: HubHandle,
    store: Arc<dyn MessageStore>,
    shutdown: CancellationToken,
    state: SessionState,
    forwarded: u64,
    persist_failures: u64,
}

impl<I: Inbound> ConnectionSession<I> {
    pub fn new(
        id: ConnectionId,
        conversation_id: ConversationId,
        transport: Arc<dyn Transport>,
        inbound: I,
        hub: HubHandle,
        store: Arc<dyn MessageStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            conversation_id,
            transport,
            inbound,
            hub,
            store,
            shutdown,
            state: SessionState::Connecting,
            forwarded: 0,
            persist_failures: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        self.state = self.state.advance(next)?;
        Ok(())
    }

    /// Run until the transport closes, the hub stops or shutdown begins.
    ///
    /// Always unregisters and closes the transport before returning.
    #[instrument(skip_all, fields(connection_id = %self.id, conversation_id = %self.conversation_id))]
    pub async fn run(mut self) -> Result<SessionSummary, SessionError> {
        let started = Instant::now();

        let reason = match self
            .hub
            .register(self.id.clone(), self.conversation_id, self.transport.clone())
        {
            Ok(()) => {
                self.transition(SessionState::Registered)?;
                info!("client connected");
                self.transition(SessionState::Active)?;
                self.relay().await
            }
            Err(HubError::Stopped) => CloseReason::HubStopped,
        };

        self.transition(SessionState::Closing)?;
        let _ = self.hub.unregister(self.id.clone());
        self.transport.close();
        self.transition(SessionState::Closed)?;

        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.label()).increment(1);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(reason = reason.label(), forwarded = self.forwarded, "client disconnected");

        Ok(SessionSummary {
            reason,
            forwarded: self.forwarded,
            persist_failures: self.persist_failures,
        })
    }

    async fn relay(&mut self) -> CloseReason {
        loop {
            let received = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return CloseReason::Shutdown,
                received = self.inbound.receive() => received,
            };

            match received {
                Ok(payload) => {
                    if let Err(HubError::Stopped) = self.forward(payload).await {
                        return CloseReason::HubStopped;
                    }
                }
                Err(TransportError::Closed) => return CloseReason::Closed,
                Err(e) => return CloseReason::Transport(e),
            }
        }
    }

    /// Persist (best-effort) then broadcast the payload as received. The hub
    /// routes by the payload's own conversation id.
    async fn forward(&mut self, payload: MessagePayload) -> Result<(), HubError> {
        match self.store.persist(payload.user_id, &payload.text).await {
            Ok(message_id) => {
                counter!(STORE_PERSISTED_TOTAL).increment(1);
                debug!(message_id, user_id = %payload.user_id, "message persisted");
            }
            Err(e) => {
                self.persist_failures += 1;
                counter!(STORE_ERRORS_TOTAL).increment(1);
                warn!(error = %e, user_id = %payload.user_id, "failed to persist message, broadcasting anyway");
            }
        }

        self.hub.broadcast(payload)?;
        self.forwarded += 1;
        Ok(())
    }
}
