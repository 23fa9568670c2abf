//! Axum HTTP + WebSocket edge.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_core::{ConnectionId, ConversationId};
use parley_store::MessageStore;

use crate::config::ServerConfig;
use crate::handshake::{parse_conversation_id, HandshakeError, WsQuery};
use crate::health;
use crate::hub::{spawn_hub, HubHandle, HubReport};
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_REJECTED_TOTAL};
use crate::session::ConnectionSession;
use crate::shutdown::{Drain, ShutdownCoordinator};
use crate::ws::{WsOptions, WsTransport};

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub hub: HubHandle,
    pub store: Arc<dyn MessageStore>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
    pub metrics: Option<PrometheusHandle>,
    live_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        hub: HubHandle,
        store: Arc<dyn MessageStore>,
        shutdown: Arc<ShutdownCoordinator>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            store,
            shutdown,
            start_time: Instant::now(),
            metrics,
            live_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Upgraded connections whose session has not finished yet.
    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Acquire)
    }

    /// Reserve a connection slot, or refuse if the limit is reached.
    fn reserve_slot(&self) -> Result<ConnectionSlot, HandshakeError> {
        let max = self.config.max_connections;
        let previous = self.live_connections.fetch_add(1, Ordering::AcqRel);
        let slot = ConnectionSlot(self.live_connections.clone());
        if previous >= max {
            return Err(HandshakeError::AtCapacity(max));
        }
        Ok(slot)
    }
}

/// Live-connection reservation, released on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, spawn the hub and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn MessageStore>,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let hub_cancel = CancellationToken::new();
    let (hub, hub_task) = spawn_hub(hub_cancel.clone());

    let shutdown_timeout = config.shutdown_timeout;
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;

    let state = AppState::new(config, hub.clone(), store, shutdown.clone(), metrics);
    let router = build_router(state);

    info!(%addr, "parley server started");

    let stop = shutdown.token();
    let server_task = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.cancelled().await });
        if let Err(e) = serve.await {
            warn!(error = %e, "http server exited with error");
        }
    });

    Ok(ServerHandle {
        addr,
        hub,
        shutdown,
        shutdown_timeout,
        hub_cancel,
        hub_task,
        server_task,
    })
}

/// Handle returned by [`start`]; keeps background tasks alive.
pub struct ServerHandle {
    addr: SocketAddr,
    hub: HubHandle,
    shutdown: Arc<ShutdownCoordinator>,
    shutdown_timeout: std::time::Duration,
    hub_cancel: CancellationToken,
    hub_task: JoinHandle<HubReport>,
    server_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Stop accepting, let sessions unregister, then drain the hub.
    ///
    /// Returns the hub's final report, or `None` if it did not stop within
    /// the shutdown timeout.
    pub async fn shutdown(self) -> Option<HubReport> {
        info!("shutting down");
        if let Drain::TimedOut { remaining } =
            self.shutdown.graceful_shutdown(self.shutdown_timeout).await
        {
            warn!(remaining, "stopping hub with sessions still attached");
        }

        self.hub_cancel.cancel();
        let report = match tokio::time::timeout(self.shutdown_timeout, self.hub_task).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!(error = %e, "hub task failed");
                None
            }
            Err(_) => {
                warn!("hub did not stop within {:?}", self.shutdown_timeout);
                None
            }
        };

        if tokio::time::timeout(self.shutdown_timeout, self.server_task)
            .await
            .is_err()
        {
            warn!("http listener did not stop within {:?}", self.shutdown_timeout);
        }
        info!("shutdown complete");
        report
    }
}

/// Validate the request before anything is created for it.
fn admit(
    state: &AppState,
    query: Result<Query<WsQuery>, QueryRejection>,
) -> Result<(ConversationId, ConnectionSlot), HandshakeError> {
    if state.shutdown.is_shutting_down() {
        return Err(HandshakeError::ShuttingDown);
    }
    let raw = query.ok().and_then(|Query(q)| q.conversation_id);
    let conversation_id = parse_conversation_id(raw.as_deref())?;
    let slot = state.reserve_slot()?;
    Ok((conversation_id, slot))
}

/// GET /ws?conversation_id=<int>
async fn ws_handler(
    State(state): State<AppState>,
    query: Result<Query<WsQuery>, QueryRejection>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (conversation_id, slot) = match admit(&state, query) {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!(error = %e, "websocket handshake rejected");
            counter!(WS_REJECTED_TOTAL, "reason" => e.reason()).increment(1);
            return e.into_response();
        }
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let max_message_size = state.config.max_message_size;
    let shutdown = state.shutdown.clone();
    upgrade
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            shutdown.track(run_connection(socket, state, conversation_id, slot))
        })
}

async fn run_connection(
    socket: WebSocket,
    state: AppState,
    conversation_id: ConversationId,
    _slot: ConnectionSlot,
) {
    let id = ConnectionId::new();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);

    let (sink, stream) = socket.split();
    let (transport, inbound) =
        WsTransport::spawn(id.clone(), sink, stream, WsOptions::from(&*state.config));

    let session = ConnectionSession::new(
        id,
        conversation_id,
        transport,
        inbound,
        state.hub.clone(),
        state.store.clone(),
        state.shutdown.token(),
    );
    if let Err(e) = session.run().await {
        warn!(error = %e, "session ended abnormally");
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.hub.snapshot().await.ok();
    let resp = health::health_check(state.start_time, snapshot.as_ref());
    let status = if resp.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
