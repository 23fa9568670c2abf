//! `/health` endpoint body.

use serde::Serialize;
use tokio::time::Instant;

use crate::hub::HubSnapshot;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while the hub answers, `"unavailable"` otherwise.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered connections.
    pub connections: usize,
    /// Conversations with at least one subscriber.
    pub conversations: usize,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Build a health response. `None` means the hub did not answer.
pub fn health_check(start_time: Instant, snapshot: Option<&HubSnapshot>) -> HealthResponse {
    let uptime_secs = start_time.elapsed().as_secs();
    match snapshot {
        Some(snap) => HealthResponse {
            status: "ok",
            uptime_secs,
            connections: snap.connections,
            conversations: snap.conversations.len(),
        },
        None => HealthResponse {
            status: "unavailable",
            uptime_secs,
            connections: 0,
            conversations: 0,
        },
    }
}
