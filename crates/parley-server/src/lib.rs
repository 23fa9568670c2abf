//! # parley-server
//!
//! Real-time conversation fan-out over WebSockets.
//!
//! - `hub`: single-task registry mapping connections to conversations
//! - `session`: per-connection receive → persist → broadcast loop
//! - `ws`: WebSocket adapter with bounded outbound queue and heartbeat
//! - `server`: Axum edge (`/ws`, `/health`, `/metrics`) and graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod handshake;
pub mod health;
pub mod heartbeat;
pub mod hub;
pub mod metrics;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use config::ServerConfig;
pub use hub::{spawn_hub, HubError, HubHandle, HubReport, HubSnapshot};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{CloseReason, ConnectionSession, SessionError, SessionState};
