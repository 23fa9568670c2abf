//! Validation of `/ws` upgrade requests.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use parley_core::ConversationId;

/// Query string accepted on `/ws`.
///
/// The id is kept as a raw string so a malformed value reaches
/// [`parse_conversation_id`] instead of failing inside the extractor.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub conversation_id: Option<String>,
}

/// Why an upgrade request was refused.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("conversation_id is missing")]
    MissingConversation,
    #[error("conversation_id {0:?} is not an integer")]
    MalformedConversation(String),
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("connection limit of {0} reached")]
    AtCapacity(usize),
}

impl HandshakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingConversation | Self::MalformedConversation(_) => StatusCode::BAD_REQUEST,
            Self::ShuttingDown | Self::AtCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Label used on the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingConversation | Self::MalformedConversation(_) => "invalid_conversation",
            Self::ShuttingDown => "shutting_down",
            Self::AtCapacity(_) => "at_capacity",
        }
    }

    fn client_message(&self) -> &'static str {
        match self {
            Self::MissingConversation | Self::MalformedConversation(_) => {
                "Invalid conversation id"
            }
            Self::ShuttingDown => "Server is shutting down",
            Self::AtCapacity(_) => "Too many connections",
        }
    }
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.client_message() });
        (self.status(), Json(body)).into_response()
    }
}

/// Parse the conversation the connection subscribes to.
pub fn parse_conversation_id(raw: Option<&str>) -> Result<ConversationId, HandshakeError> {
    let raw = raw.ok_or(HandshakeError::MissingConversation)?;
    raw.parse()
        .map_err(|_| HandshakeError::MalformedConversation(raw.to_string()))
}
