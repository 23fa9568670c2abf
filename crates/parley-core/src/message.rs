use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, UserId};

/// A chat message as it travels over the wire.
///
/// The same shape is used for inbound client sends and outbound broadcast
/// delivery: `{"conversation_id": 7, "user_id": 1, "text": "hi"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub text: String,
}

impl MessagePayload {
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        user_id: impl Into<UserId>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            text: text.into(),
        }
    }

    /// Parse a wire frame.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
