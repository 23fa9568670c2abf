//! Persistence contract used by connection sessions.

use async_trait::async_trait;
use tracing::debug;

use parley_core::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;

/// Durable sink for chat messages.
///
/// Callers treat failures as non-fatal; delivery never waits on a retry.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persist `text` authored by `participant_id`, returning the new row id.
    async fn persist(&self, participant_id: UserId, text: &str) -> Result<i64, StoreError>;
}

/// SQLite-backed store. Writes run on the blocking pool.
#[derive(Clone)]
pub struct SqliteMessageStore {
    repo: MessageRepo,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self {
            repo: MessageRepo::new(db),
        }
    }

    pub fn repo(&self) -> &MessageRepo {
        &self.repo
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn persist(&self, participant_id: UserId, text: &str) -> Result<i64, StoreError> {
        let repo = self.repo.clone();
        let text = text.to_owned();
        let row = tokio::task::spawn_blocking(move || repo.create(participant_id, &text)).await??;
        debug!(message_id = row.id, %participant_id, "message persisted");
        Ok(row.id)
    }
}
