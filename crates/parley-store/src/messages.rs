use chrono::Utc;
use tracing::instrument;

use parley_core::UserId;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRow {
    pub id: i64,
    pub participant_id: UserId,
    pub text: String,
    pub created_at: String,
    pub updated_at: String,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        participant_id: UserId::new(row.get(1)?),
        text: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a message authored by `participant_id`.
    #[instrument(skip(self, text), fields(participant_id = %participant_id, len = text.len()))]
    pub fn create(&self, participant_id: UserId, text: &str) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages (participant_id, text, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![participant_id.get(), text, now],
            )?;

            Ok(MessageRow {
                id: conn.last_insert_rowid(),
                participant_id,
                text: text.to_string(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, id: i64) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, participant_id, text, created_at, updated_at FROM messages WHERE id = ?1",
                [id],
                map_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("message {id}")),
                other => other.into(),
            })
        })
    }

    /// Most recent messages by one participant, newest first.
    #[instrument(skip(self), fields(participant_id = %participant_id))]
    pub fn list_by_participant(
        &self,
        participant_id: UserId,
        limit: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, participant_id, text, created_at, updated_at FROM messages
                 WHERE participant_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![participant_id.get(), limit], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete a message. Deleting a missing id is `NotFound`.
    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("message {id}")));
            }
            Ok(())
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?))
    }
}
