mod checkpoints;
mod state;

use checkpoints::count_turn_checkpoints;

pub use state::{RecoveryReason, RecoveryState, RevertRecord};

use chrono::{DateTime, Utc};
use rewind_core::{
    Conversation, ConversationStatus, Turn, TurnCompletion, TurnIdState, TurnIndex, TurnRole,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const REWIND_SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("turn id {turn_id} already used in conversation {conversation_id}")]
    TurnIdConflict {
        conversation_id: String,
        turn_id: String,
    },
    #[error("{count} checkpoint rows still reference turn {turn_id}")]
    StaleTurnReferences { turn_id: String, count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub status: ConversationStatus,
    pub external_session_id: Option<String>,
    pub turn_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Rows touched by a turn id rewrite.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassignReport {
    pub checkpoints: usize,
    pub turns: usize,
    pub recovery_states: usize,
}

pub struct RewindStore {
    conn: Connection,
}

impl RewindStore {
    /// Opens a file database in WAL mode. Several stores may hold the same file at once;
    /// each conversation worker keeps its own.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > REWIND_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: REWIND_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_rewind_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    fn immediate_transaction(&self) -> Result<rusqlite::Transaction<'_>, StorageError> {
        Ok(rusqlite::Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    pub fn insert_conversation(&self, conversation: &Conversation) -> Result<bool, StorageError> {
        let now = Utc::now().to_rfc3339();
        let changes = self.conn.execute(
            "
            INSERT OR IGNORE INTO conversations (
                conversation_id,
                external_session_id,
                cwd,
                status,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                conversation.id,
                conversation.external_session_id,
                conversation.cwd.to_string_lossy(),
                conversation.status.as_str(),
                conversation.created_at.to_rfc3339(),
                now,
            ],
        )?;
        Ok(changes > 0)
    }

    /// Loads a conversation together with its persisted turns.
    pub fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT external_session_id, cwd, status, created_at
                FROM conversations
                WHERE conversation_id = ?1
                ",
                [conversation_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((external_session_id, cwd, status, created_at)) = row else {
            return Ok(None);
        };

        let status = status
            .parse::<ConversationStatus>()
            .map_err(StorageError::InvalidValue)?;
        let mut conversation =
            Conversation::new(conversation_id, PathBuf::from(cwd), parse_timestamp(created_at)?)
                .with_turns(self.turns(conversation_id)?);
        conversation.status = status;
        conversation.external_session_id = external_session_id;
        Ok(Some(conversation))
    }

    pub fn conversations(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT c.conversation_id, c.status, c.external_session_id, c.updated_at,
                   (SELECT COUNT(*) FROM turns t WHERE t.conversation_id = c.conversation_id)
            FROM conversations c
            ORDER BY c.updated_at DESC, c.conversation_id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (conversation_id, status, external_session_id, updated_at, turn_count) = row?;
            summaries.push(ConversationSummary {
                conversation_id,
                status: status.parse().map_err(StorageError::InvalidValue)?,
                external_session_id,
                turn_count: turn_count.max(0) as usize,
                updated_at: parse_timestamp(updated_at)?,
            });
        }
        Ok(summaries)
    }

    pub fn set_external_session_id(
        &self,
        conversation_id: &str,
        session_id: &str,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE conversations
            SET external_session_id = ?2, updated_at = ?3
            WHERE conversation_id = ?1 AND external_session_id IS NULL
            ",
            params![conversation_id, session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    pub fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE conversations
            SET status = ?2, updated_at = ?3
            WHERE conversation_id = ?1
            ",
            params![conversation_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    pub fn append_turn(&self, conversation_id: &str, turn: &Turn) -> Result<(), StorageError> {
        insert_turn(&self.conn, conversation_id, turn)?;
        self.touch_conversation(conversation_id)
    }

    pub fn update_turn(&self, conversation_id: &str, turn: &Turn) -> Result<bool, StorageError> {
        let blocks_json = to_json(&turn.blocks)?;
        let warnings_json = to_json(&turn.warnings)?;
        let stats_json = turn.stats.as_ref().map(to_json).transpose()?;
        let changes = self.conn.execute(
            "
            UPDATE turns
            SET turn_id = ?3,
                id_state = ?4,
                blocks_json = ?5,
                completion = ?6,
                warnings_json = ?7,
                stats_json = ?8
            WHERE conversation_id = ?1 AND turn_index = ?2
            ",
            params![
                conversation_id,
                turn.index.0 as i64,
                turn.id,
                turn.id_state.as_str(),
                blocks_json,
                turn.completion.as_str(),
                warnings_json,
                stats_json,
            ],
        )?;
        self.touch_conversation(conversation_id)?;
        Ok(changes > 0)
    }

    pub fn turns(&self, conversation_id: &str) -> Result<Vec<Turn>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT turn_index, turn_id, id_state, role, blocks_json, created_at,
                   completion, warnings_json, stats_json
            FROM turns
            WHERE conversation_id = ?1
            ORDER BY turn_index ASC
            ",
        )?;
        let rows = stmt.query_map([conversation_id], turn_from_row)?;
        let mut turns = Vec::new();
        for row in rows {
            turns.push(row?);
        }
        Ok(turns)
    }

    /// Deletes every turn after `turn_id` and returns the removed turns in order.
    /// `None` when the conversation has no such turn.
    pub fn truncate_turns_after(
        &self,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<Option<Vec<Turn>>, StorageError> {
        let tx = self.immediate_transaction()?;
        let boundary: Option<i64> = tx
            .query_row(
                "SELECT turn_index FROM turns WHERE conversation_id = ?1 AND turn_id = ?2",
                params![conversation_id, turn_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(boundary) = boundary else {
            return Ok(None);
        };

        let removed = {
            let mut stmt = tx.prepare(
                "
                SELECT turn_index, turn_id, id_state, role, blocks_json, created_at,
                       completion, warnings_json, stats_json
                FROM turns
                WHERE conversation_id = ?1 AND turn_index > ?2
                ORDER BY turn_index ASC
                ",
            )?;
            let rows = stmt.query_map(params![conversation_id, boundary], turn_from_row)?;
            let mut removed = Vec::new();
            for row in rows {
                removed.push(row?);
            }
            removed
        };
        tx.execute(
            "DELETE FROM turns WHERE conversation_id = ?1 AND turn_index > ?2",
            params![conversation_id, boundary],
        )?;
        tx.commit()?;
        self.touch_conversation(conversation_id)?;
        Ok(Some(removed))
    }

    pub fn restore_turns(&self, conversation_id: &str, turns: &[Turn]) -> Result<(), StorageError> {
        let tx = self.immediate_transaction()?;
        for turn in turns {
            insert_turn(&tx, conversation_id, turn)?;
        }
        tx.commit()?;
        self.touch_conversation(conversation_id)
    }

    /// Repoints every row naming `placeholder_id` to `final_id` in one transaction:
    /// checkpoints, the turn row and any recovery state. Readers on other connections
    /// see either all of it or none of it. The transaction rolls back if any checkpoint
    /// still names the placeholder afterwards.
    pub fn reassign_turn_id(
        &self,
        conversation_id: &str,
        placeholder_id: &str,
        final_id: &str,
    ) -> Result<ReassignReport, StorageError> {
        let tx = self.immediate_transaction()?;
        let taken: Option<i64> = tx
            .query_row(
                "SELECT turn_index FROM turns WHERE conversation_id = ?1 AND turn_id = ?2",
                params![conversation_id, final_id],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(StorageError::TurnIdConflict {
                conversation_id: conversation_id.to_string(),
                turn_id: final_id.to_string(),
            });
        }

        let checkpoints = tx.execute(
            "UPDATE checkpoints SET turn_id = ?3 WHERE conversation_id = ?1 AND turn_id = ?2",
            params![conversation_id, placeholder_id, final_id],
        )?;
        let turns = tx.execute(
            "
            UPDATE turns SET turn_id = ?3, id_state = ?4
            WHERE conversation_id = ?1 AND turn_id = ?2
            ",
            params![
                conversation_id,
                placeholder_id,
                final_id,
                TurnIdState::Final.as_str()
            ],
        )?;
        let recovery_states = tx.execute(
            "UPDATE recovery_state SET turn_id = ?3 WHERE conversation_id = ?1 AND turn_id = ?2",
            params![conversation_id, placeholder_id, final_id],
        )?;
        let stale = count_turn_checkpoints(&tx, conversation_id, placeholder_id)?;
        if stale > 0 {
            return Err(StorageError::StaleTurnReferences {
                turn_id: placeholder_id.to_string(),
                count: stale,
            });
        }
        tx.commit()?;

        Ok(ReassignReport {
            checkpoints,
            turns,
            recovery_states,
        })
    }

    fn touch_conversation(&self, conversation_id: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE conversation_id = ?1",
            params![conversation_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn insert_turn(conn: &Connection, conversation_id: &str, turn: &Turn) -> Result<(), StorageError> {
    let blocks_json = to_json(&turn.blocks)?;
    let warnings_json = to_json(&turn.warnings)?;
    let stats_json = turn.stats.as_ref().map(to_json).transpose()?;
    conn.execute(
        "
        INSERT OR REPLACE INTO turns (
            conversation_id,
            turn_index,
            turn_id,
            id_state,
            role,
            blocks_json,
            created_at,
            completion,
            warnings_json,
            stats_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ",
        params![
            conversation_id,
            turn.index.0 as i64,
            turn.id,
            turn.id_state.as_str(),
            turn.role.as_str(),
            blocks_json,
            turn.created_at.to_rfc3339(),
            turn.completion.as_str(),
            warnings_json,
            stats_json,
        ],
    )?;
    Ok(())
}

fn turn_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    let index: i64 = row.get(0)?;
    let id_state: String = row.get(2)?;
    let role: String = row.get(3)?;
    let blocks_json: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let completion: String = row.get(6)?;
    let warnings_json: String = row.get(7)?;
    let stats_json: Option<String> = row.get(8)?;

    Ok(Turn {
        index: TurnIndex(index.max(0) as u64),
        id: row.get(1)?,
        id_state: id_state
            .parse::<TurnIdState>()
            .map_err(|err| conversion_error(2, err))?,
        role: role
            .parse::<TurnRole>()
            .map_err(|err| conversion_error(3, err))?,
        blocks: serde_json::from_str(&blocks_json)
            .map_err(|err| conversion_error(4, err.to_string()))?,
        created_at: parse_timestamp(created_at).map_err(|err| conversion_error(5, err.to_string()))?,
        completion: completion
            .parse::<TurnCompletion>()
            .map_err(|err| conversion_error(6, err))?,
        warnings: serde_json::from_str(&warnings_json)
            .map_err(|err| conversion_error(7, err.to_string()))?,
        stats: stats_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|err| conversion_error(8, err.to_string()))?,
    })
}

pub(crate) fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub(crate) fn to_json<T: serde::Serialize + ?Sized>(
    value: &T,
) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))
}

pub(crate) fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use rewind_core::ContentBlock;
    use tempfile::NamedTempFile;

    #[test]
    fn migrate_sets_schema_version() {
        let store = RewindStore::open_in_memory().expect("open db");
        assert_eq!(store.schema_version().expect("version"), REWIND_SCHEMA_VERSION);
        store.migrate().expect("migrate is idempotent");
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("open raw");
            conn.execute("PRAGMA user_version = 9", []).expect("bump version");
        }
        let err = match RewindStore::open(file.path()) {
            Ok(_) => panic!("newer schema must be rejected"),
            Err(err) => err,
        };
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion { found: 9, .. }
        ));
    }

    #[test]
    fn conversation_round_trips_with_turns() {
        let store = store_with_conversation("conv-1");
        store
            .append_turn("conv-1", &sample_turn(0, "u1", TurnRole::User))
            .expect("append user");
        store
            .append_turn("conv-1", &sample_turn(1, "a1", TurnRole::Assistant))
            .expect("append assistant");
        assert!(store
            .set_external_session_id("conv-1", "sess-1")
            .expect("set session"));
        assert!(!store
            .set_external_session_id("conv-1", "sess-2")
            .expect("second set ignored"));

        let conversation = store
            .conversation("conv-1")
            .expect("load")
            .expect("conversation exists");
        assert_eq!(conversation.external_session_id.as_deref(), Some("sess-1"));
        assert_eq!(conversation.turns().len(), 2);
        assert_eq!(conversation.turns()[1], sample_turn(1, "a1", TurnRole::Assistant));
        assert!(store.conversation("missing").expect("load").is_none());
    }

    #[test]
    fn update_turn_rewrites_content_by_index() {
        let store = store_with_conversation("conv-1");
        let mut turn = sample_turn(0, "a1", TurnRole::Assistant);
        store.append_turn("conv-1", &turn).expect("append");

        turn.completion = TurnCompletion::Interrupted;
        turn.blocks.push(ContentBlock::Text {
            text: "more".to_string(),
        });
        assert!(store.update_turn("conv-1", &turn).expect("update"));
        assert_eq!(store.turns("conv-1").expect("turns"), vec![turn]);
    }

    #[test]
    fn truncate_and_restore_turns() {
        let store = store_with_conversation("conv-1");
        for (index, id) in ["u1", "a1", "u2", "a2"].iter().enumerate() {
            store
                .append_turn("conv-1", &sample_turn(index as u64, id, TurnRole::User))
                .expect("append");
        }

        let removed = store
            .truncate_turns_after("conv-1", "a1")
            .expect("truncate")
            .expect("boundary exists");
        assert_eq!(
            removed.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["u2", "a2"]
        );
        assert_eq!(store.turns("conv-1").expect("turns").len(), 2);
        assert!(store
            .truncate_turns_after("conv-1", "nope")
            .expect("truncate")
            .is_none());

        store.restore_turns("conv-1", &removed).expect("restore");
        assert_eq!(store.turns("conv-1").expect("turns").len(), 4);
    }

    #[test]
    fn conversation_summaries_count_turns() {
        let store = store_with_conversation("conv-1");
        store
            .insert_conversation(&Conversation::new("conv-2", "/tmp/other", ts()))
            .expect("insert second");
        store
            .append_turn("conv-1", &sample_turn(0, "u1", TurnRole::User))
            .expect("append");
        assert!(store
            .set_conversation_status("conv-2", ConversationStatus::Archived)
            .expect("archive"));

        let summaries = store.conversations().expect("list");
        assert_eq!(summaries.len(), 2);
        let first = summaries
            .iter()
            .find(|summary| summary.conversation_id == "conv-1")
            .expect("conv-1 listed");
        assert_eq!(first.turn_count, 1);
        let second = summaries
            .iter()
            .find(|summary| summary.conversation_id == "conv-2")
            .expect("conv-2 listed");
        assert_eq!(second.status, ConversationStatus::Archived);
    }
}
