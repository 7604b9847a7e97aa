use crate::{parse_timestamp, to_json, RewindStore, StorageError};
use chrono::{DateTime, Utc};
use rewind_core::{Turn, TurnIndex};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Persisted form of `Reverted(turn_id)`. Absence of a row means `Normal`.
#[derive(Debug, Clone, PartialEq)]
pub struct RevertRecord {
    pub conversation_id: String,
    pub turn_id: String,
    pub stashed_turns: Vec<Turn>,
    pub checkpoint_ids: Vec<String>,
    pub reverted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryReason {
    InFlight,
    NonZeroExit,
    Timeout,
    Cancelled,
    Shutdown,
}

impl RecoveryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryReason::InFlight => "in_flight",
            RecoveryReason::NonZeroExit => "non_zero_exit",
            RecoveryReason::Timeout => "timeout",
            RecoveryReason::Cancelled => "cancelled",
            RecoveryReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryReason {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "in_flight" => Ok(RecoveryReason::InFlight),
            "non_zero_exit" => Ok(RecoveryReason::NonZeroExit),
            "timeout" => Ok(RecoveryReason::Timeout),
            "cancelled" => Ok(RecoveryReason::Cancelled),
            "shutdown" => Ok(RecoveryReason::Shutdown),
            other => Err(format!("unknown recovery reason: {other}")),
        }
    }
}

/// Last-known-good point of an in-flight turn. A row left behind with reason
/// `in_flight` means the process running that turn died without cleaning up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryState {
    pub conversation_id: String,
    pub turn_id: String,
    pub turn_index: TurnIndex,
    pub resume_token: Option<String>,
    pub partial_turn: Option<Turn>,
    pub reason: RecoveryReason,
    pub updated_at: DateTime<Utc>,
}

impl RewindStore {
    pub fn save_revert_state(&self, record: &RevertRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO revert_state (
                conversation_id,
                turn_id,
                stash_json,
                checkpoint_ids_json,
                reverted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(conversation_id) DO UPDATE SET
                turn_id=excluded.turn_id,
                stash_json=excluded.stash_json,
                checkpoint_ids_json=excluded.checkpoint_ids_json,
                reverted_at=excluded.reverted_at
            ",
            params![
                record.conversation_id,
                record.turn_id,
                to_json(&record.stashed_turns)?,
                to_json(&record.checkpoint_ids)?,
                record.reverted_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn revert_state(&self, conversation_id: &str) -> Result<Option<RevertRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT turn_id, stash_json, checkpoint_ids_json, reverted_at
                FROM revert_state
                WHERE conversation_id = ?1
                ",
                [conversation_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((turn_id, stash_json, checkpoint_ids_json, reverted_at)) = row else {
            return Ok(None);
        };

        Ok(Some(RevertRecord {
            conversation_id: conversation_id.to_string(),
            turn_id,
            stashed_turns: serde_json::from_str(&stash_json)
                .map_err(|err| StorageError::Serialization(err.to_string()))?,
            checkpoint_ids: serde_json::from_str(&checkpoint_ids_json)
                .map_err(|err| StorageError::Serialization(err.to_string()))?,
            reverted_at: parse_timestamp(reverted_at)?,
        }))
    }

    pub fn clear_revert_state(&self, conversation_id: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "DELETE FROM revert_state WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        Ok(changes > 0)
    }

    pub fn upsert_recovery_state(&self, state: &RecoveryState) -> Result<(), StorageError> {
        let partial_turn_json = state.partial_turn.as_ref().map(to_json).transpose()?;
        self.conn.execute(
            "
            INSERT INTO recovery_state (
                conversation_id,
                turn_id,
                turn_index,
                resume_token,
                partial_turn_json,
                reason,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(conversation_id) DO UPDATE SET
                turn_id=excluded.turn_id,
                turn_index=excluded.turn_index,
                resume_token=excluded.resume_token,
                partial_turn_json=excluded.partial_turn_json,
                reason=excluded.reason,
                updated_at=excluded.updated_at
            ",
            params![
                state.conversation_id,
                state.turn_id,
                state.turn_index.0 as i64,
                state.resume_token,
                partial_turn_json,
                state.reason.as_str(),
                state.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recovery_state(
        &self,
        conversation_id: &str,
    ) -> Result<Option<RecoveryState>, StorageError> {
        let mut states = self.query_recovery_states(Some(conversation_id))?;
        Ok(states.pop())
    }

    pub fn recovery_states(&self) -> Result<Vec<RecoveryState>, StorageError> {
        self.query_recovery_states(None)
    }

    pub fn clear_recovery_state(&self, conversation_id: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "DELETE FROM recovery_state WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        Ok(changes > 0)
    }

    fn query_recovery_states(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<Vec<RecoveryState>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT conversation_id, turn_id, turn_index, resume_token, partial_turn_json,
                   reason, updated_at
            FROM recovery_state
            WHERE ?1 IS NULL OR conversation_id = ?1
            ORDER BY updated_at DESC, conversation_id ASC
            ",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut states = Vec::new();
        for row in rows {
            let (conversation_id, turn_id, turn_index, resume_token, partial, reason, updated_at) =
                row?;
            states.push(RecoveryState {
                conversation_id,
                turn_id,
                turn_index: TurnIndex(turn_index.max(0) as u64),
                resume_token,
                partial_turn: partial
                    .map(|json| serde_json::from_str(&json))
                    .transpose()
                    .map_err(|err| StorageError::Serialization(err.to_string()))?,
                reason: reason.parse().map_err(StorageError::InvalidValue)?,
                updated_at: parse_timestamp(updated_at)?,
            });
        }
        Ok(states)
    }
}
