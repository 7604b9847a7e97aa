use crate::{conversion_error, parse_timestamp, RewindStore, StorageError};
use rewind_core::{AfterContent, Checkpoint, NewCheckpoint, ToolKind};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;

const CHECKPOINT_COLUMNS: &str = "
    checkpoint_id, conversation_id, turn_id, tool_use_id, file_path, sequence,
    created_at, before_content, after_state, after_content, tool_kind, abandoned
";

impl RewindStore {
    /// Inserts a checkpoint and assigns the next sequence number for its conversation
    /// in the same transaction.
    pub fn insert_checkpoint(&self, checkpoint: &NewCheckpoint) -> Result<Checkpoint, StorageError> {
        let tx = self.immediate_transaction()?;
        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM checkpoints WHERE conversation_id = ?1",
            [&checkpoint.conversation_id],
            |row| row.get(0),
        )?;
        let (after_state, after_content) = after_columns(&checkpoint.after_content);
        tx.execute(
            "
            INSERT INTO checkpoints (
                checkpoint_id,
                conversation_id,
                turn_id,
                tool_use_id,
                file_path,
                sequence,
                created_at,
                before_content,
                after_state,
                after_content,
                tool_kind,
                abandoned
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)
            ",
            params![
                checkpoint.checkpoint_id,
                checkpoint.conversation_id,
                checkpoint.turn_id,
                checkpoint.tool_use_id,
                checkpoint.file_path,
                sequence,
                checkpoint.created_at.to_rfc3339(),
                checkpoint.before_content,
                after_state,
                after_content,
                checkpoint.tool_kind.as_str(),
            ],
        )?;
        tx.commit()?;

        Ok(Checkpoint {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            conversation_id: checkpoint.conversation_id.clone(),
            turn_id: checkpoint.turn_id.clone(),
            tool_use_id: checkpoint.tool_use_id.clone(),
            file_path: checkpoint.file_path.clone(),
            sequence: sequence as u64,
            created_at: checkpoint.created_at,
            before_content: checkpoint.before_content.clone(),
            after_content: checkpoint.after_content.clone(),
            tool_kind: checkpoint.tool_kind,
            abandoned: false,
        })
    }

    /// Fills in after-content in place. Only a pending row is updated, so a
    /// checkpoint resolved once is never overwritten.
    pub fn resolve_checkpoint(&self, checkpoint_id: &str, content: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE checkpoints
            SET after_state = 'resolved', after_content = ?2
            WHERE checkpoint_id = ?1 AND after_state = 'pending'
            ",
            params![checkpoint_id, content],
        )?;
        Ok(changes > 0)
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, StorageError> {
        let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE checkpoint_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [checkpoint_id], checkpoint_from_row)
            .optional()?)
    }

    /// All checkpoints of a conversation in sequence order, abandoned ones included.
    pub fn checkpoints(&self, conversation_id: &str) -> Result<Vec<Checkpoint>, StorageError> {
        self.query_checkpoints(
            &format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                 WHERE conversation_id = ?1
                 ORDER BY sequence ASC"
            ),
            params![conversation_id],
        )
    }

    pub fn pending_checkpoints(
        &self,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<Vec<Checkpoint>, StorageError> {
        self.query_checkpoints(
            &format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                 WHERE conversation_id = ?1 AND turn_id = ?2 AND after_state = 'pending'
                 ORDER BY sequence ASC"
            ),
            params![conversation_id, turn_id],
        )
    }

    /// Every live checkpoint at or after the first one recorded for `turn_id`,
    /// newest first. Empty when the turn recorded nothing.
    pub fn list_for_revert(
        &self,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<Vec<Checkpoint>, StorageError> {
        self.query_checkpoints(
            &format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                 WHERE conversation_id = ?1
                   AND abandoned = 0
                   AND sequence >= (
                       SELECT MIN(sequence) FROM checkpoints
                       WHERE conversation_id = ?1 AND turn_id = ?2 AND abandoned = 0
                   )
                 ORDER BY sequence DESC"
            ),
            params![conversation_id, turn_id],
        )
    }

    pub fn count_checkpoints_for_turn(
        &self,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<usize, StorageError> {
        count_turn_checkpoints(&self.conn, conversation_id, turn_id)
    }

    pub fn turn_has_checkpoints(
        &self,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "
                SELECT 1 FROM checkpoints
                WHERE conversation_id = ?1 AND turn_id = ?2 AND abandoned = 0
                LIMIT 1
                ",
                params![conversation_id, turn_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Turn ids that own at least one live checkpoint.
    pub fn turns_with_checkpoints(
        &self,
        conversation_id: &str,
    ) -> Result<BTreeSet<String>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT DISTINCT turn_id FROM checkpoints
            WHERE conversation_id = ?1 AND abandoned = 0
            ",
        )?;
        let rows = stmt.query_map([conversation_id], |row| row.get::<_, String>(0))?;
        let mut turn_ids = BTreeSet::new();
        for row in rows {
            turn_ids.insert(row?);
        }
        Ok(turn_ids)
    }

    pub fn abandon_checkpoints(
        &self,
        conversation_id: &str,
        checkpoint_ids: &[String],
    ) -> Result<usize, StorageError> {
        let tx = self.immediate_transaction()?;
        let mut changed = 0;
        for checkpoint_id in checkpoint_ids {
            changed += tx.execute(
                "
                UPDATE checkpoints SET abandoned = 1
                WHERE conversation_id = ?1 AND checkpoint_id = ?2
                ",
                params![conversation_id, checkpoint_id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Explicit cleanup. Normal flow never deletes checkpoints.
    pub fn delete_checkpoints(&self, conversation_id: &str) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM checkpoints WHERE conversation_id = ?1",
            [conversation_id],
        )?)
    }

    pub fn delete_abandoned_checkpoints(&self, conversation_id: &str) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM checkpoints WHERE conversation_id = ?1 AND abandoned = 1",
            [conversation_id],
        )?)
    }

    fn query_checkpoints(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Checkpoint>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, checkpoint_from_row)?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row?);
        }
        Ok(checkpoints)
    }
}

pub(crate) fn count_turn_checkpoints(
    conn: &Connection,
    conversation_id: &str,
    turn_id: &str,
) -> Result<usize, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM checkpoints WHERE conversation_id = ?1 AND turn_id = ?2",
        params![conversation_id, turn_id],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as usize)
}

fn after_columns(after: &AfterContent) -> (&'static str, Option<&str>) {
    match after {
        AfterContent::Pending => ("pending", None),
        AfterContent::Resolved(content) => ("resolved", Some(content.as_str())),
    }
}

fn checkpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    let sequence: i64 = row.get(5)?;
    let created_at: String = row.get(6)?;
    let after_state: String = row.get(8)?;
    let after_content: Option<String> = row.get(9)?;
    let tool_kind: String = row.get(10)?;
    let abandoned: i64 = row.get(11)?;

    let after_content = match (after_state.as_str(), after_content) {
        ("pending", _) => AfterContent::Pending,
        ("resolved", Some(content)) => AfterContent::Resolved(content),
        (state, _) => {
            return Err(conversion_error(
                8,
                format!("invalid after state {state:?} for resolved content"),
            ))
        }
    };

    Ok(Checkpoint {
        checkpoint_id: row.get(0)?,
        conversation_id: row.get(1)?,
        turn_id: row.get(2)?,
        tool_use_id: row.get(3)?,
        file_path: row.get(4)?,
        sequence: sequence.max(0) as u64,
        created_at: parse_timestamp(created_at).map_err(|err| conversion_error(6, err.to_string()))?,
        before_content: row.get(7)?,
        after_content,
        tool_kind: tool_kind
            .parse::<ToolKind>()
            .map_err(|err| conversion_error(10, err))?,
        abandoned: abandoned != 0,
    })
}
