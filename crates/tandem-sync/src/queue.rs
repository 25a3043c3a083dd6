//! Durable offline mutation queue.
//!
//! Append-only from the UI's point of view: an action is written when the
//! user mutates while the remote write is unconfirmed, bumped on retry, and
//! deleted on success, terminal conflict, or retry exhaustion. The store is
//! SQLite, keyed by action id with secondary indexes on `created_at` (replay
//! order), `kind`, and `resource_id` (cascade lookups). It survives process
//! restarts; the application is the only writer.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tandem_core::{ChecklistItemPatch, NewChecklistItem, NewMessage};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Default retry budget for a queued action.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Discriminant for a queued mutation; also a persisted, indexed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    SendMessage,
    DeleteMessage,
    CreateChecklistItem,
    UpdateChecklistItem,
    DeleteChecklistItem,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SendMessage => "send_message",
            ActionKind::DeleteMessage => "delete_message",
            ActionKind::CreateChecklistItem => "create_checklist_item",
            ActionKind::UpdateChecklistItem => "update_checklist_item",
            ActionKind::DeleteChecklistItem => "delete_checklist_item",
        }
    }
}

/// The mutation itself, typed per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    SendMessage { message: NewMessage },
    DeleteMessage { message_id: String },
    CreateChecklistItem { item: NewChecklistItem },
    UpdateChecklistItem { item_id: String, patch: ChecklistItemPatch },
    DeleteChecklistItem { item_id: String },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::SendMessage { .. } => ActionKind::SendMessage,
            ActionPayload::DeleteMessage { .. } => ActionKind::DeleteMessage,
            ActionPayload::CreateChecklistItem { .. } => ActionKind::CreateChecklistItem,
            ActionPayload::UpdateChecklistItem { .. } => ActionKind::UpdateChecklistItem,
            ActionPayload::DeleteChecklistItem { .. } => ActionKind::DeleteChecklistItem,
        }
    }
}

/// A queued mutation awaiting confirmation by the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineAction {
    pub id: String,
    /// Parent event id the action targets; cascade key.
    pub resource_id: String,
    pub payload: ActionPayload,
    /// Replay ordering key.
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl OfflineAction {
    /// New action stamped with the current time and a fresh id.
    pub fn new(resource_id: impl Into<String>, payload: ActionPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.into(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

/// SQLite-backed store of [`OfflineAction`]s.
pub struct OfflineQueue {
    conn: Mutex<Connection>,
}

impl OfflineQueue {
    /// Open (creating if needed) the queue database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory queue for tests; contents die with the process.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS offline_actions (
                id          TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                payload     TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_offline_actions_created_at
                ON offline_actions(created_at);
            CREATE INDEX IF NOT EXISTS idx_offline_actions_kind
                ON offline_actions(kind);
            CREATE INDEX IF NOT EXISTS idx_offline_actions_resource
                ON offline_actions(resource_id);",
        )?;
        Ok(())
    }

    /// Persist a new action.
    pub fn enqueue(&self, action: &OfflineAction) -> Result<()> {
        let payload = serde_json::to_string(&action.payload)?;
        self.conn.lock().execute(
            "INSERT INTO offline_actions
                (id, kind, resource_id, payload, created_at, retry_count, max_retries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                action.id,
                action.kind().as_str(),
                action.resource_id,
                payload,
                action.created_at.timestamp_millis(),
                action.retry_count,
                action.max_retries,
            ],
        )?;
        debug!(
            id = %action.id,
            kind = action.kind().as_str(),
            resource = %action.resource_id,
            "queued offline action"
        );
        Ok(())
    }

    /// All queued actions, oldest first. Equal timestamps fall back to
    /// insertion order so replay order stays total.
    pub fn list(&self) -> Result<Vec<OfflineAction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, resource_id, payload, created_at, retry_count, max_retries
             FROM offline_actions
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, u32>(5)?,
            ))
        })?;

        let mut actions = Vec::new();
        for row in rows {
            let (id, resource_id, payload, created_ms, retry_count, max_retries) = row?;
            let payload: ActionPayload = serde_json::from_str(&payload)?;
            let created_at = DateTime::from_timestamp_millis(created_ms).ok_or_else(|| {
                SyncError::Internal(format!("corrupt created_at for action {id}"))
            })?;
            actions.push(OfflineAction {
                id,
                resource_id,
                payload,
                created_at,
                retry_count,
                max_retries,
            });
        }
        Ok(actions)
    }

    /// Remove one action; returns whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM offline_actions WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Increment an action's retry count, returning the new value.
    pub fn bump(&self, id: &str) -> Result<u32> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "UPDATE offline_actions SET retry_count = retry_count + 1
             WHERE id = ?1
             RETURNING retry_count",
            params![id],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(count)
    }

    /// Cascade: drop every action targeting `resource_id`. Returns how many
    /// were removed.
    pub fn remove_for_resource(&self, resource_id: &str) -> Result<usize> {
        let n = self.conn.lock().execute(
            "DELETE FROM offline_actions WHERE resource_id = ?1",
            params![resource_id],
        )?;
        if n > 0 {
            debug!(resource = %resource_id, removed = n, "cascade-discarded queued actions");
        }
        Ok(n)
    }

    /// Drop everything.
    pub fn clear(&self) -> Result<()> {
        self.conn.lock().execute("DELETE FROM offline_actions", [])?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
