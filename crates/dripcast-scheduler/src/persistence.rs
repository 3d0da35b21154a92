//! SQLite-backed task store for recipients, delivery tasks, and engagement events.
//!
//! Every mutation is one keyed statement (or one short transaction), never a
//! load-mutate-rewrite of a whole collection. The enrollment/opt-out path and
//! the worker path share one database and interleave safely on that basis.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use dripcast_core::error::DripError;
use dripcast_core::types::ChatId;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;

use crate::tasks::{
    EngagementEvent, NewTask, Recipient, RecipientProfile, Task, TaskKind, TaskPayload, TaskStatus,
};

/// Persistence failure. Callers treat it as transient: nothing was applied.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("payload encoding: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("store lock poisoned: {0}")]
    Lock(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for DripError {
    fn from(e: StoreError) -> Self {
        DripError::Store(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

/// Aggregate snapshot for the read-only reporting surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub recipients: u64,
    pub opted_out: u64,
    pub tasks: TaskCounts,
    pub engagement: BTreeMap<String, u64>,
    pub total_engagements: u64,
}

const TASK_COLUMNS: &str = "id, chat_id, kind, due_at, status, retry_count, payload";

/// Durable keyed storage shared by the worker and the command path.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupt(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        // WAL lets the CLI read stats while the worker writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }

    fn migrate(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS recipients (
                chat_id INTEGER PRIMARY KEY,
                user_id INTEGER,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                start_payload TEXT,              -- deep-link tag from first contact
                enrolled_at INTEGER NOT NULL,    -- epoch seconds, latest enrollment
                opted_out INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                chat_id INTEGER NOT NULL REFERENCES recipients(chat_id),
                kind TEXT NOT NULL,              -- 'immediate', 'delayed_N', 'cleanup', 'final'
                due_at INTEGER NOT NULL,         -- epoch seconds, immutable
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL,           -- JSON: content, options, skip_rule
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, due_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_chat ON tasks(chat_id, status);

            -- Append-only
            CREATE TABLE IF NOT EXISTS engagement_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_engagement_chat ON engagement_events(chat_id, kind);
            ",
        )?;
        Ok(())
    }

    // ─── Recipients ──────────────────────────────────────────

    /// Insert or refresh a recipient row keyed by chat id.
    pub fn upsert_recipient(&self, profile: &RecipientProfile, enrolled_at: i64) -> StoreResult<()> {
        let conn = self.lock()?;
        upsert_recipient_on(&conn, profile, enrolled_at)?;
        Ok(())
    }

    pub fn get_recipient(&self, chat_id: ChatId) -> StoreResult<Option<Recipient>> {
        let conn = self.lock()?;
        get_recipient_on(&conn, chat_id)
    }

    /// Every recipient chat id, in enrollment order.
    pub fn list_recipient_ids(&self) -> StoreResult<Vec<ChatId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT chat_id FROM recipients ORDER BY enrolled_at, chat_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Enroll a recipient and persist its task set in one transaction.
    ///
    /// Returns `None` (and writes nothing) when the recipient is already
    /// enrolled and has not opted out. An opted-out recipient is re-enrolled:
    /// the row is refreshed and a brand-new task set is inserted.
    pub fn enroll(
        &self,
        profile: &RecipientProfile,
        enrolled_at: i64,
        tasks: &[NewTask],
    ) -> StoreResult<Option<Vec<String>>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if let Some(existing) = get_recipient_on(&tx, profile.chat_id)?
            && !existing.opted_out
        {
            return Ok(None);
        }

        upsert_recipient_on(&tx, profile, enrolled_at)?;
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(insert_task_on(
                &tx,
                profile.chat_id,
                task.kind,
                task.due_at,
                &task.payload,
                enrolled_at,
            )?);
        }
        tx.commit()?;
        Ok(Some(ids))
    }

    /// Cancel every pending task and flag the recipient as opted out.
    pub fn opt_out(&self, chat_id: ChatId) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let cancelled = cancel_pending_on(&tx, chat_id)?;
        tx.execute(
            "UPDATE recipients SET opted_out = 1 WHERE chat_id = ?1",
            params![chat_id],
        )?;
        tx.commit()?;
        Ok(cancelled)
    }

    // ─── Tasks ───────────────────────────────────────────────

    /// Insert one pending task. Not idempotent: call it once per step.
    pub fn enqueue(
        &self,
        chat_id: ChatId,
        kind: TaskKind,
        due_at: i64,
        payload: &TaskPayload,
    ) -> StoreResult<String> {
        let conn = self.lock()?;
        insert_task_on(&conn, chat_id, kind, due_at, payload, chrono::Utc::now().timestamp())
    }

    /// Pending tasks with `due_at <= now`, oldest first, ties by insertion order.
    pub fn list_due(&self, now: i64) -> StoreResult<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'pending' AND due_at <= ?1
             ORDER BY due_at ASC, rowid ASC"
        ))?;
        let rows = stmt
            .query_map(params![now], TaskRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    pub fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                TaskRow::read,
            )
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Live status of one task.
    pub fn task_status(&self, id: &str) -> StoreResult<Option<TaskStatus>> {
        let conn = self.lock()?;
        let status: Option<String> = conn
            .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        status
            .map(|s| parse_status(&s))
            .transpose()
    }

    /// All tasks of one recipient, in due order.
    pub fn tasks_for(&self, chat_id: ChatId) -> StoreResult<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE chat_id = ?1 ORDER BY due_at ASC, rowid ASC"
        ))?;
        let rows = stmt
            .query_map(params![chat_id], TaskRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Write a task's next status in one keyed statement.
    ///
    /// Only a `pending` row is touched, so terminal states stay absorbing and
    /// a task cancelled mid-cycle is not overwritten. Returns whether the row
    /// was updated.
    pub fn set_status(&self, id: &str, status: TaskStatus, increment_retry: bool) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, retry_count = retry_count + ?2
             WHERE id = ?3 AND status = 'pending'",
            params![status.as_str(), increment_retry as i64, id],
        )?;
        Ok(changed == 1)
    }

    /// Cancel every pending task of a recipient; sent/failed rows are untouched.
    pub fn cancel_all_pending(&self, chat_id: ChatId) -> StoreResult<usize> {
        let conn = self.lock()?;
        cancel_pending_on(&conn, chat_id)
    }

    // ─── Engagement ──────────────────────────────────────────

    pub fn record_engagement(&self, chat_id: ChatId, kind: &str) -> StoreResult<()> {
        self.record_engagement_at(chat_id, kind, chrono::Utc::now().timestamp())
    }

    pub fn record_engagement_at(&self, chat_id: ChatId, kind: &str, at: i64) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO engagement_events (chat_id, kind, recorded_at) VALUES (?1, ?2, ?3)",
            params![chat_id, kind, at],
        )?;
        Ok(())
    }

    pub fn has_engagement(&self, chat_id: ChatId, kind: &str) -> StoreResult<bool> {
        self.has_engagement_before(chat_id, kind, i64::MAX)
    }

    /// Whether `kind` was recorded for `chat_id` at or before `at`.
    pub fn has_engagement_before(&self, chat_id: ChatId, kind: &str, at: i64) -> StoreResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM engagement_events
                 WHERE chat_id = ?1 AND kind = ?2 AND recorded_at <= ?3 LIMIT 1",
                params![chat_id, kind, at],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn engagements_for(&self, chat_id: ChatId) -> StoreResult<Vec<EngagementEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT chat_id, kind, recorded_at FROM engagement_events
             WHERE chat_id = ?1 ORDER BY recorded_at DESC, id DESC",
        )?;
        let events = stmt
            .query_map(params![chat_id], |row| {
                Ok(EngagementEvent {
                    chat_id: row.get(0)?,
                    kind: row.get(1)?,
                    recorded_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ─── Aggregates ──────────────────────────────────────────

    pub fn recipient_count(&self) -> StoreResult<u64> {
        recipient_count_on(&*self.lock()?)
    }

    pub fn task_counts(&self) -> StoreResult<TaskCounts> {
        task_counts_on(&*self.lock()?)
    }

    pub fn engagement_counts(&self) -> StoreResult<BTreeMap<String, u64>> {
        engagement_counts_on(&*self.lock()?)
    }

    /// Everything the reporting surface shows, read in one transaction so
    /// the counts describe a single moment.
    pub fn stats(&self) -> StoreResult<Stats> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let engagement = engagement_counts_on(&tx)?;
        let opted_out: i64 =
            tx.query_row("SELECT COUNT(*) FROM recipients WHERE opted_out = 1", [], |r| r.get(0))?;
        let stats = Stats {
            recipients: recipient_count_on(&tx)?,
            opted_out: opted_out as u64,
            tasks: task_counts_on(&tx)?,
            total_engagements: engagement.values().sum(),
            engagement,
        };
        tx.commit()?;
        Ok(stats)
    }
}

fn recipient_count_on(conn: &Connection) -> StoreResult<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM recipients", [], |r| r.get(0))?;
    Ok(n as u64)
}

fn task_counts_on(conn: &Connection) -> StoreResult<TaskCounts> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = TaskCounts::default();
    for (status, n) in rows {
        let n = n as u64;
        match TaskStatus::parse(&status) {
            Some(TaskStatus::Pending) => counts.pending += n,
            Some(TaskStatus::Sent) => counts.sent += n,
            Some(TaskStatus::Failed) => counts.failed += n,
            Some(TaskStatus::Cancelled) => counts.cancelled += n,
            None => tracing::warn!("⚠️ Unknown task status '{status}' ({n} rows)"),
        }
        counts.total += n;
    }
    Ok(counts)
}

fn engagement_counts_on(conn: &Connection) -> StoreResult<BTreeMap<String, u64>> {
    let mut stmt =
        conn.prepare("SELECT kind, COUNT(*) FROM engagement_events GROUP BY kind ORDER BY kind")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

fn upsert_recipient_on(conn: &Connection, profile: &RecipientProfile, enrolled_at: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO recipients
         (chat_id, user_id, username, first_name, last_name, start_payload, enrolled_at, opted_out)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
         ON CONFLICT(chat_id) DO UPDATE SET
           user_id = excluded.user_id,
           username = excluded.username,
           first_name = excluded.first_name,
           last_name = excluded.last_name,
           start_payload = excluded.start_payload,
           enrolled_at = excluded.enrolled_at,
           opted_out = 0",
        params![
            profile.chat_id,
            profile.user_id,
            profile.username,
            profile.first_name,
            profile.last_name,
            profile.start_payload,
            enrolled_at,
        ],
    )?;
    Ok(())
}

fn get_recipient_on(conn: &Connection, chat_id: ChatId) -> StoreResult<Option<Recipient>> {
    let recipient = conn
        .query_row(
            "SELECT chat_id, user_id, username, first_name, last_name, start_payload, enrolled_at, opted_out
             FROM recipients WHERE chat_id = ?1",
            params![chat_id],
            |row| {
                Ok(Recipient {
                    profile: RecipientProfile {
                        chat_id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get(2)?,
                        first_name: row.get(3)?,
                        last_name: row.get(4)?,
                        start_payload: row.get(5)?,
                    },
                    enrolled_at: row.get(6)?,
                    opted_out: row.get::<_, i64>(7)? != 0,
                })
            },
        )
        .optional()?;
    Ok(recipient)
}

fn insert_task_on(
    conn: &Connection,
    chat_id: ChatId,
    kind: TaskKind,
    due_at: i64,
    payload: &TaskPayload,
    created_at: i64,
) -> StoreResult<String> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let payload = serde_json::to_string(payload)?;
    conn.execute(
        "INSERT INTO tasks (id, chat_id, kind, due_at, status, retry_count, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
        params![id, chat_id, kind.as_str(), due_at, payload, created_at],
    )?;
    Ok(id)
}

fn cancel_pending_on(conn: &Connection, chat_id: ChatId) -> StoreResult<usize> {
    let n = conn.execute(
        "UPDATE tasks SET status = 'cancelled' WHERE chat_id = ?1 AND status = 'pending'",
        params![chat_id],
    )?;
    Ok(n)
}

fn parse_status(s: &str) -> StoreResult<TaskStatus> {
    TaskStatus::parse(s).ok_or_else(|| StoreError::Corrupt(format!("unknown task status '{s}'")))
}

/// Raw column values; decoded outside the rusqlite closure.
struct TaskRow {
    id: String,
    chat_id: i64,
    kind: String,
    due_at: i64,
    status: String,
    retry_count: u32,
    payload: String,
}

impl TaskRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            kind: row.get(2)?,
            due_at: row.get(3)?,
            status: row.get(4)?,
            retry_count: row.get(5)?,
            payload: row.get(6)?,
        })
    }

    fn into_task(self) -> StoreResult<Task> {
        let kind = TaskKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("task {}: unknown kind '{}'", self.id, self.kind)))?;
        Ok(Task {
            status: parse_status(&self.status)?,
            payload: serde_json::from_str(&self.payload)?,
            id: self.id,
            chat_id: self.chat_id,
            kind,
            due_at: self.due_at,
            retry_count: self.retry_count,
        })
    }
}
