//! Read-only view over task records and their transition history.

use crate::db::models::{parse_column, TaskKind, TaskState};
use crate::db::{ms_to_datetime, Database};
use crate::errors::Result;
use crate::queue::dispatcher::{load_record, map_task, TASK_COLUMNS};
use crate::queue::TaskRecord;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// What a client polling a task sees
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub record_id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<TaskRecord> for TaskStatus {
    fn from(record: TaskRecord) -> Self {
        let finished_ok = record.state == TaskState::Succeeded;
        Self {
            record_id: record.record_id,
            kind: record.kind,
            state: record.state,
            attempts: record.attempt_count,
            max_attempts: record.max_attempts,
            result: if finished_ok { record.result } else { None },
            error: if finished_ok { None } else { record.error },
            cancel_requested: record.cancel_requested,
            updated_at: record.updated_at,
        }
    }
}

/// One state change of a task record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTransition {
    pub record_id: String,
    /// `None` for the initial enqueue
    pub from_state: Option<TaskState>,
    pub to_state: TaskState,
    pub message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub state: Option<TaskState>,
    pub limit: Option<u32>,
}

#[derive(Clone)]
pub struct StatusTracker {
    db: Database,
}

impl StatusTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, record_id: &str) -> Result<TaskStatus> {
        let conn = self.db.get_conn()?;
        Ok(load_record(&conn, record_id)?.into())
    }

    pub fn record(&self, record_id: &str) -> Result<TaskRecord> {
        let conn = self.db.get_conn()?;
        load_record(&conn, record_id)
    }

    /// Transitions of a record, oldest first
    pub fn history(&self, record_id: &str) -> Result<Vec<TaskTransition>> {
        let conn = self.db.get_conn()?;
        // Surface NotFound for unknown records rather than an empty history
        load_record(&conn, record_id)?;

        let mut stmt = conn.prepare(
            "SELECT record_id, from_state, to_state, message, at FROM task_events \
             WHERE record_id = ? ORDER BY event_id",
        )?;
        let rows = stmt.query_map(params![record_id], |row| {
            let from: Option<String> = row.get(1)?;
            let from_state = from
                .map(|s| s.parse::<TaskState>())
                .transpose()
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?;
            Ok(TaskTransition {
                record_id: row.get(0)?,
                from_state,
                to_state: parse_column(row, 2)?,
                message: row.get(3)?,
                at: ms_to_datetime(row.get(4)?),
            })
        })?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Most recently updated records matching `filter`
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskStatus>> {
        let conn = self.db.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM task_records \
             WHERE (?1 IS NULL OR kind = ?1) AND (?2 IS NULL OR state = ?2) \
             ORDER BY updated_at DESC, rowid DESC LIMIT ?3",
            TASK_COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![
                filter.kind.map(|k| k.as_str()),
                filter.state.map(|s| s.as_str()),
                filter.limit.map(i64::from).unwrap_or(-1)
            ],
            map_task,
        )?;

        Ok(rows
            .map(|r| r.map(TaskStatus::from))
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Records that failed permanently, newest first
    pub fn failed(&self, limit: u32) -> Result<Vec<TaskStatus>> {
        self.list(&TaskFilter {
            state: Some(TaskState::Failed),
            limit: Some(limit),
            ..Default::default()
        })
    }
}
