use super::session::{chunk_count, ArtifactMetadata, ChunkAck, CreateSession, SessionStatus, UploadTask};
use crate::chunk_store::ChunkStore;
use crate::config::UploadConfig;
use crate::db::models::{parse_column, TaskKind, UploadState};
use crate::db::{ms_to_datetime, now_ms, Database};
use crate::errors::{HubError, Result};
use crate::queue::{Dispatcher, MergePayload};
use crate::registry::ModelRegistry;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

const SESSION_COLUMNS: &str = "task_id, total_size, total_chunks, chunk_size, original_extension, \
     metadata, state, merge_record_id, model_version_id, error, created_at, last_activity_at";

/// Owns the lifecycle of chunked uploads up to the point a merge is queued
#[derive(Clone)]
pub struct UploadSessionManager {
    db: Database,
    chunks: ChunkStore,
    registry: ModelRegistry,
    dispatcher: Dispatcher,
    config: UploadConfig,
}

impl UploadSessionManager {
    pub fn new(
        db: Database,
        chunks: ChunkStore,
        registry: ModelRegistry,
        dispatcher: Dispatcher,
        config: UploadConfig,
    ) -> Self {
        Self {
            db,
            chunks,
            registry,
            dispatcher,
            config,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.config.chunk_size
    }

    /// Open a new upload session in `CREATED`
    #[instrument(skip(self, request), fields(model_name = %request.metadata.model_name))]
    pub fn create_session(&self, request: CreateSession) -> Result<UploadTask> {
        let CreateSession {
            total_size,
            total_chunks,
            original_extension,
            metadata,
        } = request;

        if total_size == 0 {
            return Err(HubError::InvalidArgument("total_size must be positive".into()));
        }
        if total_chunks == 0 {
            return Err(HubError::InvalidArgument("total_chunks must be positive".into()));
        }
        if total_size > self.config.max_artifact_size {
            return Err(HubError::QuotaExceeded {
                size: total_size,
                limit: self.config.max_artifact_size,
            });
        }

        let expected_chunks = chunk_count(total_size, self.config.chunk_size);
        if total_chunks as u64 != expected_chunks {
            return Err(HubError::InvalidArgument(format!(
                "total_chunks must be {} for {} bytes at chunk size {}",
                expected_chunks, total_size, self.config.chunk_size
            )));
        }

        let extension = normalize_extension(&original_extension);
        if !self.is_allowed_extension(&extension) {
            return Err(HubError::InvalidArgument(format!(
                "Extension '{}' not allowed (allowed: {})",
                original_extension,
                self.config.allowed_extensions.join(", ")
            )));
        }

        metadata.validate()?;
        if let Some(version) = &metadata.version {
            if self.registry.exists(&metadata.model_name, version)? {
                return Err(HubError::Conflict(format!(
                    "Model {} version {} already registered",
                    metadata.model_name, version
                )));
            }
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let metadata_json = serde_json::to_string(&metadata)?;

        let conn = self.db.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO upload_sessions (
                task_id, total_size, total_chunks, chunk_size, original_extension,
                metadata, state, created_at, last_activity_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                &task_id,
                total_size as i64,
                total_chunks,
                self.config.chunk_size as i64,
                &extension,
                &metadata_json,
                UploadState::Created.as_str(),
                now,
                now
            ],
        )?;

        info!(
            task_id = %task_id,
            total_size,
            total_chunks,
            extension = %extension,
            "Upload session created"
        );

        Ok(UploadTask {
            task_id,
            total_size,
            total_chunks,
            chunk_size: self.config.chunk_size,
            original_extension: extension,
            metadata,
            received_chunks: BTreeSet::new(),
            state: UploadState::Created,
            merge_record_id: None,
            model_version_id: None,
            error: None,
            created_at: ms_to_datetime(now),
            last_activity_at: ms_to_datetime(now),
        })
    }

    /// Store one chunk. Re-sending an index replaces the stored bytes.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub fn submit_chunk(&self, task_id: &str, index: u32, bytes: &[u8]) -> Result<ChunkAck> {
        let session = self.live_session(task_id)?;

        if !session.state.accepts_chunks() {
            return Err(HubError::Conflict(format!(
                "Upload {} is {} and no longer accepts chunks",
                task_id, session.state
            )));
        }
        if index >= session.total_chunks {
            return Err(HubError::OutOfRange {
                index,
                total: session.total_chunks,
            });
        }
        let expected = session.expected_chunk_len(index);
        if bytes.len() as u64 != expected {
            return Err(HubError::SizeMismatch {
                index,
                expected,
                actual: bytes.len() as u64,
            });
        }

        // Written outside the transaction, renamed into place inside it
        let staged = self.chunks.stage_chunk(task_id, index, bytes)?;

        let now = now_ms();
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let state: UploadState = tx
            .query_row(
                "SELECT state FROM upload_sessions WHERE task_id = ?",
                params![task_id],
                |row| parse_column(row, 0),
            )
            .optional()?
            .ok_or_else(|| not_found(task_id))?;
        if state == UploadState::Expired {
            return Err(not_found(task_id));
        }
        if !state.accepts_chunks() {
            return Err(HubError::Conflict(format!(
                "Upload {} is {} and no longer accepts chunks",
                task_id, state
            )));
        }

        staged.commit()?;
        tx.execute(
            r#"
            INSERT INTO upload_chunks (task_id, chunk_index, byte_length, received_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(task_id, chunk_index)
            DO UPDATE SET byte_length = excluded.byte_length, received_at = excluded.received_at
            "#,
            params![task_id, index, expected as i64, now],
        )?;

        let received: u32 = tx.query_row(
            "SELECT COUNT(*) FROM upload_chunks WHERE task_id = ?",
            params![task_id],
            |row| row.get(0),
        )?;
        let next = if received == session.total_chunks {
            UploadState::ReadyToMerge
        } else {
            UploadState::Uploading
        };

        tx.execute(
            "UPDATE upload_sessions SET state = ?, last_activity_at = ? WHERE task_id = ? AND state = ?",
            params![next.as_str(), now, task_id, state.as_str()],
        )?;
        tx.commit()?;

        debug!(task_id = %task_id, index, received, total = session.total_chunks, "Chunk accepted");
        if next == UploadState::ReadyToMerge && state != UploadState::ReadyToMerge {
            info!(task_id = %task_id, "All chunks received");
        }

        Ok(ChunkAck {
            task_id: task_id.to_string(),
            index,
            received,
            total: session.total_chunks,
            state: next,
        })
    }

    /// Move a complete upload to `MERGING` and queue exactly one merge.
    ///
    /// The state change and the enqueue commit together. Returns the merge
    /// record id.
    #[instrument(skip(self))]
    pub fn request_merge(&self, task_id: &str) -> Result<String> {
        let now = now_ms();
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let session = load_session(&tx, task_id)?.ok_or_else(|| not_found(task_id))?;
        match session.state {
            UploadState::Created | UploadState::Uploading => {
                return Err(HubError::Incomplete {
                    received: session.received(),
                    total: session.total_chunks,
                })
            }
            UploadState::Merging | UploadState::Completed | UploadState::Failed => {
                return Err(HubError::Conflict(format!(
                    "Upload {} is already {}",
                    task_id, session.state
                )))
            }
            UploadState::Expired => return Err(not_found(task_id)),
            UploadState::ReadyToMerge => {}
        }
        if !session.is_complete() {
            return Err(HubError::Incomplete {
                received: session.received(),
                total: session.total_chunks,
            });
        }

        let record_id = self.dispatcher.enqueue_with(
            &tx,
            TaskKind::Merge,
            &MergePayload {
                upload_task_id: task_id.to_string(),
            },
        )?;

        let moved = tx.execute(
            r#"
            UPDATE upload_sessions
            SET state = 'MERGING', merge_record_id = ?, last_activity_at = ?
            WHERE task_id = ? AND state = 'READY_TO_MERGE'
            "#,
            params![&record_id, now, task_id],
        )?;
        if moved == 0 {
            return Err(HubError::Conflict(format!(
                "Upload {} changed state during merge request",
                task_id
            )));
        }
        tx.commit()?;
        self.dispatcher.notify_enqueued();

        info!(task_id = %task_id, record_id = %record_id, "Merge requested");
        Ok(record_id)
    }

    pub fn get_status(&self, task_id: &str) -> Result<SessionStatus> {
        Ok(self.live_session(task_id)?.status())
    }

    /// Full session, including expired ones
    pub fn get_session(&self, task_id: &str) -> Result<UploadTask> {
        let conn = self.db.get_conn()?;
        load_session(&conn, task_id)?.ok_or_else(|| not_found(task_id))
    }

    /// Abort an upload before its merge starts. The task id becomes unknown.
    #[instrument(skip(self))]
    pub fn cancel_session(&self, task_id: &str) -> Result<()> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let state: UploadState = tx
            .query_row(
                "SELECT state FROM upload_sessions WHERE task_id = ?",
                params![task_id],
                |row| parse_column(row, 0),
            )
            .optional()?
            .ok_or_else(|| not_found(task_id))?;

        if state == UploadState::Expired {
            return Err(not_found(task_id));
        }
        if !state.accepts_chunks() {
            return Err(HubError::Conflict(format!(
                "Upload {} is {} and can no longer be cancelled",
                task_id, state
            )));
        }

        tx.execute(
            "DELETE FROM upload_sessions WHERE task_id = ? AND state = ?",
            params![task_id, state.as_str()],
        )?;
        tx.commit()?;

        self.chunks.remove_task(task_id)?;
        info!(task_id = %task_id, "Upload cancelled");
        Ok(())
    }

    /// Expire sessions idle for longer than the session TTL.
    ///
    /// Returns the expired task ids. Their staged chunks are deleted.
    pub fn expire_idle_sessions(&self) -> Result<Vec<String>> {
        self.expire_idle_sessions_at(now_ms())
    }

    pub fn expire_idle_sessions_at(&self, now: i64) -> Result<Vec<String>> {
        let cutoff = now - (self.config.session_ttl_secs as i64) * 1000;
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let idle: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT task_id, state FROM upload_sessions \
                 WHERE state IN ('CREATED', 'UPLOADING', 'READY_TO_MERGE') AND last_activity_at < ?",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut expired = Vec::with_capacity(idle.len());
        for (task_id, state) in idle {
            let updated = tx.execute(
                "UPDATE upload_sessions SET state = 'EXPIRED', error = 'expired after inactivity', \
                 last_activity_at = ? WHERE task_id = ? AND state = ?",
                params![now, &task_id, &state],
            )?;
            if updated == 1 {
                tx.execute("DELETE FROM upload_chunks WHERE task_id = ?", params![&task_id])?;
                expired.push(task_id);
            }
        }
        tx.commit()?;

        for task_id in &expired {
            if let Err(e) = self.chunks.remove_task(task_id) {
                warn!(task_id = %task_id, error = %e, "Failed to delete chunks of expired upload");
            }
            info!(task_id = %task_id, "Upload session expired");
        }
        Ok(expired)
    }

    /// Delete terminal sessions older than the retention window
    pub fn purge_retained(&self) -> Result<usize> {
        self.purge_retained_at(now_ms())
    }

    pub fn purge_retained_at(&self, now: i64) -> Result<usize> {
        let cutoff = now - (self.config.retention_secs as i64) * 1000;
        let conn = self.db.get_conn()?;

        let old: Vec<String> = {
            let mut stmt = conn.prepare(
                "DELETE FROM upload_sessions \
                 WHERE state IN ('COMPLETED', 'FAILED', 'EXPIRED') AND last_activity_at < ? \
                 RETURNING task_id",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        for task_id in &old {
            self.chunks.remove_task(task_id)?;
        }
        if !old.is_empty() {
            debug!(count = old.len(), "Purged retained upload sessions");
        }
        Ok(old.len())
    }

    /// Delete staging directories whose upload no longer needs them
    pub fn remove_orphaned_chunks(&self) -> Result<usize> {
        let conn = self.db.get_conn()?;
        let mut removed = 0;

        for task_id in self.chunks.staged_tasks()? {
            let state: Option<UploadState> = conn
                .query_row(
                    "SELECT state FROM upload_sessions WHERE task_id = ?",
                    params![&task_id],
                    |row| parse_column(row, 0),
                )
                .optional()?;

            let orphaned = match state {
                None => true,
                Some(state) => state.is_terminal(),
            };
            if orphaned && self.chunks.remove_task(&task_id)? {
                warn!(task_id = %task_id, "Removed orphaned staged chunks");
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn is_allowed_extension(&self, extension: &str) -> bool {
        self.config
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    }

    /// Session that exists and has not expired
    fn live_session(&self, task_id: &str) -> Result<UploadTask> {
        let session = self.get_session(task_id)?;
        if session.state == UploadState::Expired {
            return Err(not_found(task_id));
        }
        Ok(session)
    }
}

/// `".PT"` and `"pt"` both become `"pt"`
pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn not_found(task_id: &str) -> HubError {
    HubError::NotFound(format!("Upload {} not found", task_id))
}

/// Load a session together with its received chunk indices
pub(crate) fn load_session(conn: &Connection, task_id: &str) -> Result<Option<UploadTask>> {
    let session = conn
        .query_row(
            &format!("SELECT {} FROM upload_sessions WHERE task_id = ?", SESSION_COLUMNS),
            params![task_id],
            map_session,
        )
        .optional()?;

    let Some(mut session) = session else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT chunk_index FROM upload_chunks WHERE task_id = ? ORDER BY chunk_index",
    )?;
    let indices = stmt.query_map(params![task_id], |row| row.get::<_, u32>(0))?;
    session.received_chunks = indices.collect::<std::result::Result<_, _>>()?;

    Ok(Some(session))
}

fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadTask> {
    let total_size: i64 = row.get(1)?;
    let chunk_size: i64 = row.get(3)?;
    let metadata: String = row.get(5)?;
    let metadata: ArtifactMetadata = serde_json::from_str(&metadata).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(UploadTask {
        task_id: row.get(0)?,
        total_size: total_size as u64,
        total_chunks: row.get(2)?,
        chunk_size: chunk_size as u64,
        original_extension: row.get(4)?,
        metadata,
        received_chunks: BTreeSet::new(),
        state: parse_column(row, 6)?,
        merge_record_id: row.get(7)?,
        model_version_id: row.get(8)?,
        error: row.get(9)?,
        created_at: ms_to_datetime(row.get(10)?),
        last_activity_at: ms_to_datetime(row.get(11)?),
    })
}
