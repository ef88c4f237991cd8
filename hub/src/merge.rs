//! Reassembly and validation of a completed upload.
//!
//! A merge runs as the body of a `MERGE` task and may be delivered more than
//! once. Only the run that moves the upload out of `MERGING` has any lasting
//! effect: publishing is guarded by a compare-and-swap on the upload state,
//! and a redelivery after success returns the version already published.

use crate::chunk_store::ChunkStore;
use crate::db::models::UploadState;
use crate::db::{now_ms, Database};
use crate::errors::{HubError, Result};
use crate::registry::{ModelRegistry, ModelVersion, NewModelVersion};
use crate::upload::manager::{load_session, normalize_extension};
use crate::upload::UploadTask;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Bytes inspected by the structural check
const HEADER_LEN: usize = 16;

/// Result of a merge, stored as the `MERGE` record's result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeOutcome {
    pub upload_task_id: String,
    pub version_id: i64,
    pub model_name: String,
    pub version: String,
    pub file_size: u64,
    pub checksum: String,
    /// The upload had already been merged by an earlier delivery
    pub already_completed: bool,
}

impl MergeOutcome {
    fn new(upload_task_id: &str, version: &ModelVersion, already_completed: bool) -> Self {
        Self {
            upload_task_id: upload_task_id.to_string(),
            version_id: version.version_id,
            model_name: version.model_name.clone(),
            version: version.version.clone(),
            file_size: version.file_size,
            checksum: version.checksum.clone(),
            already_completed,
        }
    }
}

#[derive(Clone)]
pub struct MergeValidator {
    db: Database,
    chunks: ChunkStore,
    registry: ModelRegistry,
    allowed_extensions: Vec<String>,
}

impl MergeValidator {
    pub fn new(
        db: Database,
        chunks: ChunkStore,
        registry: ModelRegistry,
        allowed_extensions: Vec<String>,
    ) -> Self {
        Self {
            db,
            chunks,
            registry,
            allowed_extensions,
        }
    }

    /// Merge, validate and publish an upload that is `MERGING`.
    ///
    /// Transient errors and cancellation leave the upload `MERGING` with its
    /// chunks in place: the task is retried, redelivered to another worker, or
    /// settled as failed by the caller. Any other error marks the upload
    /// `FAILED` and deletes its chunks.
    #[instrument(skip(self, cancel))]
    pub fn run(&self, upload_task_id: &str, cancel: &AtomicBool) -> Result<MergeOutcome> {
        let session = self.load(upload_task_id)?;

        if let Some(outcome) = self.completed_outcome(&session)? {
            info!("Upload already merged");
            return Ok(outcome);
        }
        if session.state != UploadState::Merging {
            return Err(HubError::Conflict(format!(
                "Upload {} is {}, not MERGING",
                upload_task_id, session.state
            )));
        }

        match self.assemble_and_publish(&session, cancel) {
            Ok(version) => {
                self.discard_chunks(upload_task_id);
                info!(
                    version_id = version.version_id,
                    size = version.file_size,
                    checksum = %version.checksum,
                    "Upload merged"
                );
                Ok(MergeOutcome::new(upload_task_id, &version, false))
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Merge hit a transient error, upload stays MERGING");
                Err(e)
            }
            Err(e @ HubError::Cancelled(_)) => {
                // The lease may already belong to a redelivery; leave the upload to it
                info!("Merge cancelled, upload stays MERGING");
                Err(e)
            }
            Err(e) => {
                // A concurrent delivery may have finished the merge meanwhile
                let current = self.load(upload_task_id)?;
                if let Some(outcome) = self.completed_outcome(&current)? {
                    debug!(error = %e, "Merge lost the race to a concurrent delivery");
                    return Ok(outcome);
                }
                self.fail(upload_task_id, &e.to_string())?;
                Err(e)
            }
        }
    }

    /// Move an upload stuck in `MERGING` to `FAILED` and drop its chunks.
    ///
    /// Returns whether this call made the transition.
    pub fn fail(&self, upload_task_id: &str, reason: &str) -> Result<bool> {
        let conn = self.db.get_conn()?;
        let updated = conn.execute(
            "UPDATE upload_sessions SET state = 'FAILED', error = ?, last_activity_at = ? \
             WHERE task_id = ? AND state = 'MERGING'",
            params![reason, now_ms(), upload_task_id],
        )?;
        if updated == 0 {
            return Ok(false);
        }

        warn!(task_id = %upload_task_id, reason = %reason, "Upload failed");
        self.discard_chunks(upload_task_id);
        Ok(true)
    }

    /// Fail uploads whose merge record already failed permanently.
    ///
    /// Covers merges abandoned by lease expiry or exhausted transient retries.
    pub fn fail_abandoned_merges(&self) -> Result<Vec<String>> {
        let stuck: Vec<(String, Option<String>)> = {
            let conn = self.db.get_conn()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT s.task_id, r.error
                FROM upload_sessions s
                JOIN task_records r ON r.record_id = s.merge_record_id
                WHERE s.state = 'MERGING' AND r.state = 'FAILED'
                "#,
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut failed = Vec::new();
        for (task_id, error) in stuck {
            let reason = format!(
                "merge task failed: {}",
                error.as_deref().unwrap_or("unknown error")
            );
            if self.fail(&task_id, &reason)? {
                failed.push(task_id);
            }
        }
        Ok(failed)
    }

    fn load(&self, upload_task_id: &str) -> Result<UploadTask> {
        let conn = self.db.get_conn()?;
        load_session(&conn, upload_task_id)?
            .ok_or_else(|| HubError::NotFound(format!("Upload {} not found", upload_task_id)))
    }

    fn completed_outcome(&self, session: &UploadTask) -> Result<Option<MergeOutcome>> {
        match (session.state, session.model_version_id) {
            (UploadState::Completed, Some(version_id)) => {
                let version = self.registry.get(version_id)?;
                Ok(Some(MergeOutcome::new(&session.task_id, &version, true)))
            }
            _ => Ok(None),
        }
    }

    fn assemble_and_publish(&self, session: &UploadTask, cancel: &AtomicBool) -> Result<ModelVersion> {
        let extension = normalize_extension(&session.original_extension);
        if !self
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        {
            return Err(HubError::IntegrityFailure(format!(
                "extension '{}' is not allowed",
                extension
            )));
        }

        self.verify_chunks(session)?;

        let staging = self.registry.staging_dir_for(&session.metadata.model_name)?;
        let temp_path = staging.join(format!(
            ".{}.{}.partial",
            session.metadata.model_name,
            uuid::Uuid::new_v4().simple()
        ));

        let published = self
            .concatenate(session, &temp_path, cancel)
            .and_then(|(size, checksum)| {
                if size != session.total_size {
                    return Err(HubError::IntegrityFailure(format!(
                        "merged size {} does not match declared size {}",
                        size, session.total_size
                    )));
                }
                check_structure(&extension, &read_header(&temp_path)?)?;
                check_cancelled(cancel)?;

                let new = NewModelVersion {
                    model_name: session.metadata.model_name.clone(),
                    version: session.metadata.version.clone(),
                    model_type: session.metadata.model_type,
                    task_types: session.metadata.effective_task_types(),
                    format: extension.clone(),
                    file_size: size,
                    checksum,
                    parameters: session.metadata.parameters.clone(),
                    description: session.metadata.description.clone(),
                    source_upload_id: Some(session.task_id.clone()),
                    derived_from: None,
                };

                let task_id = session.task_id.clone();
                self.registry.publish(&temp_path, new, move |tx, version_id| {
                    let updated = tx.execute(
                        "UPDATE upload_sessions \
                         SET state = 'COMPLETED', model_version_id = ?, error = NULL, last_activity_at = ? \
                         WHERE task_id = ? AND state = 'MERGING'",
                        params![version_id, now_ms(), &task_id],
                    )?;
                    if updated == 0 {
                        return Err(HubError::Conflict(format!(
                            "Upload {} is no longer MERGING",
                            task_id
                        )));
                    }
                    Ok(())
                })
            });

        if published.is_err() {
            remove_if_exists(&temp_path);
        }
        published
    }

    /// Every index is recorded and its staged file has the expected length
    fn verify_chunks(&self, session: &UploadTask) -> Result<()> {
        if !session.is_complete() {
            return Err(HubError::Incomplete {
                received: session.received(),
                total: session.total_chunks,
            });
        }

        for index in 0..session.total_chunks {
            if !session.received_chunks.contains(&index) {
                return Err(HubError::Incomplete {
                    received: session.received(),
                    total: session.total_chunks,
                });
            }
            let expected = session.expected_chunk_len(index);
            match self.chunks.chunk_len(&session.task_id, index)? {
                Some(len) if len == expected => {}
                Some(len) => {
                    return Err(HubError::IntegrityFailure(format!(
                        "staged chunk {} has {} bytes, expected {}",
                        index, len, expected
                    )))
                }
                None => {
                    return Err(HubError::IntegrityFailure(format!(
                        "staged chunk {} is missing",
                        index
                    )))
                }
            }
        }
        Ok(())
    }

    /// Concatenate chunks in index order, hashing as they are written
    fn concatenate(
        &self,
        session: &UploadTask,
        temp_path: &Path,
        cancel: &AtomicBool,
    ) -> Result<(u64, String)> {
        let mut out = BufWriter::new(File::create(temp_path)?);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;

        for index in 0..session.total_chunks {
            check_cancelled(cancel)?;

            let mut chunk = self.chunks.open_chunk(&session.task_id, index)?;
            loop {
                let n = chunk.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
                out.write_all(&buffer[..n])?;
                written += n as u64;
            }
        }

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok((written, hex::encode(hasher.finalize())))
    }

    fn discard_chunks(&self, upload_task_id: &str) {
        if let Err(e) = self.chunks.remove_task(upload_task_id) {
            warn!(task_id = %upload_task_id, error = %e, "Failed to delete staged chunks");
        }
    }
}

/// Cheap format sniffing on the first bytes of an artifact
pub fn check_structure(format: &str, header: &[u8]) -> Result<()> {
    match format {
        // ModelProto starts with field 1 (ir_version), varint wire type
        "onnx" => {
            if header.first() != Some(&0x08) {
                return Err(HubError::IntegrityFailure(
                    "not an ONNX model (missing ir_version header)".into(),
                ));
            }
        }
        // TorchScript/torch.save zip archive, or a legacy pickle
        "pt" | "pth" => {
            if !header.starts_with(b"PK\x03\x04") && header.first() != Some(&0x80) {
                return Err(HubError::IntegrityFailure(
                    "not a PyTorch checkpoint (expected zip or pickle header)".into(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Size and lowercase hex SHA-256 of a file
pub fn checksum_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

pub fn read_header(path: &Path) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    File::open(path)?
        .take(HEADER_LEN as u64)
        .read_to_end(&mut header)?;
    Ok(header)
}

fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        return Err(HubError::Cancelled("merge cancelled".into()));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial artifact"),
    }
}
