//! Chunked upload of a local artifact into the hub, then merge.

use crate::errors::{AgentError, Result};
use model_hub::upload::{chunk_count, ArtifactMetadata, CreateSession};
use model_hub::{HubError, HubState, TaskStatus};
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub metadata: ArtifactMetadata,
    /// Retries per chunk after transient failures
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl UploadOptions {
    pub fn new(metadata: ArtifactMetadata) -> Self {
        Self {
            metadata,
            max_retries: 3,
            retry_base: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UploadReceipt {
    pub task_id: String,
    pub record_id: String,
    pub total_size: u64,
    pub total_chunks: u32,
}

/// Upload `path` chunk by chunk and request the merge.
///
/// A permanent failure cancels the session so its chunks do not linger.
#[instrument(skip(state, options), fields(model_name = %options.metadata.model_name))]
pub async fn upload_file(state: &HubState, path: &Path, options: UploadOptions) -> Result<UploadReceipt> {
    let total_size = tokio::fs::metadata(path).await?.len();
    let chunk_size = state.uploads.chunk_size();
    let total_chunks = u32::try_from(chunk_count(total_size, chunk_size)).map_err(|_| {
        AgentError::Config(format!("{} needs too many chunks", path.display()))
    })?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| AgentError::Config(format!("{} has no file extension", path.display())))?
        .to_string();

    let uploads = state.uploads.clone();
    let request = CreateSession {
        total_size,
        total_chunks,
        original_extension: extension,
        metadata: options.metadata.clone(),
    };
    let task_id = tokio::task::spawn_blocking(move || uploads.create_session(request))
        .await??
        .task_id;
    info!(task_id = %task_id, total_size, total_chunks, "Upload session created");

    match send_chunks_and_merge(state, path, &task_id, total_size, chunk_size, total_chunks, &options).await {
        Ok(record_id) => Ok(UploadReceipt {
            task_id,
            record_id,
            total_size,
            total_chunks,
        }),
        Err(e) => {
            let uploads = state.uploads.clone();
            let id = task_id.clone();
            match tokio::task::spawn_blocking(move || uploads.cancel_session(&id)).await {
                Ok(Ok(())) => debug!(task_id = %task_id, "Abandoned upload cancelled"),
                Ok(Err(cancel_err)) => warn!(task_id = %task_id, error = %cancel_err, "Failed to cancel upload"),
                Err(join_err) => warn!(error = %join_err, "Task join error"),
            }
            Err(e)
        }
    }
}

async fn send_chunks_and_merge(
    state: &HubState,
    path: &Path,
    task_id: &str,
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
    options: &UploadOptions,
) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;

    for index in 0..total_chunks {
        let offset = index as u64 * chunk_size;
        let len = chunk_size.min(total_size - offset) as usize;
        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes).await?;

        let ack = with_retry(options, "chunk upload", || {
            let uploads = state.uploads.clone();
            let task_id = task_id.to_string();
            let bytes = bytes.clone();
            async move {
                tokio::task::spawn_blocking(move || uploads.submit_chunk(&task_id, index, &bytes))
                    .await?
            }
        })
        .await?;
        debug!(index, received = ack.received, total = ack.total, "Chunk uploaded");
    }

    let record_id = with_retry(options, "merge request", || {
        let uploads = state.uploads.clone();
        let task_id = task_id.to_string();
        async move { tokio::task::spawn_blocking(move || uploads.request_merge(&task_id)).await? }
    })
    .await?;

    info!(task_id = %task_id, record_id = %record_id, "Merge requested");
    Ok(record_id)
}

/// Retry transient hub errors with exponential backoff
async fn with_retry<T, F, Fut>(options: &UploadOptions, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, HubError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < options.max_retries => {
                attempt += 1;
                let delay = options.retry_base * 2u32.pow(attempt - 1);
                warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "{} failed, retrying", what);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Poll a task record until it is finished or `timeout` passes
pub async fn wait_for_record(
    state: &HubState,
    record_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<TaskStatus> {
    let started = Instant::now();
    loop {
        let status_tracker = state.status.clone();
        let id = record_id.to_string();
        let status = tokio::task::spawn_blocking(move || status_tracker.get(&id)).await??;
        if status.state.is_terminal() {
            return Ok(status);
        }
        if started.elapsed() >= timeout {
            return Err(HubError::Timeout(format!(
                "Task {} still {} after {}s",
                record_id,
                status.state,
                timeout.as_secs()
            ))
            .into());
        }
        tokio::time::sleep(poll_interval).await;
    }
}
