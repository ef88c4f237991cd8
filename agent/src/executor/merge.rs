use super::handler::{HandlerError, TaskContext, TaskHandler};
use async_trait::async_trait;
use model_hub::queue::MergePayload;
use model_hub::MergeValidator;
use tracing::{error, warn};

/// Runs `MERGE` records through the [`MergeValidator`]
pub struct MergeHandler {
    validator: MergeValidator,
}

impl MergeHandler {
    pub fn new(validator: MergeValidator) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl TaskHandler for MergeHandler {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value, HandlerError> {
        let payload: MergePayload = ctx.payload()?;
        let validator = self.validator.clone();
        let cancel = ctx.cancel_flag();

        let outcome = tokio::task::spawn_blocking(move || {
            validator.run(&payload.upload_task_id, &cancel)
        })
        .await
        .map_err(|e| HandlerError::retryable(format!("Merge task join error: {}", e)))??;

        serde_json::to_value(&outcome)
            .map_err(|e| HandlerError::permanent(format!("Failed to encode merge outcome: {}", e)))
    }

    /// Transient errors leave the upload `MERGING`; once retries are spent it fails too
    async fn on_permanent_failure(&self, ctx: &TaskContext, err: &HandlerError) {
        let Ok(payload) = ctx.payload::<MergePayload>() else {
            return;
        };
        let validator = self.validator.clone();
        let reason = err.message.clone();
        let upload_id = payload.upload_task_id.clone();

        match tokio::task::spawn_blocking(move || validator.fail(&upload_id, &reason)).await {
            Ok(Ok(true)) => warn!(task_id = %payload.upload_task_id, "Upload failed after merge gave up"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => error!(task_id = %payload.upload_task_id, error = %e, "Failed to mark upload failed"),
            Err(e) => error!(error = %e, "Task join error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_hub::upload::{ArtifactMetadata, CreateSession};
    use model_hub::{HubConfig, HubState, ModelType, TaskKind, UploadState};
    use serde_json::json;
    use tempfile::TempDir;

    fn state() -> (HubState, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = HubConfig::with_data_dir(dir.path());
        config.upload.chunk_size = 4;
        (HubState::open(config).unwrap(), dir)
    }

    fn ready_upload(state: &HubState, bytes: &[u8]) -> String {
        let task_id = state
            .uploads
            .create_session(CreateSession {
                total_size: bytes.len() as u64,
                total_chunks: bytes.len().div_ceil(4) as u32,
                original_extension: "onnx".into(),
                metadata: ArtifactMetadata::new("stem", ModelType::Resnet),
            })
            .unwrap()
            .task_id;
        for (i, chunk) in bytes.chunks(4).enumerate() {
            state.uploads.submit_chunk(&task_id, i as u32, chunk).unwrap();
        }
        state.uploads.request_merge(&task_id).unwrap();
        task_id
    }

    #[tokio::test]
    async fn test_merge_handler_publishes() {
        let (state, _dir) = state();
        let task_id = ready_upload(&state, &[0x08, 0x07, 0x12, 0x04, 0x6f, 0x6e]);
        let handler = MergeHandler::new(state.merger.clone());

        let ctx = TaskContext::new("r1", TaskKind::Merge, json!({ "upload_task_id": task_id }));
        let result = handler.handle(&ctx).await.unwrap();
        assert_eq!(result["model_name"], "stem");
        assert_eq!(result["file_size"], 6);
        assert_eq!(
            state.uploads.get_status(&task_id).unwrap().state,
            UploadState::Completed
        );
    }

    #[tokio::test]
    async fn test_integrity_failure_is_permanent() {
        let (state, _dir) = state();
        let task_id = ready_upload(&state, b"not onnx");
        let handler = MergeHandler::new(state.merger.clone());

        let ctx = TaskContext::new("r1", TaskKind::Merge, json!({ "upload_task_id": task_id }));
        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(
            state.uploads.get_session(&task_id).unwrap().state,
            UploadState::Failed
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_upload_merging() {
        let (state, _dir) = state();
        let task_id = ready_upload(&state, &[0x08, 0x07, 0x12, 0x04, 0x6f, 0x6e]);
        let handler = MergeHandler::new(state.merger.clone());

        let ctx = TaskContext::new("r1", TaskKind::Merge, json!({ "upload_task_id": task_id }));
        ctx.cancel();
        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(
            state.uploads.get_session(&task_id).unwrap().state,
            UploadState::Merging
        );
        assert_eq!(state.chunks.stored_indices(&task_id).unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_giving_up_fails_upload() {
        let (state, _dir) = state();
        let task_id = ready_upload(&state, &[0x08, 1, 2, 3]);
        let handler = MergeHandler::new(state.merger.clone());

        let ctx = TaskContext::new("r1", TaskKind::Merge, json!({ "upload_task_id": task_id }));
        handler
            .on_permanent_failure(&ctx, &HandlerError::retryable("database is locked"))
            .await;

        let upload = state.uploads.get_session(&task_id).unwrap();
        assert_eq!(upload.state, UploadState::Failed);
        assert!(state.chunks.stored_indices(&task_id).unwrap().is_empty());
    }
}
