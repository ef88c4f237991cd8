//! Request and response shapes for an HTTP front end.
//!
//! The functions here are the whole contract such a layer needs: deserialize
//! the request, call the matching function, serialize the response or
//! [`ErrorBody`] with [`HubError::http_status`].

use crate::db::models::{ModelType, TaskKind, TaskState, UploadState};
use crate::errors::{HubError, Result};
use crate::queue::{ConvertPayload, InferPayload};
use crate::registry::{ModelFilter, ModelVersion};
use crate::state::HubState;
use crate::upload::{ArtifactMetadata, CreateSession};
use serde::{Deserialize, Serialize};

/// `POST /upload/create`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUploadRequest {
    pub total_size: u64,
    pub total_chunks: u32,
    /// File extension of the artifact, with or without the dot
    pub original_extension: String,
    pub metadata: ArtifactMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUploadResponse {
    pub task_id: String,
    /// Size every chunk but the last must have
    pub chunk_size: u64,
}

/// `POST /upload/chunk`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkRequest {
    pub task_id: String,
    pub chunk_index: u32,
    pub chunk_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    pub accepted: bool,
    pub received: u32,
    pub total: u32,
    pub state: UploadState,
}

/// `POST /upload/merge`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResponse {
    pub record_id: String,
}

/// `GET /upload/{task_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    pub state: UploadState,
    pub progress: f64,
    pub received: u32,
    pub total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /tasks/{record_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub kind: TaskKind,
    pub state: TaskState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /tasks/infer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub record_id: String,
}

/// `GET /models` query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListModelsQuery {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_type: Option<ModelType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub models: Vec<ModelVersion>,
}

/// Body of every error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub success: bool,
    pub code: String,
    pub message: String,
}

impl From<&HubError> for ErrorBody {
    fn from(e: &HubError) -> Self {
        // Internal details stay in the logs
        let message = match e.http_status() {
            500 => {
                tracing::error!(error = %e, "Internal error");
                "Internal server error".to_string()
            }
            _ => e.to_string(),
        };
        Self {
            success: false,
            code: e.code().to_string(),
            message,
        }
    }
}

pub fn create_upload(state: &HubState, req: CreateUploadRequest) -> Result<CreateUploadResponse> {
    let session = state.uploads.create_session(CreateSession {
        total_size: req.total_size,
        total_chunks: req.total_chunks,
        original_extension: req.original_extension,
        metadata: req.metadata,
    })?;
    Ok(CreateUploadResponse {
        task_id: session.task_id,
        chunk_size: session.chunk_size,
    })
}

pub fn upload_chunk(state: &HubState, req: UploadChunkRequest) -> Result<UploadChunkResponse> {
    let ack = state
        .uploads
        .submit_chunk(&req.task_id, req.chunk_index, &req.chunk_bytes)?;
    Ok(UploadChunkResponse {
        accepted: true,
        received: ack.received,
        total: ack.total,
        state: ack.state,
    })
}

pub fn request_merge(state: &HubState, req: MergeRequest) -> Result<MergeResponse> {
    let record_id = state.uploads.request_merge(&req.task_id)?;
    Ok(MergeResponse { record_id })
}

pub fn upload_status(state: &HubState, task_id: &str) -> Result<UploadStatusResponse> {
    let status = state.uploads.get_status(task_id)?;
    Ok(UploadStatusResponse {
        state: status.state,
        progress: status.progress_fraction,
        received: status.received,
        total: status.total,
        merge_record_id: status.merge_record_id,
        model_version_id: status.model_version_id,
        error: status.error,
    })
}

pub fn task_status(state: &HubState, record_id: &str) -> Result<TaskStatusResponse> {
    let status = state.status.get(record_id)?;
    Ok(TaskStatusResponse {
        kind: status.kind,
        state: status.state,
        attempts: status.attempts,
        result: status.result,
        error: status.error,
    })
}

/// Queue an inference job after checking the model can serve it
pub fn submit_infer(state: &HubState, payload: InferPayload) -> Result<SubmitTaskResponse> {
    let model = state
        .registry
        .resolve(&payload.model_name, payload.version.as_deref())?;
    if !model.task_types.contains(&payload.task_type) {
        return Err(HubError::InvalidArgument(format!(
            "Model {} {} is not registered for {} tasks",
            model.model_name, model.version, payload.task_type
        )));
    }
    if payload.input_path.trim().is_empty() {
        return Err(HubError::InvalidArgument("input_path cannot be empty".into()));
    }

    let record_id = state.dispatcher.enqueue(TaskKind::Infer, &payload)?;
    Ok(SubmitTaskResponse { record_id })
}

/// Queue conversion of a registered version
pub fn submit_convert(state: &HubState, payload: ConvertPayload) -> Result<SubmitTaskResponse> {
    let model = state.registry.get(payload.version_id)?;
    if model.format == payload.target_format {
        return Err(HubError::InvalidArgument(format!(
            "Model version {} is already {}",
            payload.version_id, payload.target_format
        )));
    }
    if payload.target_format != "onnx" {
        return Err(HubError::InvalidArgument(format!(
            "Unsupported target format: {}",
            payload.target_format
        )));
    }

    let record_id = state.dispatcher.enqueue(TaskKind::Convert, &payload)?;
    Ok(SubmitTaskResponse { record_id })
}

pub fn list_models(state: &HubState, query: ListModelsQuery) -> Result<ListModelsResponse> {
    let models = state.registry.list(&ModelFilter {
        model_name: query.model_name,
        model_type: query.model_type,
        limit: None,
    })?;
    Ok(ListModelsResponse { models })
}

pub fn get_model(state: &HubState, version_id: i64) -> Result<ModelVersion> {
    state.registry.get(version_id)
}

pub fn delete_model(state: &HubState, version_id: i64) -> Result<ModelVersion> {
    state.registry.delete(version_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::db::models::TaskType;
    use tempfile::TempDir;

    fn state() -> (HubState, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = HubConfig::with_data_dir(dir.path());
        config.upload.chunk_size = 4;
        (HubState::open(config).unwrap(), dir)
    }

    #[test]
    fn test_error_body() {
        let body = ErrorBody::from(&HubError::OutOfRange { index: 5, total: 3 });
        assert!(!body.success);
        assert_eq!(body.code, "out_of_range");

        let body = ErrorBody::from(&HubError::Database("disk I/O error".into()));
        assert_eq!(body.message, "Internal server error");
    }

    #[test]
    fn test_upload_flow_through_api() {
        let (state, _dir) = state();

        let created = create_upload(
            &state,
            CreateUploadRequest {
                total_size: 6,
                total_chunks: 2,
                original_extension: "pt".into(),
                metadata: ArtifactMetadata::new("leafnet", ModelType::Yolo),
            },
        )
        .unwrap();
        assert_eq!(created.chunk_size, 4);

        let ack = upload_chunk(
            &state,
            UploadChunkRequest {
                task_id: created.task_id.clone(),
                chunk_index: 0,
                chunk_bytes: b"PK\x03\x04".to_vec(),
            },
        )
        .unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.state, UploadState::Uploading);

        let status = upload_status(&state, &created.task_id).unwrap();
        assert_eq!(status.progress, 0.5);

        let err = request_merge(
            &state,
            MergeRequest {
                task_id: created.task_id.clone(),
            },
        )
        .unwrap_err();
        assert_eq!(err.http_status(), 409);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "UPLOADING");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_submit_infer_requires_model() {
        let (state, _dir) = state();
        let err = submit_infer(
            &state,
            InferPayload {
                model_name: "missing".into(),
                version: None,
                task_type: TaskType::Detect,
                input_path: "/tmp/leaf.jpg".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
        assert_eq!(state.dispatcher.pending_count(None).unwrap(), 0);
    }
}
