use crate::db::models::{ModelType, TaskType, UploadState};
use crate::errors::{HubError, Result};
use crate::registry::validate_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use time::OffsetDateTime;

/// Descriptive data registered with the model once the upload completes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMetadata {
    pub model_name: String,
    /// Next `vN` is assigned when absent
    #[serde(default)]
    pub version: Option<String>,
    pub model_type: ModelType,
    /// Defaults to everything the model type supports
    #[serde(default)]
    pub task_types: Vec<TaskType>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

impl ArtifactMetadata {
    pub fn new(model_name: impl Into<String>, model_type: ModelType) -> Self {
        Self {
            model_name: model_name.into(),
            version: None,
            model_type,
            task_types: Vec::new(),
            description: None,
            parameters: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("model_name", &self.model_name)?;
        if let Some(version) = &self.version {
            validate_name("version", version)?;
        }

        for task in &self.task_types {
            if !self.model_type.supports(*task) {
                return Err(HubError::InvalidArgument(format!(
                    "{} models do not support {} tasks",
                    self.model_type, task
                )));
            }
        }

        if let Some(params) = &self.parameters {
            if !params.is_object() {
                return Err(HubError::InvalidArgument(
                    "parameters must be a JSON object".into(),
                ));
            }
        }
        Ok(())
    }

    /// Declared task types, or all the model type supports when none were given
    pub fn effective_task_types(&self) -> Vec<TaskType> {
        if self.task_types.is_empty() {
            return self.model_type.supported_tasks().to_vec();
        }
        let mut tasks = Vec::new();
        for task in &self.task_types {
            if !tasks.contains(task) {
                tasks.push(*task);
            }
        }
        tasks
    }
}

/// Request to open an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSession {
    pub total_size: u64,
    pub total_chunks: u32,
    pub original_extension: String,
    pub metadata: ArtifactMetadata,
}

/// One in-progress or finished chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub task_id: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub chunk_size: u64,
    /// Lowercase, without the leading dot
    pub original_extension: String,
    pub metadata: ArtifactMetadata,
    pub received_chunks: BTreeSet<u32>,
    pub state: UploadState,
    pub merge_record_id: Option<String>,
    pub model_version_id: Option<i64>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

impl UploadTask {
    pub fn received(&self) -> u32 {
        self.received_chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total_chunks
    }

    pub fn progress_fraction(&self) -> f64 {
        if self.state == UploadState::Completed {
            return 1.0;
        }
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.received() as f64 / self.total_chunks as f64
    }

    /// Exact length chunk `index` must have
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        expected_chunk_len(self.total_size, self.total_chunks, self.chunk_size, index)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            task_id: self.task_id.clone(),
            state: self.state,
            progress_fraction: self.progress_fraction(),
            received: self.received(),
            total: self.total_chunks,
            merge_record_id: self.merge_record_id.clone(),
            model_version_id: self.model_version_id,
            error: self.error.clone(),
        }
    }
}

pub(crate) fn expected_chunk_len(total_size: u64, total_chunks: u32, chunk_size: u64, index: u32) -> u64 {
    if index + 1 < total_chunks {
        chunk_size
    } else {
        total_size - chunk_size * (total_chunks as u64 - 1)
    }
}

/// Number of chunks `total_size` splits into
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    total_size.div_ceil(chunk_size)
}

/// Progress snapshot of an upload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    pub task_id: String,
    pub state: UploadState,
    pub progress_fraction: f64,
    pub received: u32,
    pub total: u32,
    pub merge_record_id: Option<String>,
    pub model_version_id: Option<i64>,
    pub error: Option<String>,
}

/// Acknowledgement of one accepted chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkAck {
    pub task_id: String,
    pub index: u32,
    pub received: u32,
    pub total: u32,
    pub state: UploadState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_lengths() {
        let mib = 1024 * 1024;
        assert_eq!(chunk_count(15 * mib, 5 * mib), 3);
        assert_eq!(chunk_count(15 * mib + 1, 5 * mib), 4);
        assert_eq!(chunk_count(1, 5 * mib), 1);

        assert_eq!(expected_chunk_len(12, 3, 5, 0), 5);
        assert_eq!(expected_chunk_len(12, 3, 5, 2), 2);
        assert_eq!(expected_chunk_len(15, 3, 5, 2), 5);
    }

    #[test]
    fn test_metadata_validation() {
        let mut meta = ArtifactMetadata::new("leafnet", ModelType::Resnet);
        assert!(meta.validate().is_ok());
        assert_eq!(meta.effective_task_types(), vec![TaskType::Classify]);

        meta.task_types = vec![TaskType::Detect];
        assert!(matches!(meta.validate(), Err(HubError::InvalidArgument(_))));

        let mut meta = ArtifactMetadata::new("../escape", ModelType::Yolo);
        assert!(meta.validate().is_err());

        meta.model_name = "leafnet".into();
        meta.parameters = Some(serde_json::json!([1, 2]));
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_task_types_deduplicated() {
        let mut meta = ArtifactMetadata::new("leafnet", ModelType::Yolo);
        meta.task_types = vec![TaskType::Detect, TaskType::Detect, TaskType::Classify];
        assert_eq!(
            meta.effective_task_types(),
            vec![TaskType::Detect, TaskType::Classify]
        );
    }
}
