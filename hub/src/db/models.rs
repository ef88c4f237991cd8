use crate::errors::HubError;
use serde::{Deserialize, Serialize};

/// Upload session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadState {
    Created,
    Uploading,
    ReadyToMerge,
    Merging,
    Completed,
    Failed,
    Expired,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Created => "CREATED",
            UploadState::Uploading => "UPLOADING",
            UploadState::ReadyToMerge => "READY_TO_MERGE",
            UploadState::Merging => "MERGING",
            UploadState::Completed => "COMPLETED",
            UploadState::Failed => "FAILED",
            UploadState::Expired => "EXPIRED",
        }
    }

    /// Whether chunks may still be submitted
    pub fn accepts_chunks(&self) -> bool {
        matches!(
            self,
            UploadState::Created | UploadState::Uploading | UploadState::ReadyToMerge
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Completed | UploadState::Failed | UploadState::Expired
        )
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UploadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(UploadState::Created),
            "UPLOADING" => Ok(UploadState::Uploading),
            "READY_TO_MERGE" => Ok(UploadState::ReadyToMerge),
            "MERGING" => Ok(UploadState::Merging),
            "COMPLETED" => Ok(UploadState::Completed),
            "FAILED" => Ok(UploadState::Failed),
            "EXPIRED" => Ok(UploadState::Expired),
            _ => Err(format!("Invalid upload state: {}", s)),
        }
    }
}

/// Task record delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Retrying => "RETRYING",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "RUNNING" => Ok(TaskState::Running),
            "SUCCEEDED" => Ok(TaskState::Succeeded),
            "FAILED" => Ok(TaskState::Failed),
            "RETRYING" => Ok(TaskState::Retrying),
            _ => Err(format!("Invalid task state: {}", s)),
        }
    }
}

/// Kind of work a task record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Merge,
    Convert,
    Infer,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Merge, TaskKind::Convert, TaskKind::Infer];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Merge => "MERGE",
            TaskKind::Convert => "CONVERT",
            TaskKind::Infer => "INFER",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MERGE" => Ok(TaskKind::Merge),
            "CONVERT" => Ok(TaskKind::Convert),
            "INFER" => Ok(TaskKind::Infer),
            _ => Err(HubError::InvalidArgument(format!("Unknown task kind: {}", s))),
        }
    }
}

/// Model architecture family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Detection family, also usable for classification
    Yolo,
    /// Classification family
    Resnet,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Yolo => "yolo",
            ModelType::Resnet => "resnet",
        }
    }

    /// Task types this family can serve
    pub fn supported_tasks(&self) -> &'static [TaskType] {
        match self {
            ModelType::Yolo => &[TaskType::Detect, TaskType::Classify],
            ModelType::Resnet => &[TaskType::Classify],
        }
    }

    pub fn supports(&self, task: TaskType) -> bool {
        self.supported_tasks().contains(&task)
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yolo" => Ok(ModelType::Yolo),
            "resnet" => Ok(ModelType::Resnet),
            _ => Err(HubError::InvalidArgument(format!("Unknown model type: {}", s))),
        }
    }
}

/// Inference task a model version can be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Detect,
    Classify,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Detect => "detect",
            TaskType::Classify => "classify",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "detect" => Ok(TaskType::Detect),
            "classify" => Ok(TaskType::Classify),
            _ => Err(HubError::InvalidArgument(format!("Unknown task type: {}", s))),
        }
    }
}

/// Read a TEXT column and parse it with `FromStr`
pub(crate) fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}
