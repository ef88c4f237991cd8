//! Model hub core: chunked artifact uploads, the model registry and the
//! durable task queue the workers consume.

pub mod api;
pub mod chunk_store;
pub mod config;
pub mod db;
pub mod errors;
pub mod maintenance;
pub mod merge;
pub mod queue;
pub mod registry;
pub mod state;
pub mod status;
pub mod upload;

pub use config::HubConfig;
pub use db::models::{ModelType, TaskKind, TaskState, TaskType, UploadState};
pub use db::{Database, DbError};
pub use errors::{HubError, Result};
pub use merge::{MergeOutcome, MergeValidator};
pub use queue::{Dispatcher, Lease, TaskRecord};
pub use registry::{ModelRegistry, ModelVersion};
pub use state::HubState;
pub use status::{StatusTracker, TaskStatus};
pub use upload::UploadSessionManager;
