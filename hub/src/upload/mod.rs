//! Chunked upload sessions.

pub mod manager;
pub mod session;

pub use manager::UploadSessionManager;
pub use session::{
    chunk_count, ArtifactMetadata, ChunkAck, CreateSession, SessionStatus, UploadTask,
};
