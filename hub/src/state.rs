use crate::chunk_store::ChunkStore;
use crate::config::HubConfig;
use crate::db::Database;
use crate::errors::Result;
use crate::merge::MergeValidator;
use crate::queue::Dispatcher;
use crate::registry::ModelRegistry;
use crate::status::StatusTracker;
use crate::upload::UploadSessionManager;
use std::sync::Arc;

/// Every hub component, wired to one database and one data directory
#[derive(Clone)]
pub struct HubState {
    /// Database connection pool
    pub db: Database,
    pub chunks: ChunkStore,
    pub registry: ModelRegistry,
    /// Task queue shared by the upload manager and the workers
    pub dispatcher: Dispatcher,
    pub uploads: UploadSessionManager,
    pub merger: MergeValidator,
    pub status: StatusTracker,
    pub config: Arc<HubConfig>,
}

impl HubState {
    /// Open (and migrate) the database and storage directories named by `config`
    pub fn open(config: HubConfig) -> Result<Self> {
        config.validate()?;

        let db_path = config.database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&db_path)?;
        Self::with_database(db, config)
    }

    /// Build the components around an already migrated database
    pub fn with_database(db: Database, config: HubConfig) -> Result<Self> {
        let chunks = ChunkStore::new(config.staging_dir())?;
        let registry = ModelRegistry::new(db.clone(), config.artifacts_dir())?;
        let dispatcher = Dispatcher::new(db.clone(), &config.queue);

        let uploads = UploadSessionManager::new(
            db.clone(),
            chunks.clone(),
            registry.clone(),
            dispatcher.clone(),
            config.upload.clone(),
        );
        let merger = MergeValidator::new(
            db.clone(),
            chunks.clone(),
            registry.clone(),
            config.upload.allowed_extensions.clone(),
        );
        let status = StatusTracker::new(db.clone());

        tracing::info!(
            data_dir = %config.storage.data_dir.display(),
            "Hub state initialized"
        );

        Ok(Self {
            db,
            chunks,
            registry,
            dispatcher,
            uploads,
            merger,
            status,
            config: Arc::new(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let state = HubState::open(HubConfig::with_data_dir(dir.path())).unwrap();

        assert!(dir.path().join("hub.db").exists());
        assert!(state.config.staging_dir().is_dir());
        assert!(state.config.artifacts_dir().is_dir());

        // Reopening runs no migration twice
        drop(state);
        HubState::open(HubConfig::with_data_dir(dir.path())).unwrap();
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = HubConfig::with_data_dir(dir.path());
        config.upload.chunk_size = 0;
        assert!(HubState::open(config).is_err());
    }
}
