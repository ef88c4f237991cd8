use crate::errors::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Default artifact size limit: 500 MiB
pub const DEFAULT_MAX_ARTIFACT_SIZE: u64 = 500 * 1024 * 1024;

/// Main configuration for the model hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub queue: QueueConfig,
    pub workers: WorkersConfig,
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub inference: CommandConfig,
    #[serde(default)]
    pub conversion: CommandConfig,
    pub logging: LoggingConfig,
}

/// Where staged chunks, artifacts and the database live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/hub.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

/// Chunked upload limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub chunk_size: u64,
    pub max_artifact_size: u64,
    pub allowed_extensions: Vec<String>,
    /// Idle time after which an unmerged session expires
    pub session_ttl_secs: u64,
    /// How long terminal sessions are kept before deletion
    pub retention_secs: u64,
}

/// Task queue delivery and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub lease_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub poll_interval_ms: u64,
}

/// Worker group sizes. Zero means size from detected hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub merge: usize,
    pub convert: usize,
    pub infer: usize,
    pub handler_timeout_secs: u64,
    /// Overrides accelerator detection for the infer group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerators: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
}

/// External command template.
///
/// Placeholders `{model}`, `{input}`, `{output}` and `{task}` are substituted
/// per argument before spawning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default)]
    pub command: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl HubConfig {
    /// Get default configuration file path: `~/.model-hub/hub.toml`
    pub fn default_path() -> Result<PathBuf> {
        Ok(default_data_dir()?.join("hub.toml"))
    }

    /// Load configuration from file, apply environment overrides, validate
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let mut config: HubConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        tracing::debug!(path = %path.display(), "No config file, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MODEL_HUB_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| HubError::Config(format!("{} has invalid value '{}'", key, value)))
        }

        if let Some(v) = lookup("MODEL_HUB_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MODEL_HUB_DATABASE") {
            self.storage.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("MODEL_HUB_CHUNK_SIZE") {
            self.upload.chunk_size = parse("MODEL_HUB_CHUNK_SIZE", v)?;
        }
        if let Some(v) = lookup("MODEL_HUB_MAX_ARTIFACT_SIZE") {
            self.upload.max_artifact_size = parse("MODEL_HUB_MAX_ARTIFACT_SIZE", v)?;
        }
        if let Some(v) = lookup("MODEL_HUB_LEASE_TIMEOUT_SECS") {
            self.queue.lease_timeout_secs = parse("MODEL_HUB_LEASE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("MODEL_HUB_MAX_ATTEMPTS") {
            self.queue.max_attempts = parse("MODEL_HUB_MAX_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("MODEL_HUB_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Configuration rooted at `data_dir` with default limits
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.into();
        config
    }

    /// Resolved database path
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("hub.db"))
    }

    /// Directory holding per-upload chunk staging directories
    pub fn staging_dir(&self) -> PathBuf {
        self.storage.data_dir.join("staging")
    }

    /// Directory holding published artifacts
    pub fn artifacts_dir(&self) -> PathBuf {
        self.storage.data_dir.join("artifacts")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(HubError::Config("storage.data_dir cannot be empty".into()));
        }

        if self.upload.chunk_size == 0 {
            return Err(HubError::Config("upload.chunk_size must be at least 1".into()));
        }

        if self.upload.max_artifact_size < self.upload.chunk_size {
            return Err(HubError::Config(
                "upload.max_artifact_size must be at least upload.chunk_size".into(),
            ));
        }

        if self.upload.allowed_extensions.is_empty() {
            return Err(HubError::Config(
                "upload.allowed_extensions cannot be empty".into(),
            ));
        }

        for ext in &self.upload.allowed_extensions {
            if ext.is_empty() || ext.starts_with('.') || ext.contains('/') {
                return Err(HubError::Config(format!(
                    "invalid extension '{}' (use bare names like 'onnx')",
                    ext
                )));
            }
        }

        if self.upload.session_ttl_secs == 0 {
            return Err(HubError::Config("upload.session_ttl_secs must be at least 1".into()));
        }

        if self.queue.lease_timeout_secs == 0 {
            return Err(HubError::Config("queue.lease_timeout_secs must be at least 1".into()));
        }

        if self.queue.max_attempts == 0 || self.queue.max_attempts > 100 {
            return Err(HubError::Config(
                "queue.max_attempts must be between 1 and 100".into(),
            ));
        }

        if self.queue.backoff_base_ms == 0 || self.queue.backoff_max_ms < self.queue.backoff_base_ms {
            return Err(HubError::Config(
                "queue.backoff_base_ms must be at least 1 and not above backoff_max_ms".into(),
            ));
        }

        if self.queue.poll_interval_ms == 0 {
            return Err(HubError::Config("queue.poll_interval_ms must be at least 1".into()));
        }

        if self.workers.handler_timeout_secs == 0 {
            return Err(HubError::Config(
                "workers.handler_timeout_secs must be at least 1".into(),
            ));
        }

        if self.maintenance.interval_secs == 0 {
            return Err(HubError::Config(
                "maintenance.interval_secs must be at least 1".into(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(HubError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        let data_dir = default_data_dir().unwrap_or_else(|_| PathBuf::from(".model-hub"));

        HubConfig {
            storage: StorageConfig {
                data_dir,
                database_path: None,
            },
            upload: UploadConfig {
                chunk_size: DEFAULT_CHUNK_SIZE,
                max_artifact_size: DEFAULT_MAX_ARTIFACT_SIZE,
                allowed_extensions: vec!["pt".into(), "pth".into(), "onnx".into()],
                session_ttl_secs: 3600,
                retention_secs: 86400,
            },
            queue: QueueConfig {
                lease_timeout_secs: 300,
                max_attempts: 3,
                backoff_base_ms: 1000,
                backoff_max_ms: 60_000,
                poll_interval_ms: 500,
            },
            workers: WorkersConfig {
                merge: 2,
                convert: 1,
                infer: 0,
                handler_timeout_secs: 240,
                accelerators: None,
            },
            maintenance: MaintenanceConfig { interval_secs: 30 },
            inference: CommandConfig::default(),
            conversion: CommandConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: false,
                log_dir: None,
            },
        }
    }
}

/// `~/.model-hub`
pub fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| HubError::Config("Cannot determine home directory".into()))?;
    Ok(home.join(".model-hub"))
}
