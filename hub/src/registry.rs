//! Versioned catalog of published model artifacts.
//!
//! A `(model_name, version)` pair is registered at most once, enforced by a
//! unique index. Publishing inserts the row and moves the artifact into place
//! inside one immediate transaction, so a version is never visible without its
//! file.

use crate::db::models::{parse_column, ModelType, TaskType};
use crate::db::{ms_to_datetime, now_ms, Database};
use crate::errors::{is_unique_violation, HubError, Result};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

const VERSION_COLUMNS: &str = "version_id, model_name, version, model_type, task_types, format, \
     artifact_path, file_size, checksum, parameters, description, source_upload_id, \
     derived_from, created_at";

/// A registered, immutable model version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelVersion {
    pub version_id: i64,
    pub model_name: String,
    pub version: String,
    pub model_type: ModelType,
    pub task_types: Vec<TaskType>,
    /// Artifact format, the file extension (`pt`, `pth`, `onnx`)
    pub format: String,
    pub artifact_path: PathBuf,
    pub file_size: u64,
    /// SHA-256, lowercase hex
    pub checksum: String,
    pub parameters: Option<serde_json::Value>,
    pub description: Option<String>,
    pub source_upload_id: Option<String>,
    /// Version this one was converted from
    pub derived_from: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Everything needed to publish a version except its id and final path
#[derive(Debug, Clone)]
pub struct NewModelVersion {
    pub model_name: String,
    /// `None` assigns the next `vN`
    pub version: Option<String>,
    pub model_type: ModelType,
    pub task_types: Vec<TaskType>,
    pub format: String,
    pub file_size: u64,
    pub checksum: String,
    pub parameters: Option<serde_json::Value>,
    pub description: Option<String>,
    pub source_upload_id: Option<String>,
    pub derived_from: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub model_name: Option<String>,
    pub model_type: Option<ModelType>,
    pub limit: Option<u32>,
}

#[derive(Clone)]
pub struct ModelRegistry {
    db: Database,
    artifacts_dir: PathBuf,
}

impl ModelRegistry {
    pub fn new(db: Database, artifacts_dir: impl Into<PathBuf>) -> Result<Self> {
        let artifacts_dir = artifacts_dir.into();
        std::fs::create_dir_all(&artifacts_dir)?;
        Ok(Self { db, artifacts_dir })
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Final location of an artifact: `<artifacts>/<model>/<version>/<model>.<format>`
    pub fn artifact_path(&self, model_name: &str, version: &str, format: &str) -> PathBuf {
        self.artifacts_dir
            .join(model_name)
            .join(version)
            .join(format!("{}.{}", model_name, format))
    }

    /// Directory for temporary files that will be published for `model_name`.
    ///
    /// Sits on the same filesystem as the final path so publishing is a rename.
    pub fn staging_dir_for(&self, model_name: &str) -> Result<PathBuf> {
        validate_name("model_name", model_name)?;
        let dir = self.artifacts_dir.join(model_name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Publish `temp_file` as a new version.
    ///
    /// `guard` runs right after the row is inserted, inside the same immediate
    /// transaction, and receives the new version id; an error from it rolls
    /// the insert back and leaves `temp_file` where it was. The temp file is
    /// renamed into place before commit and moved back out if commit fails.
    #[instrument(skip(self, temp_file, new, guard), fields(model_name = %new.model_name))]
    pub fn publish<F>(&self, temp_file: &Path, new: NewModelVersion, guard: F) -> Result<ModelVersion>
    where
        F: FnOnce(&Transaction<'_>, i64) -> Result<()>,
    {
        validate_name("model_name", &new.model_name)?;
        if let Some(version) = &new.version {
            validate_name("version", version)?;
        }

        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let version = match new.version.clone() {
            Some(v) => v,
            None => next_version_in(&tx, &new.model_name)?,
        };

        let final_path = self.artifact_path(&new.model_name, &version, &new.format);
        let created_at = now_ms();
        let task_types = join_task_types(&new.task_types);
        let parameters = new
            .parameters
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let inserted = tx.execute(
            r#"
            INSERT INTO model_versions (
                model_name, version, model_type, task_types, format, artifact_path,
                file_size, checksum, parameters, description, source_upload_id,
                derived_from, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                &new.model_name,
                &version,
                new.model_type.as_str(),
                &task_types,
                &new.format,
                final_path.to_string_lossy(),
                new.file_size as i64,
                &new.checksum,
                parameters,
                &new.description,
                &new.source_upload_id,
                new.derived_from,
                created_at,
            ],
        );
        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(HubError::Conflict(format!(
                    "Model {} version {} already registered",
                    new.model_name, version
                )));
            }
            return Err(e.into());
        }
        let version_id = tx.last_insert_rowid();

        guard(&tx, version_id)?;

        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(temp_file, &final_path)?;

        if let Err(e) = tx.commit() {
            if let Err(undo) = std::fs::rename(&final_path, temp_file) {
                warn!(path = %final_path.display(), error = %undo, "Failed to withdraw artifact after aborted publish");
            }
            return Err(e.into());
        }

        info!(
            version_id,
            model_name = %new.model_name,
            version = %version,
            size = new.file_size,
            "Model version published"
        );

        Ok(ModelVersion {
            version_id,
            model_name: new.model_name,
            version,
            model_type: new.model_type,
            task_types: new.task_types,
            format: new.format,
            artifact_path: final_path,
            file_size: new.file_size,
            checksum: new.checksum,
            parameters: new.parameters,
            description: new.description,
            source_upload_id: new.source_upload_id,
            derived_from: new.derived_from,
            created_at: ms_to_datetime(created_at),
        })
    }

    pub fn get(&self, version_id: i64) -> Result<ModelVersion> {
        let conn = self.db.get_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM model_versions WHERE version_id = ?", VERSION_COLUMNS),
            params![version_id],
            map_version,
        )
        .optional()?
        .ok_or_else(|| HubError::NotFound(format!("Model version {} not found", version_id)))
    }

    pub fn find(&self, model_name: &str, version: &str) -> Result<Option<ModelVersion>> {
        let conn = self.db.get_conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM model_versions WHERE model_name = ? AND version = ?",
                    VERSION_COLUMNS
                ),
                params![model_name, version],
                map_version,
            )
            .optional()?)
    }

    pub fn exists(&self, model_name: &str, version: &str) -> Result<bool> {
        let conn = self.db.get_conn()?;
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM model_versions WHERE model_name = ? AND version = ?)",
            params![model_name, version],
            |row| row.get(0),
        )?)
    }

    /// Most recently registered version of a model
    pub fn latest(&self, model_name: &str) -> Result<Option<ModelVersion>> {
        let conn = self.db.get_conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM model_versions WHERE model_name = ? \
                     ORDER BY created_at DESC, version_id DESC LIMIT 1",
                    VERSION_COLUMNS
                ),
                params![model_name],
                map_version,
            )
            .optional()?)
    }

    /// Explicit version, or the latest one when `version` is `None`
    pub fn resolve(&self, model_name: &str, version: Option<&str>) -> Result<ModelVersion> {
        let found = match version {
            Some(v) => self.find(model_name, v)?,
            None => self.latest(model_name)?,
        };
        found.ok_or_else(|| {
            HubError::NotFound(format!(
                "Model {} version {} not found",
                model_name,
                version.unwrap_or("latest")
            ))
        })
    }

    pub fn list(&self, filter: &ModelFilter) -> Result<Vec<ModelVersion>> {
        let conn = self.db.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM model_versions \
             WHERE (?1 IS NULL OR model_name = ?1) AND (?2 IS NULL OR model_type = ?2) \
             ORDER BY model_name, version_id LIMIT ?3",
            VERSION_COLUMNS
        ))?;

        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        let rows = stmt.query_map(
            params![
                filter.model_name,
                filter.model_type.map(|t| t.as_str()),
                limit
            ],
            map_version,
        )?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Remove a version and its artifact file
    #[instrument(skip(self))]
    pub fn delete(&self, version_id: i64) -> Result<ModelVersion> {
        let version = self.get(version_id)?;

        let conn = self.db.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM model_versions WHERE version_id = ?",
            params![version_id],
        )?;
        if removed == 0 {
            return Err(HubError::NotFound(format!(
                "Model version {} not found",
                version_id
            )));
        }

        match std::fs::remove_file(&version.artifact_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %version.artifact_path.display(), "Artifact already missing");
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(dir) = version.artifact_path.parent() {
            // Only succeeds when the version directory is empty
            let _ = std::fs::remove_dir(dir);
        }

        info!(
            version_id,
            model_name = %version.model_name,
            version = %version.version,
            "Model version deleted"
        );
        Ok(version)
    }
}

/// Names become path components: `[A-Za-z0-9_.-]`, at most 64 chars.
pub fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > 64 {
        return Err(HubError::InvalidArgument(format!(
            "{} must be 1 to 64 characters",
            field
        )));
    }
    if value == "." || value == ".." {
        return Err(HubError::InvalidArgument(format!("{} cannot be '{}'", field, value)));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(HubError::InvalidArgument(format!(
            "{} may only contain letters, digits, '_', '-' and '.'",
            field
        )));
    }
    Ok(())
}

/// Next `vN` for a model, one past the highest existing `vN`
fn next_version_in(tx: &Transaction<'_>, model_name: &str) -> Result<String> {
    let mut stmt = tx.prepare("SELECT version FROM model_versions WHERE model_name = ?")?;
    let versions = stmt.query_map(params![model_name], |row| row.get::<_, String>(0))?;

    let mut highest = 0u64;
    for version in versions {
        if let Some(n) = version?.strip_prefix('v').and_then(|n| n.parse::<u64>().ok()) {
            highest = highest.max(n);
        }
    }
    Ok(format!("v{}", highest + 1))
}

fn join_task_types(task_types: &[TaskType]) -> String {
    task_types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn map_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelVersion> {
    let task_types: String = row.get(4)?;
    let task_types = task_types
        .split(',')
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<TaskType>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?;

    let parameters: Option<String> = row.get(9)?;
    let parameters = parameters
        .map(|p| serde_json::from_str(&p))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, e.into())
        })?;

    let artifact_path: String = row.get(6)?;
    let file_size: i64 = row.get(7)?;

    Ok(ModelVersion {
        version_id: row.get(0)?,
        model_name: row.get(1)?,
        version: row.get(2)?,
        model_type: parse_column(row, 3)?,
        task_types,
        format: row.get(5)?,
        artifact_path: PathBuf::from(artifact_path),
        file_size: file_size as u64,
        checksum: row.get(8)?,
        parameters,
        description: row.get(10)?,
        source_upload_id: row.get(11)?,
        derived_from: row.get(12)?,
        created_at: ms_to_datetime(row.get(13)?),
    })
}
