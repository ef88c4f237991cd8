use super::command::CommandTemplate;
use super::handler::{HandlerError, TaskContext, TaskHandler};
use crate::errors::{AgentError, Result};
use async_trait::async_trait;
use model_hub::merge::{check_structure, checksum_file, read_header};
use model_hub::queue::ConvertPayload;
use model_hub::registry::NewModelVersion;
use model_hub::{HubError, ModelRegistry, ModelVersion};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

const TARGET_FORMAT: &str = "onnx";

/// Turns a PyTorch artifact into ONNX
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        model: &ModelVersion,
        output: &Path,
        cancel: Arc<AtomicBool>,
    ) -> Result<()>;
}

/// Converter backed by an external command.
///
/// Placeholders: `{model}` source artifact, `{output}` destination, `{task}`
/// the model's first task type.
pub struct CommandConverter {
    template: CommandTemplate,
}

impl CommandConverter {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            template: CommandTemplate::new(argv),
        }
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(
        &self,
        model: &ModelVersion,
        output: &Path,
        cancel: Arc<AtomicBool>,
    ) -> Result<()> {
        if !self.template.is_configured() {
            return Err(AgentError::Config(
                "conversion.command is not configured".into(),
            ));
        }
        let source = model.artifact_path.to_string_lossy().into_owned();
        let output = output.to_string_lossy().into_owned();
        let task = model
            .task_types
            .first()
            .map(|t| t.to_string())
            .unwrap_or_default();

        self.template
            .run(
                &[
                    ("model", source.as_str()),
                    ("output", output.as_str()),
                    ("task", task.as_str()),
                ],
                &cancel,
            )
            .await?;
        Ok(())
    }
}

/// Result stored on a `CONVERT` record
#[derive(Debug, Clone, Serialize)]
pub struct ConvertOutcome {
    pub version_id: i64,
    pub model_name: String,
    pub version: String,
    pub derived_from: i64,
    pub file_size: u64,
    pub already_converted: bool,
}

impl ConvertOutcome {
    fn new(version: &ModelVersion, source_id: i64, already_converted: bool) -> Self {
        Self {
            version_id: version.version_id,
            model_name: version.model_name.clone(),
            version: version.version.clone(),
            derived_from: source_id,
            file_size: version.file_size,
            already_converted,
        }
    }
}

/// Version name of the ONNX export of `version`
pub fn converted_version_name(version: &str) -> String {
    format!("{}-{}", version, TARGET_FORMAT)
}

pub struct ConvertHandler {
    registry: ModelRegistry,
    converter: Arc<dyn Converter>,
}

impl ConvertHandler {
    pub fn new(registry: ModelRegistry, converter: Arc<dyn Converter>) -> Self {
        Self {
            registry,
            converter,
        }
    }

    /// Existing export of `source`, if one was already published
    async fn existing(&self, source: &ModelVersion) -> std::result::Result<Option<ModelVersion>, HandlerError> {
        let registry = self.registry.clone();
        let name = source.model_name.clone();
        let version = converted_version_name(&source.version);
        let found = blocking(move || registry.find(&name, &version)).await?;

        match found {
            Some(v) if v.derived_from == Some(source.version_id) => Ok(Some(v)),
            Some(v) => Err(HandlerError::permanent(format!(
                "Version {} of {} exists and was not converted from version {}",
                v.version, v.model_name, source.version_id
            ))),
            None => Ok(None),
        }
    }

    async fn publish(
        &self,
        source: &ModelVersion,
        temp_path: PathBuf,
    ) -> std::result::Result<ModelVersion, HubError> {
        let registry = self.registry.clone();
        let source = source.clone();
        blocking_hub(move || {
            check_structure(TARGET_FORMAT, &read_header(&temp_path)?)?;
            let (file_size, checksum) = checksum_file(&temp_path)?;

            let new = NewModelVersion {
                model_name: source.model_name.clone(),
                version: Some(converted_version_name(&source.version)),
                model_type: source.model_type,
                task_types: source.task_types.clone(),
                format: TARGET_FORMAT.to_string(),
                file_size,
                checksum,
                parameters: source.parameters.clone(),
                description: source.description.clone(),
                source_upload_id: None,
                derived_from: Some(source.version_id),
            };
            registry.publish(&temp_path, new, |_, _| Ok(()))
        })
        .await
    }
}

#[async_trait]
impl TaskHandler for ConvertHandler {
    async fn handle(&self, ctx: &TaskContext) -> std::result::Result<serde_json::Value, HandlerError> {
        let payload: ConvertPayload = ctx.payload()?;
        if payload.target_format != TARGET_FORMAT {
            return Err(HandlerError::permanent(format!(
                "Unsupported target format: {}",
                payload.target_format
            )));
        }

        let registry = self.registry.clone();
        let source = blocking(move || registry.get(payload.version_id)).await?;
        if source.format == TARGET_FORMAT {
            return Err(HandlerError::permanent(format!(
                "Model version {} is already {}",
                source.version_id, TARGET_FORMAT
            )));
        }

        if let Some(done) = self.existing(&source).await? {
            info!(version_id = done.version_id, "Model already converted");
            return encode(ConvertOutcome::new(&done, source.version_id, true));
        }

        let registry = self.registry.clone();
        let model_name = source.model_name.clone();
        let staging = blocking(move || registry.staging_dir_for(&model_name)).await?;
        let temp_path = staging.join(format!(
            ".{}.{}.onnx.partial",
            source.model_name,
            uuid::Uuid::new_v4().simple()
        ));

        if let Err(e) = self
            .converter
            .convert(&source, &temp_path, ctx.cancel_flag())
            .await
        {
            remove_partial(&temp_path);
            return Err(e.into());
        }

        match self.publish(&source, temp_path.clone()).await {
            Ok(version) => {
                info!(
                    version_id = version.version_id,
                    derived_from = source.version_id,
                    "Model converted"
                );
                encode(ConvertOutcome::new(&version, source.version_id, false))
            }
            Err(HubError::Conflict(_)) => {
                // A concurrent delivery published the same export first
                remove_partial(&temp_path);
                match self.existing(&source).await? {
                    Some(done) => encode(ConvertOutcome::new(&done, source.version_id, true)),
                    None => Err(HandlerError::retryable("conversion raced with a delete")),
                }
            }
            Err(e) => {
                remove_partial(&temp_path);
                Err(e.into())
            }
        }
    }
}

fn encode(outcome: ConvertOutcome) -> std::result::Result<serde_json::Value, HandlerError> {
    serde_json::to_value(outcome)
        .map_err(|e| HandlerError::permanent(format!("Failed to encode result: {}", e)))
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial export");
        }
    }
}

async fn blocking_hub<T, F>(f: F) -> std::result::Result<T, HubError>
where
    F: FnOnce() -> std::result::Result<T, HubError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

async fn blocking<T, F>(f: F) -> std::result::Result<T, HandlerError>
where
    F: FnOnce() -> std::result::Result<T, HubError> + Send + 'static,
    T: Send + 'static,
{
    Ok(blocking_hub(f).await?)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use model_hub::{HubConfig, HubState, ModelType, TaskKind, TaskType};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Writes a minimal ONNX-looking file
    struct FakeConverter {
        calls: AtomicU32,
        header: u8,
    }

    #[async_trait]
    impl Converter for FakeConverter {
        async fn convert(&self, _model: &ModelVersion, output: &Path, _cancel: Arc<AtomicBool>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(output, [self.header, 0x07, 0x3a, 0x10])?;
            Ok(())
        }
    }

    fn registered_pt(state: &HubState) -> ModelVersion {
        let temp = state.registry.staging_dir_for("leafdet").unwrap().join(".upload");
        std::fs::write(&temp, b"PK\x03\x04weights").unwrap();
        state
            .registry
            .publish(
                &temp,
                NewModelVersion {
                    model_name: "leafdet".into(),
                    version: None,
                    model_type: ModelType::Yolo,
                    task_types: vec![TaskType::Detect],
                    format: "pt".into(),
                    file_size: 11,
                    checksum: "00".into(),
                    parameters: None,
                    description: None,
                    source_upload_id: None,
                    derived_from: None,
                },
                |_, _| Ok(()),
            )
            .unwrap()
    }

    fn setup(header: u8) -> (HubState, TempDir, Arc<FakeConverter>, ConvertHandler) {
        let dir = TempDir::new().unwrap();
        let state = HubState::open(HubConfig::with_data_dir(dir.path())).unwrap();
        let converter = Arc::new(FakeConverter {
            calls: AtomicU32::new(0),
            header,
        });
        let handler = ConvertHandler::new(state.registry.clone(), converter.clone());
        (state, dir, converter, handler)
    }

    #[tokio::test]
    async fn test_convert_publishes_derived_version() {
        let (state, _dir, converter, handler) = setup(0x08);
        let source = registered_pt(&state);

        let ctx = TaskContext::new("r1", TaskKind::Convert, json!({ "version_id": source.version_id }));
        let out = handler.handle(&ctx).await.unwrap();
        assert_eq!(out["version"], "v1-onnx");
        assert_eq!(out["already_converted"], false);

        let onnx = state.registry.find("leafdet", "v1-onnx").unwrap().unwrap();
        assert_eq!(onnx.format, "onnx");
        assert_eq!(onnx.derived_from, Some(source.version_id));
        assert_eq!(onnx.task_types, vec![TaskType::Detect]);
        assert!(onnx.artifact_path.exists());

        // Redelivery does not convert twice
        let again = handler.handle(&ctx).await.unwrap();
        assert_eq!(again["already_converted"], true);
        assert_eq!(again["version_id"], onnx.version_id);
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_export_is_rejected() {
        let (state, _dir, _converter, handler) = setup(0x50);
        let source = registered_pt(&state);

        let ctx = TaskContext::new("r1", TaskKind::Convert, json!({ "version_id": source.version_id }));
        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(!err.retryable);
        assert!(state.registry.find("leafdet", "v1-onnx").unwrap().is_none());

        let leftovers: Vec<_> = std::fs::read_dir(state.registry.staging_dir_for("leafdet").unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let (_state, _dir, _converter, handler) = setup(0x08);
        let ctx = TaskContext::new("r1", TaskKind::Convert, json!({ "version_id": 404 }));
        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_command_converter() {
        let (state, _dir, _converter, _handler) = setup(0x08);
        let source = registered_pt(&state);
        let converter = CommandConverter::new(vec![
            "sh".into(),
            "-c".into(),
            "test -f \"$0\" && printf '\\010\\007' > \"$1\"".into(),
            "{model}".into(),
            "{output}".into(),
        ]);
        let handler = ConvertHandler::new(state.registry.clone(), Arc::new(converter));

        let ctx = TaskContext::new("r1", TaskKind::Convert, json!({ "version_id": source.version_id }));
        let out = handler.handle(&ctx).await.unwrap();
        assert_eq!(out["file_size"], 2);
    }
}
