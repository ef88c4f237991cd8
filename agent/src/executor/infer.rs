use super::command::CommandTemplate;
use super::handler::{HandlerError, TaskContext, TaskHandler};
use crate::errors::{AgentError, Result};
use async_trait::async_trait;
use model_hub::queue::InferPayload;
use model_hub::{ModelRegistry, ModelVersion, TaskType};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

/// Runs a registered model on one input.
///
/// The output is opaque to the hub; it is stored as the record's result.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn infer(
        &self,
        model: &ModelVersion,
        task: TaskType,
        input: &Path,
        cancel: Arc<AtomicBool>,
    ) -> Result<serde_json::Value>;
}

/// Engine backed by an external command that prints JSON on stdout.
///
/// Placeholders: `{model}` artifact path, `{input}` input file, `{task}`
/// `detect` or `classify`.
pub struct CommandEngine {
    template: CommandTemplate,
}

impl CommandEngine {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            template: CommandTemplate::new(argv),
        }
    }
}

#[async_trait]
impl InferenceEngine for CommandEngine {
    async fn infer(
        &self,
        model: &ModelVersion,
        task: TaskType,
        input: &Path,
        cancel: Arc<AtomicBool>,
    ) -> Result<serde_json::Value> {
        if !self.template.is_configured() {
            return Err(AgentError::Config("inference.command is not configured".into()));
        }
        let model_path = model.artifact_path.to_string_lossy().into_owned();
        let input = input.to_string_lossy().into_owned();

        let output = self
            .template
            .run(
                &[
                    ("model", model_path.as_str()),
                    ("input", input.as_str()),
                    ("task", task.as_str()),
                ],
                &cancel,
            )
            .await?;

        serde_json::from_slice(&output.stdout).map_err(|e| {
            AgentError::Serialization(format!("inference output is not JSON: {}", e))
        })
    }
}

pub struct InferHandler {
    registry: ModelRegistry,
    engine: Arc<dyn InferenceEngine>,
}

impl InferHandler {
    pub fn new(registry: ModelRegistry, engine: Arc<dyn InferenceEngine>) -> Self {
        Self { registry, engine }
    }
}

#[async_trait]
impl TaskHandler for InferHandler {
    async fn handle(&self, ctx: &TaskContext) -> std::result::Result<serde_json::Value, HandlerError> {
        let payload: InferPayload = ctx.payload()?;

        let registry = self.registry.clone();
        let name = payload.model_name.clone();
        let version = payload.version.clone();
        let model = tokio::task::spawn_blocking(move || registry.resolve(&name, version.as_deref()))
            .await
            .map_err(|e| HandlerError::retryable(format!("Task join error: {}", e)))??;

        if !model.task_types.contains(&payload.task_type) {
            return Err(HandlerError::permanent(format!(
                "Model {} {} does not support {} tasks",
                model.model_name, model.version, payload.task_type
            )));
        }

        let input = Path::new(&payload.input_path);
        if !input.is_file() {
            return Err(HandlerError::permanent(format!(
                "Input {} does not exist",
                payload.input_path
            )));
        }

        let output = self
            .engine
            .infer(&model, payload.task_type, input, ctx.cancel_flag())
            .await?;

        info!(
            model_name = %model.model_name,
            version = %model.version,
            task = %payload.task_type,
            "Inference complete"
        );

        Ok(json!({
            "model_name": model.model_name,
            "version": model.version,
            "version_id": model.version_id,
            "task_type": payload.task_type,
            "output": output,
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use model_hub::registry::NewModelVersion;
    use model_hub::{HubConfig, HubState, ModelType, TaskKind};
    use tempfile::TempDir;

    fn setup(engine: Arc<dyn InferenceEngine>) -> (HubState, TempDir, InferHandler) {
        let dir = TempDir::new().unwrap();
        let state = HubState::open(HubConfig::with_data_dir(dir.path())).unwrap();

        let temp = state.registry.staging_dir_for("rootcls").unwrap().join(".upload");
        std::fs::write(&temp, [0x08, 0x07]).unwrap();
        state
            .registry
            .publish(
                &temp,
                NewModelVersion {
                    model_name: "rootcls".into(),
                    version: None,
                    model_type: ModelType::Resnet,
                    task_types: vec![TaskType::Classify],
                    format: "onnx".into(),
                    file_size: 2,
                    checksum: "00".into(),
                    parameters: None,
                    description: None,
                    source_upload_id: None,
                    derived_from: None,
                },
                |_, _| Ok(()),
            )
            .unwrap();

        let handler = InferHandler::new(state.registry.clone(), engine);
        (state, dir, handler)
    }

    fn echo_engine() -> Arc<dyn InferenceEngine> {
        Arc::new(CommandEngine::new(vec![
            "sh".into(),
            "-c".into(),
            "printf '{\"task\":\"%s\",\"label\":\"healthy\"}' \"$0\"".into(),
            "{task}".into(),
        ]))
    }

    #[tokio::test]
    async fn test_infer_latest_version() {
        let (state, dir, handler) = setup(echo_engine());
        let input = dir.path().join("leaf.jpg");
        std::fs::write(&input, b"jpeg").unwrap();

        let ctx = TaskContext::new(
            "r1",
            TaskKind::Infer,
            json!({
                "model_name": "rootcls",
                "task_type": "classify",
                "input_path": input.to_string_lossy(),
            }),
        );
        let out = handler.handle(&ctx).await.unwrap();
        assert_eq!(out["version"], "v1");
        assert_eq!(out["output"]["label"], "healthy");
        assert_eq!(out["output"]["task"], "classify");
        drop(state);
    }

    #[tokio::test]
    async fn test_unsupported_task_and_missing_model() {
        let (_state, dir, handler) = setup(echo_engine());
        let input = dir.path().join("leaf.jpg");
        std::fs::write(&input, b"jpeg").unwrap();

        let detect = TaskContext::new(
            "r1",
            TaskKind::Infer,
            json!({"model_name": "rootcls", "task_type": "detect", "input_path": input.to_string_lossy()}),
        );
        assert!(!handler.handle(&detect).await.unwrap_err().retryable);

        let missing = TaskContext::new(
            "r2",
            TaskKind::Infer,
            json!({"model_name": "nope", "task_type": "classify", "input_path": input.to_string_lossy()}),
        );
        assert!(!handler.handle(&missing).await.unwrap_err().retryable);
    }

    #[tokio::test]
    async fn test_non_json_output_is_permanent() {
        let engine = Arc::new(CommandEngine::new(vec!["echo".into(), "not json".into()]));
        let (_state, dir, handler) = setup(engine);
        let input = dir.path().join("leaf.jpg");
        std::fs::write(&input, b"jpeg").unwrap();

        let ctx = TaskContext::new(
            "r1",
            TaskKind::Infer,
            json!({"model_name": "rootcls", "version": "v1", "task_type": "classify", "input_path": input.to_string_lossy()}),
        );
        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("not JSON"));
    }
}
