use crate::errors::AgentError;
use async_trait::async_trait;
use model_hub::{HubError, Lease, TaskKind};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Failure reported by a handler; `retryable` decides between retry and `FAILED`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<HubError> for HandlerError {
    fn from(e: HubError) -> Self {
        Self {
            retryable: e.is_transient(),
            message: e.to_string(),
        }
    }
}

impl From<AgentError> for HandlerError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Hub(e) => e.into(),
            AgentError::Io(e) => Self::retryable(format!("IO error: {}", e)),
            AgentError::Join(e) => Self::retryable(format!("Task join error: {}", e)),
            // External commands fail for transient reasons too (device memory, busy files)
            e @ AgentError::Execution(_) => Self::retryable(e.to_string()),
            other => Self::permanent(other.to_string()),
        }
    }
}

/// One delivery of a task record, as seen by its handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub record_id: String,
    pub kind: TaskKind,
    /// 1-based
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new(record_id: impl Into<String>, kind: TaskKind, payload: serde_json::Value) -> Self {
        Self {
            record_id: record_id.into(),
            kind,
            attempt: 1,
            max_attempts: 1,
            payload,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_lease(lease: &Lease) -> Self {
        Self {
            record_id: lease.record_id().to_string(),
            kind: lease.kind(),
            attempt: lease.attempt(),
            max_attempts: lease.record.max_attempts,
            payload: lease.record.payload.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deserialize the payload; a malformed payload never succeeds on retry
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            HandlerError::permanent(format!("Invalid {} payload: {}", self.kind, e))
        })
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Flag shared with blocking work that polls for cancellation
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// Executes one kind of task record
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value, HandlerError>;

    /// Called once the record has failed for good
    async fn on_permanent_failure(&self, _ctx: &TaskContext, _error: &HandlerError) {}
}

/// Handler table, built once at startup
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Every kind in `kinds` must have a handler
    pub fn validate(&self, kinds: &[TaskKind]) -> Result<(), HubError> {
        let missing: Vec<String> = kinds
            .iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .map(|kind| kind.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(HubError::InvalidArgument(format!(
                "No handler registered for: {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value, HandlerError> {
            Ok(ctx.payload.clone())
        }
    }

    #[test]
    fn test_hub_error_retryability() {
        let transient: HandlerError = HubError::Unavailable("pool exhausted".into()).into();
        assert!(transient.retryable);

        let permanent: HandlerError = HubError::IntegrityFailure("bad header".into()).into();
        assert!(!permanent.retryable);
        assert!(permanent.message.contains("bad header"));
    }

    #[test]
    fn test_registry_validation() {
        let registry = HandlerRegistry::new().register(TaskKind::Merge, Arc::new(Echo));
        assert!(registry.validate(&[TaskKind::Merge]).is_ok());

        let err = registry
            .validate(&[TaskKind::Merge, TaskKind::Infer])
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidArgument(ref m) if m.contains("INFER")));
    }

    #[test]
    fn test_payload_errors_are_permanent() {
        let ctx = TaskContext::new("r1", TaskKind::Convert, json!({"version_id": "seven"}));
        let err = ctx
            .payload::<model_hub::queue::ConvertPayload>()
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_cancel_flag_shared() {
        let ctx = TaskContext::new("r1", TaskKind::Infer, json!({"x": 1}));
        let flag = ctx.cancel_flag();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(flag.load(Ordering::Relaxed));

        let out = Echo.handle(&ctx).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }
}
