//! Worker groups that lease task records and run their handlers.
//!
//! Every executor is a tokio task looping over `dequeue_wait`. A leased
//! record runs in its own task so a panic or timeout is caught here and turned
//! into a nack; the executor itself never dies with the handler.

use super::handler::{HandlerError, HandlerRegistry, TaskContext, TaskHandler};
use super::stats::PoolStats;
use crate::device::GroupSizes;
use model_hub::queue::CANCELLED_MESSAGE;
use model_hub::{Dispatcher, HubError, Lease, TaskKind, TaskState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Pause after a failed dequeue before trying again
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Soft limit per handler run; the attempt is nacked as retryable when hit
    pub handler_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Prefix of the lease owner recorded for each executor
    pub worker_prefix: String,
}

impl PoolConfig {
    /// Heartbeats three times per lease period
    pub fn new(handler_timeout: Duration, lease_timeout: Duration) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            handler_timeout,
            heartbeat_interval: (lease_timeout / 3).max(Duration::from_millis(100)),
            worker_prefix: format!("worker-{}", &id[..8]),
        }
    }
}

/// Executors serving the same set of kinds
#[derive(Debug, Clone)]
pub struct WorkerGroup {
    pub name: String,
    pub kinds: Vec<TaskKind>,
    pub size: usize,
}

impl WorkerGroup {
    pub fn new(name: impl Into<String>, kinds: Vec<TaskKind>, size: usize) -> Self {
        Self {
            name: name.into(),
            kinds,
            size,
        }
    }
}

/// One group per task kind, sized from configuration and hardware
pub fn standard_groups(sizes: GroupSizes) -> Vec<WorkerGroup> {
    vec![
        WorkerGroup::new("merge", vec![TaskKind::Merge], sizes.merge),
        WorkerGroup::new("convert", vec![TaskKind::Convert], sizes.convert),
        WorkerGroup::new("infer", vec![TaskKind::Infer], sizes.infer),
    ]
}

pub struct WorkerPool {
    dispatcher: Dispatcher,
    handlers: HandlerRegistry,
    groups: Vec<WorkerGroup>,
    config: PoolConfig,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn new(dispatcher: Dispatcher, handlers: HandlerRegistry, config: PoolConfig) -> Self {
        Self {
            dispatcher,
            handlers,
            groups: Vec::new(),
            config,
            stats: Arc::new(PoolStats::new()),
        }
    }

    pub fn with_group(mut self, group: WorkerGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = WorkerGroup>) -> Self {
        self.groups.extend(groups);
        self
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.stats.clone()
    }

    /// Spawn every executor. Fails before spawning anything if a served kind
    /// has no handler.
    pub fn start(self) -> Result<PoolHandle, HubError> {
        for group in self.groups.iter().filter(|g| g.size > 0) {
            if group.kinds.is_empty() {
                return Err(HubError::InvalidArgument(format!(
                    "Worker group '{}' serves no task kinds",
                    group.name
                )));
            }
            self.handlers.validate(&group.kinds)?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handlers = Arc::new(self.handlers);
        let mut tasks = Vec::new();

        for group in &self.groups {
            for i in 0..group.size {
                let executor = Executor {
                    worker_id: format!("{}-{}-{}", self.config.worker_prefix, group.name, i),
                    kinds: group.kinds.clone(),
                    dispatcher: self.dispatcher.clone(),
                    handlers: handlers.clone(),
                    config: self.config.clone(),
                    stats: self.stats.clone(),
                };
                tasks.push(tokio::spawn(executor.run(shutdown_rx.clone())));
            }
            if group.size > 0 {
                info!(group = %group.name, size = group.size, "Worker group started");
            }
        }

        Ok(PoolHandle {
            shutdown: shutdown_tx,
            tasks,
            stats: self.stats,
        })
    }
}

/// Running pool; dropping it without [`PoolHandle::shutdown`] detaches the executors
pub struct PoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<PoolStats>,
}

impl PoolHandle {
    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    pub fn executor_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop taking new records and wait for in-flight handlers to settle
    pub async fn shutdown(self) {
        info!("Shutting down worker pool");
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Executor task join error");
            }
        }
        self.stats.print_summary();
    }
}

/// How a handler run ended from the executor's point of view
enum RunOutcome {
    Finished(Result<serde_json::Value, HandlerError>),
    /// Another worker holds the record now; nothing to settle
    LeaseLost,
}

struct Executor {
    worker_id: String,
    kinds: Vec<TaskKind>,
    dispatcher: Dispatcher,
    handlers: Arc<HandlerRegistry>,
    config: PoolConfig,
    stats: Arc<PoolStats>,
}

impl Executor {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id = %self.worker_id, kinds = ?self.kinds, "Executor started");

        loop {
            let lease = match self
                .dispatcher
                .dequeue_wait(&self.worker_id, &self.kinds, &mut shutdown)
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => break,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Failed to dequeue");
                    tokio::select! {
                        _ = sleep(DEQUEUE_ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };
            self.execute(lease).await;
        }

        debug!(worker_id = %self.worker_id, "Executor stopped");
    }

    #[instrument(
        skip(self, lease),
        fields(
            worker_id = %self.worker_id,
            record_id = %lease.record_id(),
            kind = %lease.kind(),
            attempt = lease.attempt()
        )
    )]
    async fn execute(&self, lease: Lease) {
        let ctx = TaskContext::from_lease(&lease);
        let Some(handler) = self.handlers.get(lease.kind()) else {
            // Only reachable if the queue hands out a kind this group never asked for
            let err = HandlerError::permanent(format!("No handler for {}", lease.kind()));
            self.nack(&lease, &err).await;
            return;
        };

        self.stats.start_job();
        let started = Instant::now();
        let outcome = self.run_handler(handler.clone(), &ctx, &lease).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            RunOutcome::Finished(Ok(result)) => {
                let dispatcher = self.dispatcher.clone();
                let settled = lease.clone();
                match tokio::task::spawn_blocking(move || dispatcher.ack(&settled, result)).await {
                    Ok(Ok(())) => self.stats.record_success(elapsed_ms),
                    Ok(Err(e)) => warn!(error = %e, "Failed to ack task"),
                    Err(e) => error!(error = %e, "Task join error"),
                }
            }
            RunOutcome::Finished(Err(err)) => match self.nack(&lease, &err).await {
                Some(TaskState::Retrying) => self.stats.record_retry(elapsed_ms),
                Some(_) => {
                    self.stats.record_failure(elapsed_ms);
                    handler.on_permanent_failure(&ctx, &err).await;
                }
                None => {}
            },
            RunOutcome::LeaseLost => {
                warn!("Lease lost while running, result discarded");
            }
        }
        self.stats.finish_job();
    }

    /// Run `handler` in its own task, heartbeating until it finishes
    async fn run_handler(
        &self,
        handler: Arc<dyn TaskHandler>,
        ctx: &TaskContext,
        lease: &Lease,
    ) -> RunOutcome {
        let task_ctx = ctx.clone();
        let mut task = tokio::spawn(async move { handler.handle(&task_ctx).await });

        let deadline = sleep(self.config.handler_timeout);
        tokio::pin!(deadline);

        let mut beat = interval(self.config.heartbeat_interval);
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        beat.tick().await;

        loop {
            tokio::select! {
                joined = &mut task => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => Err(join_failure(e)),
                    };
                    return RunOutcome::Finished(match result {
                        // A cooperative stop after cancellation is final
                        Err(_) if ctx.is_cancelled() => Err(HandlerError::permanent(CANCELLED_MESSAGE)),
                        other => other,
                    });
                }
                _ = &mut deadline => {
                    ctx.cancel();
                    task.abort();
                    warn!(timeout_secs = self.config.handler_timeout.as_secs(), "Handler timed out");
                    return RunOutcome::Finished(Err(HandlerError::retryable(format!(
                        "handler timed out after {}s",
                        self.config.handler_timeout.as_secs()
                    ))));
                }
                _ = beat.tick() => {
                    let dispatcher = self.dispatcher.clone();
                    let held = lease.clone();
                    match tokio::task::spawn_blocking(move || dispatcher.heartbeat(&held)).await {
                        Ok(Ok(status)) => {
                            if status.cancel_requested && !ctx.is_cancelled() {
                                info!("Cancellation requested, signalling handler");
                                ctx.cancel();
                            }
                        }
                        Ok(Err(HubError::Conflict(_))) => {
                            ctx.cancel();
                            task.abort();
                            return RunOutcome::LeaseLost;
                        }
                        Ok(Err(e)) => warn!(error = %e, "Heartbeat failed"),
                        Err(e) => warn!(error = %e, "Heartbeat join error"),
                    }
                }
            }
        }
    }

    async fn nack(&self, lease: &Lease, err: &HandlerError) -> Option<TaskState> {
        let dispatcher = self.dispatcher.clone();
        let settled = lease.clone();
        let message = err.message.clone();
        let retryable = err.retryable;
        match tokio::task::spawn_blocking(move || dispatcher.nack(&settled, &message, retryable))
            .await
        {
            Ok(Ok(state)) => Some(state),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to nack task");
                None
            }
            Err(e) => {
                error!(error = %e, "Task join error");
                None
            }
        }
    }
}

fn join_failure(e: JoinError) -> HandlerError {
    if e.is_panic() {
        let payload = e.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(panic = %message, "Handler panicked");
        HandlerError::retryable(format!("handler panicked: {}", message))
    } else {
        HandlerError::retryable("handler task was aborted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use model_hub::config::HubConfig;
    use model_hub::queue::RetryPolicy;
    use model_hub::Database;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value, HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(HandlerError::retryable(format!("flaky call {}", call)));
            }
            Ok(json!({"record": ctx.record_id, "call": call}))
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn handle(&self, _ctx: &TaskContext) -> Result<serde_json::Value, HandlerError> {
            panic!("model file vanished");
        }
    }

    struct Sleeps;

    #[async_trait]
    impl TaskHandler for Sleeps {
        async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value, HandlerError> {
            for _ in 0..200 {
                if ctx.is_cancelled() {
                    return Err(HandlerError::permanent("stopped"));
                }
                sleep(Duration::from_millis(10)).await;
            }
            Ok(json!("done"))
        }
    }

    fn dispatcher(max_attempts: u32) -> (Dispatcher, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("hub.db")).unwrap();
        let mut queue = HubConfig::default().queue;
        queue.max_attempts = max_attempts;
        queue.poll_interval_ms = 20;
        let dispatcher = Dispatcher::new(db, &queue).with_policy(RetryPolicy {
            max_attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(1),
            jitter: 0.0,
        });
        (dispatcher, dir)
    }

    fn config() -> PoolConfig {
        let mut config = PoolConfig::new(Duration::from_secs(5), Duration::from_secs(30));
        config.heartbeat_interval = Duration::from_millis(20);
        config
    }

    async fn wait_for_state(dispatcher: &Dispatcher, record_id: &str, state: TaskState) {
        for _ in 0..500 {
            if dispatcher.get(record_id).unwrap().state == state {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("record {} never reached {}", record_id, state);
    }

    #[tokio::test]
    async fn test_missing_handler_rejected_at_start() {
        let (dispatcher, _dir) = dispatcher(3);
        let pool = WorkerPool::new(dispatcher, HandlerRegistry::new(), config())
            .with_group(WorkerGroup::new("infer", vec![TaskKind::Infer], 1));
        assert!(matches!(pool.start(), Err(HubError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_empty_group_needs_no_handler() {
        let (dispatcher, _dir) = dispatcher(3);
        let handle = WorkerPool::new(dispatcher, HandlerRegistry::new(), config())
            .with_group(WorkerGroup::new("infer", vec![TaskKind::Infer], 0))
            .start()
            .unwrap();
        assert_eq!(handle.executor_count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let (dispatcher, _dir) = dispatcher(3);
        let handler = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let handlers = HandlerRegistry::new().register(TaskKind::Convert, handler.clone());
        let handle = WorkerPool::new(dispatcher.clone(), handlers, config())
            .with_group(WorkerGroup::new("convert", vec![TaskKind::Convert], 1))
            .start()
            .unwrap();

        let record_id = dispatcher.enqueue(TaskKind::Convert, &json!({})).unwrap();
        wait_for_state(&dispatcher, &record_id, TaskState::Succeeded).await;

        let record = dispatcher.get(&record_id).unwrap();
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.result.unwrap()["call"], 3);

        let stats = handle.stats().snapshot();
        assert_eq!((stats.completed, stats.retried), (1, 2));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let (dispatcher, _dir) = dispatcher(2);
        let handlers = HandlerRegistry::new().register(
            TaskKind::Convert,
            Arc::new(Scripted {
                calls: AtomicU32::new(0),
                fail_first: u32::MAX,
            }),
        );
        let handle = WorkerPool::new(dispatcher.clone(), handlers, config())
            .with_group(WorkerGroup::new("convert", vec![TaskKind::Convert], 2))
            .start()
            .unwrap();

        let record_id = dispatcher.enqueue(TaskKind::Convert, &json!({})).unwrap();
        wait_for_state(&dispatcher, &record_id, TaskState::Failed).await;

        let record = dispatcher.get(&record_id).unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.error.as_deref(), Some("flaky call 2"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_executor() {
        let (dispatcher, _dir) = dispatcher(1);
        let handlers = HandlerRegistry::new()
            .register(TaskKind::Infer, Arc::new(Panics))
            .register(
                TaskKind::Merge,
                Arc::new(Scripted {
                    calls: AtomicU32::new(0),
                    fail_first: 0,
                }),
            );
        let handle = WorkerPool::new(dispatcher.clone(), handlers, config())
            .with_group(WorkerGroup::new(
                "mixed",
                vec![TaskKind::Infer, TaskKind::Merge],
                1,
            ))
            .start()
            .unwrap();

        let bad = dispatcher.enqueue(TaskKind::Infer, &json!({})).unwrap();
        wait_for_state(&dispatcher, &bad, TaskState::Failed).await;
        let error = dispatcher.get(&bad).unwrap().error.unwrap();
        assert!(error.contains("model file vanished"), "{}", error);

        // Same executor keeps serving
        let good = dispatcher.enqueue(TaskKind::Merge, &json!({})).unwrap();
        wait_for_state(&dispatcher, &good, TaskState::Succeeded).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_is_retryable_failure() {
        let (dispatcher, _dir) = dispatcher(1);
        let handlers = HandlerRegistry::new().register(TaskKind::Infer, Arc::new(Sleeps));
        let mut config = config();
        config.handler_timeout = Duration::from_millis(100);
        let handle = WorkerPool::new(dispatcher.clone(), handlers, config)
            .with_group(WorkerGroup::new("infer", vec![TaskKind::Infer], 1))
            .start()
            .unwrap();

        let record_id = dispatcher.enqueue(TaskKind::Infer, &json!({})).unwrap();
        wait_for_state(&dispatcher, &record_id, TaskState::Failed).await;
        let error = dispatcher.get(&record_id).unwrap().error.unwrap();
        assert!(error.contains("timed out"), "{}", error);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_reaches_running_handler() {
        let (dispatcher, _dir) = dispatcher(3);
        let handlers = HandlerRegistry::new().register(TaskKind::Infer, Arc::new(Sleeps));
        let handle = WorkerPool::new(dispatcher.clone(), handlers, config())
            .with_group(WorkerGroup::new("infer", vec![TaskKind::Infer], 1))
            .start()
            .unwrap();

        let record_id = dispatcher.enqueue(TaskKind::Infer, &json!({})).unwrap();
        wait_for_state(&dispatcher, &record_id, TaskState::Running).await;
        assert_eq!(dispatcher.request_cancel(&record_id).unwrap(), TaskState::Running);

        wait_for_state(&dispatcher, &record_id, TaskState::Failed).await;
        let record = dispatcher.get(&record_id).unwrap();
        assert_eq!(record.error.as_deref(), Some(CANCELLED_MESSAGE));
        assert_eq!(record.attempt_count, 1);
        handle.shutdown().await;
    }
}
