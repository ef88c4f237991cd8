//! Everything `hub start` runs: the worker pool plus the maintenance loop.

use crate::device::WorkerCapabilities;
use crate::errors::Result;
use crate::executor::{
    standard_groups, CommandConverter, CommandEngine, ConvertHandler, HandlerRegistry, InferHandler,
    MergeHandler, PoolConfig, PoolHandle, PoolStats, WorkerPool,
};
use model_hub::maintenance::maintenance_loop;
use model_hub::{HubState, TaskKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Handlers for every task kind, with the configured external commands
pub fn default_handlers(state: &HubState) -> HandlerRegistry {
    let converter = Arc::new(CommandConverter::new(state.config.conversion.command.clone()));
    let engine = Arc::new(CommandEngine::new(state.config.inference.command.clone()));

    HandlerRegistry::new()
        .register(TaskKind::Merge, Arc::new(MergeHandler::new(state.merger.clone())))
        .register(
            TaskKind::Convert,
            Arc::new(ConvertHandler::new(state.registry.clone(), converter)),
        )
        .register(
            TaskKind::Infer,
            Arc::new(InferHandler::new(state.registry.clone(), engine)),
        )
}

pub struct Worker {
    pool: PoolHandle,
    maintenance: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Worker {
    /// Start the pool sized for `capabilities` and the maintenance loop
    pub fn start(
        state: HubState,
        handlers: HandlerRegistry,
        capabilities: &WorkerCapabilities,
    ) -> Result<Self> {
        let sizes = capabilities.group_sizes(&state.config.workers);
        info!(
            merge = sizes.merge,
            convert = sizes.convert,
            infer = sizes.infer,
            cpu_cores = capabilities.cpu_cores,
            accelerators = capabilities.accelerators,
            "Starting workers"
        );

        let pool_config = PoolConfig::new(
            Duration::from_secs(state.config.workers.handler_timeout_secs),
            state.dispatcher.lease_timeout(),
        );
        let pool = WorkerPool::new(state.dispatcher.clone(), handlers, pool_config)
            .with_groups(standard_groups(sizes))
            .start()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let period = Duration::from_secs(state.config.maintenance.interval_secs);
        let maintenance = tokio::spawn(maintenance_loop(state, period, shutdown_rx));

        Ok(Self {
            pool,
            maintenance,
            shutdown,
        })
    }

    pub fn stats(&self) -> &Arc<PoolStats> {
        self.pool.stats()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.pool.shutdown().await;
        if let Err(e) = self.maintenance.await {
            error!(error = %e, "Maintenance task join error");
        }
        info!("Workers stopped");
    }
}
