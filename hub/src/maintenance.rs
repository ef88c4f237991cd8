//! Periodic housekeeping: session expiry, lease reclamation and cleanup.

use crate::db::now_ms;
use crate::errors::Result;
use crate::state::HubState;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

/// What one maintenance pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_sessions: Vec<String>,
    pub reclaimed_leases: Vec<String>,
    pub failed_merges: Vec<String>,
    pub purged_sessions: usize,
    pub purged_records: usize,
    pub orphaned_chunk_dirs: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Run every housekeeping step once
pub fn run_maintenance_pass(state: &HubState) -> Result<MaintenanceReport> {
    run_maintenance_pass_at(state, now_ms())
}

pub fn run_maintenance_pass_at(state: &HubState, now: i64) -> Result<MaintenanceReport> {
    let retention_ms = (state.config.upload.retention_secs as i64) * 1000;

    // Leases first so merges that just ran out of attempts are failed below
    let reclaimed_leases = state.dispatcher.reclaim_expired_leases_at(now)?;
    let expired_sessions = state.uploads.expire_idle_sessions_at(now)?;
    let failed_merges = state.merger.fail_abandoned_merges()?;
    let purged_sessions = state.uploads.purge_retained_at(now)?;
    let purged_records = state.dispatcher.purge_finished_at(now - retention_ms)?;
    let orphaned_chunk_dirs = state.uploads.remove_orphaned_chunks()?;

    Ok(MaintenanceReport {
        expired_sessions,
        reclaimed_leases,
        failed_merges,
        purged_sessions,
        purged_records,
        orphaned_chunk_dirs,
    })
}

/// Background task running [`run_maintenance_pass`] every `period` until shutdown
pub async fn maintenance_loop(
    state: HubState,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = period.as_secs(), "Starting maintenance task");

    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                info!("Maintenance task stopping");
                return;
            }
        }
        if *shutdown.borrow() {
            info!("Maintenance task stopping");
            return;
        }

        let state_clone = state.clone();
        match tokio::task::spawn_blocking(move || run_maintenance_pass(&state_clone)).await {
            Ok(Ok(report)) if report.is_empty() => {}
            Ok(Ok(report)) => debug!(
                expired = report.expired_sessions.len(),
                reclaimed = report.reclaimed_leases.len(),
                failed_merges = report.failed_merges.len(),
                purged_sessions = report.purged_sessions,
                purged_records = report.purged_records,
                orphans = report.orphaned_chunk_dirs,
                "Maintenance pass complete"
            ),
            Ok(Err(e)) => error!(error = %e, "Maintenance pass failed"),
            Err(e) => error!(error = %e, "Task join error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::db::models::{ModelType, TaskKind, TaskState, UploadState};
    use crate::errors::HubError;
    use crate::upload::{ArtifactMetadata, CreateSession};
    use tempfile::TempDir;

    fn state() -> (HubState, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = HubConfig::with_data_dir(dir.path());
        config.upload.chunk_size = 4;
        config.upload.session_ttl_secs = 60;
        config.queue.max_attempts = 1;
        config.queue.lease_timeout_secs = 5;
        (HubState::open(config).unwrap(), dir)
    }

    fn session(state: &HubState, total_size: u64, total_chunks: u32) -> String {
        state
            .uploads
            .create_session(CreateSession {
                total_size,
                total_chunks,
                original_extension: "onnx".into(),
                metadata: ArtifactMetadata::new("sprout", ModelType::Resnet),
            })
            .unwrap()
            .task_id
    }

    #[test]
    fn test_idle_session_expires() {
        let (state, _dir) = state();
        let task_id = session(&state, 8, 2);
        state.uploads.submit_chunk(&task_id, 0, &[8, 1, 2, 3]).unwrap();

        let report = run_maintenance_pass_at(&state, now_ms() + 61_000).unwrap();
        assert_eq!(report.expired_sessions, vec![task_id.clone()]);
        assert!(state.chunks.stored_indices(&task_id).unwrap().is_empty());
        assert!(matches!(
            state.uploads.get_status(&task_id),
            Err(HubError::NotFound(_))
        ));

        // Nothing left to do on the next pass
        let report = run_maintenance_pass_at(&state, now_ms() + 62_000).unwrap();
        assert!(report.expired_sessions.is_empty());
    }

    #[test]
    fn test_abandoned_merge_fails_upload() {
        let (state, _dir) = state();
        let task_id = session(&state, 4, 1);
        state.uploads.submit_chunk(&task_id, 0, &[8, 1, 2, 3]).unwrap();
        let record_id = state.uploads.request_merge(&task_id).unwrap();

        // Worker claims the merge and never reports back
        let lease = state.dispatcher.dequeue("lost", &[TaskKind::Merge]).unwrap().unwrap();
        assert_eq!(lease.record_id(), record_id);

        let report = run_maintenance_pass_at(&state, lease.expires_at_ms + 1).unwrap();
        assert_eq!(report.reclaimed_leases, vec![record_id.clone()]);
        assert_eq!(report.failed_merges, vec![task_id.clone()]);

        assert_eq!(state.dispatcher.get(&record_id).unwrap().state, TaskState::Failed);
        let upload = state.uploads.get_session(&task_id).unwrap();
        assert_eq!(upload.state, UploadState::Failed);
        assert!(state.chunks.stored_indices(&task_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let (state, _dir) = state();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(maintenance_loop(state, Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
