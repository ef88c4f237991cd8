//! Durable at-least-once task queue on top of SQLite.
//!
//! Every state change is a compare-and-swap on the record row (`WHERE
//! record_id = ? AND state = ?`, plus the lease id for leased records) inside
//! an immediate transaction, and is mirrored into `task_events` for the
//! status tracker. A record is leased to at most one worker at a time; a
//! lease that is not acked, nacked or extended before it expires is reclaimed
//! and the record delivered again.

use super::types::{HeartbeatStatus, Lease, RetryPolicy, TaskRecord};
use crate::config::QueueConfig;
use crate::db::models::{parse_column, TaskKind, TaskState};
use crate::db::{ms_to_datetime, now_ms, Database};
use crate::errors::{HubError, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

pub(crate) const TASK_COLUMNS: &str = "record_id, kind, payload, state, attempt_count, \
     max_attempts, result, error, cancel_requested, available_at, created_at, updated_at";

/// Error text stored on records cancelled before they ran
pub const CANCELLED_MESSAGE: &str = "cancelled";

#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    notify: Arc<Notify>,
    policy: RetryPolicy,
    lease_timeout: Duration,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
            policy: RetryPolicy::from_config(config),
            lease_timeout: Duration::from_secs(config.lease_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// How often idle workers re-check the queue
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Persist a new `PENDING` record and wake idle workers.
    #[instrument(skip(self, payload))]
    pub fn enqueue<P: Serialize>(&self, kind: TaskKind, payload: &P) -> Result<String> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record_id = self.enqueue_with(&tx, kind, payload)?;
        tx.commit()?;

        self.notify_enqueued();
        Ok(record_id)
    }

    /// Insert a record using the caller's transaction.
    ///
    /// The record only exists once the caller commits; call
    /// [`Dispatcher::notify_enqueued`] afterwards.
    pub fn enqueue_with<P: Serialize>(
        &self,
        conn: &Connection,
        kind: TaskKind,
        payload: &P,
    ) -> Result<String> {
        let record_id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(payload)?;
        let now = now_ms();

        conn.execute(
            r#"
            INSERT INTO task_records (
                record_id, kind, payload, state, attempt_count, max_attempts,
                available_at, cancel_requested, created_at, updated_at
            ) VALUES (?, ?, ?, 'PENDING', 0, ?, ?, 0, ?, ?)
            "#,
            params![
                &record_id,
                kind.as_str(),
                &payload,
                self.policy.max_attempts,
                now,
                now,
                now
            ],
        )?;
        record_transition(conn, &record_id, None, TaskState::Pending, None, now)?;

        info!(record_id = %record_id, kind = %kind, "Task enqueued");
        Ok(record_id)
    }

    /// Wake workers blocked in [`Dispatcher::dequeue_wait`]
    pub fn notify_enqueued(&self) {
        self.notify.notify_waiters();
    }

    /// Claim the oldest eligible record of one of `kinds`, if any
    pub fn dequeue(&self, worker_id: &str, kinds: &[TaskKind]) -> Result<Option<Lease>> {
        self.dequeue_at(worker_id, kinds, now_ms())
    }

    pub fn dequeue_at(&self, worker_id: &str, kinds: &[TaskKind], now: i64) -> Result<Option<Lease>> {
        if kinds.is_empty() {
            return Ok(None);
        }

        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        promote_due_retries(&tx, now)?;

        let placeholders = vec!["?"; kinds.len()].join(", ");
        let candidate: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT record_id FROM task_records \
                     WHERE state = 'PENDING' AND available_at <= ? AND kind IN ({}) \
                     ORDER BY created_at, rowid LIMIT 1",
                    placeholders
                ),
                params_from_iter(
                    std::iter::once(rusqlite::types::Value::Integer(now)).chain(
                        kinds
                            .iter()
                            .map(|k| rusqlite::types::Value::Text(k.as_str().to_string())),
                    ),
                ),
                |row| row.get(0),
            )
            .optional()?;

        let Some(record_id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let lease_id = uuid::Uuid::new_v4().to_string();
        let expires_at = now + self.lease_timeout.as_millis() as i64;
        let claimed = tx.execute(
            r#"
            UPDATE task_records
            SET state = 'RUNNING', lease_id = ?, lease_owner = ?, lease_expires_at = ?, updated_at = ?
            WHERE record_id = ? AND state = 'PENDING'
            "#,
            params![&lease_id, worker_id, expires_at, now, &record_id],
        )?;
        if claimed == 0 {
            tx.commit()?;
            return Ok(None);
        }

        record_transition(
            &tx,
            &record_id,
            Some(TaskState::Pending),
            TaskState::Running,
            Some(&format!("leased by {}", worker_id)),
            now,
        )?;
        let record = load_record(&tx, &record_id)?;
        tx.commit()?;

        debug!(
            record_id = %record_id,
            kind = %record.kind,
            worker_id = %worker_id,
            attempt = record.attempt_count + 1,
            "Task leased"
        );

        Ok(Some(Lease {
            record,
            lease_id,
            worker_id: worker_id.to_string(),
            expires_at_ms: expires_at,
        }))
    }

    /// Wait until a record of `kinds` can be leased or `shutdown` flips.
    ///
    /// Returns `Ok(None)` only on shutdown.
    pub async fn dequeue_wait(
        &self,
        worker_id: &str,
        kinds: &[TaskKind],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Lease>> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            // Registered before the check so an enqueue in between is not missed
            let notified = self.notify.notified();

            let this = self.clone();
            let worker = worker_id.to_string();
            let wanted = kinds.to_vec();
            let leased = tokio::task::spawn_blocking(move || this.dequeue(&worker, &wanted)).await??;
            if leased.is_some() {
                return Ok(leased);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Complete a leased record successfully
    #[instrument(skip(self, lease, result), fields(record_id = %lease.record.record_id))]
    pub fn ack(&self, lease: &Lease, result: serde_json::Value) -> Result<()> {
        let now = now_ms();
        let result = serde_json::to_string(&result)?;

        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            r#"
            UPDATE task_records
            SET state = 'SUCCEEDED', result = ?, error = NULL, attempt_count = attempt_count + 1,
                lease_id = NULL, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE record_id = ? AND state = 'RUNNING' AND lease_id = ?
            "#,
            params![&result, now, lease.record_id(), &lease.lease_id],
        )?;
        if updated == 0 {
            return Err(lease_lost(lease));
        }
        record_transition(
            &tx,
            lease.record_id(),
            Some(TaskState::Running),
            TaskState::Succeeded,
            None,
            now,
        )?;
        tx.commit()?;

        info!(kind = %lease.kind(), attempt = lease.attempt(), "Task succeeded");
        Ok(())
    }

    /// Report a failed attempt.
    ///
    /// Retryable failures with attempts left go to `RETRYING` behind a backoff;
    /// everything else is `FAILED` for good. Returns the resulting state.
    #[instrument(skip(self, lease, error), fields(record_id = %lease.record.record_id))]
    pub fn nack(&self, lease: &Lease, error: &str, retryable: bool) -> Result<TaskState> {
        self.nack_at(lease, error, retryable, now_ms())
    }

    pub fn nack_at(&self, lease: &Lease, error: &str, retryable: bool, now: i64) -> Result<TaskState> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(u32, u32)> = tx
            .query_row(
                "SELECT attempt_count, max_attempts FROM task_records \
                 WHERE record_id = ? AND state = 'RUNNING' AND lease_id = ?",
                params![lease.record_id(), &lease.lease_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((attempts, max_attempts)) = current else {
            return Err(lease_lost(lease));
        };

        let attempts = attempts + 1;
        let (next, available_at) = if retryable && attempts < max_attempts {
            let delay = self.policy.backoff(attempts);
            (TaskState::Retrying, now + delay.as_millis() as i64)
        } else {
            (TaskState::Failed, now)
        };

        tx.execute(
            r#"
            UPDATE task_records
            SET state = ?, error = ?, attempt_count = ?, available_at = ?,
                lease_id = NULL, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE record_id = ? AND state = 'RUNNING' AND lease_id = ?
            "#,
            params![
                next.as_str(),
                error,
                attempts,
                available_at,
                now,
                lease.record_id(),
                &lease.lease_id
            ],
        )?;
        record_transition(
            &tx,
            lease.record_id(),
            Some(TaskState::Running),
            next,
            Some(error),
            now,
        )?;
        tx.commit()?;

        match next {
            TaskState::Retrying => warn!(
                kind = %lease.kind(),
                attempt = attempts,
                max_attempts,
                retry_in_ms = available_at - now,
                error = %error,
                "Task failed, will retry"
            ),
            _ => warn!(
                kind = %lease.kind(),
                attempt = attempts,
                retryable,
                error = %error,
                "Task failed permanently"
            ),
        }
        Ok(next)
    }

    /// Extend a lease. Reports whether cancellation was requested.
    pub fn heartbeat(&self, lease: &Lease) -> Result<HeartbeatStatus> {
        self.heartbeat_at(lease, now_ms())
    }

    pub fn heartbeat_at(&self, lease: &Lease, now: i64) -> Result<HeartbeatStatus> {
        let expires_at = now + self.lease_timeout.as_millis() as i64;
        let conn = self.db.get_conn()?;
        let cancel: Option<bool> = conn
            .query_row(
                r#"
                UPDATE task_records
                SET lease_expires_at = ?, updated_at = ?
                WHERE record_id = ? AND state = 'RUNNING' AND lease_id = ?
                RETURNING cancel_requested
                "#,
                params![expires_at, now, lease.record_id(), &lease.lease_id],
                |row| row.get(0),
            )
            .optional()?;

        match cancel {
            Some(cancel_requested) => Ok(HeartbeatStatus {
                expires_at_ms: expires_at,
                cancel_requested,
            }),
            None => Err(lease_lost(lease)),
        }
    }

    /// Return records with expired leases to the queue.
    ///
    /// An expiry counts as a failed attempt; records out of attempts fail.
    /// Returns the ids of the records reclaimed.
    pub fn reclaim_expired_leases(&self) -> Result<Vec<String>> {
        self.reclaim_expired_leases_at(now_ms())
    }

    pub fn reclaim_expired_leases_at(&self, now: i64) -> Result<Vec<String>> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let expired: Vec<(String, String, u32, u32, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT record_id, lease_id, attempt_count, max_attempts, lease_owner \
                 FROM task_records WHERE state = 'RUNNING' AND lease_expires_at < ?",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (record_id, lease_id, attempts, max_attempts, owner) in expired {
            let attempts = attempts + 1;
            let message = format!(
                "lease held by {} expired",
                owner.as_deref().unwrap_or("unknown worker")
            );
            let next = if attempts < max_attempts {
                TaskState::Pending
            } else {
                TaskState::Failed
            };

            let updated = tx.execute(
                r#"
                UPDATE task_records
                SET state = ?, error = ?, attempt_count = ?, available_at = ?,
                    lease_id = NULL, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
                WHERE record_id = ? AND state = 'RUNNING' AND lease_id = ?
                "#,
                params![
                    next.as_str(),
                    HubError::Timeout(message.clone()).to_string(),
                    attempts,
                    now,
                    now,
                    &record_id,
                    &lease_id
                ],
            )?;
            if updated == 0 {
                continue;
            }
            record_transition(
                &tx,
                &record_id,
                Some(TaskState::Running),
                next,
                Some(&message),
                now,
            )?;

            warn!(record_id = %record_id, attempt = attempts, next = %next, "Reclaimed expired lease");
            reclaimed.push(record_id);
        }
        tx.commit()?;

        if !reclaimed.is_empty() {
            self.notify_enqueued();
        }
        Ok(reclaimed)
    }

    /// Cancel a record.
    ///
    /// Queued records fail immediately; running records get a cancellation
    /// flag their worker sees on its next heartbeat; finished records are left
    /// alone. Returns the state after the request.
    #[instrument(skip(self))]
    pub fn request_cancel(&self, record_id: &str) -> Result<TaskState> {
        let now = now_ms();
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let state: TaskState = tx
            .query_row(
                "SELECT state FROM task_records WHERE record_id = ?",
                params![record_id],
                |row| parse_column(row, 0),
            )
            .optional()?
            .ok_or_else(|| HubError::NotFound(format!("Task {} not found", record_id)))?;

        let outcome = match state {
            TaskState::Pending | TaskState::Retrying => {
                tx.execute(
                    "UPDATE task_records SET state = 'FAILED', error = ?, updated_at = ? \
                     WHERE record_id = ? AND state = ?",
                    params![CANCELLED_MESSAGE, now, record_id, state.as_str()],
                )?;
                record_transition(
                    &tx,
                    record_id,
                    Some(state),
                    TaskState::Failed,
                    Some(CANCELLED_MESSAGE),
                    now,
                )?;
                TaskState::Failed
            }
            TaskState::Running => {
                tx.execute(
                    "UPDATE task_records SET cancel_requested = 1, updated_at = ? \
                     WHERE record_id = ? AND state = 'RUNNING'",
                    params![now, record_id],
                )?;
                TaskState::Running
            }
            TaskState::Succeeded | TaskState::Failed => state,
        };
        tx.commit()?;

        info!(record_id = %record_id, from = %state, to = %outcome, "Cancellation requested");
        Ok(outcome)
    }

    pub fn get(&self, record_id: &str) -> Result<TaskRecord> {
        let conn = self.db.get_conn()?;
        load_record(&conn, record_id)
    }

    /// Records waiting for delivery (`PENDING` or `RETRYING`)
    pub fn pending_count(&self, kind: Option<TaskKind>) -> Result<u64> {
        let conn = self.db.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM task_records \
             WHERE state IN ('PENDING', 'RETRYING') AND (?1 IS NULL OR kind = ?1)",
            params![kind.map(|k| k.as_str())],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete finished records last updated before `older_than_ms`
    pub fn purge_finished_at(&self, older_than_ms: i64) -> Result<usize> {
        let conn = self.db.get_conn()?;
        let purged = conn.execute(
            "DELETE FROM task_records WHERE state IN ('SUCCEEDED', 'FAILED') AND updated_at < ?",
            params![older_than_ms],
        )?;
        if purged > 0 {
            debug!(count = purged, "Purged finished task records");
        }
        Ok(purged)
    }
}

fn lease_lost(lease: &Lease) -> HubError {
    HubError::Conflict(format!(
        "Lease {} on task {} is no longer held",
        lease.lease_id,
        lease.record_id()
    ))
}

/// Move `RETRYING` records whose backoff elapsed back to `PENDING`
fn promote_due_retries(conn: &Connection, now: i64) -> Result<usize> {
    let due: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT record_id FROM task_records WHERE state = 'RETRYING' AND available_at <= ?",
        )?;
        let rows = stmt.query_map(params![now], |row| row.get(0))?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    for record_id in &due {
        conn.execute(
            "UPDATE task_records SET state = 'PENDING', updated_at = ? \
             WHERE record_id = ? AND state = 'RETRYING'",
            params![now, record_id],
        )?;
        record_transition(
            conn,
            record_id,
            Some(TaskState::Retrying),
            TaskState::Pending,
            Some("backoff elapsed"),
            now,
        )?;
    }
    Ok(due.len())
}

pub(crate) fn record_transition(
    conn: &Connection,
    record_id: &str,
    from: Option<TaskState>,
    to: TaskState,
    message: Option<&str>,
    at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO task_events (record_id, from_state, to_state, message, at) VALUES (?, ?, ?, ?, ?)",
        params![record_id, from.map(|s| s.as_str()), to.as_str(), message, at],
    )?;
    Ok(())
}

pub(crate) fn load_record(conn: &Connection, record_id: &str) -> Result<TaskRecord> {
    conn.query_row(
        &format!("SELECT {} FROM task_records WHERE record_id = ?", TASK_COLUMNS),
        params![record_id],
        map_task,
    )
    .optional()?
    .ok_or_else(|| HubError::NotFound(format!("Task {} not found", record_id)))
}

pub(crate) fn map_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    fn json_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
        let raw: Option<String> = row.get(idx)?;
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
            })
    }

    Ok(TaskRecord {
        record_id: row.get(0)?,
        kind: parse_column(row, 1)?,
        payload: json_column(row, 2)?.unwrap_or(serde_json::Value::Null),
        state: parse_column(row, 3)?,
        attempt_count: row.get(4)?,
        max_attempts: row.get(5)?,
        result: json_column(row, 6)?,
        error: row.get(7)?,
        cancel_requested: row.get(8)?,
        available_at: ms_to_datetime(row.get(9)?),
        created_at: ms_to_datetime(row.get(10)?),
        updated_at: ms_to_datetime(row.get(11)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::db::{create_file_test_db, create_test_db};
    use crate::queue::types::MergePayload;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let config = HubConfig::default();
        Dispatcher::new(create_test_db(), &config.queue).with_policy(RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1000),
            max: Duration::from_millis(60_000),
            jitter: 0.0,
        })
    }

    fn merge_payload() -> MergePayload {
        MergePayload {
            upload_task_id: "abc".into(),
        }
    }

    #[test]
    fn test_enqueue_and_lease() {
        let dispatcher = dispatcher();
        let record_id = dispatcher.enqueue(TaskKind::Merge, &merge_payload()).unwrap();

        let lease = dispatcher
            .dequeue("w1", &[TaskKind::Merge])
            .unwrap()
            .expect("record should be leased");
        assert_eq!(lease.record_id(), record_id);
        assert_eq!(lease.record.state, TaskState::Running);
        assert_eq!(lease.attempt(), 1);
        assert_eq!(
            lease.record.payload_as::<MergePayload>().unwrap(),
            merge_payload()
        );

        // Exclusive: nothing left for a second worker
        assert!(dispatcher.dequeue("w2", &[TaskKind::Merge]).unwrap().is_none());
    }

    #[test]
    fn test_dequeue_respects_capabilities() {
        let dispatcher = dispatcher();
        dispatcher.enqueue(TaskKind::Infer, &json!({})).unwrap();

        assert!(dispatcher.dequeue("w1", &[TaskKind::Merge]).unwrap().is_none());
        assert!(dispatcher.dequeue("w1", &[]).unwrap().is_none());
        assert!(dispatcher
            .dequeue("w1", &[TaskKind::Merge, TaskKind::Infer])
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_fifo_within_kind() {
        let dispatcher = dispatcher();
        let first = dispatcher.enqueue(TaskKind::Convert, &json!({"n": 1})).unwrap();
        let second = dispatcher.enqueue(TaskKind::Convert, &json!({"n": 2})).unwrap();

        let a = dispatcher.dequeue("w", &[TaskKind::Convert]).unwrap().unwrap();
        let b = dispatcher.dequeue("w", &[TaskKind::Convert]).unwrap().unwrap();
        assert_eq!(a.record_id(), first);
        assert_eq!(b.record_id(), second);
    }

    #[test]
    fn test_ack_records_result() {
        let dispatcher = dispatcher();
        let record_id = dispatcher.enqueue(TaskKind::Merge, &merge_payload()).unwrap();
        let lease = dispatcher.dequeue("w1", &[TaskKind::Merge]).unwrap().unwrap();

        dispatcher.ack(&lease, json!({"version_id": 1})).unwrap();

        let record = dispatcher.get(&record_id).unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.result, Some(json!({"version_id": 1})));

        // Second ack with the same lease is rejected
        assert!(matches!(
            dispatcher.ack(&lease, json!(null)),
            Err(HubError::Conflict(_))
        ));
    }

    #[test]
    fn test_retry_backoff_then_permanent_failure() {
        let dispatcher = dispatcher();
        let record_id = dispatcher.enqueue(TaskKind::Infer, &json!({})).unwrap();
        let mut now = now_ms();

        for attempt in 1..=3u32 {
            let lease = dispatcher
                .dequeue_at("w1", &[TaskKind::Infer], now)
                .unwrap()
                .expect("record should be deliverable");
            assert_eq!(lease.attempt(), attempt);

            let state = dispatcher.nack_at(&lease, "engine crashed", true, now).unwrap();
            if attempt < 3 {
                assert_eq!(state, TaskState::Retrying);
                // Not redelivered before the backoff elapses
                assert!(dispatcher
                    .dequeue_at("w1", &[TaskKind::Infer], now + 1)
                    .unwrap()
                    .is_none());
                now += 1000 * 2i64.pow(attempt - 1);
            } else {
                assert_eq!(state, TaskState::Failed);
            }
        }

        assert!(dispatcher
            .dequeue_at("w1", &[TaskKind::Infer], now + 3_600_000)
            .unwrap()
            .is_none());
        let record = dispatcher.get(&record_id).unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.error.as_deref(), Some("engine crashed"));
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let dispatcher = dispatcher();
        dispatcher.enqueue(TaskKind::Merge, &merge_payload()).unwrap();
        let lease = dispatcher.dequeue("w1", &[TaskKind::Merge]).unwrap().unwrap();

        let state = dispatcher.nack(&lease, "checksum mismatch", false).unwrap();
        assert_eq!(state, TaskState::Failed);
    }

    #[test]
    fn test_expired_lease_redelivered_once() {
        let dispatcher = dispatcher();
        let record_id = dispatcher.enqueue(TaskKind::Merge, &merge_payload()).unwrap();
        let now = now_ms();

        let stale = dispatcher.dequeue_at("w1", &[TaskKind::Merge], now).unwrap().unwrap();
        let after_expiry = now + dispatcher.lease_timeout().as_millis() as i64 + 1;

        let reclaimed = dispatcher.reclaim_expired_leases_at(after_expiry).unwrap();
        assert_eq!(reclaimed, vec![record_id.clone()]);
        assert!(dispatcher
            .reclaim_expired_leases_at(after_expiry)
            .unwrap()
            .is_empty());

        let fresh = dispatcher
            .dequeue_at("w2", &[TaskKind::Merge], after_expiry)
            .unwrap()
            .expect("reclaimed record is delivered again");
        assert_eq!(fresh.record_id(), record_id);
        assert_eq!(fresh.attempt(), 2);
        assert!(dispatcher
            .dequeue_at("w3", &[TaskKind::Merge], after_expiry)
            .unwrap()
            .is_none());

        // The abandoned worker can no longer settle the record
        assert!(matches!(
            dispatcher.ack(&stale, json!(null)),
            Err(HubError::Conflict(_))
        ));
        dispatcher.ack(&fresh, json!(null)).unwrap();
    }

    #[test]
    fn test_expiry_exhausts_attempts() {
        let dispatcher = dispatcher();
        let record_id = dispatcher.enqueue(TaskKind::Merge, &merge_payload()).unwrap();
        let step = dispatcher.lease_timeout().as_millis() as i64 + 1;
        let mut now = now_ms();

        for _ in 0..3 {
            dispatcher.dequeue_at("w", &[TaskKind::Merge], now).unwrap().unwrap();
            now += step;
            dispatcher.reclaim_expired_leases_at(now).unwrap();
        }

        let record = dispatcher.get(&record_id).unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert!(record.error.unwrap().contains("expired"));
    }

    #[test]
    fn test_heartbeat_extends_and_reports_cancel() {
        let dispatcher = dispatcher();
        let record_id = dispatcher.enqueue(TaskKind::Convert, &json!({})).unwrap();
        let now = now_ms();
        let lease = dispatcher.dequeue_at("w1", &[TaskKind::Convert], now).unwrap().unwrap();

        let later = now + 10_000;
        let status = dispatcher.heartbeat_at(&lease, later).unwrap();
        assert!(!status.cancel_requested);
        assert!(status.expires_at_ms > lease.expires_at_ms);

        // Not reclaimed at the original expiry because the lease was extended
        let original_expiry = lease.expires_at_ms + 1;
        assert!(dispatcher
            .reclaim_expired_leases_at(original_expiry)
            .unwrap()
            .is_empty());

        assert_eq!(
            dispatcher.request_cancel(&record_id).unwrap(),
            TaskState::Running
        );
        assert!(dispatcher.heartbeat(&lease).unwrap().cancel_requested);
    }

    #[test]
    fn test_cancel_pending_record() {
        let dispatcher = dispatcher();
        let record_id = dispatcher.enqueue(TaskKind::Infer, &json!({})).unwrap();

        assert_eq!(dispatcher.request_cancel(&record_id).unwrap(), TaskState::Failed);
        assert!(dispatcher.dequeue("w", &[TaskKind::Infer]).unwrap().is_none());
        assert_eq!(
            dispatcher.get(&record_id).unwrap().error.as_deref(),
            Some(CANCELLED_MESSAGE)
        );
        assert!(matches!(
            dispatcher.request_cancel("missing"),
            Err(HubError::NotFound(_))
        ));
    }

    #[test]
    fn test_purge_and_pending_count() {
        let dispatcher = dispatcher();
        dispatcher.enqueue(TaskKind::Infer, &json!({})).unwrap();
        dispatcher.enqueue(TaskKind::Merge, &merge_payload()).unwrap();
        assert_eq!(dispatcher.pending_count(None).unwrap(), 2);
        assert_eq!(dispatcher.pending_count(Some(TaskKind::Infer)).unwrap(), 1);

        let lease = dispatcher.dequeue("w", &[TaskKind::Infer]).unwrap().unwrap();
        dispatcher.ack(&lease, json!(null)).unwrap();

        assert_eq!(dispatcher.purge_finished_at(now_ms() + 1).unwrap(), 1);
        assert!(matches!(
            dispatcher.get(lease.record_id()),
            Err(HubError::NotFound(_))
        ));
        assert_eq!(dispatcher.pending_count(None).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_wait_wakes_on_enqueue() {
        let (db, _dir) = create_file_test_db();
        let dispatcher = Dispatcher::new(db, &HubConfig::default().queue);
        let (_tx, mut rx) = watch::channel(false);

        let waiter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .dequeue_wait("w1", &[TaskKind::Merge], &mut rx)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let record_id = dispatcher.enqueue(TaskKind::Merge, &merge_payload()).unwrap();

        let lease = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap()
            .expect("lease");
        assert_eq!(lease.record_id(), record_id);
    }

    #[tokio::test]
    async fn test_dequeue_wait_returns_on_shutdown() {
        let dispatcher = dispatcher();
        let (tx, mut rx) = watch::channel(false);

        let waiter = tokio::spawn(async move {
            dispatcher
                .dequeue_wait("w1", &[TaskKind::Merge], &mut rx)
                .await
        });
        tx.send(true).unwrap();

        let leased = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(leased.is_none());
    }
}
