use super::models::{QueueJob, QueueJobStatus};
use crate::config::{QueueSettings, QueueTuning};
use crate::error::{EngineError, EngineResult};
use crate::inventory::{EnqueueOutcome, InventoryDb};
use crate::utils::{now_millis, now_secs};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Back to waiting, due after the delay
    Retry(Duration),
    /// No more attempts
    Failed,
}

/// Durable, at-least-once queue backed by the `queue_jobs` table.
///
/// Entries are keyed by a caller-chosen id that doubles as the
/// de-duplication key. Delivery is at-least-once: a crash between claim and
/// completion leaves the entry active until [`JobQueue::recover_stalled`]
/// returns it to waiting, so handlers must be idempotent or resumable.
pub struct JobQueue {
    name: String,
    db: Arc<InventoryDb>,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    wakeup: Notify,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, db: Arc<InventoryDb>, tuning: QueueTuning, settings: &QueueSettings) -> Self {
        Self {
            name: name.into(),
            db,
            max_attempts: tuning.max_attempts.max(1),
            backoff_base: settings.backoff_base(),
            backoff_max: settings.backoff_max(),
            wakeup: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Enqueue a payload under `id`. Adding an id that is already waiting or
    /// active is a no-op. A failed or completed entry is reset and reused.
    pub fn add<T: Serialize>(&self, id: &str, payload: &T) -> EngineResult<String> {
        let payload = serde_json::to_value(payload).map_err(anyhow::Error::from)?;
        let now = now_secs();
        let job = QueueJob {
            id: id.to_string(),
            queue: self.name.clone(),
            payload,
            status: QueueJobStatus::Waiting,
            attempts_made: 0,
            max_attempts: self.max_attempts,
            run_at: now_millis(),
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        match self.db.enqueue_queue_job(&job)? {
            EnqueueOutcome::Duplicate => {
                tracing::debug!(target: "tasks::queue", queue = %self.name, job_id = %id, "Job already queued");
            }
            outcome => {
                tracing::debug!(target: "tasks::queue", queue = %self.name, job_id = %id, ?outcome, "Job enqueued");
                self.wakeup.notify_one();
            }
        }
        Ok(id.to_string())
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<QueueJob>> {
        Ok(self.db.get_queue_job(id)?)
    }

    /// Atomically claim the oldest due entry
    pub fn claim_next(&self) -> EngineResult<Option<QueueJob>> {
        Ok(self.db.claim_next_queue_job(&self.name, now_millis())?)
    }

    pub fn complete(&self, id: &str) -> EngineResult<()> {
        self.db.delete_queue_job(id)?;
        Ok(())
    }

    /// Schedule another attempt if the error allows it and attempts remain,
    /// otherwise mark the entry failed.
    pub fn fail_attempt(&self, job: &QueueJob, error: &EngineError) -> EngineResult<AttemptOutcome> {
        let message = error.to_string();
        if error.is_retryable() && job.attempts_left() {
            let delay = self.backoff_delay(job.attempts_made);
            let run_at = now_millis() + delay.as_millis() as i64;
            self.db.reschedule_queue_job(&job.id, run_at, &message)?;
            tracing::warn!(
                target: "tasks::queue",
                queue = %self.name,
                job_id = %job.id,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Job attempt failed, retrying"
            );
            Ok(AttemptOutcome::Retry(delay))
        } else {
            self.db.fail_queue_job(&job.id, &message)?;
            tracing::error!(
                target: "tasks::queue",
                queue = %self.name,
                job_id = %job.id,
                attempt = job.attempts_made,
                error = %message,
                "Job failed permanently"
            );
            Ok(AttemptOutcome::Failed)
        }
    }

    /// `min(base * 2^(attempt-1), max)` for a 1-based attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Return entries a dead process left active to waiting
    pub fn recover_stalled(&self) -> EngineResult<usize> {
        let recovered = self.db.reset_active_queue_jobs(&self.name)?;
        if recovered > 0 {
            tracing::info!(target: "tasks::queue", queue = %self.name, recovered, "Recovered stalled jobs");
            self.wakeup.notify_one();
        }
        Ok(recovered)
    }

    /// Remove an entry that no worker has claimed yet
    pub fn remove_waiting(&self, id: &str) -> EngineResult<bool> {
        Ok(self.db.remove_waiting_queue_job(id)?)
    }

    /// User-invoked retry of a permanently failed entry
    pub fn retry_failed(&self, id: &str) -> EngineResult<bool> {
        let retried = self.db.retry_failed_queue_job(id, now_millis())?;
        if retried {
            tracing::info!(target: "tasks::queue", queue = %self.name, job_id = %id, "Failed job re-queued");
            self.wakeup.notify_one();
        }
        Ok(retried)
    }

    pub fn count(&self, status: QueueJobStatus) -> EngineResult<i64> {
        Ok(self.db.count_queue_jobs(&self.name, status)?)
    }

    /// Resolves when something was added to the queue
    pub(crate) async fn notified(&self) {
        self.wakeup.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::inventory::test_support::temp_db;
    use serde_json::json;

    fn queue(db: Arc<InventoryDb>, max_attempts: u32) -> JobQueue {
        let settings = QueueSettings {
            backoff_base_ms: 0,
            ..QueueSettings::default()
        };
        JobQueue::new(
            "test",
            db,
            QueueTuning {
                concurrency: 1,
                max_attempts,
            },
            &settings,
        )
    }

    fn provider_error() -> EngineError {
        ProviderError::new("local", "unreachable").into()
    }

    #[test]
    fn test_add_deduplicates_live_entries() {
        let (db, _dir) = temp_db();
        let q = queue(db, 3);

        q.add("sync-p1", &json!({"n": 1})).unwrap();
        q.add("sync-p1", &json!({"n": 2})).unwrap();
        assert_eq!(q.count(QueueJobStatus::Waiting).unwrap(), 1);

        // The original payload wins while the entry is live
        let job = q.claim_next().unwrap().unwrap();
        assert_eq!(job.payload, json!({"n": 1}));
        assert_eq!(job.attempts_made, 1);

        q.add("sync-p1", &json!({"n": 3})).unwrap();
        assert_eq!(q.count(QueueJobStatus::Waiting).unwrap(), 0);
        assert!(q.claim_next().unwrap().is_none());
    }

    #[test]
    fn test_retry_until_attempts_exhausted() {
        let (db, _dir) = temp_db();
        let q = queue(db, 2);
        q.add("job", &json!({})).unwrap();

        let first = q.claim_next().unwrap().unwrap();
        assert!(matches!(q.fail_attempt(&first, &provider_error()).unwrap(), AttemptOutcome::Retry(_)));

        let second = q.claim_next().unwrap().unwrap();
        assert_eq!(second.attempts_made, 2);
        assert_eq!(q.fail_attempt(&second, &provider_error()).unwrap(), AttemptOutcome::Failed);

        let stored = q.get("job").unwrap().unwrap();
        assert_eq!(stored.status, QueueJobStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("local provider error: unreachable"));

        // A failed entry is reset by a new add
        q.add("job", &json!({"again": true})).unwrap();
        let reset = q.get("job").unwrap().unwrap();
        assert_eq!(reset.status, QueueJobStatus::Waiting);
        assert_eq!(reset.attempts_made, 0);
    }

    #[test]
    fn test_validation_errors_are_not_retried() {
        let (db, _dir) = temp_db();
        let q = queue(db, 5);
        q.add("job", &json!({})).unwrap();

        let job = q.claim_next().unwrap().unwrap();
        let outcome = q.fail_attempt(&job, &EngineError::validation("bad input")).unwrap();
        assert_eq!(outcome, AttemptOutcome::Failed);

        assert!(q.retry_failed("job").unwrap());
        assert_eq!(q.claim_next().unwrap().unwrap().attempts_made, 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let (db, _dir) = temp_db();
        let q = JobQueue::new(
            "test",
            db,
            QueueTuning {
                concurrency: 1,
                max_attempts: 3,
            },
            &QueueSettings {
                backoff_base_ms: 1_000,
                backoff_max_ms: 5_000,
                ..QueueSettings::default()
            },
        );
        assert_eq!(q.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(q.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(q.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(q.backoff_delay(4), Duration::from_secs(5));
        assert_eq!(q.backoff_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_recover_stalled_and_remove_waiting() {
        let (db, _dir) = temp_db();
        let q = queue(db, 3);
        q.add("a", &json!({})).unwrap();
        q.add("b", &json!({})).unwrap();

        let claimed = q.claim_next().unwrap().unwrap();
        assert!(!q.remove_waiting(&claimed.id).unwrap());
        assert_eq!(q.recover_stalled().unwrap(), 1);
        assert_eq!(q.count(QueueJobStatus::Waiting).unwrap(), 2);

        assert!(q.remove_waiting("b").unwrap());
        q.complete("a").unwrap();
        assert!(q.get("a").unwrap().is_none());
    }
}
