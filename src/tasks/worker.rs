use super::models::QueueJob;
use super::queue::{AttemptOutcome, JobQueue};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// A claimed queue entry as seen by a handler
pub struct JobContext {
    job: QueueJob,
}

impl JobContext {
    pub fn new(job: QueueJob) -> Self {
        Self { job }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn payload<T: DeserializeOwned>(&self) -> EngineResult<T> {
        self.job.payload_as()
    }

    /// 1-based number of the current attempt
    pub fn attempts_made(&self) -> u32 {
        self.job.attempts_made
    }

    pub fn max_attempts(&self) -> u32 {
        self.job.max_attempts
    }

    pub fn job(&self) -> &QueueJob {
        &self.job
    }
}

/// Processes entries of one queue. Called at least once per entry, so
/// implementations must be idempotent or resumable.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &JobContext) -> EngineResult<()>;

    /// Called after a failed attempt once the queue has decided whether to retry
    async fn on_failed(&self, _ctx: &JobContext, _error: &EngineError, _will_retry: bool) {}
}

/// Bounded pool of consumers for one queue
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Run the pool until `shutdown` fires, then wait for in-flight handlers
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let queue_name = self.queue.name().to_string();
        tracing::info!(target: "tasks::worker", queue = %queue_name, concurrency = self.concurrency, "Worker pool started");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(result) = in_flight.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(target: "tasks::worker", queue = %queue_name, error = %e, "Job handler panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.claim_next() {
                Ok(Some(job)) => {
                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        process(queue, handler, job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.queue.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(target: "tasks::worker", queue = %queue_name, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            tracing::info!(target: "tasks::worker", queue = %queue_name, draining, "Waiting for in-flight jobs");
        }
        while in_flight.join_next().await.is_some() {}
        tracing::info!(target: "tasks::worker", queue = %queue_name, "Worker pool stopped");
    }
}

async fn process(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, job: QueueJob) {
    let ctx = JobContext::new(job);
    tracing::info!(
        target: "tasks::worker",
        queue = %queue.name(),
        job_id = %ctx.id(),
        attempt = ctx.attempts_made(),
        "Starting job"
    );

    match handler.handle(&ctx).await {
        Ok(()) => {
            tracing::info!(target: "tasks::worker", queue = %queue.name(), job_id = %ctx.id(), "Job completed");
            if let Err(e) = queue.complete(ctx.id()) {
                tracing::error!(target: "tasks::worker", job_id = %ctx.id(), error = %e, "Failed to remove completed job");
            }
        }
        Err(err) => match queue.fail_attempt(ctx.job(), &err) {
            Ok(outcome) => {
                let will_retry = matches!(outcome, AttemptOutcome::Retry(_));
                handler.on_failed(&ctx, &err, will_retry).await;
            }
            Err(e) => {
                tracing::error!(target: "tasks::worker", job_id = %ctx.id(), error = %e, "Failed to record job failure");
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueSettings, QueueTuning};
    use crate::error::ProviderError;
    use crate::inventory::test_support::temp_db;
    use crate::tasks::QueueJobStatus;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(db: Arc<crate::inventory::InventoryDb>, max_attempts: u32) -> Arc<JobQueue> {
        Arc::new(JobQueue::new(
            "test",
            db,
            QueueTuning {
                concurrency: 2,
                max_attempts,
            },
            &QueueSettings {
                backoff_base_ms: 0,
                ..QueueSettings::default()
            },
        ))
    }

    /// Fails the first attempt of every job, records retry decisions
    #[derive(Default)]
    struct FlakyHandler {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        failures: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, ctx: &JobContext) -> EngineResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if ctx.attempts_made() == 1 {
                return Err(ProviderError::new("memory", "transient").into());
            }
            Ok(())
        }

        async fn on_failed(&self, ctx: &JobContext, _error: &EngineError, will_retry: bool) {
            self.failures.lock().unwrap().push((ctx.id().to_string(), will_retry));
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_pool_retries_and_bounds_concurrency() {
        let (db, _dir) = temp_db();
        let q = queue(db, 3);
        let handler = Arc::new(FlakyHandler::default());
        for i in 0..4 {
            q.add(&format!("job-{}", i), &json!({"i": i})).unwrap();
        }

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(q.clone(), handler.clone(), 2, Duration::from_millis(10)).spawn(shutdown.clone());

        wait_until(|| handler.calls.load(Ordering::SeqCst) >= 8).await;
        wait_until(|| q.count(QueueJobStatus::Waiting).unwrap() == 0 && q.count(QueueJobStatus::Active).unwrap() == 0)
            .await;

        shutdown.cancel();
        pool.await.unwrap();

        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        let failures = handler.failures.lock().unwrap();
        assert_eq!(failures.len(), 4);
        assert!(failures.iter().all(|(_, will_retry)| *will_retry));
        for i in 0..4 {
            assert!(q.get(&format!("job-{}", i)).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_final_failure_is_reported() {
        let (db, _dir) = temp_db();
        let q = queue(db, 1);
        let handler = Arc::new(FlakyHandler::default());
        q.add("only", &json!({})).unwrap();

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(q.clone(), handler.clone(), 1, Duration::from_millis(10)).spawn(shutdown.clone());
        wait_until(|| !handler.failures.lock().unwrap().is_empty()).await;
        shutdown.cancel();
        pool.await.unwrap();

        assert_eq!(handler.failures.lock().unwrap()[0], ("only".to_string(), false));
        assert_eq!(q.get("only").unwrap().unwrap().status, QueueJobStatus::Failed);
    }
}
