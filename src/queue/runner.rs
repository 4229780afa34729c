use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

use super::worker::Worker;
use super::{JobHandler, JobQueue};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Spawns workers that claim and run jobs from a [`JobQueue`]
pub struct Runner<H> {
    queue: JobQueue,
    handler: H,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    job_timeout: Duration,
    shutdown_when_queue_empty: bool,
}

impl<H> std::fmt::Debug for Runner<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("job_timeout", &self.job_timeout)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<H: JobHandler> Runner<H> {
    pub fn new(queue: JobQueue, handler: H) -> Self {
        Self {
            queue,
            handler,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            shutdown_when_queue_empty: false,
        }
    }

    /// Set the number of concurrent workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to poll intervals.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the upper bound on a single attempt. An attempt running longer is
    /// abandoned and counted as failed.
    pub fn job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// Stop the workers once no job is left outstanding.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start the workers.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the workers to shut down.
    pub fn start(&self) -> RunHandle {
        let handles = (1..=self.num_workers)
            .map(|i| {
                let name = format!("price-worker-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    queue: self.queue.clone(),
                    handler: self.handler.clone(),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: self.poll_interval,
                    jitter: self.jitter,
                    job_timeout: self.job_timeout,
                };

                let span = info_span!("worker", worker.name = %name);
                tokio::spawn(async move { worker.run().instrument(span).await })
            })
            .collect();

        RunHandle { handles }
    }
}

/// Handle to the running workers
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result
                && error.is_panic()
            {
                warn!(%error, "Worker task panicked");
            }
        });
    }

    /// Stop every worker at its next await point.
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::database::test_support::temp_database;
    use crate::queue::{Job, JobMeta, JobState, RetryPolicy, TriggerType};

    #[derive(Clone, Default)]
    struct Flaky {
        calls: Arc<AtomicUsize>,
    }

    impl JobHandler for Flaky {
        async fn handle(&self, _job: Job, meta: JobMeta) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if meta.attempt < 2 {
                anyhow::bail!("FETCH_ERROR: connection reset");
            }
            Ok(json!({ "attempt": meta.attempt }))
        }
    }

    #[derive(Clone)]
    struct Panicking;

    impl JobHandler for Panicking {
        async fn handle(&self, _job: Job, _meta: JobMeta) -> anyhow::Result<Value> {
            panic!("boom");
        }
    }

    fn fast<H: JobHandler>(runner: Runner<H>) -> Runner<H> {
        runner
            .num_workers(2)
            .poll_interval(Duration::from_millis(10))
            .jitter(Duration::ZERO)
            .shutdown_when_queue_empty()
    }

    #[tokio::test]
    async fn failed_attempts_are_retried() {
        let (_dir, db) = temp_database().await;
        let queue = JobQueue::new(
            db.pool().clone(),
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::ZERO,
            },
        );
        let id = queue.enqueue(&Job::send_digest(TriggerType::Manual)).await.unwrap();

        let handler = Flaky::default();
        fast(Runner::new(queue.clone(), handler.clone()))
            .start()
            .wait_for_shutdown()
            .await;

        let record = queue.job(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.result_value(), Some(json!({ "attempt": 2 })));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panics_settle_the_job_as_failed() {
        let (_dir, db) = temp_database().await;
        let queue = JobQueue::new(
            db.pool().clone(),
            RetryPolicy {
                max_attempts: 1,
                backoff: Duration::ZERO,
            },
        );
        let id = queue.enqueue(&Job::send_digest(TriggerType::Manual)).await.unwrap();

        fast(Runner::new(queue.clone(), Panicking))
            .start()
            .wait_for_shutdown()
            .await;

        let record = queue.job(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error.as_deref(), Some("job panicked: boom"));
    }
}
