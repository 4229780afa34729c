use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use rand::Rng;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

use super::{Disposition, Job, JobHandler, JobMeta, JobQueue, JobRecord};

/// Extra lock time on top of the job timeout, so a job that times out is
/// settled by its own worker before the lock can be considered stale.
const LOCK_GRACE: Duration = Duration::from_secs(30);

pub(crate) struct Worker<H> {
    pub(crate) queue: JobQueue,
    pub(crate) handler: H,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) job_timeout: Duration,
}

impl<H: JobHandler> Worker<H> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run jobs forever, or until nothing is left outstanding if
    /// `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if self.shutdown_when_queue_empty && self.queue_drained().await {
                        debug!("No outstanding jobs. Shutting down the worker…");
                        break;
                    }
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No runnable jobs found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error:#}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Gated flow parents and delayed retries keep the worker alive.
    async fn queue_drained(&self) -> bool {
        match self.queue.pending_count().await {
            Ok(pending) => pending == 0,
            Err(error) => {
                warn!("Failed to count pending jobs: {error}");
                false
            }
        }
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were runnable
    /// - `Err(...)` if the job could not be claimed or settled
    async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        trace!("Looking for next job…");

        let Some(record) = self.queue.claim_next(self.job_timeout + LOCK_GRACE).await? else {
            return Ok(None);
        };

        let span = info_span!(
            "job",
            job.id = record.id,
            job.kind = %record.kind,
            job.attempt = record.attempts,
        );

        self.execute(record).instrument(span).await.map(Some)
    }

    async fn execute(&self, record: JobRecord) -> anyhow::Result<i64> {
        let job_id = record.id;
        let meta = record.meta();
        let job = record.job();

        if meta.attempt > meta.max_attempts {
            warn!("Job was abandoned on its final attempt");
            let message = "attempts exhausted: job abandoned by a previous worker";
            if let Ok(job) = job {
                self.exhausted(job, meta, message).await;
            }
            self.queue.fail(&record, message).await?;
            return Ok(job_id);
        }

        debug!("Running job…");

        let result = match &job {
            Ok(job) => {
                let run = AssertUnwindSafe(self.handler.handle(job.clone(), meta)).catch_unwind();
                match tokio::time::timeout(self.job_timeout, run).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(anyhow!("job panicked: {}", panic_message(&*panic))),
                    Err(_) => Err(anyhow!("TIMEOUT: job exceeded {:?}", self.job_timeout)),
                }
            }
            Err(error) => Err(anyhow!("{error}")),
        };

        match result {
            Ok(value) => {
                debug!("Completing job…");
                self.queue.complete(&record, &value).await?;
            }
            Err(error) => {
                let message = format!("{error:#}");
                if meta.is_final_attempt()
                    && let Ok(job) = job
                {
                    self.exhausted(job, meta, &message).await;
                }

                match self.queue.fail(&record, &message).await? {
                    Disposition::Retrying { run_at } => {
                        warn!(%run_at, "Job failed, retrying: {message}");
                    }
                    Disposition::Failed => {
                        error!("Job failed permanently: {message}");
                    }
                }
            }
        }

        Ok(job_id)
    }

    /// Give the handler a chance to record the final failure. Runs before the
    /// job is settled, so a flow parent never sees a child without it.
    async fn exhausted(&self, job: Job, meta: JobMeta, message: &str) {
        let hook = AssertUnwindSafe(self.handler.on_exhausted(job, meta, message)).catch_unwind();
        match tokio::time::timeout(LOCK_GRACE, hook).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(error))) => warn!("Failed to record exhausted job: {error:#}"),
            Ok(Err(panic)) => warn!("Exhausted-job hook panicked: {}", panic_message(&*panic)),
            Err(_) => warn!("Exhausted-job hook timed out"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
