//! Durable, at-least-once job queue stored in the relational database.
//!
//! Jobs are a closed set ([`Job`]); each kind carries its own payload. A flow
//! parent is held in `waiting-children` until every child is terminal, at which
//! point exactly one conditional update releases it for execution.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, instrument};

mod runner;
mod storage;
mod worker;

pub use runner::{RunHandle, Runner};

/// Backoff never grows past this, however many attempts are configured.
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Error type for queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to (de)serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown job kind {0:?}")]
    UnknownKind(String),

    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// What started a digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPricePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Accepted from older producers only; `url` wins when both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDigestPayload {
    pub trigger_type: TriggerType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestFlowPayload {
    pub trigger_type: TriggerType,
    /// Size of the child set registered with the parent
    pub expected_children: usize,
}

/// Every job this system runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    CheckPrice(CheckPricePayload),
    SendDigest(SendDigestPayload),
    DigestFlow(DigestFlowPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    CheckPrice,
    SendDigest,
    DigestFlow,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckPrice => "check-price",
            Self::SendDigest => "send-digest",
            Self::DigestFlow => "digest-flow",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check-price" => Ok(Self::CheckPrice),
            "send-digest" => Ok(Self::SendDigest),
            "digest-flow" => Ok(Self::DigestFlow),
            other => Err(QueueError::UnknownKind(other.to_string())),
        }
    }
}

impl Job {
    /// A check for `url`, triggered now.
    pub fn check_price(url: impl Into<String>) -> Self {
        Self::CheckPrice(CheckPricePayload {
            url: Some(url.into()),
            product_id: None,
            triggered_at: Utc::now(),
        })
    }

    pub fn send_digest(trigger_type: TriggerType) -> Self {
        Self::SendDigest(SendDigestPayload { trigger_type })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::CheckPrice(_) => JobKind::CheckPrice,
            Self::SendDigest(_) => JobKind::SendDigest,
            Self::DigestFlow(_) => JobKind::DigestFlow,
        }
    }

    fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::CheckPrice(payload) => serde_json::to_string(payload),
            Self::SendDigest(payload) => serde_json::to_string(payload),
            Self::DigestFlow(payload) => serde_json::to_string(payload),
        }
    }

    fn from_parts(kind: &str, payload: &str) -> Result<Self, QueueError> {
        let job = match kind.parse::<JobKind>()? {
            JobKind::CheckPrice => Self::CheckPrice(serde_json::from_str(payload)?),
            JobKind::SendDigest => Self::SendDigest(serde_json::from_str(payload)?),
            JobKind::DigestFlow => Self::DigestFlow(serde_json::from_str(payload)?),
        };
        Ok(job)
    }
}

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    /// Flow parent whose children have not all finished
    WaitingChildren,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A job row as stored in the queue
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub state: JobState,
    /// Attempts started so far, including the running one
    pub attempts: i64,
    pub max_attempts: i64,
    pub parent_id: Option<i64>,
    /// Terminal value of a completed job
    pub result: Option<String>,
    /// Last failure message
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn job(&self) -> Result<Job, QueueError> {
        Job::from_parts(&self.kind, &self.payload)
    }

    pub fn result_value(&self) -> Option<Value> {
        self.result
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn meta(&self) -> JobMeta {
        JobMeta {
            id: self.id,
            attempt: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            max_attempts: u32::try_from(self.max_attempts).unwrap_or(u32::MAX),
            parent_id: self.parent_id,
        }
    }
}

/// Execution context handed to a job handler alongside the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobMeta {
    pub id: i64,
    /// 1-based number of the running attempt
    pub attempt: u32,
    pub max_attempts: u32,
    pub parent_id: Option<i64>,
}

impl JobMeta {
    /// A failure now settles the job as `failed`.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Business logic behind the queue.
///
/// The returned value is stored as the job's terminal result; an error marks
/// the attempt failed.
pub trait JobHandler: Clone + Send + Sync + 'static {
    fn handle(&self, job: Job, meta: JobMeta) -> impl Future<Output = anyhow::Result<Value>> + Send;

    /// Called once the last attempt has failed, before the job is settled.
    /// Runs even when `handle` timed out or panicked.
    fn on_exhausted(
        &self,
        job: Job,
        meta: JobMeta,
        error: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        let _ = (job, meta, error);
        async { Ok(()) }
    }
}

/// How failed attempts are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each later one
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// What happened to a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retrying { run_at: DateTime<Utc> },
    Failed,
}

/// Ids of a submitted flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowHandle {
    pub parent_id: i64,
    pub child_ids: Vec<i64>,
}

/// Handle for submitting and settling jobs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Enqueue a standalone job, runnable immediately.
    #[instrument(name = "queue.enqueue", skip(self, job), fields(job.kind = %job.kind()))]
    pub async fn enqueue(&self, job: &Job) -> Result<i64, QueueError> {
        let payload = job.payload_json()?;
        let mut tx = self.pool.begin().await?;
        let id = storage::insert_job(
            &mut tx,
            storage::NewJob {
                kind: job.kind().as_str(),
                payload: &payload,
                state: JobState::Waiting,
                parent_id: None,
                max_attempts: self.retry.max_attempts,
                result: None,
            },
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        debug!(job.id = id, "Enqueued job");
        Ok(id)
    }

    /// Submit a parent together with its full child set in one transaction.
    ///
    /// No child is visible to workers before all of them are registered, and
    /// the parent only runs once every child is terminal. An empty child set
    /// completes the parent immediately without running it.
    #[instrument(name = "queue.enqueue_flow", skip_all, fields(job.kind = %parent.kind(), children = children.len()))]
    pub async fn enqueue_flow(&self, parent: &Job, children: &[Job]) -> Result<FlowHandle, QueueError> {
        let parent_payload = parent.payload_json()?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let (state, result) = if children.is_empty() {
            (JobState::Completed, Some(r#"{"skipped":true}"#))
        } else {
            (JobState::WaitingChildren, None)
        };

        let parent_id = storage::insert_job(
            &mut tx,
            storage::NewJob {
                kind: parent.kind().as_str(),
                payload: &parent_payload,
                state,
                parent_id: None,
                max_attempts: self.retry.max_attempts,
                result,
            },
            now,
        )
        .await?;

        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            let payload = child.payload_json()?;
            let id = storage::insert_job(
                &mut tx,
                storage::NewJob {
                    kind: child.kind().as_str(),
                    payload: &payload,
                    state: JobState::Waiting,
                    parent_id: Some(parent_id),
                    max_attempts: self.retry.max_attempts,
                    result: None,
                },
                now,
            )
            .await?;
            child_ids.push(id);
        }

        tx.commit().await?;

        info!(flow.id = parent_id, children = child_ids.len(), "Enqueued flow");
        Ok(FlowHandle {
            parent_id,
            child_ids,
        })
    }

    pub async fn job(&self, id: i64) -> Result<Option<JobRecord>, QueueError> {
        Ok(storage::find_job(&self.pool, id).await?)
    }

    pub async fn children(&self, parent_id: i64) -> Result<Vec<JobRecord>, QueueError> {
        Ok(storage::find_children(&self.pool, parent_id).await?)
    }

    /// Jobs not yet terminal, including delayed retries and gated parents.
    pub async fn pending_count(&self) -> Result<i64, QueueError> {
        Ok(storage::pending_job_count(&self.pool).await?)
    }

    /// Number of jobs in each state.
    pub async fn counts(&self) -> Result<HashMap<JobState, i64>, QueueError> {
        Ok(storage::job_counts(&self.pool).await?.into_iter().collect())
    }

    /// Return jobs whose lock expired (abandoned by a crashed or stuck worker)
    /// to the waiting state. The abandoned run still counts as an attempt.
    pub async fn recover_stale(&self) -> Result<u64, QueueError> {
        let recovered = storage::reset_stale_jobs(&self.pool, Utc::now()).await?;
        if recovered > 0 {
            info!(recovered, "Recovered abandoned jobs");
        }
        Ok(recovered)
    }

    /// Lock the next runnable job for `lock_for`, counting a new attempt.
    pub(crate) async fn claim_next(&self, lock_for: Duration) -> Result<Option<JobRecord>, QueueError> {
        let now = Utc::now();
        let locked_until = now + to_chrono(lock_for);
        Ok(storage::claim_next_job(&self.pool, now, locked_until).await?)
    }

    /// Record a successful run and release the flow parent if this was its
    /// last outstanding child.
    pub(crate) async fn complete(&self, record: &JobRecord, result: &Value) -> Result<(), QueueError> {
        let result = serde_json::to_string(result)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        storage::mark_completed(&mut tx, record.id, &result, now).await?;
        if let Some(parent_id) = record.parent_id {
            storage::release_parent(&mut tx, parent_id, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record a failed attempt: schedule a retry with backoff, or settle the
    /// job as failed (releasing its flow parent) once attempts are exhausted.
    pub(crate) async fn fail(&self, record: &JobRecord, error: &str) -> Result<Disposition, QueueError> {
        let meta = record.meta();
        let now = Utc::now();

        if !meta.is_final_attempt() {
            let delay = self.retry.backoff_after(meta.attempt);
            let run_at = now + to_chrono(delay);
            storage::schedule_retry(&self.pool, record.id, error, run_at, now).await?;
            return Ok(Disposition::Retrying { run_at });
        }

        let mut tx = self.pool.begin().await?;
        storage::mark_failed(&mut tx, record.id, error, now).await?;
        if let Some(parent_id) = record.parent_id {
            storage::release_parent(&mut tx, parent_id, now).await?;
        }
        tx.commit().await?;
        Ok(Disposition::Failed)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_BACKOFF * 24)).unwrap_or_else(|_| chrono::Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_database;

    fn queue(pool: &SqlitePool, max_attempts: u32) -> JobQueue {
        JobQueue::new(
            pool.clone(),
            RetryPolicy {
                max_attempts,
                backoff: Duration::ZERO,
            },
        )
    }

    const LOCK: Duration = Duration::from_secs(60);

    #[test]
    fn payloads_use_camel_case_wire_names() {
        let payload: CheckPricePayload = serde_json::from_str(
            r#"{"productId":"17","triggeredAt":"2024-05-01T09:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(payload.url, None);
        assert_eq!(payload.product_id.as_deref(), Some("17"));

        let digest = serde_json::to_string(&SendDigestPayload {
            trigger_type: TriggerType::Scheduled,
        })
        .unwrap();
        assert_eq!(digest, r#"{"triggerType":"scheduled"}"#);
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        assert!(matches!(
            Job::from_parts("reindex", "{}"),
            Err(QueueError::UnknownKind(kind)) if kind == "reindex"
        ));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_secs(30),
        };
        assert_eq!(policy.backoff_after(1), Duration::from_secs(30));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(60));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(120));
        assert_eq!(policy.backoff_after(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn claimed_jobs_are_not_claimed_twice() {
        let (_dir, db) = temp_database().await;
        let queue = queue(db.pool(), 3);

        let id = queue.enqueue(&Job::check_price("https://shop.example/a")).await.unwrap();

        let claimed = queue.claim_next(LOCK).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.job().unwrap().kind(), JobKind::CheckPrice);

        assert!(queue.claim_next(LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failures_retry_until_attempts_are_exhausted() {
        let (_dir, db) = temp_database().await;
        let queue = queue(db.pool(), 2);
        let id = queue.enqueue(&Job::check_price("https://shop.example/a")).await.unwrap();

        let first = queue.claim_next(LOCK).await.unwrap().unwrap();
        assert!(matches!(
            queue.fail(&first, "FETCH_ERROR: boom").await.unwrap(),
            Disposition::Retrying { .. }
        ));

        let second = queue.claim_next(LOCK).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(queue.fail(&second, "FETCH_ERROR: boom").await.unwrap(), Disposition::Failed);

        let record = queue.job(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error.as_deref(), Some("FETCH_ERROR: boom"));
        assert!(record.finished_at.is_some());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flow_parent_waits_for_every_child() {
        let (_dir, db) = temp_database().await;
        let queue = queue(db.pool(), 1);

        let parent = Job::DigestFlow(DigestFlowPayload {
            trigger_type: TriggerType::Manual,
            expected_children: 2,
        });
        let children = [
            Job::check_price("https://shop.example/a"),
            Job::check_price("https://shop.example/b"),
        ];
        let flow = queue.enqueue_flow(&parent, &children).await.unwrap();

        let first = queue.claim_next(LOCK).await.unwrap().unwrap();
        let second = queue.claim_next(LOCK).await.unwrap().unwrap();
        assert_eq!(first.parent_id, Some(flow.parent_id));
        assert_eq!(second.parent_id, Some(flow.parent_id));

        // The parent is gated while a child is still running
        assert!(queue.claim_next(LOCK).await.unwrap().is_none());

        queue.complete(&first, &serde_json::json!({"ok": true})).await.unwrap();
        assert_eq!(
            queue.job(flow.parent_id).await.unwrap().unwrap().state,
            JobState::WaitingChildren
        );

        // A terminally failed child still counts as finished
        assert_eq!(queue.fail(&second, "TIMEOUT").await.unwrap(), Disposition::Failed);

        let parent = queue.claim_next(LOCK).await.unwrap().unwrap();
        assert_eq!(parent.id, flow.parent_id);
        assert_eq!(parent.kind, "digest-flow");
        assert!(queue.claim_next(LOCK).await.unwrap().is_none());

        let children = queue.children(flow.parent_id).await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.state.is_terminal()));
    }

    #[tokio::test]
    async fn empty_flow_completes_without_running() {
        let (_dir, db) = temp_database().await;
        let queue = queue(db.pool(), 3);

        let parent = Job::DigestFlow(DigestFlowPayload {
            trigger_type: TriggerType::Scheduled,
            expected_children: 0,
        });
        let flow = queue.enqueue_flow(&parent, &[]).await.unwrap();

        assert!(flow.child_ids.is_empty());
        assert_eq!(
            queue.job(flow.parent_id).await.unwrap().unwrap().state,
            JobState::Completed
        );
        assert!(queue.claim_next(LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_locks_are_recovered() {
        let (_dir, db) = temp_database().await;
        let queue = queue(db.pool(), 3);
        let id = queue.enqueue(&Job::send_digest(TriggerType::Manual)).await.unwrap();

        let abandoned = queue.claim_next(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(abandoned.id, id);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.recover_stale().await.unwrap(), 1);

        let retried = queue.claim_next(LOCK).await.unwrap().unwrap();
        assert_eq!(retried.id, id);
        assert_eq!(retried.attempts, 2);
        assert_eq!(queue.counts().await.unwrap().get(&JobState::Active), Some(&1));
    }
}
