use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::{JobRecord, JobState};

const JOB_COLUMNS: &str =
    "id, kind, payload, state, attempts, max_attempts, parent_id, result, error, created_at, finished_at";

pub(crate) struct NewJob<'a> {
    pub(crate) kind: &'a str,
    pub(crate) payload: &'a str,
    pub(crate) state: JobState,
    pub(crate) parent_id: Option<i64>,
    pub(crate) max_attempts: u32,
    pub(crate) result: Option<&'a str>,
}

pub(crate) async fn insert_job(
    tx: &mut Transaction<'_, Sqlite>,
    job: NewJob<'_>,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let finished_at = job.state.is_terminal().then_some(now);

    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO jobs (kind, payload, state, attempts, max_attempts, run_at, parent_id, result,
                          created_at, updated_at, finished_at)
        VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?5, ?5, ?8)
        RETURNING id
        ",
    )
    .bind(job.kind)
    .bind(job.payload)
    .bind(job.state)
    .bind(i64::from(job.max_attempts))
    .bind(now)
    .bind(job.parent_id)
    .bind(job.result)
    .bind(finished_at)
    .fetch_one(&mut **tx)
    .await
}

/// Atomically moves the oldest runnable job to `active` and counts the attempt.
///
/// Selection and update happen in one statement, so two workers can never
/// claim the same row.
pub(crate) async fn claim_next_job(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    locked_until: DateTime<Utc>,
) -> Result<Option<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>(&format!(
        r"
        UPDATE jobs
        SET state = 'active', attempts = attempts + 1, locked_until = ?1, updated_at = ?2
        WHERE id = (
            SELECT id FROM jobs
            WHERE state = 'waiting' AND run_at <= ?2
            ORDER BY run_at ASC, id ASC
            LIMIT 1
        )
        RETURNING {JOB_COLUMNS}
        "
    ))
    .bind(locked_until)
    .bind(now)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn mark_completed(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: i64,
    result: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE jobs
        SET state = 'completed', result = ?1, error = NULL, locked_until = NULL,
            finished_at = ?2, updated_at = ?2
        WHERE id = ?3 AND state = 'active'
        ",
    )
    .bind(result)
    .bind(now)
    .bind(job_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Puts a failed job back in line, runnable again at `run_at`.
pub(crate) async fn schedule_retry(
    pool: &SqlitePool,
    job_id: i64,
    error: &str,
    run_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE jobs
        SET state = 'waiting', error = ?1, run_at = ?2, locked_until = NULL, updated_at = ?3
        WHERE id = ?4 AND state = 'active'
        ",
    )
    .bind(error)
    .bind(run_at)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn mark_failed(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE jobs
        SET state = 'failed', error = ?1, result = NULL, locked_until = NULL,
            finished_at = ?2, updated_at = ?2
        WHERE id = ?3 AND state = 'active'
        ",
    )
    .bind(error)
    .bind(now)
    .bind(job_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Makes a flow parent runnable once none of its children is outstanding.
///
/// Only the first caller to observe the last terminal child gets a row back,
/// which is what makes the parent run once.
pub(crate) async fn release_parent(
    tx: &mut Transaction<'_, Sqlite>,
    parent_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let released = sqlx::query(
        r"
        UPDATE jobs
        SET state = 'waiting', run_at = ?1, updated_at = ?1
        WHERE id = ?2
          AND state = 'waiting-children'
          AND NOT EXISTS (
              SELECT 1 FROM jobs
              WHERE parent_id = ?2 AND state NOT IN ('completed', 'failed')
          )
        ",
    )
    .bind(now)
    .bind(parent_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    Ok(released == 1)
}

/// Returns every expired `active` job to `waiting`.
pub(crate) async fn reset_stale_jobs(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET state = 'waiting', locked_until = NULL, run_at = ?1, updated_at = ?1
        WHERE state = 'active' AND locked_until < ?1
        ",
    )
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn find_job(pool: &SqlitePool, job_id: i64) -> Result<Option<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn find_children(pool: &SqlitePool, parent_id: i64) -> Result<Vec<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE parent_id = ? ORDER BY id ASC"
    ))
    .bind(parent_id)
    .fetch_all(pool)
    .await
}

/// The number of jobs that have not reached a terminal state
pub(crate) async fn pending_job_count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM jobs WHERE state NOT IN ('completed', 'failed')",
    )
    .fetch_one(pool)
    .await
}

pub(crate) async fn job_counts(pool: &SqlitePool) -> Result<Vec<(JobState, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (JobState, i64)>("SELECT state, COUNT(*) FROM jobs GROUP BY state")
        .fetch_all(pool)
        .await
}
