use anyhow::Result;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

use super::{ScheduleError, ScheduleSettings, describe, load_schedule, parse_pattern};
use crate::database::Database;
use crate::queue::{Job, JobQueue, TriggerType};

/// Day names understood by the cron parser, indexed by ISO weekday - 1.
const CRON_DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Convert a five-field trigger pattern to the scheduler's six-field form
/// (seconds first, weekdays by name).
pub fn to_scheduler_expression(pattern: &str) -> Result<String, ScheduleError> {
    let parsed = parse_pattern(pattern).ok_or_else(|| ScheduleError::InvalidPattern(pattern.to_string()))?;
    let day = match parsed.day_of_week {
        Some(day) => CRON_DAYS[(day - 1) as usize],
        None => "*",
    };
    Ok(format!("0 {} {} * * {day}", parsed.minute, parsed.hour))
}

struct Registered {
    id: Uuid,
    pattern: String,
}

/// Keeps one recurring job registered that enqueues a scheduled digest.
pub struct DigestScheduler {
    scheduler: JobScheduler,
    queue: JobQueue,
    registered: Mutex<Option<Registered>>,
}

impl DigestScheduler {
    pub async fn new(queue: JobQueue) -> Result<Self> {
        Ok(Self {
            scheduler: JobScheduler::new().await?,
            queue,
            registered: Mutex::new(None),
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await?;
        Ok(())
    }

    /// Pattern currently registered, if any.
    pub async fn pattern(&self) -> Option<String> {
        self.registered.lock().await.as_ref().map(|r| r.pattern.clone())
    }

    #[cfg(test)]
    async fn registered_id(&self) -> Option<Uuid> {
        self.registered.lock().await.as_ref().map(|r| r.id)
    }

    /// Replace the registered trigger with one for `settings`.
    ///
    /// Invalid settings are rejected before the current trigger is touched.
    pub async fn reschedule(&self, settings: &ScheduleSettings) -> Result<()> {
        let pattern = settings.to_trigger_pattern()?;
        let mut registered = self.registered.lock().await;

        if registered.as_ref().is_some_and(|r| r.pattern == pattern) {
            return Ok(());
        }

        let expression = to_scheduler_expression(&pattern)?;
        let queue = self.queue.clone();
        let job = CronJob::new_async(expression.as_str(), move |_uuid, _l| {
            let queue = queue.clone();
            Box::pin(async move {
                match queue.enqueue(&Job::send_digest(TriggerType::Scheduled)).await {
                    Ok(id) => info!(job.id = id, "Enqueued scheduled digest"),
                    Err(e) => error!("Failed to enqueue scheduled digest: {}", e),
                }
            })
        })?;
        let id = self.scheduler.add(job).await?;

        if let Some(previous) = registered.take() {
            self.scheduler.remove(&previous.id).await?;
        }

        info!(%pattern, "Digest schedule set: {}", describe(&pattern));
        *registered = Some(Registered { id, pattern });
        Ok(())
    }

    /// Pick up schedule changes written to the settings store.
    pub async fn sync_from_settings(&self, db: &Database) -> Result<()> {
        let settings = load_schedule(db).await?;
        self.reschedule(&settings).await
    }
}
