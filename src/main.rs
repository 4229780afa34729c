use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use price_watch::config::Config;
use price_watch::database::Database;
use price_watch::digest::DigestDispatcher;
use price_watch::mailer;
use price_watch::queue::{Job, JobQueue, RetryPolicy, Runner, TriggerType};
use price_watch::schedule::DigestScheduler;
use price_watch::scraper::Scraper;
use price_watch::tracker::PriceTracker;

/// How often the stored schedule is re-read for changes.
const SCHEDULE_SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let database = Database::connect(&config.database_url).await?;
    let queue = JobQueue::new(
        database.pool().clone(),
        RetryPolicy {
            max_attempts: config.job_max_attempts,
            backoff: config.job_backoff,
        },
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] => run(config, database, queue).await,
        ["check", url] => {
            url::Url::parse(url).with_context(|| format!("invalid url {url:?}"))?;
            let id = queue.enqueue(&Job::check_price(*url)).await?;
            info!(job.id = id, %url, "Enqueued price check");
            Ok(())
        }
        ["digest"] => {
            let id = queue.enqueue(&Job::send_digest(TriggerType::Manual)).await?;
            info!(job.id = id, "Enqueued digest");
            Ok(())
        }
        _ => bail!("usage: price-watch [check <url> | digest]"),
    }
}

async fn run(config: Config, database: Database, queue: JobQueue) -> Result<()> {
    info!("Starting price watch");

    queue.recover_stale().await?;

    let (flow_events, flow_completed) = mpsc::channel(16);
    let dispatcher = DigestDispatcher::new(database.clone(), mailer::from_config(&config));
    let dispatcher_task = tokio::spawn(dispatcher.run(flow_completed));

    let tracker = PriceTracker::new(
        database.clone(),
        queue.clone(),
        Scraper::from_config(&config)?,
        flow_events,
    );
    let workers = Runner::new(queue.clone(), tracker)
        .num_workers(config.worker_concurrency)
        .job_timeout(config.job_timeout)
        .start();

    let scheduler = Arc::new(DigestScheduler::new(queue.clone()).await?);
    scheduler.sync_from_settings(&database).await?;
    scheduler.start().await?;

    let sync_scheduler = scheduler.clone();
    let sync_database = database.clone();
    let sync_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SCHEDULE_SYNC_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = sync_scheduler.sync_from_settings(&sync_database).await {
                error!("Failed to refresh digest schedule: {:#}", e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    sync_task.abort();
    workers.abort();
    workers.wait_for_shutdown().await;
    dispatcher_task.abort();

    Ok(())
}
