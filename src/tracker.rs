use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::database::Database;
use crate::flow::{CheckOutcome, FlowCompleted, collect_outcomes, create_digest_flow};
use crate::models::{ProductData, RunStatus};
use crate::price::DEFAULT_CURRENCY;
use crate::queue::{
    CheckPricePayload, DigestFlowPayload, Job, JobHandler, JobMeta, JobQueue, SendDigestPayload,
};
use crate::scraper::Scraper;

/// Runs every job kind against the store, the scraper and the queue.
#[derive(Clone)]
pub struct PriceTracker {
    database: Database,
    queue: JobQueue,
    scraper: Scraper,
    flow_events: mpsc::Sender<FlowCompleted>,
}

impl PriceTracker {
    pub fn new(
        database: Database,
        queue: JobQueue,
        scraper: Scraper,
        flow_events: mpsc::Sender<FlowCompleted>,
    ) -> Self {
        Self {
            database,
            queue,
            scraper,
            flow_events,
        }
    }

    /// Scrape one URL and record the result.
    ///
    /// Fetch errors and timeouts fail the attempt so the queue retries it; the
    /// FAILED run log for the last attempt is written by
    /// [`JobHandler::on_exhausted`]. Pages that load but yield nothing usable
    /// complete with an unsuccessful outcome.
    #[instrument(skip_all, fields(job.id = meta.id))]
    pub async fn check_price(&self, payload: CheckPricePayload, meta: JobMeta) -> Result<CheckOutcome> {
        let url = self.target_url(payload).await?;

        match self.scraper.extract(&url).await {
            Ok(data) => self.record_success(url, data).await,
            Err(e) if e.is_retryable() => {
                warn!(%url, attempt = meta.attempt, "Check failed: {}", e);
                Err(e.into())
            }
            Err(e) => self.record_failure(&url, &e.to_string()).await,
        }
    }

    async fn target_url(&self, payload: CheckPricePayload) -> Result<String> {
        match (payload.url, payload.product_id) {
            (Some(url), _) => Ok(url),
            (None, Some(product_id)) => self.legacy_product_url(&product_id).await,
            (None, None) => bail!("check-price job has neither url nor productId"),
        }
    }

    /// Older producers sent only a product id; look its URL up.
    async fn legacy_product_url(&self, product_id: &str) -> Result<String> {
        let id: i64 = product_id
            .parse()
            .with_context(|| format!("invalid productId {product_id:?}"))?;

        warn!(product.id = id, "check-price job without url, resolving by productId");
        match self.database.product(id).await? {
            Some(product) => Ok(product.url),
            None => bail!("product {id} no longer exists"),
        }
    }

    async fn record_success(&self, url: String, data: ProductData) -> Result<CheckOutcome> {
        let product = self
            .database
            .resolve_product(&url, data.title.as_deref())
            .await?;
        let product = self
            .database
            .update_product_details(&product, data.title.as_deref(), data.image_url.as_deref())
            .await?;

        let mut currency = None;
        if let Some(cents) = data.price_cents {
            let code = data.currency.as_deref().unwrap_or(DEFAULT_CURRENCY);
            self.database
                .insert_price_record(product.id, cents, code, Utc::now())
                .await?;
            currency = Some(code.to_string());
        }

        self.database.mark_success(product.id).await?;
        self.database
            .insert_run_log(Some(product.id), &url, RunStatus::Success, None)
            .await?;

        match data.price_cents {
            Some(cents) => info!(product.id = product.id, %url, cents, "Recorded price"),
            None => info!(product.id = product.id, %url, "Page had no price, title only"),
        }

        Ok(CheckOutcome {
            url,
            product_id: Some(product.id),
            success: true,
            price_cents: data.price_cents,
            currency,
            error: None,
        })
    }

    async fn record_failure(&self, url: &str, message: &str) -> Result<CheckOutcome> {
        // Best-effort link to a product that may not exist yet
        let product_id = self.database.product_by_url(url).await?.map(|p| p.id);

        self.database
            .insert_run_log(product_id, url, RunStatus::Failed, Some(message))
            .await?;
        if let Some(id) = product_id {
            self.database.mark_failure(id).await?;
        }

        warn!(product.id = ?product_id, %url, "Check failed: {}", message);

        Ok(CheckOutcome {
            url: url.to_string(),
            product_id,
            success: false,
            price_cents: None,
            currency: None,
            error: Some(message.to_string()),
        })
    }

    /// Fan out one check per active product behind a digest flow parent.
    pub async fn send_digest(&self, payload: SendDigestPayload) -> Result<Value> {
        let flow = create_digest_flow(&self.database, &self.queue, payload.trigger_type).await?;
        Ok(json!({
            "flowId": flow.parent_id,
            "children": flow.child_ids.len(),
        }))
    }

    /// Runs once all children of the flow are terminal; hands their outcomes
    /// to the digest dispatcher.
    #[instrument(skip_all, fields(flow.id = meta.id))]
    pub async fn digest_flow(&self, payload: DigestFlowPayload, meta: JobMeta) -> Result<Value> {
        let outcomes = collect_outcomes(&self.queue, meta.id).await?;
        if outcomes.len() != payload.expected_children {
            warn!(
                expected = payload.expected_children,
                found = outcomes.len(),
                "Flow child count mismatch"
            );
        }

        let checked = outcomes.len();
        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(checked, failed, "Digest flow completed");

        self.flow_events
            .send(FlowCompleted {
                flow_id: meta.id,
                trigger_type: payload.trigger_type,
                outcomes,
            })
            .await
            .map_err(|_| anyhow!("digest dispatcher is not running"))?;

        Ok(json!({ "checked": checked, "failed": failed }))
    }
}

impl JobHandler for PriceTracker {
    async fn handle(&self, job: Job, meta: JobMeta) -> Result<Value> {
        match job {
            Job::CheckPrice(payload) => Ok(serde_json::to_value(self.check_price(payload, meta).await?)?),
            Job::SendDigest(payload) => self.send_digest(payload).await,
            Job::DigestFlow(payload) => self.digest_flow(payload, meta).await,
        }
    }

    async fn on_exhausted(&self, job: Job, _meta: JobMeta, error: &str) -> Result<()> {
        let Job::CheckPrice(payload) = job else {
            return Ok(());
        };

        let url = self.target_url(payload).await?;
        self.record_failure(&url, error).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::database::test_support::temp_database;
    use crate::models::PLACEHOLDER_NAME;
    use crate::queue::{JobState, RetryPolicy, Runner, TriggerType};
    use crate::scraper::ScrapeError;
    use crate::scraper::test_support::FakeStrategy;
    use crate::traits::FetchStrategy;

    const URL: &str = "https://shop.example/kettle";

    fn meta(attempt: u32, max_attempts: u32) -> JobMeta {
        JobMeta {
            id: 1,
            attempt,
            max_attempts,
            parent_id: None,
        }
    }

    fn payload(url: Option<&str>, product_id: Option<&str>) -> CheckPricePayload {
        CheckPricePayload {
            url: url.map(ToString::to_string),
            product_id: product_id.map(ToString::to_string),
            triggered_at: Utc::now(),
        }
    }

    fn page(body: &str) -> String {
        format!(
            "<html><body>{body}<p>{}</p></body></html>",
            "Plenty of static copy so the page is not mistaken for a script shell. ".repeat(5)
        )
    }

    async fn tracker(strategy: FakeStrategy) -> (tempfile::TempDir, Database, PriceTracker) {
        let (dir, db) = temp_database().await;
        let queue = JobQueue::new(
            db.pool().clone(),
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::ZERO,
            },
        );
        let (tx, _rx) = mpsc::channel(4);
        let scraper = Scraper::with_strategies(vec![Arc::new(strategy)]);
        let tracker = PriceTracker::new(db.clone(), queue, scraper, tx);
        (dir, db, tracker)
    }

    #[tokio::test]
    async fn first_success_creates_the_product_and_records_a_price() {
        let html = page(r#"<h1>Kettle</h1><span class="price">€24,50</span>"#);
        let (_dir, db, tracker) = tracker(FakeStrategy::new("http").page(URL, Ok(&html))).await;

        let outcome = tracker.check_price(payload(Some(URL), None), meta(1, 3)).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.price_cents, Some(2450));
        assert_eq!(outcome.currency.as_deref(), Some("EUR"));

        let product = db.product_by_url(URL).await.unwrap().unwrap();
        assert_eq!(outcome.product_id, Some(product.id));
        assert_eq!(product.name.as_deref(), Some("Kettle"));
        assert!(product.last_success_at.is_some());

        let history = db.price_history(product.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].price_cents, 2450);

        let logs = db.run_logs(product.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn placeholder_names_are_replaced_by_the_scraped_title() {
        let html = page(r#"<h1>Kettle</h1><span class="price">$10.00</span>"#);
        let (_dir, db, tracker) = tracker(FakeStrategy::new("http").page(URL, Ok(&html))).await;

        let added = db.add_product(URL, None).await.unwrap();
        assert_eq!(added.name.as_deref(), Some(PLACEHOLDER_NAME));

        tracker.check_price(payload(Some(URL), None), meta(1, 3)).await.unwrap();

        let product = db.product(added.id).await.unwrap().unwrap();
        assert_eq!(product.name.as_deref(), Some("Kettle"));
    }

    #[tokio::test]
    async fn transient_failures_are_logged_once_attempts_run_out() {
        let strategy = FakeStrategy::new("http").page(URL, Err(ScrapeError::Fetch("HTTP 503".into())));
        let (_dir, db, tracker) = tracker(strategy).await;
        let product = db.add_product(URL, Some("Kettle")).await.unwrap();

        let err = tracker.check_price(payload(Some(URL), None), meta(3, 3)).await.unwrap_err();
        assert!(db.run_logs_for_url(URL).await.unwrap().is_empty());

        tracker
            .on_exhausted(Job::CheckPrice(payload(Some(URL), None)), meta(3, 3), &format!("{err:#}"))
            .await
            .unwrap();

        let logs = db.run_logs_for_url(URL).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RunStatus::Failed);
        assert_eq!(logs[0].product_id, Some(product.id));
        assert_eq!(logs[0].error.as_deref(), Some("FETCH_ERROR: HTTP 503"));

        let product = db.product(product.id).await.unwrap().unwrap();
        assert!(product.last_failure_at.is_some());
    }

    struct Stalling;

    #[async_trait]
    impl FetchStrategy for Stalling {
        fn name(&self) -> &'static str {
            "stalling"
        }

        async fn fetch(&self, _url: &str) -> Result<String, ScrapeError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Err(ScrapeError::Timeout("render".into()))
        }
    }

    #[tokio::test]
    async fn timed_out_final_attempt_is_logged_as_failed() {
        let (_dir, db) = temp_database().await;
        let product = db.add_product(URL, Some("Kettle")).await.unwrap();
        let queue = JobQueue::new(
            db.pool().clone(),
            RetryPolicy {
                max_attempts: 1,
                backoff: Duration::ZERO,
            },
        );
        let (tx, _rx) = mpsc::channel(4);
        let scraper = Scraper::with_strategies(vec![Arc::new(Stalling)]);
        let tracker = PriceTracker::new(db.clone(), queue.clone(), scraper, tx);

        let id = queue.enqueue(&Job::check_price(URL)).await.unwrap();
        Runner::new(queue.clone(), tracker)
            .poll_interval(Duration::from_millis(10))
            .jitter(Duration::ZERO)
            .job_timeout(Duration::from_millis(50))
            .shutdown_when_queue_empty()
            .start()
            .wait_for_shutdown()
            .await;

        let record = queue.job(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error.as_deref(), Some("TIMEOUT: job exceeded 50ms"));

        let logs = db.run_logs_for_url(URL).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RunStatus::Failed);
        assert_eq!(logs[0].error.as_deref(), Some("TIMEOUT: job exceeded 50ms"));

        let product = db.product(product.id).await.unwrap().unwrap();
        assert!(product.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn pages_without_data_complete_unsuccessfully() {
        let (_dir, db, tracker) =
            tracker(FakeStrategy::new("http").page(URL, Ok("<html><body></body></html>"))).await;

        let outcome = tracker.check_price(payload(Some(URL), None), meta(1, 3)).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.product_id, None);
        assert_eq!(outcome.error.as_deref(), Some("NO_PRICE_FOUND"));
        assert!(db.product_by_url(URL).await.unwrap().is_none());

        let logs = db.run_logs_for_url(URL).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].product_id, None);
    }

    #[tokio::test]
    async fn product_id_only_payloads_resolve_through_the_store() {
        let html = page(r#"<h1>Kettle</h1><span class="price">£5.00</span>"#);
        let (_dir, db, tracker) = tracker(FakeStrategy::new("http").page(URL, Ok(&html))).await;
        let product = db.add_product(URL, Some("Kettle")).await.unwrap();

        let outcome = tracker
            .check_price(payload(None, Some(&product.id.to_string())), meta(1, 3))
            .await
            .unwrap();
        assert_eq!(outcome.product_id, Some(product.id));

        assert!(tracker.check_price(payload(None, Some("999")), meta(1, 3)).await.is_err());
        assert!(tracker.check_price(payload(None, None), meta(1, 3)).await.is_err());
    }

    #[tokio::test]
    async fn send_digest_starts_a_flow() {
        let (_dir, db, tracker) = tracker(FakeStrategy::new("http")).await;
        db.add_product(URL, None).await.unwrap();

        let result = tracker
            .send_digest(SendDigestPayload {
                trigger_type: TriggerType::Manual,
            })
            .await
            .unwrap();

        assert_eq!(result["children"], 1);
    }
}
