//! Digest assembly and dispatch, one email per completed flow

use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::database::Database;
use crate::flow::{ChildOutcome, FlowCompleted};
use crate::price::Money;
use crate::queue::TriggerType;
use crate::traits::{Email, Mailer};
use crate::trends::{ProductTrend, WINDOW_DAYS, product_trends};

/// One product line of the digest
#[derive(Debug, Clone, PartialEq)]
pub struct DigestEntry {
    pub product_id: i64,
    pub name: String,
    pub url: String,
    pub image_url: Option<String>,
    /// Latest known price; stale when `check_failed` is set
    pub price: Option<Money>,
    pub vs_last_check: Option<f64>,
    /// `(days, change)` per window
    pub windows: Vec<(i64, Option<f64>)>,
    pub check_failed: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Digest {
    pub trigger_type: TriggerType,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<DigestEntry>,
}

impl Digest {
    /// Combine trends with the flow's outcomes. Products whose check failed in
    /// this flow are flagged.
    pub fn build(event: &FlowCompleted, trends: Vec<ProductTrend>, generated_at: DateTime<Utc>) -> Self {
        let failed: Vec<&ChildOutcome> = event.failed().collect();

        let entries = trends
            .into_iter()
            .map(|ProductTrend { product, trend }| {
                let failure = failed.iter().find(|o| {
                    o.product_id == Some(product.id) || o.url.as_deref() == Some(product.url.as_str())
                });

                DigestEntry {
                    product_id: product.id,
                    name: product.display_name().to_string(),
                    url: product.url.clone(),
                    image_url: product.image_url.clone(),
                    price: trend
                        .current
                        .as_ref()
                        .map(|r| Money::new(r.price_cents, r.currency.clone())),
                    vs_last_check: trend.vs_last_check,
                    windows: trend.windows.iter().map(|w| (w.days, w.change_pct)).collect(),
                    check_failed: failure.is_some(),
                    failure: failure.and_then(|o| o.error.clone()),
                }
            })
            .collect();

        Self {
            trigger_type: event.trigger_type,
            generated_at,
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.check_failed).count()
    }

    pub fn subject(&self) -> String {
        let mut subject = format!(
            "Price digest: {} product{}",
            self.entries.len(),
            if self.entries.len() == 1 { "" } else { "s" }
        );
        if self.failed_count() > 0 {
            let _ = write!(subject, " ({} failed)", self.failed_count());
        }
        subject
    }

    pub fn render_text(&self) -> String {
        let mut out = format!(
            "Price digest for {}\n\n",
            self.generated_at.format("%Y-%m-%d %H:%M UTC")
        );

        for entry in &self.entries {
            let _ = writeln!(out, "{}", entry.name);
            let _ = writeln!(out, "  Price: {}", format_price(entry.price.as_ref()));
            if entry.check_failed {
                let _ = writeln!(
                    out,
                    "  Check failed: {}",
                    entry.failure.as_deref().unwrap_or("unknown error")
                );
            }
            let _ = writeln!(out, "  vs last check: {}", format_change(entry.vs_last_check));
            for (days, change) in &entry.windows {
                let _ = writeln!(out, "  vs {days}d avg: {}", format_change(*change));
            }
            let _ = writeln!(out, "  {}\n", entry.url);
        }

        out
    }

    pub fn render_html(&self) -> String {
        let mut out = String::from("<html><body>");
        let _ = write!(
            out,
            "<h1>Price digest</h1><p>{}</p><table><tr><th>Product</th><th>Price</th><th>vs last</th>",
            self.generated_at.format("%Y-%m-%d %H:%M UTC")
        );
        for days in WINDOW_DAYS {
            let _ = write!(out, "<th>{days}d</th>");
        }
        out.push_str("</tr>");

        for entry in &self.entries {
            let _ = write!(
                out,
                "<tr><td><a href=\"{}\">{}</a>",
                escape_html(&entry.url),
                escape_html(&entry.name)
            );
            if entry.check_failed {
                out.push_str(" <strong>(check failed)</strong>");
            }
            let _ = write!(
                out,
                "</td><td>{}</td><td>{}</td>",
                escape_html(&format_price(entry.price.as_ref())),
                format_change(entry.vs_last_check)
            );
            for (_, change) in &entry.windows {
                let _ = write!(out, "<td>{}</td>", format_change(*change));
            }
            out.push_str("</tr>");
        }

        out.push_str("</table></body></html>");
        out
    }

    pub fn to_email(&self) -> Email {
        Email {
            subject: self.subject(),
            html: self.render_html(),
            text: self.render_text(),
        }
    }
}

/// Signed percentage with one decimal, or `N/A`.
pub fn format_change(change: Option<f64>) -> String {
    match change {
        Some(pct) => format!("{pct:+.1}%"),
        None => "N/A".to_string(),
    }
}

fn format_price(price: Option<&Money>) -> String {
    price.map_or_else(|| "N/A".to_string(), ToString::to_string)
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// How many handled flow ids the dispatcher remembers.
const RECENT_FLOWS: usize = 256;

const DISPATCH_ATTEMPTS: u32 = 3;
const DISPATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Most recently handled flow ids, oldest evicted first
#[derive(Debug, Default)]
struct RecentFlows {
    order: VecDeque<i64>,
    seen: HashSet<i64>,
}

impl RecentFlows {
    fn contains(&self, flow_id: i64) -> bool {
        self.seen.contains(&flow_id)
    }

    /// Returns false if the flow was already recorded.
    fn insert(&mut self, flow_id: i64) -> bool {
        if !self.seen.insert(flow_id) {
            return false;
        }
        self.order.push_back(flow_id);
        if self.order.len() > RECENT_FLOWS
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        true
    }
}

/// Turns flow completion events into digest emails
pub struct DigestDispatcher {
    db: Database,
    mailer: Arc<dyn Mailer>,
    /// Flows already handled, so a retried parent does not mail twice
    dispatched: Mutex<RecentFlows>,
}

impl DigestDispatcher {
    pub fn new(db: Database, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            db,
            mailer,
            dispatched: Mutex::new(RecentFlows::default()),
        }
    }

    /// Consume completion events until every sender is dropped.
    pub async fn run(self, mut events: mpsc::Receiver<FlowCompleted>) {
        while let Some(event) = events.recv().await {
            for attempt in 1..=DISPATCH_ATTEMPTS {
                match self.dispatch(&event).await {
                    Ok(_) => break,
                    Err(e) if attempt < DISPATCH_ATTEMPTS => {
                        warn!(flow.id = event.flow_id, attempt, "Failed to build digest, retrying: {:#}", e);
                        sleep(DISPATCH_RETRY_DELAY).await;
                    }
                    Err(e) => error!(flow.id = event.flow_id, "Failed to build digest: {:#}", e),
                }
            }
        }
        debug!("Digest dispatcher stopped");
    }

    /// Build and send the digest for one flow. Returns whether an email went
    /// out; a failed send is logged and not retried. A flow whose digest could
    /// not be built is not marked handled, so it can be dispatched again.
    #[instrument(name = "digest.dispatch", skip_all, fields(flow.id = event.flow_id))]
    pub async fn dispatch(&self, event: &FlowCompleted) -> Result<bool> {
        if self.recent().contains(event.flow_id) {
            warn!("Digest already dispatched for this flow");
            return Ok(false);
        }

        let now = Utc::now();
        let digest = Digest::build(event, product_trends(&self.db, now).await?, now);

        if !self.recent().insert(event.flow_id) {
            warn!("Digest already dispatched for this flow");
            return Ok(false);
        }

        if digest.is_empty() {
            info!("No active products, no digest sent");
            return Ok(false);
        }

        match self.mailer.send(&digest.to_email()).await {
            Ok(()) => {
                info!(
                    products = digest.entries.len(),
                    failed = digest.failed_count(),
                    "Digest dispatched"
                );
                Ok(true)
            }
            Err(e) => {
                error!("Failed to send digest email: {:#}", e);
                Ok(false)
            }
        }
    }

    fn recent(&self) -> MutexGuard<'_, RecentFlows> {
        self.dispatched.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration;
    use sqlx::Executor;

    use super::*;
    use crate::database::test_support::temp_database;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Email>>,
    }

    #[async_trait]
    impl Mailer for Recording {
        async fn send(&self, email: &Email) -> Result<()> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Mailer for Broken {
        async fn send(&self, _email: &Email) -> Result<()> {
            anyhow::bail!("mail API returned 503")
        }
    }

    fn completed(flow_id: i64, outcomes: Vec<ChildOutcome>) -> FlowCompleted {
        FlowCompleted {
            flow_id,
            trigger_type: TriggerType::Manual,
            outcomes,
        }
    }

    #[test]
    fn formats_changes() {
        assert_eq!(format_change(Some(33.333)), "+33.3%");
        assert_eq!(format_change(Some(-5.26)), "-5.3%");
        assert_eq!(format_change(None), "N/A");
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html(r#"<b>"Tom & Jerry's"</b>"#), "&lt;b&gt;&quot;Tom &amp; Jerry&#39;s&quot;&lt;/b&gt;");
    }

    #[tokio::test]
    async fn failed_products_are_flagged_with_last_price() {
        let (_dir, db) = temp_database().await;
        let now = Utc::now();

        let kettle = db.add_product("https://shop.example/kettle", Some("Kettle")).await.unwrap();
        let lamp = db.add_product("https://shop.example/lamp", Some("Lamp")).await.unwrap();
        db.insert_price_record(kettle.id, 1999, "USD", now - Duration::days(1)).await.unwrap();

        let event = completed(
            7,
            vec![
                ChildOutcome {
                    job_id: 1,
                    url: Some(kettle.url.clone()),
                    product_id: None,
                    success: false,
                    error: Some("FETCH_ERROR: HTTP 503".into()),
                },
                ChildOutcome {
                    job_id: 2,
                    url: Some(lamp.url.clone()),
                    product_id: Some(lamp.id),
                    success: true,
                    error: None,
                },
            ],
        );

        let digest = Digest::build(&event, product_trends(&db, now).await.unwrap(), now);

        assert_eq!(digest.entries.len(), 2);
        assert_eq!(digest.failed_count(), 1);
        assert_eq!(digest.subject(), "Price digest: 2 products (1 failed)");

        let text = digest.render_text();
        assert!(text.contains("Kettle\n  Price: 19.99 USD\n  Check failed: FETCH_ERROR: HTTP 503"));
        assert!(text.contains("Lamp\n  Price: N/A"));
        assert!(digest.render_html().contains("(check failed)"));
    }

    #[tokio::test]
    async fn sends_once_per_flow() {
        let (_dir, db) = temp_database().await;
        db.add_product("https://shop.example/kettle", Some("Kettle")).await.unwrap();

        let mailer = Arc::new(Recording::default());
        let dispatcher = DigestDispatcher::new(db, mailer.clone());

        assert!(dispatcher.dispatch(&completed(1, vec![])).await.unwrap());
        assert!(!dispatcher.dispatch(&completed(1, vec![])).await.unwrap());
        assert!(dispatcher.dispatch(&completed(2, vec![])).await.unwrap());

        assert_eq!(mailer.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn skips_empty_digests_and_survives_mail_failures() {
        let (_dir, db) = temp_database().await;

        let dispatcher = DigestDispatcher::new(db.clone(), Arc::new(Broken));
        assert!(!dispatcher.dispatch(&completed(1, vec![])).await.unwrap());

        db.add_product("https://shop.example/kettle", None).await.unwrap();
        assert!(!dispatcher.dispatch(&completed(2, vec![])).await.unwrap());
    }

    #[tokio::test]
    async fn store_errors_leave_the_flow_dispatchable() {
        let (_dir, db) = temp_database().await;
        db.add_product("https://shop.example/kettle", Some("Kettle")).await.unwrap();

        let mailer = Arc::new(Recording::default());
        let dispatcher = DigestDispatcher::new(db.clone(), mailer.clone());

        db.pool().execute("ALTER TABLE price_records RENAME TO price_records_moved").await.unwrap();
        assert!(dispatcher.dispatch(&completed(9, vec![])).await.is_err());

        db.pool().execute("ALTER TABLE price_records_moved RENAME TO price_records").await.unwrap();
        assert!(dispatcher.dispatch(&completed(9, vec![])).await.unwrap());
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn remembers_only_recent_flows() {
        let mut recent = RecentFlows::default();
        for flow_id in 0..=RECENT_FLOWS as i64 {
            assert!(recent.insert(flow_id));
        }

        assert!(!recent.insert(RECENT_FLOWS as i64));
        assert!(recent.contains(1));
        assert!(!recent.contains(0));
        assert_eq!(recent.seen.len(), RECENT_FLOWS);
        assert_eq!(recent.order.len(), RECENT_FLOWS);
    }
}
