//! Seams between the pipeline and the outside world: page fetching and mail delivery

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::scraper::ScrapeError;

/// Default browser-like user agent sent with page requests.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Configuration shared by fetch strategies
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent header for outgoing requests
    pub user_agent: String,
    /// Upper bound on a single fetch, including body download
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// One way of turning a URL into page HTML.
///
/// Strategies are tried in order by [`crate::scraper::Scraper`]; each reports
/// its own success or failure.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Fetch the page and return its HTML
    ///
    /// # Arguments
    /// * `url` - Absolute URL of the product page
    async fn fetch(&self, url: &str) -> Result<String, ScrapeError>;
}

/// A rendered email ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Mail transport used by the digest dispatcher
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<()>;
}
