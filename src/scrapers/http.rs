//! Plain HTTP fetch: fast, no script execution

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::classify;
use crate::scraper::ScrapeError;
use crate::traits::{FetchConfig, FetchStrategy};

/// Fetches the raw HTML served for a URL
pub struct HttpStrategy {
    client: Client,
}

impl HttpStrategy {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl FetchStrategy for HttpStrategy {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
        debug!(%url, "Fetching page");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml")
            .send()
            .await
            .map_err(|e| classify(&e, url))?;

        if !response.status().is_success() {
            return Err(ScrapeError::Fetch(format!(
                "failed to fetch {url}: HTTP {}",
                response.status()
            )));
        }

        response.text().await.map_err(|e| classify(&e, url))
    }
}
