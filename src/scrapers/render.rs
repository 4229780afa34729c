//! Headless-browser fallback for pages whose price is rendered by script.
//!
//! Rendering is delegated to a browser service reached over HTTP: it receives
//! `{"url": ...}` and answers with the DOM serialized after scripts have run.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::classify;
use crate::scraper::ScrapeError;
use crate::traits::{FetchConfig, FetchStrategy};

/// Rendering waits for scripts and network, so it gets a longer budget.
const RENDER_TIMEOUT_FACTOR: u32 = 3;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderRequest<'a> {
    url: &'a str,
    user_agent: &'a str,
    wait_until: &'static str,
}

/// Fetches fully rendered HTML from a headless browser service
pub struct RenderStrategy {
    client: Client,
    endpoint: String,
    token: Option<String>,
    user_agent: String,
}

impl RenderStrategy {
    pub fn new(endpoint: &str, token: Option<String>, config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout.saturating_mul(RENDER_TIMEOUT_FACTOR).max(Duration::from_secs(1)))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            token,
            user_agent: config.user_agent.clone(),
        })
    }
}

#[async_trait]
impl FetchStrategy for RenderStrategy {
    fn name(&self) -> &'static str {
        "render"
    }

    async fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
        debug!(%url, endpoint = %self.endpoint, "Rendering page");

        let mut request = self.client.post(&self.endpoint).json(&RenderRequest {
            url,
            user_agent: &self.user_agent,
            wait_until: "networkidle2",
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| classify(&e, url))?;

        if !response.status().is_success() {
            return Err(ScrapeError::Fetch(format!(
                "render service failed for {url}: HTTP {}",
                response.status()
            )));
        }

        response.text().await.map_err(|e| classify(&e, url))
    }
}
