use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::ProductData;
use crate::scrapers::{HttpStrategy, RenderStrategy};
use crate::traits::{FetchConfig, FetchStrategy};

pub mod extract;

use extract::extract_product;

/// Why a page could not be turned into product data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScrapeError {
    #[error("FETCH_ERROR: {0}")]
    Fetch(String),

    #[error("PARSE_ERROR: {0}")]
    Parse(String),

    #[error("TIMEOUT: {0}")]
    Timeout(String),

    #[error("NO_PRICE_FOUND")]
    NoPriceFound,
}

impl ScrapeError {
    /// Stable error code recorded in run logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "FETCH_ERROR",
            Self::Parse(_) => "PARSE_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::NoPriceFound => "NO_PRICE_FOUND",
        }
    }

    /// Network-level failures may succeed on a later attempt; extraction
    /// failures will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Timeout(_))
    }
}

/// Ordered chain of fetch strategies sharing one extraction step
#[derive(Clone)]
pub struct Scraper {
    strategies: Vec<Arc<dyn FetchStrategy>>,
}

impl Scraper {
    /// Plain HTTP first, then the render service when one is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetch = FetchConfig {
            timeout: config.http_timeout,
            ..FetchConfig::default()
        };

        let mut strategies: Vec<Arc<dyn FetchStrategy>> = vec![Arc::new(HttpStrategy::new(&fetch)?)];

        match &config.render_service_url {
            Some(endpoint) => strategies.push(Arc::new(RenderStrategy::new(
                endpoint,
                config.render_service_token.clone(),
                &fetch,
            )?)),
            None => warn!("RENDER_SERVICE_URL not set - script-rendered pages will not be retried in a browser"),
        }

        Ok(Self::with_strategies(strategies))
    }

    pub fn with_strategies(strategies: Vec<Arc<dyn FetchStrategy>>) -> Self {
        Self { strategies }
    }

    /// Run the strategy chain for `url`.
    ///
    /// Returns the first result carrying a price. When no strategy finds a
    /// price but some page yielded a title, that partial result is returned.
    pub async fn extract(&self, url: &str) -> Result<ProductData, ScrapeError> {
        let mut partial = ProductData::default();
        let mut unparsed_price = None;
        let mut last_retryable = None;
        let mut fetched_any = false;

        for strategy in &self.strategies {
            let html = match strategy.fetch(url).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(strategy = strategy.name(), %url, "Fetch failed: {}", e);
                    if e.is_retryable() {
                        last_retryable = Some(e);
                    }
                    continue;
                }
            };
            fetched_any = true;

            let page = extract_product(&html, url);
            if page.data.has_price() {
                info!(strategy = strategy.name(), %url, "Extracted price");
                return Ok(page.data.or(partial));
            }

            debug!(
                strategy = strategy.name(),
                %url,
                needs_render = page.needs_render,
                "No usable price, trying next strategy"
            );
            unparsed_price = unparsed_price.or(page.unparsed_price);
            partial = partial.or(page.data);
        }

        if !partial.is_empty() {
            return Ok(partial);
        }

        if let Some(e) = last_retryable {
            return Err(e);
        }

        match unparsed_price {
            Some(text) => Err(ScrapeError::Parse(format!("unrecognized price text {text:?}"))),
            None if fetched_any => Err(ScrapeError::NoPriceFound),
            None => Err(ScrapeError::Fetch("no fetch strategy available".to_string())),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::test_support::FakeStrategy;
    use super::*;

    const URL: &str = "https://shop.example/item";

    fn page(body: &str) -> String {
        format!(
            "<html><body>{body}<p>{}</p></body></html>",
            "Static product copy that makes this page look server rendered. ".repeat(5)
        )
    }

    #[tokio::test]
    async fn first_strategy_with_price_wins() {
        let html = page(r#"<h1>Kettle</h1><span class="price">$19.99</span>"#);
        let http = Arc::new(FakeStrategy::new("http").page(URL, Ok(&html)));
        let render = Arc::new(FakeStrategy::new("render"));

        let scraper = Scraper::with_strategies(vec![http.clone(), render.clone()]);
        let data = scraper.extract(URL).await.unwrap();

        assert_eq!(data.title.as_deref(), Some("Kettle"));
        assert_eq!(data.price_cents, Some(1999));
        assert_eq!(data.currency.as_deref(), Some("USD"));
        assert_eq!(render.calls(), 0);
    }

    #[tokio::test]
    async fn render_fallback_fills_in_missing_price() {
        let shell = r#"<html><head><meta property="og:title" content="Lamp"></head><body><div id="root"></div></body></html>"#;
        let rendered = page(r#"<div class="price">€24,50</div>"#);

        let http = Arc::new(FakeStrategy::new("http").page(URL, Ok(shell)));
        let render = Arc::new(FakeStrategy::new("render").page(URL, Ok(&rendered)));

        let scraper = Scraper::with_strategies(vec![http, render.clone()]);
        let data = scraper.extract(URL).await.unwrap();

        assert_eq!(data.title.as_deref(), Some("Lamp"));
        assert_eq!(data.price_cents, Some(2450));
        assert_eq!(data.currency.as_deref(), Some("EUR"));
        assert_eq!(render.calls(), 1);
    }

    #[tokio::test]
    async fn shell_with_price_metadata_skips_rendering() {
        let shell = r#"<html><head><meta property="og:title" content="Lamp">
            <meta property="product:price:amount" content="24.50">
            <meta property="product:price:currency" content="EUR"></head>
            <body><div id="root"></div></body></html>"#;

        let http = Arc::new(FakeStrategy::new("http").page(URL, Ok(shell)));
        let render = Arc::new(FakeStrategy::new("render"));

        let scraper = Scraper::with_strategies(vec![http, render.clone()]);
        let data = scraper.extract(URL).await.unwrap();

        assert_eq!(data.price_cents, Some(2450));
        assert_eq!(data.currency.as_deref(), Some("EUR"));
        assert_eq!(render.calls(), 0);
    }

    #[tokio::test]
    async fn title_only_is_a_partial_success() {
        let html = page("<h1>Discontinued Chair</h1>");
        let http = Arc::new(FakeStrategy::new("http").page(URL, Ok(&html)));
        let render = Arc::new(
            FakeStrategy::new("render").page(URL, Err(ScrapeError::Timeout("render".into()))),
        );

        let scraper = Scraper::with_strategies(vec![http, render]);
        let data = scraper.extract(URL).await.unwrap();

        assert_eq!(data.title.as_deref(), Some("Discontinued Chair"));
        assert_eq!(data.price_cents, None);
    }

    #[tokio::test]
    async fn all_fetches_failing_reports_the_transient_error() {
        let http = Arc::new(
            FakeStrategy::new("http").page(URL, Err(ScrapeError::Fetch("HTTP 503".into()))),
        );
        let render = Arc::new(
            FakeStrategy::new("render").page(URL, Err(ScrapeError::Timeout("render".into()))),
        );

        let scraper = Scraper::with_strategies(vec![http, render]);
        let err = scraper.extract(URL).await.unwrap_err();

        assert_eq!(err.code(), "TIMEOUT");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn empty_pages_report_no_price() {
        let http = Arc::new(FakeStrategy::new("http").page(URL, Ok("<html><body></body></html>")));

        let scraper = Scraper::with_strategies(vec![http]);
        let err = scraper.extract(URL).await.unwrap_err();

        assert_eq!(err, ScrapeError::NoPriceFound);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn garbled_price_without_title_is_a_parse_error() {
        let http = Arc::new(FakeStrategy::new("http").page(
            URL,
            Ok(r#"<html><body><meta property="product:price:amount" content="1.2.3"></body></html>"#),
        ));

        let scraper = Scraper::with_strategies(vec![http]);
        let err = scraper.extract(URL).await.unwrap_err();

        assert_eq!(err.code(), "PARSE_ERROR");
    }
}
