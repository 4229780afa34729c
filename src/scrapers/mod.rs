//! Fetch strategies used by the scraper pipeline

mod http;
mod render;

pub use http::HttpStrategy;
pub use render::RenderStrategy;

use crate::scraper::ScrapeError;

/// Map a transport error onto the pipeline's failure taxonomy.
fn classify(error: &reqwest::Error, url: &str) -> ScrapeError {
    if error.is_timeout() {
        ScrapeError::Timeout(format!("request to {url} timed out"))
    } else {
        ScrapeError::Fetch(format!("request to {url} failed: {error}"))
    }
}
