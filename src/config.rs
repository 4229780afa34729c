//! Process configuration read from the environment (and `.env` via dotenvy)

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Number of concurrent queue workers
    pub worker_concurrency: usize,
    /// Attempts per job before it settles as failed
    pub job_max_attempts: u32,
    pub job_timeout: Duration,
    /// Base of the exponential retry backoff
    pub job_backoff: Duration,
    pub http_timeout: Duration,
    pub render_service_url: Option<String>,
    pub render_service_token: Option<String>,
    pub mail: Option<MailConfig>,
}

/// Mail delivery settings; absent when digests are disabled
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub sender: String,
    pub recipient: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mail = match (optional("MAIL_ENDPOINT"), optional("DIGEST_RECIPIENT")) {
            (Some(endpoint), Some(recipient)) => Some(MailConfig {
                endpoint,
                api_key: optional("MAIL_API_KEY"),
                sender: optional("DIGEST_SENDER")
                    .unwrap_or_else(|| "Price Watch <digest@localhost>".to_string()),
                recipient,
            }),
            _ => {
                warn!("MAIL_ENDPOINT or DIGEST_RECIPIENT not set - digest emails will be disabled");
                None
            }
        };

        Ok(Self {
            database_url: optional("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:data/prices.db".to_string()),
            worker_concurrency: parsed("WORKER_CONCURRENCY", 4)?,
            job_max_attempts: parsed("JOB_MAX_ATTEMPTS", 3)?,
            job_timeout: Duration::from_secs(parsed("JOB_TIMEOUT_SECS", 120)?),
            job_backoff: Duration::from_secs(parsed("JOB_BACKOFF_SECS", 30)?),
            http_timeout: Duration::from_secs(parsed("HTTP_TIMEOUT_SECS", 20)?),
            render_service_url: optional("RENDER_SERVICE_URL"),
            render_service_token: optional("RENDER_SERVICE_TOKEN"),
            mail,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}
