//! # Digest Mail Delivery
//!
//! This module delivers rendered digest emails through an HTTP mail API. The
//! message is posted as JSON to a configured endpoint, authenticated with a
//! bearer key when one is set.
//!
//! ## Message Structure
//!
//! ```json
//! { "from": "...", "to": ["..."], "subject": "...", "html": "...", "text": "..." }
//! ```
//!
//! ## Environment Configuration
//!
//! - `MAIL_ENDPOINT`: URL the message is posted to
//! - `MAIL_API_KEY`: optional bearer token
//! - `DIGEST_SENDER`: `from` address
//! - `DIGEST_RECIPIENT`: `to` address
//!
//! Without an endpoint and recipient, [`DisabledMailer`] is used and digests
//! are logged but not sent.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Config, MailConfig};
use crate::traits::{Email, Mailer};

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

/// Mail API client for digest emails.
///
/// Cloning is cheap: the underlying `reqwest::Client` shares its connection
/// pool between clones.
#[derive(Clone)]
pub struct HttpMailer {
    client: Client,
    config: MailConfig,
}

impl HttpMailer {
    pub fn new(config: MailConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    /// Post the email to the mail API.
    ///
    /// A non-success status is an error; the caller decides whether that is
    /// worth more than a log line.
    async fn send(&self, email: &Email) -> Result<()> {
        let message = OutgoingMessage {
            from: &self.config.sender,
            to: [&self.config.recipient],
            subject: &email.subject,
            html: &email.html,
            text: &email.text,
        };

        let mut request = self.client.post(&self.config.endpoint).json(&message);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("mail API returned {}: {}", status, body.trim());
        }

        info!(to = %self.config.recipient, "Digest email sent: {}", email.subject);
        Ok(())
    }
}

/// Stand-in used when mail is not configured
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        warn!("Mail not configured, dropping digest: {}", email.subject);
        Ok(())
    }
}

/// The mailer matching the process configuration.
pub fn from_config(config: &Config) -> Arc<dyn Mailer> {
    match &config.mail {
        Some(mail) => Arc::new(HttpMailer::new(mail.clone())),
        None => Arc::new(DisabledMailer),
    }
}
