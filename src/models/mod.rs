//! Data models for tracked products, their price history and run audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Name given to a product created before its title has been extracted.
pub const PLACEHOLDER_NAME: &str = "Detecting…";

/// A product page being watched, keyed by its URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub image_url: Option<String>,
    pub active: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Whether the stored name still needs to be replaced by a scraped title.
    pub fn needs_name(&self) -> bool {
        self.name
            .as_deref()
            .is_none_or(|name| name.trim().is_empty() || name == PLACEHOLDER_NAME)
    }

    /// Name suitable for display, falling back to the URL.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.url,
        }
    }
}

/// One observed price, in minor currency units. Never updated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PriceRecord {
    pub id: i64,
    pub product_id: i64,
    pub price_cents: i64,
    pub currency: String,
    pub captured_at: DateTime<Utc>,
}

/// Outcome of a single extraction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Audit row for an extraction attempt.
///
/// `product_id` is a weak reference: the row may outlive, or predate, the
/// product it names when resolution raced or failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RunLog {
    pub id: i64,
    pub product_id: Option<i64>,
    pub url: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Title, price and image pulled out of a product page.
///
/// A page may yield a title without a price; that is still a usable result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductData {
    pub title: Option<String>,
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub image_url: Option<String>,
}

impl ProductData {
    pub fn has_price(&self) -> bool {
        self.price_cents.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.price_cents.is_none()
    }

    /// Fill any field missing here from `other`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            title: self.title.or(other.title),
            price_cents: self.price_cents.or(other.price_cents),
            currency: self.currency.or(other.currency),
            image_url: self.image_url.or(other.image_url),
        }
    }
}
