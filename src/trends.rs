//! Rolling-window price statistics per product

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::database::{Database, StoreError};
use crate::models::{PriceRecord, Product};

/// Windows, in days, that the current price is compared against.
pub const WINDOW_DAYS: [i64; 4] = [7, 30, 90, 180];

/// Change of the current price against the mean of one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowChange {
    pub days: i64,
    /// `None` when the window holds fewer than two records
    pub change_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceTrend {
    pub current: Option<PriceRecord>,
    pub vs_last_check: Option<f64>,
    pub windows: Vec<WindowChange>,
}

impl PriceTrend {
    pub fn vs_window(&self, days: i64) -> Option<f64> {
        self.windows
            .iter()
            .find(|w| w.days == days)
            .and_then(|w| w.change_pct)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductTrend {
    pub product: Product,
    pub trend: PriceTrend,
}

/// Compute the trend from records ordered newest first.
///
/// Only records in the current price's currency take part. Window means
/// include the current record.
pub fn compute(now: DateTime<Utc>, records: &[PriceRecord]) -> PriceTrend {
    let Some(current) = records.first() else {
        return PriceTrend {
            current: None,
            vs_last_check: None,
            windows: WINDOW_DAYS
                .iter()
                .map(|&days| WindowChange {
                    days,
                    change_pct: None,
                })
                .collect(),
        };
    };

    let comparable: Vec<&PriceRecord> = records
        .iter()
        .filter(|r| r.currency == current.currency)
        .collect();
    let latest = current.price_cents as f64;

    let vs_last_check = comparable
        .get(1)
        .and_then(|previous| percent_change(latest, previous.price_cents as f64));

    let windows = WINDOW_DAYS
        .iter()
        .map(|&days| {
            let since = now - Duration::days(days);
            let in_window: Vec<f64> = comparable
                .iter()
                .filter(|r| r.captured_at >= since)
                .map(|r| r.price_cents as f64)
                .collect();

            let change_pct = if in_window.len() < 2 {
                None
            } else {
                let mean = in_window.iter().sum::<f64>() / in_window.len() as f64;
                percent_change(latest, mean)
            };

            WindowChange { days, change_pct }
        })
        .collect();

    PriceTrend {
        current: Some(current.clone()),
        vs_last_check,
        windows,
    }
}

fn percent_change(current: f64, baseline: f64) -> Option<f64> {
    (baseline != 0.0).then(|| (current - baseline) / baseline * 100.0)
}

/// Trends for every active product, each read from a single snapshot of
/// its price history.
pub async fn product_trends(db: &Database, now: DateTime<Utc>) -> Result<Vec<ProductTrend>, StoreError> {
    let since = now - Duration::days(WINDOW_DAYS[WINDOW_DAYS.len() - 1]);
    let mut trends = Vec::new();

    for product in db.list_active_products().await? {
        let records = db.recent_price_records(product.id, since).await?;
        trends.push(ProductTrend {
            trend: compute(now, &records),
            product,
        });
    }

    Ok(trends)
}
