use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latest price for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPrice {
    pub asset_id: String,
    pub price: f64,
    /// When the feed last updated this price (ms).
    pub last_updated: i64,
}

impl AssetPrice {
    pub fn new(asset_id: impl Into<String>, price: f64, last_updated: i64) -> Self {
        Self {
            asset_id: asset_id.into().to_lowercase(),
            price,
            last_updated,
        }
    }

    /// A price that can be used for locking or valuation.
    pub fn is_usable(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

/// Point-in-time view of the price feed, keyed by lowercase asset id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub prices: HashMap<String, AssetPrice>,
}

impl PriceSnapshot {
    pub fn from_prices(prices: impl IntoIterator<Item = AssetPrice>) -> Self {
        Self {
            prices: prices
                .into_iter()
                .map(|p| (p.asset_id.clone(), p))
                .collect(),
        }
    }

    /// Usable price for an asset; missing, zero, negative and non-finite prices are `None`.
    pub fn price(&self, asset_id: &str) -> Option<f64> {
        self.prices
            .get(&asset_id.to_lowercase())
            .filter(|p| p.is_usable())
            .map(|p| p.price)
    }

    /// Assets whose last update is older than `threshold_ms` at `now`.
    pub fn stale_assets(&self, now: i64, threshold_ms: i64) -> Vec<String> {
        let mut stale: Vec<String> = self
            .prices
            .values()
            .filter(|p| now - p.last_updated > threshold_ms)
            .map(|p| p.asset_id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}
