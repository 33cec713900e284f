use crate::types::{now_ms, AssetPrice, PriceSnapshot};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum PriceFeedError {
    #[error("Price feed unavailable: {0}")]
    Unavailable(String),

    #[error("Price feed timed out")]
    Timeout,
}

/// Source of current asset prices.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Latest known prices for the requested assets. Assets the feed has no
    /// price for are simply absent from the snapshot.
    async fn snapshot(&self, asset_ids: &[String]) -> Result<PriceSnapshot, PriceFeedError>;
}

/// In-memory price cache keyed by lowercase asset id.
pub struct PriceCache {
    prices: DashMap<String, AssetPrice>,
    /// Broadcast channel for price updates.
    tx: broadcast::Sender<AssetPrice>,
}

impl PriceCache {
    /// Create a new price cache.
    pub fn new() -> (Arc<Self>, broadcast::Receiver<AssetPrice>) {
        let (tx, rx) = broadcast::channel(1024);
        let cache = Arc::new(Self {
            prices: DashMap::new(),
            tx,
        });
        (cache, rx)
    }

    /// Subscribe to price updates.
    pub fn subscribe(&self) -> broadcast::Receiver<AssetPrice> {
        self.tx.subscribe()
    }

    /// Record a price observed now.
    pub fn update_price(&self, asset_id: &str, price: f64) {
        self.update_price_at(asset_id, price, now_ms());
    }

    /// Record a price observed at `timestamp`. Non-finite or non-positive
    /// prices are ignored.
    pub fn update_price_at(&self, asset_id: &str, price: f64, timestamp: i64) {
        let update = AssetPrice::new(asset_id, price, timestamp);
        if !update.is_usable() {
            return;
        }
        self.prices.insert(update.asset_id.clone(), update.clone());

        // Broadcast update (ignore errors if no receivers)
        let _ = self.tx.send(update);
    }

    pub fn get_price(&self, asset_id: &str) -> Option<f64> {
        self.prices
            .get(&asset_id.to_lowercase())
            .map(|entry| entry.price)
    }

    /// All asset ids with a cached price.
    pub fn asset_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.prices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Move every cached price by a bounded random step. Used by paper mode
    /// to keep valuations moving without an upstream feed.
    pub fn simulate_tick(&self, max_step_pct: f64) {
        let timestamp = now_ms();
        let mut rng = rand::thread_rng();
        let updates: Vec<(String, f64)> = self
            .prices
            .iter()
            .map(|entry| {
                let step = rng.gen_range(-max_step_pct..=max_step_pct) / 100.0;
                (entry.key().clone(), entry.price * (1.0 + step))
            })
            .collect();

        for (asset_id, price) in updates {
            self.update_price_at(&asset_id, price, timestamp);
        }
    }
}

#[async_trait]
impl PriceFeed for PriceCache {
    async fn snapshot(&self, asset_ids: &[String]) -> Result<PriceSnapshot, PriceFeedError> {
        let prices = asset_ids
            .iter()
            .filter_map(|id| self.prices.get(&id.to_lowercase()).map(|e| e.value().clone()));
        Ok(PriceSnapshot::from_prices(prices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_returns_known_assets_only() {
        let (cache, _rx) = PriceCache::new();
        cache.update_price_at("BTC", 60_000.0, 1_000);
        cache.update_price_at("eth", 3_000.0, 2_000);

        let snapshot = cache
            .snapshot(&["btc".to_string(), "doge".to_string()])
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.price("btc"), Some(60_000.0));
        assert_eq!(snapshot.price("doge"), None);
    }

    #[test]
    fn test_unusable_prices_ignored() {
        let (cache, _rx) = PriceCache::new();
        cache.update_price("btc", 50_000.0);
        cache.update_price("btc", f64::NAN);
        cache.update_price("btc", -1.0);
        assert_eq!(cache.get_price("BTC"), Some(50_000.0));
    }

    #[test]
    fn test_updates_are_broadcast() {
        let (cache, mut rx) = PriceCache::new();
        cache.update_price("sol", 150.0);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.asset_id, "sol");
        assert_eq!(update.price, 150.0);
    }

    #[test]
    fn test_simulate_tick_stays_in_bounds() {
        let (cache, _rx) = PriceCache::new();
        cache.update_price("btc", 100.0);
        cache.simulate_tick(1.0);
        let price = cache.get_price("btc").unwrap();
        assert!((99.0..=101.0).contains(&price));
        assert_eq!(cache.asset_ids(), vec!["btc".to_string()]);
    }
}
