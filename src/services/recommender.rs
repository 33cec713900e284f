//! System-opponent portfolio generation.

use crate::types::{Portfolio, PortfolioAsset};
use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedAsset {
    pub asset_id: String,
    pub symbol: String,
}

/// Assets with percentage allocations, positionally paired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartPortfolio {
    pub assets: Vec<RecommendedAsset>,
    /// Percent of the portfolio value per asset
    pub allocations: Vec<f64>,
    pub strategy: String,
}

impl SmartPortfolio {
    pub fn validate(&self) -> Result<()> {
        if self.assets.is_empty() {
            bail!("recommendation has no assets");
        }
        if self.assets.len() != self.allocations.len() {
            bail!(
                "{} assets but {} allocations",
                self.assets.len(),
                self.allocations.len()
            );
        }
        if self
            .allocations
            .iter()
            .any(|a| !a.is_finite() || *a < 0.0)
        {
            bail!("allocation out of range");
        }
        if self.allocations.iter().sum::<f64>() <= 0.0 {
            bail!("allocations sum to zero");
        }
        Ok(())
    }

    /// Materialize as the system opponent's portfolio for a game, splitting
    /// `initial_value` by the allocation percentages.
    pub fn into_ape_portfolio(self, game_id: u64, initial_value: f64, now: i64) -> Portfolio {
        let total: f64 = self.allocations.iter().sum();
        let assets = self
            .assets
            .into_iter()
            .zip(self.allocations)
            .map(|(asset, pct)| {
                PortfolioAsset::new(asset.asset_id, asset.symbol, initial_value * pct / total)
            })
            .collect();
        Portfolio::ape(game_id, assets, now)
    }
}

#[async_trait]
pub trait PortfolioRecommender: Send + Sync {
    async fn generate_smart_portfolio(
        &self,
        game_type: &str,
        asset_count: usize,
    ) -> Result<SmartPortfolio>;
}

/// Default percentage split for `n` assets, largest first.
pub fn default_allocation_tiers(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![100.0],
        2 => vec![60.0, 40.0],
        3 => vec![50.0, 30.0, 20.0],
        4 => vec![40.0, 30.0, 20.0, 10.0],
        5 => vec![30.0, 25.0, 20.0, 15.0, 10.0],
        _ => vec![100.0 / n as f64; n],
    }
}

/// Random asset picks from a fixed universe with tiered default allocations.
pub struct FallbackRecommender {
    universe: Vec<String>,
}

impl FallbackRecommender {
    pub fn new(universe: Vec<String>) -> Self {
        Self { universe }
    }
}

#[async_trait]
impl PortfolioRecommender for FallbackRecommender {
    async fn generate_smart_portfolio(
        &self,
        _game_type: &str,
        asset_count: usize,
    ) -> Result<SmartPortfolio> {
        let count = asset_count.min(self.universe.len());
        if count == 0 {
            bail!("no assets available for fallback portfolio");
        }

        let picks: Vec<String> = {
            let mut rng = rand::thread_rng();
            self.universe
                .choose_multiple(&mut rng, count)
                .cloned()
                .collect()
        };
        let assets = picks
            .into_iter()
            .map(|id| RecommendedAsset {
                symbol: id.to_uppercase(),
                asset_id: id,
            })
            .collect();

        Ok(SmartPortfolio {
            assets,
            allocations: default_allocation_tiers(count),
            strategy: "fallback".to_string(),
        })
    }
}
