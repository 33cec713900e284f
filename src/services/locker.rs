//! Portfolio locking and revaluation.
//!
//! Locking converts each asset's allocation into a token quantity at the
//! current price. Revaluation prices those quantities again and refreshes the
//! game's system-opponent summary.

use crate::error::SettlementError;
use crate::services::price_cache::PriceFeed;
use crate::services::sqlite_store::SqliteStore;
use crate::types::{now_ms, ApePortfolio, Game, Portfolio, PortfolioStatus, PriceSnapshot};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const QTY_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Error, PartialEq)]
pub enum LockError {
    #[error("asset {asset_id} has invalid allocation {allocation}")]
    InvalidAllocation { asset_id: String, allocation: f64 },
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LockReport {
    pub locked: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RevalueReport {
    pub revalued: usize,
    /// Settled while the prices were being fetched
    pub skipped: usize,
    pub failed: usize,
}

/// Truncate toward zero at 6 decimal places.
fn truncate_qty(qty: f64) -> f64 {
    (qty * QTY_SCALE).trunc() / QTY_SCALE
}

/// Freeze token quantities for one portfolio.
///
/// Returns `Ok(false)` without touching the portfolio if it is already locked.
/// A missing or non-positive price yields a zero quantity.
pub fn lock_portfolio(
    portfolio: &mut Portfolio,
    prices: &PriceSnapshot,
    now: i64,
) -> Result<bool, LockError> {
    if portfolio.is_locked {
        return Ok(false);
    }

    if let Some(bad) = portfolio
        .assets
        .iter()
        .find(|a| !a.allocation.is_finite() || a.allocation < 0.0)
    {
        return Err(LockError::InvalidAllocation {
            asset_id: bad.asset_id.clone(),
            allocation: bad.allocation,
        });
    }

    for asset in &mut portfolio.assets {
        match prices.price(&asset.asset_id) {
            Some(price) => {
                asset.token_qty = truncate_qty(asset.allocation / price);
                asset.locked_price = Some(price);
                asset.last_price = Some(price);
            }
            None => {
                asset.token_qty = 0.0;
            }
        }
    }

    portfolio.is_locked = true;
    portfolio.status = PortfolioStatus::Locked;
    portfolio.locked_at = Some(now);
    portfolio.error = None;
    Ok(true)
}

fn asset_ids(portfolios: &[Portfolio]) -> Vec<String> {
    portfolios
        .iter()
        .flat_map(|p| p.assets.iter().map(|a| a.asset_id.to_lowercase()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub struct PortfolioLocker {
    store: Arc<SqliteStore>,
    price_feed: Arc<dyn PriceFeed>,
}

impl PortfolioLocker {
    pub fn new(store: Arc<SqliteStore>, price_feed: Arc<dyn PriceFeed>) -> Self {
        Self { store, price_feed }
    }

    /// Lock every `PENDING`, unlocked portfolio of a game, oldest entry first.
    ///
    /// A failure on one portfolio is written to its `error` and does not stop
    /// the others. A price feed failure aborts the whole call.
    pub async fn lock_game_portfolios(&self, game: &Game) -> Result<LockReport, SettlementError> {
        let pending: Vec<Portfolio> = self
            .store
            .portfolios_for_game(game.game_id, Some(PortfolioStatus::Pending))?
            .into_iter()
            .filter(|p| !p.is_locked)
            .collect();

        let mut report = LockReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let snapshot = self.price_feed.snapshot(&asset_ids(&pending)).await?;
        let now = now_ms();

        for mut portfolio in pending {
            let portfolio_id = portfolio.portfolio_id;
            let result = lock_portfolio(&mut portfolio, &snapshot, now)
                .map_err(|e| e.to_string())
                .and_then(|changed| {
                    if changed {
                        self.store
                            .update_portfolio(&portfolio, now)
                            .map_err(|e| e.to_string())
                    } else {
                        Ok(())
                    }
                });

            match result {
                Ok(()) => report.locked += 1,
                Err(e) => {
                    warn!("Failed to lock portfolio {}: {}", portfolio_id, e);
                    report.failed += 1;
                    if let Err(store_err) = self.store.set_portfolio_error(portfolio_id, &e, now) {
                        warn!(
                            "Could not record lock error on portfolio {}: {}",
                            portfolio_id, store_err
                        );
                    }
                }
            }
        }

        info!(
            "Game {}: locked {} portfolios ({} failed)",
            game.game_id, report.locked, report.failed
        );
        Ok(report)
    }

    /// Reprice every locked portfolio of a game and refresh the opponent summary.
    pub async fn revalue_game(&self, game: &Game) -> Result<RevalueReport, SettlementError> {
        let mut locked = self
            .store
            .portfolios_for_game(game.game_id, Some(PortfolioStatus::Locked))?;

        let mut report = RevalueReport::default();
        if locked.is_empty() {
            return Ok(report);
        }

        let snapshot = self.price_feed.snapshot(&asset_ids(&locked)).await?;
        let now = now_ms();

        for portfolio in &mut locked {
            portfolio.revalue(&snapshot);
            match self.store.update_portfolio_values(portfolio, now) {
                Ok(true) => report.revalued += 1,
                Ok(false) => {
                    debug!(
                        "Portfolio {} left LOCKED during revaluation, skipping",
                        portfolio.portfolio_id
                    );
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to revalue portfolio {}: {}", portfolio.portfolio_id, e);
                    report.failed += 1;
                }
            }

            if portfolio.is_ape {
                let summary = ApePortfolio {
                    portfolio_id: portfolio.portfolio_id,
                    current_value: portfolio.current_value,
                    performance_percentage: portfolio.performance_percentage,
                };
                self.store.set_ape_portfolio(game.game_id, &summary, now)?;
            }
        }

        debug!(
            "Game {}: revalued {} portfolios ({} failed)",
            game.game_id, report.revalued, report.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetPrice, PortfolioAsset};

    fn portfolio() -> Portfolio {
        Portfolio::new(
            1,
            1,
            "alice",
            "0xa",
            vec![
                PortfolioAsset::new("btc", "BTC", 50_000.0),
                PortfolioAsset::new("eth", "ETH", 30_000.0),
                PortfolioAsset::new("doge", "DOGE", 20_000.0),
            ],
            0,
        )
        .with_status(PortfolioStatus::Pending)
    }

    fn snapshot() -> PriceSnapshot {
        PriceSnapshot::from_prices(vec![
            AssetPrice::new("btc", 30_000.0, 0),
            AssetPrice::new("eth", 7.0, 0),
            AssetPrice::new("doge", 0.0, 0),
        ])
    }

    #[test]
    fn test_lock_computes_truncated_quantities() {
        let mut p = portfolio();
        assert!(lock_portfolio(&mut p, &snapshot(), 42).unwrap());

        assert_eq!(p.assets[0].token_qty, 1.666666);
        assert_eq!(p.assets[1].token_qty, 4285.714285);
        // Non-positive price is degenerate, not an error
        assert_eq!(p.assets[2].token_qty, 0.0);
        assert!(p.is_locked);
        assert_eq!(p.status, PortfolioStatus::Locked);
        assert_eq!(p.locked_at, Some(42));
    }

    #[test]
    fn test_lock_is_noop_when_locked() {
        let mut p = portfolio();
        lock_portfolio(&mut p, &snapshot(), 1).unwrap();
        let before = p.assets.clone();

        let other = PriceSnapshot::from_prices(vec![AssetPrice::new("btc", 1.0, 0)]);
        assert!(!lock_portfolio(&mut p, &other, 2).unwrap());
        assert_eq!(p.assets, before);
        assert!(p.is_locked);
        assert_eq!(p.locked_at, Some(1));
    }

    #[test]
    fn test_lock_rejects_invalid_allocation() {
        let mut p = portfolio();
        p.assets[1].allocation = f64::NAN;
        assert!(matches!(
            lock_portfolio(&mut p, &snapshot(), 1),
            Err(LockError::InvalidAllocation { .. })
        ));
        assert!(!p.is_locked);
    }

    #[test]
    fn test_asset_ids_deduplicated() {
        let ids = asset_ids(&[portfolio(), portfolio()]);
        assert_eq!(ids, vec!["btc", "doge", "eth"]);
    }
}
