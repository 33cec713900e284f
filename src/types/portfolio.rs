//! Portfolio Types
//!
//! A portfolio is one participant's allocation in one game. Allocations are fixed
//! at entry; token quantities are fixed when the portfolio is locked at game start.

use crate::types::PriceSnapshot;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Portfolio ids at or above this offset belong to system opponents.
pub const APE_PORTFOLIO_ID_OFFSET: u64 = 9_000_000_000_000;

/// User id recorded on system-opponent portfolios.
pub const APE_USER_ID: &str = "system-ape";

/// Deterministic system-opponent portfolio id for a game.
pub fn ape_portfolio_id(game_id: u64) -> u64 {
    APE_PORTFOLIO_ID_OFFSET + game_id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortfolioStatus {
    /// Entry confirmed, waiting for game start
    Pending,
    /// Token quantities frozen
    Locked,
    Won,
    Lost,
    Failed,
    /// Entry submitted to the ledger, not yet confirmed
    PendingLockBalance,
    AwaitingDecision,
}

impl PortfolioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortfolioStatus::Pending => "PENDING",
            PortfolioStatus::Locked => "LOCKED",
            PortfolioStatus::Won => "WON",
            PortfolioStatus::Lost => "LOST",
            PortfolioStatus::Failed => "FAILED",
            PortfolioStatus::PendingLockBalance => "PENDING_LOCK_BALANCE",
            PortfolioStatus::AwaitingDecision => "AWAITING_DECISION",
        }
    }
}

impl fmt::Display for PortfolioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortfolioStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PortfolioStatus::Pending),
            "LOCKED" => Ok(PortfolioStatus::Locked),
            "WON" => Ok(PortfolioStatus::Won),
            "LOST" => Ok(PortfolioStatus::Lost),
            "FAILED" => Ok(PortfolioStatus::Failed),
            "PENDING_LOCK_BALANCE" => Ok(PortfolioStatus::PendingLockBalance),
            "AWAITING_DECISION" => Ok(PortfolioStatus::AwaitingDecision),
            other => Err(format!("unknown portfolio status: {}", other)),
        }
    }
}

/// One holding inside a portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioAsset {
    pub asset_id: String,
    pub symbol: String,
    /// Value allocated at entry, in the portfolio's valuation unit
    pub allocation: f64,
    /// Units held; zero until locked
    pub token_qty: f64,
    /// Price used when locking
    pub locked_price: Option<f64>,
    /// Most recent price used for valuation
    pub last_price: Option<f64>,
}

impl PortfolioAsset {
    pub fn new(asset_id: impl Into<String>, symbol: impl Into<String>, allocation: f64) -> Self {
        Self {
            asset_id: asset_id.into(),
            symbol: symbol.into(),
            allocation,
            token_qty: 0.0,
            locked_price: None,
            last_price: None,
        }
    }
}

/// Result of settlement written onto the portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOutcome {
    pub is_winner: bool,
    #[serde(with = "crate::types::amount")]
    pub reward: BigUint,
    pub rank: u32,
    pub settled_at: i64,
    pub reward_transaction_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub portfolio_id: u64,
    pub game_id: u64,
    pub user_id: String,
    /// Ledger address expected to own this portfolio
    pub wallet_address: String,
    pub assets: Vec<PortfolioAsset>,
    pub status: PortfolioStatus,
    pub is_locked: bool,
    pub is_ape: bool,
    pub initial_value: f64,
    pub current_value: f64,
    pub performance_percentage: f64,
    pub game_outcome: Option<GameOutcome>,
    pub retry_count: u32,
    pub last_retry_at: Option<i64>,
    pub transaction_hash: Option<String>,
    pub locked_at: Option<i64>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Portfolio {
    /// New player entry awaiting ledger confirmation.
    ///
    /// The initial value is the sum of the allocations.
    pub fn new(
        portfolio_id: u64,
        game_id: u64,
        user_id: impl Into<String>,
        wallet_address: impl Into<String>,
        assets: Vec<PortfolioAsset>,
        created_at: i64,
    ) -> Self {
        let initial_value: f64 = assets.iter().map(|a| a.allocation).sum();
        Self {
            portfolio_id,
            game_id,
            user_id: user_id.into(),
            wallet_address: wallet_address.into(),
            assets,
            status: PortfolioStatus::PendingLockBalance,
            is_locked: false,
            is_ape: false,
            initial_value,
            current_value: initial_value,
            performance_percentage: 0.0,
            game_outcome: None,
            retry_count: 0,
            last_retry_at: None,
            transaction_hash: None,
            locked_at: None,
            error: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// System-opponent portfolio for a game. It never pays an entry fee, so it
    /// starts out confirmed.
    pub fn ape(game_id: u64, assets: Vec<PortfolioAsset>, created_at: i64) -> Self {
        let mut portfolio = Self::new(
            ape_portfolio_id(game_id),
            game_id,
            APE_USER_ID,
            String::new(),
            assets,
            created_at,
        );
        portfolio.is_ape = true;
        portfolio.status = PortfolioStatus::Pending;
        portfolio
    }

    pub fn with_status(mut self, status: PortfolioStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_transaction_hash(mut self, hash: impl Into<String>) -> Self {
        self.transaction_hash = Some(hash.into());
        self
    }

    /// Recompute value and performance from locked quantities.
    ///
    /// Assets without a usable price in the snapshot keep their last known price.
    pub fn revalue(&mut self, prices: &PriceSnapshot) {
        let mut total = 0.0;
        for asset in &mut self.assets {
            if let Some(price) = prices.price(&asset.asset_id) {
                asset.last_price = Some(price);
            }
            let price = asset.last_price.or(asset.locked_price).unwrap_or(0.0);
            total += asset.token_qty * price;
        }
        self.current_value = total;
        self.performance_percentage = performance_percentage(self.initial_value, total);
    }
}

/// Percentage gain of `current` over `initial`; zero when there is no basis.
pub fn performance_percentage(initial: f64, current: f64) -> f64 {
    if initial > 0.0 && initial.is_finite() {
        (current - initial) / initial * 100.0
    } else {
        0.0
    }
}
