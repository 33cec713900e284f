//! Winner calculation.
//!
//! Ranking and reward assignment are pure functions of the locked portfolios,
//! the prize pool and the win condition. [`WinnerCalculator`] validates the
//! inputs, runs the algorithm and persists the result in one transaction.
//!
//! Every algorithm shares one ordering: performance descending, then entry
//! time ascending, then portfolio id ascending.

use crate::error::SettlementError;
use crate::services::notifier::NotificationSink;
use crate::services::price_cache::PriceFeed;
use crate::services::sqlite_store::SqliteStore;
use crate::types::{
    amount, now_ms, Game, NotificationEvent, NotificationKind, Placement, Portfolio,
    PortfolioStatus, RewardTier, WinCondition, WinConditionType,
};
use num_bigint::BigUint;
use num_traits::Zero;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

fn rank_order(a: &Portfolio, b: &Portfolio) -> Ordering {
    b.performance_percentage
        .total_cmp(&a.performance_percentage)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.portfolio_id.cmp(&b.portfolio_id))
}

/// Portfolios in rank order.
pub fn rank_portfolios<'a>(portfolios: impl IntoIterator<Item = &'a Portfolio>) -> Vec<&'a Portfolio> {
    let mut ranked: Vec<&Portfolio> = portfolios.into_iter().collect();
    ranked.sort_by(|a, b| rank_order(a, b));
    ranked
}

fn placement(portfolio: &Portfolio, rank: u32, reward: BigUint, is_winner: bool) -> Placement {
    Placement {
        portfolio_id: portfolio.portfolio_id,
        user_id: portfolio.user_id.clone(),
        is_ape: portfolio.is_ape,
        is_winner,
        rank,
        reward,
        performance_percentage: portfolio.performance_percentage,
    }
}

fn rank_u32(position: usize) -> u32 {
    u32::try_from(position).unwrap_or(u32::MAX)
}

/// Standings for a game's locked portfolios under its win condition.
pub fn settle(
    condition: &WinCondition,
    prize_pool: &BigUint,
    portfolios: &[Portfolio],
) -> Result<Vec<Placement>, SettlementError> {
    match condition.kind {
        WinConditionType::MarloweBanes => settle_marlowe_banes(prize_pool, portfolios),
        WinConditionType::EqualDistribute => {
            let top = condition.config.top_winners_percentage.ok_or_else(|| {
                SettlementError::Validation("topWinnersPercentage is required".to_string())
            })?;
            let reward = condition.config.reward_percentage.ok_or_else(|| {
                SettlementError::Validation("rewardPercentage is required".to_string())
            })?;
            settle_equal_distribute(top, reward, prize_pool, portfolios)
        }
        WinConditionType::Tiered => settle_tiered(&condition.config.tiers, prize_pool, portfolios),
    }
}

/// Players beat the system opponent by ending strictly above its value.
pub fn settle_marlowe_banes(
    prize_pool: &BigUint,
    portfolios: &[Portfolio],
) -> Result<Vec<Placement>, SettlementError> {
    let ape = portfolios.iter().find(|p| p.is_ape).ok_or_else(|| {
        SettlementError::DataIntegrity("system opponent portfolio is missing".to_string())
    })?;

    let ranked = rank_portfolios(portfolios.iter().filter(|p| !p.is_ape));
    let (winners, losers): (Vec<&Portfolio>, Vec<&Portfolio>) = ranked
        .into_iter()
        .partition(|p| p.current_value > ape.current_value);

    let mut placements = Vec::with_capacity(portfolios.len());

    if winners.is_empty() {
        placements.push(placement(ape, 1, BigUint::zero(), true));
        placements.extend(losers.iter().map(|p| placement(p, 2, BigUint::zero(), false)));
        return Ok(placements);
    }

    let reward = prize_pool / BigUint::from(winners.len());
    let loser_rank = rank_u32(winners.len() + 1);
    placements.extend(
        winners
            .iter()
            .enumerate()
            .map(|(i, p)| placement(p, rank_u32(i + 1), reward.clone(), true)),
    );
    placements.push(placement(ape, loser_rank, BigUint::zero(), false));
    placements.extend(
        losers
            .iter()
            .map(|p| placement(p, loser_rank, BigUint::zero(), false)),
    );
    Ok(placements)
}

/// The top share of the field splits a share of the pool evenly.
pub fn settle_equal_distribute(
    top_winners_percentage: Decimal,
    reward_percentage: Decimal,
    prize_pool: &BigUint,
    portfolios: &[Portfolio],
) -> Result<Vec<Placement>, SettlementError> {
    if top_winners_percentage <= Decimal::ZERO || top_winners_percentage > HUNDRED {
        return Err(SettlementError::Validation(format!(
            "topWinnersPercentage {} is outside (0, 100]",
            top_winners_percentage
        )));
    }
    if reward_percentage < Decimal::ZERO || reward_percentage > HUNDRED {
        return Err(SettlementError::Validation(format!(
            "rewardPercentage {} is outside [0, 100]",
            reward_percentage
        )));
    }

    let ranked = rank_portfolios(portfolios);
    if ranked.is_empty() {
        return Ok(Vec::new());
    }

    let field = Decimal::from(ranked.len() as u64);
    let top_count = (top_winners_percentage * field / HUNDRED)
        .ceil()
        .to_usize()
        .unwrap_or(ranked.len())
        .min(ranked.len());

    let reward_pool = amount::percent_of(prize_pool, reward_percentage);
    let per_winner = if top_count > 0 {
        reward_pool / BigUint::from(top_count)
    } else {
        BigUint::zero()
    };
    let loser_rank = rank_u32(top_count + 1);

    Ok(ranked
        .iter()
        .enumerate()
        .map(|(i, p)| {
            if i < top_count {
                placement(p, rank_u32(i + 1), per_winner.clone(), true)
            } else {
                placement(p, loser_rank, BigUint::zero(), false)
            }
        })
        .collect())
}

fn validate_tiers(tiers: &[RewardTier]) -> Result<(), SettlementError> {
    if tiers.is_empty() {
        return Err(SettlementError::Validation("no reward tiers configured".to_string()));
    }

    let mut positions = HashSet::new();
    let mut total = Decimal::ZERO;
    for tier in tiers {
        if tier.position == 0 {
            return Err(SettlementError::Validation(
                "tier positions start at 1".to_string(),
            ));
        }
        if !positions.insert(tier.position) {
            return Err(SettlementError::Validation(format!(
                "tier position {} is configured twice",
                tier.position
            )));
        }
        if tier.reward_percentage < Decimal::ZERO {
            return Err(SettlementError::Validation(format!(
                "tier {} has negative reward percentage",
                tier.position
            )));
        }
        total += tier.reward_percentage;
    }

    if total > HUNDRED {
        return Err(SettlementError::Validation(format!(
            "tier reward percentages sum to {}, above 100",
            total
        )));
    }
    Ok(())
}

/// Fixed pool shares for fixed finishing positions.
pub fn settle_tiered(
    tiers: &[RewardTier],
    prize_pool: &BigUint,
    portfolios: &[Portfolio],
) -> Result<Vec<Placement>, SettlementError> {
    validate_tiers(tiers)?;

    let ranked = rank_portfolios(portfolios);
    let loser_rank = rank_u32(tiers.len() + 1);
    let mut rewards = vec![None; ranked.len()];

    for tier in tiers {
        let index = tier.position as usize - 1;
        match rewards.get_mut(index) {
            Some(slot) => *slot = Some(amount::percent_of(prize_pool, tier.reward_percentage)),
            None => warn!(
                "Tier position {} exceeds the {} ranked portfolios, skipping",
                tier.position,
                ranked.len()
            ),
        }
    }

    Ok(ranked
        .iter()
        .zip(rewards)
        .enumerate()
        .map(|(i, (p, reward))| match reward {
            Some(reward) => placement(p, rank_u32(i + 1), reward, true),
            None => placement(p, loser_rank, BigUint::zero(), false),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct CalculationReport {
    pub game_id: u64,
    pub winners: usize,
    pub losers: usize,
    pub stale_assets: Vec<String>,
}

pub struct WinnerCalculator {
    store: Arc<SqliteStore>,
    price_feed: Arc<dyn PriceFeed>,
    notifier: Arc<dyn NotificationSink>,
    stale_threshold_ms: i64,
}

impl WinnerCalculator {
    pub fn new(
        store: Arc<SqliteStore>,
        price_feed: Arc<dyn PriceFeed>,
        notifier: Arc<dyn NotificationSink>,
        stale_threshold_ms: i64,
    ) -> Self {
        Self {
            store,
            price_feed,
            notifier,
            stale_threshold_ms,
        }
    }

    /// Assets whose latest price is older than the threshold. Feed failures
    /// only produce a warning.
    async fn stale_assets(&self, portfolios: &[Portfolio], now: i64) -> Vec<String> {
        let ids: Vec<String> = portfolios
            .iter()
            .flat_map(|p| p.assets.iter().map(|a| a.asset_id.to_lowercase()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }

        match self.price_feed.snapshot(&ids).await {
            Ok(snapshot) => snapshot.stale_assets(now, self.stale_threshold_ms),
            Err(e) => {
                warn!("Could not check price freshness: {}", e);
                Vec::new()
            }
        }
    }

    /// Calculate and persist a game's winners.
    ///
    /// Returns `None` if the game was already calculated. Validation and
    /// integrity errors are returned for the caller to fail the game.
    pub async fn calculate(&self, game: &Game) -> Result<Option<CalculationReport>, SettlementError> {
        if game.has_calculated_winners {
            return Ok(None);
        }

        let portfolios = self
            .store
            .portfolios_for_game(game.game_id, Some(PortfolioStatus::Locked))?;

        if let Some(bad) = portfolios
            .iter()
            .find(|p| !p.current_value.is_finite() || p.current_value == 0.0)
        {
            return Err(SettlementError::DataIntegrity(format!(
                "portfolio {} has invalid current value {}",
                bad.portfolio_id, bad.current_value
            )));
        }

        let now = now_ms();
        let stale_assets = self.stale_assets(&portfolios, now).await;
        if !stale_assets.is_empty() {
            warn!(
                "Game {}: prices older than {}ms for {}",
                game.game_id,
                self.stale_threshold_ms,
                stale_assets.join(", ")
            );
        }

        let placements = settle(&game.win_condition, &game.total_prize_pool, &portfolios)?;

        if !self.store.record_settlement(game.game_id, &placements, now)? {
            info!("Game {} was already settled", game.game_id);
            return Ok(None);
        }

        let winners = placements.iter().filter(|p| p.is_winner).count();
        for placement in placements.iter().filter(|p| !p.is_ape) {
            if let Err(e) = self.store.record_user_outcome(
                &placement.user_id,
                placement.is_winner,
                &placement.reward,
                now,
            ) {
                warn!("Failed to update stats for {}: {}", placement.user_id, e);
            }
            self.notifier.emit(outcome_notification(game.game_id, placement));
        }

        info!(
            "Game {} settled: {} winners of {} portfolios",
            game.game_id,
            winners,
            placements.len()
        );
        Ok(Some(CalculationReport {
            game_id: game.game_id,
            winners,
            losers: placements.len() - winners,
            stale_assets,
        }))
    }
}

fn outcome_notification(game_id: u64, placement: &Placement) -> NotificationEvent {
    if placement.is_winner {
        NotificationEvent::new(
            NotificationKind::PortfolioWon,
            &placement.user_id,
            game_id,
            placement.portfolio_id,
            format!("You finished #{} in game {}", placement.rank, game_id),
        )
        .with_message(format!("Reward: {}", placement.reward))
    } else {
        NotificationEvent::new(
            NotificationKind::PortfolioLost,
            &placement.user_id,
            game_id,
            placement.portfolio_id,
            format!("Game {} has ended", game_id),
        )
    }
}
