//! Game Types
//!
//! A game is one timed contest. Its status only moves forward through
//! [`GameStatus::LIFECYCLE`] or drops to [`GameStatus::Failed`].

use num_bigint::BigUint;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    /// Created locally, waiting for the ledger registration to go through
    TrxPending,
    /// Registered, accepting entries until start time
    Upcoming,
    /// Portfolios are locked and the contest is running
    Active,
    /// Ended, waiting for the final valuation
    UpdateValues,
    /// Values are final; winners are computed and then paid out
    CalculatingWinners,
    /// All rewards distributed
    Completed,
    /// Unrecoverable validation or integrity failure
    Failed,
}

impl GameStatus {
    /// Forward order of the non-failure states.
    pub const LIFECYCLE: [GameStatus; 6] = [
        GameStatus::TrxPending,
        GameStatus::Upcoming,
        GameStatus::Active,
        GameStatus::UpdateValues,
        GameStatus::CalculatingWinners,
        GameStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::TrxPending => "TRX_PENDING",
            GameStatus::Upcoming => "UPCOMING",
            GameStatus::Active => "ACTIVE",
            GameStatus::UpdateValues => "UPDATE_VALUES",
            GameStatus::CalculatingWinners => "CALCULATING_WINNERS",
            GameStatus::Completed => "COMPLETED",
            GameStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GameStatus::Completed | GameStatus::Failed)
    }

    fn position(&self) -> Option<usize> {
        Self::LIFECYCLE.iter().position(|s| s == self)
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: GameStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == GameStatus::Failed {
            return true;
        }
        match (self.position(), next.position()) {
            (Some(from), Some(to)) => to == from + 1,
            _ => false,
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRX_PENDING" => Ok(GameStatus::TrxPending),
            "UPCOMING" => Ok(GameStatus::Upcoming),
            "ACTIVE" => Ok(GameStatus::Active),
            "UPDATE_VALUES" => Ok(GameStatus::UpdateValues),
            "CALCULATING_WINNERS" => Ok(GameStatus::CalculatingWinners),
            "COMPLETED" => Ok(GameStatus::Completed),
            "FAILED" => Ok(GameStatus::Failed),
            other => Err(format!("unknown game status: {}", other)),
        }
    }
}

/// Why a status transition was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: GameStatus, to: GameStatus },

    #[error("game has no ledger registration yet")]
    NotRegistered,

    #[error("game starts at {start_time}, now is {now}")]
    NotStarted { start_time: i64, now: i64 },

    #[error("game ends at {end_time}, now is {now}")]
    NotEnded { end_time: i64, now: i64 },

    #[error("winners have not been calculated")]
    WinnersNotCalculated,

    #[error("rewards are not fully distributed")]
    NotFullyDistributed,
}

// =============================================================================
// Win condition
// =============================================================================

/// Payout algorithm attached to a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WinConditionType {
    /// Beat the system opponent
    MarloweBanes,
    /// Top N% split a share of the pool evenly
    EqualDistribute,
    /// Fixed positions get fixed percentages
    Tiered,
}

impl fmt::Display for WinConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WinConditionType::MarloweBanes => write!(f, "MARLOWE_BANES"),
            WinConditionType::EqualDistribute => write!(f, "EQUAL_DISTRIBUTE"),
            WinConditionType::Tiered => write!(f, "TIERED"),
        }
    }
}

/// A fixed-position payout rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardTier {
    /// 1-indexed rank
    pub position: u32,
    pub reward_percentage: Decimal,
}

/// Algorithm parameters. Which fields are required depends on the condition type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WinConditionConfig {
    pub top_winners_percentage: Option<Decimal>,
    pub reward_percentage: Option<Decimal>,
    pub tiers: Vec<RewardTier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinCondition {
    #[serde(rename = "type")]
    pub kind: WinConditionType,
    #[serde(default)]
    pub config: WinConditionConfig,
}

impl WinCondition {
    pub fn marlowe_banes() -> Self {
        Self {
            kind: WinConditionType::MarloweBanes,
            config: WinConditionConfig::default(),
        }
    }

    pub fn equal_distribute(top_winners_percentage: Decimal, reward_percentage: Decimal) -> Self {
        Self {
            kind: WinConditionType::EqualDistribute,
            config: WinConditionConfig {
                top_winners_percentage: Some(top_winners_percentage),
                reward_percentage: Some(reward_percentage),
                tiers: Vec::new(),
            },
        }
    }

    pub fn tiered(tiers: Vec<RewardTier>) -> Self {
        Self {
            kind: WinConditionType::Tiered,
            config: WinConditionConfig {
                tiers,
                ..Default::default()
            },
        }
    }
}

// =============================================================================
// Winners and placements
// =============================================================================

/// Entry in a game's append-only winner list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Winner {
    pub user_id: String,
    pub portfolio_id: u64,
    pub rank: u32,
    pub performance_percentage: f64,
    #[serde(with = "crate::types::amount")]
    pub reward: BigUint,
    pub is_ape: bool,
    pub is_reward_distributed: bool,
    pub distribution_ref: Option<String>,
}

/// Final standing of one portfolio, winner or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub portfolio_id: u64,
    pub user_id: String,
    pub is_ape: bool,
    pub is_winner: bool,
    pub rank: u32,
    #[serde(with = "crate::types::amount")]
    pub reward: BigUint,
    pub performance_percentage: f64,
}

/// Snapshot of the system opponent's standing kept on the game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApePortfolio {
    pub portfolio_id: u64,
    pub current_value: f64,
    pub performance_percentage: f64,
}

// =============================================================================
// Game
// =============================================================================

/// Parameters for a game that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewGame {
    pub game_type: String,
    pub start_time: i64,
    pub end_time: i64,
    pub entry_price: BigUint,
    pub entry_cap: u32,
    pub win_condition: WinCondition,
    pub game_cron_id: Option<i64>,
    pub scheduled_for: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub game_id: u64,
    pub status: GameStatus,
    pub game_type: String,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(with = "crate::types::amount")]
    pub entry_price: BigUint,
    pub entry_cap: u32,
    #[serde(with = "crate::types::amount")]
    pub total_prize_pool: BigUint,
    pub participant_count: u64,
    pub win_condition: WinCondition,
    pub winners: Vec<Winner>,
    pub has_calculated_winners: bool,
    pub is_fully_distributed: bool,
    pub ape_portfolio: Option<ApePortfolio>,
    pub error: Option<String>,
    pub game_cron_id: Option<i64>,
    pub scheduled_for: Option<i64>,
    pub creation_tx_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Game {
    /// Check the guard for moving this game to `next` at time `now`.
    pub fn check_transition(&self, next: GameStatus, now: i64) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next,
            });
        }

        match next {
            GameStatus::Upcoming if self.creation_tx_hash.is_none() => {
                Err(TransitionError::NotRegistered)
            }
            GameStatus::Active if self.start_time > now => Err(TransitionError::NotStarted {
                start_time: self.start_time,
                now,
            }),
            GameStatus::UpdateValues if self.end_time > now => Err(TransitionError::NotEnded {
                end_time: self.end_time,
                now,
            }),
            GameStatus::Completed if !self.has_calculated_winners => {
                Err(TransitionError::WinnersNotCalculated)
            }
            GameStatus::Completed if !self.is_fully_distributed => {
                Err(TransitionError::NotFullyDistributed)
            }
            _ => Ok(()),
        }
    }

    pub fn has_started(&self, now: i64) -> bool {
        self.start_time <= now
    }

    pub fn has_ended(&self, now: i64) -> bool {
        self.end_time <= now
    }

    /// Winners still waiting for a payout reference.
    pub fn undistributed_winners(&self) -> impl Iterator<Item = &Winner> {
        self.winners.iter().filter(|w| !w.is_reward_distributed)
    }
}
