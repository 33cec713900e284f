//! Read-only game settlement snapshots.

use crate::error::{AppError, Result};
use crate::services::rank_portfolios;
use crate::types::{Game, PortfolioStatus};
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

pub fn router() -> Router<AppState> {
    Router::new().route("/:id", get(get_game))
}

/// One portfolio's standing within its game.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub portfolio_id: u64,
    pub user_id: String,
    pub status: PortfolioStatus,
    pub is_ape: bool,
    pub current_value: f64,
    pub performance_percentage: f64,
    pub rank: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    #[serde(flatten)]
    pub game: Game,
    pub standings: Vec<Standing>,
}

/// Game with its winners and current standings, best first.
pub async fn get_game(
    State(state): State<AppState>,
    Path(game_id): Path<u64>,
) -> Result<Json<GameSnapshot>> {
    let game = state
        .store
        .get_game(game_id)?
        .ok_or_else(|| AppError::NotFound(format!("game {}", game_id)))?;

    let portfolios = state.store.portfolios_for_game(game_id, None)?;
    let competing = portfolios.iter().filter(|p| {
        matches!(
            p.status,
            PortfolioStatus::Locked | PortfolioStatus::Won | PortfolioStatus::Lost
        )
    });
    let standings = rank_portfolios(competing)
        .into_iter()
        .map(|p| Standing {
            portfolio_id: p.portfolio_id,
            user_id: p.user_id.clone(),
            status: p.status,
            is_ape: p.is_ape,
            current_value: p.current_value,
            performance_percentage: p.performance_percentage,
            rank: p.game_outcome.as_ref().map(|o| o.rank),
        })
        .collect();

    Ok(Json(GameSnapshot { game, standings }))
}
