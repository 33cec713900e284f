//! Scheduler status endpoint.

use crate::services::HandlerStats;
use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(get_status))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatusResponse {
    pub tick_interval_secs: u64,
    pub paper_mode: bool,
    pub handlers: Vec<HandlerStats>,
}

/// Per-handler run counters.
pub async fn get_status(State(state): State<AppState>) -> Json<SchedulerStatusResponse> {
    Json(SchedulerStatusResponse {
        tick_interval_secs: state.config.scheduler.tick_interval.as_secs(),
        paper_mode: state.config.paper_mode,
        handlers: state.scheduler.stats(),
    })
}
