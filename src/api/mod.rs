pub mod games;
pub mod health;
pub mod scheduler;

use crate::config::Config;
use crate::services::{GameLifecycleScheduler, SqliteStore};
use axum::Router;
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub scheduler: Arc<GameLifecycleScheduler>,
}

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api/scheduler", scheduler::router())
        .nest("/api/games", games::router())
}
