use crate::services::StoreError;
use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    paper_mode: bool,
    store_ok: bool,
    active_crons: Option<u64>,
    running_handlers: usize,
}

impl HealthResponse {
    fn new(active_crons: Result<u64, StoreError>, running_handlers: usize, paper_mode: bool) -> Self {
        let active_crons = match active_crons {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Health check could not read the store: {}", e);
                None
            }
        };
        let store_ok = active_crons.is_some();

        Self {
            status: if store_ok { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            paper_mode,
            store_ok,
            active_crons,
            running_handlers,
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let running = state
        .scheduler
        .stats()
        .iter()
        .filter(|s| s.running)
        .count();
    Json(HealthResponse::new(
        state.store.active_cron_count(),
        running,
        state.config.paper_mode,
    ))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::{
        FallbackRecommender, GameLifecycleScheduler, Ledger, NotificationSink, Notifier,
        PaperLedger, PriceCache, PriceFeed, SqliteStore,
    };
    use std::sync::Arc;

    fn state() -> AppState {
        let config = Config::default();
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let (prices, _rx) = PriceCache::new();
        let scheduler = GameLifecycleScheduler::new(
            config.clone(),
            store.clone(),
            Arc::new(PaperLedger::new()) as Arc<dyn Ledger>,
            prices as Arc<dyn PriceFeed>,
            Arc::new(Notifier::default()) as Arc<dyn NotificationSink>,
            Arc::new(FallbackRecommender::new(vec!["btc".to_string()])),
        );
        AppState {
            config: Arc::new(config),
            store,
            scheduler: Arc::new(scheduler),
        }
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse::new(Ok(2), 1, true);

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"storeOk\":true"));
        assert!(json.contains("\"activeCrons\":2"));
        assert!(json.contains("\"runningHandlers\":1"));
    }

    #[test]
    fn test_store_failure_degrades_status() {
        let response = HealthResponse::new(Err(StoreError::Poisoned), 0, true);

        assert_eq!(response.status, "degraded");
        assert!(!response.store_ok);
        assert_eq!(response.active_crons, None);
        assert!(!response.version.is_empty());
    }

    #[tokio::test]
    async fn test_health_handler() {
        let Json(response) = health(State(state())).await;
        assert_eq!(response.status, "ok");
        assert_eq!(response.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(response.active_crons, Some(0));
        assert_eq!(response.running_handlers, 0);
    }
}
