use ape_arena::api;
use ape_arena::config::Config;
use ape_arena::services::{
    FallbackRecommender, GameLifecycleScheduler, Ledger, NotificationSink, Notifier, PaperLedger,
    PriceCache, PriceFeed, SqliteStore,
};
use ape_arena::types::{now_ms, CronType, GameCron, WinCondition};
use ape_arena::AppState;
use axum::Router;
use num_bigint::BigUint;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Starting prices for the simulated feed, per asset id.
const PAPER_PRICES: [(&str, f64); 8] = [
    ("btc", 67_000.0),
    ("eth", 3_400.0),
    ("sol", 150.0),
    ("bnb", 580.0),
    ("xrp", 0.52),
    ("ada", 0.45),
    ("doge", 0.15),
    ("avax", 35.0),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ape_arena=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    info!("Starting Ape Arena on {}:{}", config.host, config.port);

    if !config.paper_mode {
        anyhow::bail!("no live ledger client is configured; set PAPER_MODE=true");
    }

    let store = Arc::new(SqliteStore::new(&config.database_path)?);
    info!("Opened settlement store at {}", config.database_path);

    // Simulated price feed
    let (price_cache, _price_rx) = PriceCache::new();
    for (asset_id, price) in PAPER_PRICES {
        price_cache.update_price(asset_id, price);
    }
    for asset_id in &config.ape.asset_universe {
        if price_cache.get_price(asset_id).is_none() {
            price_cache.update_price(asset_id, 1.0);
        }
    }
    {
        let price_cache = price_cache.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                price_cache.simulate_tick(0.5);
            }
        });
    }

    let ledger = Arc::new(PaperLedger::new());
    let notifier = Arc::new(Notifier::default());
    {
        let mut events = notifier.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                debug!("Notification {} for {}", event.kind.as_str(), event.user_id);
            }
        });
    }

    if store.active_cron_count()? == 0 {
        let id = store.insert_cron(&default_paper_cron())?;
        info!("Seeded paper game cron {}", id);
    }

    let scheduler = Arc::new(GameLifecycleScheduler::new(
        (*config).clone(),
        store.clone(),
        ledger as Arc<dyn Ledger>,
        price_cache.clone() as Arc<dyn PriceFeed>,
        notifier as Arc<dyn NotificationSink>,
        Arc::new(FallbackRecommender::new(config.ape.asset_universe.clone())),
    ));
    let handles = scheduler.clone().start();

    let state = AppState {
        config: config.clone(),
        store,
        scheduler: scheduler.clone(),
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(api::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Ape Arena listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    info!("Shutting down scheduler");
    scheduler.shutdown();
    for handle in handles {
        handle.await.ok();
    }

    Ok(())
}

/// Recurring six-hourly MARLOWE_BANES game used when the store has no crons.
fn default_paper_cron() -> GameCron {
    GameCron {
        id: 0,
        game_type: "crypto".to_string(),
        cron_type: CronType::Recurring,
        entry_price: BigUint::from(10_000_000u64),
        start_offset_minutes: 15,
        game_duration_hours: 6,
        entry_cap: 100,
        win_condition: WinCondition::marlowe_banes(),
        recurring_schedule_hours: 6,
        next_execution: now_ms(),
        last_executed: None,
        is_active: true,
        created_at: now_ms(),
    }
}
