//! Shared fixtures for the settlement integration tests.

#![allow(dead_code)]

use ape_arena::config::Config;
use ape_arena::services::scheduler::{
    CALCULATE_WINNERS, END_GAMES, FINALIZE_VALUES, FIRE_GAME_CRONS, RECONCILE_PORTFOLIOS,
    START_GAMES,
};
use ape_arena::services::{
    FallbackRecommender, GameLifecycleScheduler, Ledger, NotificationSink, Notifier, PaperLedger,
    PortfolioRecommender, PriceCache, PriceFeed, SqliteStore,
};
use ape_arena::types::{
    now_ms, CronType, Game, GameCron, GameStatus, Portfolio, PortfolioAsset, WinCondition,
};
use num_bigint::BigUint;
use std::sync::Arc;
use std::time::Duration;

pub const ENTRY_PRICE: u64 = 1_000_000;
pub const STAKE: f64 = 100_000.0;

/// Config with the opponent holding btc and eth, and no real waiting.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.ape.asset_universe = vec!["btc".to_string(), "eth".to_string()];
    config.ape.asset_count = 2;
    config.ape.initial_value = STAKE;
    config.distribution.batch_delay = Duration::from_millis(1);
    config.distribution.retry_base_delay = Duration::from_millis(1);
    config.distribution.max_attempts = 3;
    config.reconcile.retry_interval = Duration::ZERO;
    config.reconcile.max_retries = 3;
    config
}

pub struct Harness {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub ledger: Arc<PaperLedger>,
    pub prices: Arc<PriceCache>,
    pub notifier: Arc<Notifier>,
    pub scheduler: GameLifecycleScheduler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let recommender = Arc::new(FallbackRecommender::new(config.ape.asset_universe.clone()));
        Self::build(
            config,
            Arc::new(SqliteStore::new_in_memory().unwrap()),
            recommender,
        )
    }

    /// Harness with a caller-supplied store and primary recommender.
    pub fn build(
        config: Config,
        store: Arc<SqliteStore>,
        recommender: Arc<dyn PortfolioRecommender>,
    ) -> Self {
        let ledger = Arc::new(PaperLedger::new());
        let (prices, _rx) = PriceCache::new();
        prices.update_price("btc", 100.0);
        prices.update_price("eth", 100.0);
        prices.update_price("sol", 10.0);
        prices.update_price("ada", 10.0);
        prices.update_price("doge", 10.0);
        let notifier = Arc::new(Notifier::default());

        let scheduler = GameLifecycleScheduler::new(
            config.clone(),
            store.clone(),
            ledger.clone() as Arc<dyn Ledger>,
            prices.clone() as Arc<dyn PriceFeed>,
            notifier.clone() as Arc<dyn NotificationSink>,
            recommender,
        );

        Self {
            config,
            store,
            ledger,
            prices,
            notifier,
            scheduler,
        }
    }

    /// Insert a one-shot cron that is already due and fire it.
    pub async fn fire_game(&self, win_condition: WinCondition) -> Game {
        let now = now_ms();
        let cron = GameCron {
            id: 0,
            game_type: "crypto".to_string(),
            cron_type: CronType::Once,
            entry_price: BigUint::from(ENTRY_PRICE),
            start_offset_minutes: 0,
            game_duration_hours: 0,
            entry_cap: 10,
            win_condition,
            recurring_schedule_hours: 0,
            next_execution: now - 1_000,
            last_executed: None,
            is_active: true,
            created_at: now,
        };
        let cron_id = self.store.insert_cron(&cron).unwrap();

        let report = self.scheduler.run_handler(FIRE_GAME_CRONS).await.unwrap();
        assert_eq!(report.failed, 0);

        let game = self
            .store
            .game_for_cron_firing(cron_id, cron.next_execution)
            .unwrap()
            .expect("cron should have created a game");
        assert_eq!(game.status, GameStatus::Upcoming);
        game
    }

    /// Pay the entry fee on the ledger and record the pending portfolio.
    ///
    /// The whole stake goes into a single asset.
    pub fn enter(&self, game_id: u64, portfolio_id: u64, user: &str, asset: &str, created_at: i64) -> Portfolio {
        let wallet = format!("0x{}", user);
        let hash = self
            .ledger
            .enter_portfolio(portfolio_id, game_id, &wallet)
            .unwrap();
        let portfolio = Portfolio::new(
            portfolio_id,
            game_id,
            user,
            wallet,
            vec![PortfolioAsset::new(asset, asset.to_uppercase(), STAKE)],
            created_at,
        )
        .with_transaction_hash(hash);
        assert!(self.store.insert_portfolio(&portfolio).unwrap());
        portfolio
    }

    pub fn game(&self, game_id: u64) -> Game {
        self.store.get_game(game_id).unwrap().unwrap()
    }

    pub fn portfolio(&self, portfolio_id: u64) -> Portfolio {
        self.store.get_portfolio(portfolio_id).unwrap().unwrap()
    }

    /// Confirm entries, start the game, move prices, and take final values.
    /// The game is left awaiting winner calculation.
    pub async fn play_until_finalized(&self, game_id: u64, closing_prices: &[(&str, f64)]) -> Game {
        self.start(game_id).await;

        for (asset, price) in closing_prices {
            self.prices.update_price(asset, *price);
        }

        self.scheduler.run_handler(END_GAMES).await.unwrap();
        self.scheduler.run_handler(FINALIZE_VALUES).await.unwrap();
        let game = self.game(game_id);
        assert_eq!(game.status, GameStatus::CalculatingWinners);
        game
    }

    /// Confirm entries and start the game.
    pub async fn start(&self, game_id: u64) -> Game {
        self.scheduler.run_handler(RECONCILE_PORTFOLIOS).await.unwrap();
        self.scheduler.run_handler(START_GAMES).await.unwrap();
        let game = self.game(game_id);
        assert_eq!(game.status, GameStatus::Active);
        game
    }

    /// Play a game through winner calculation.
    pub async fn play_until_calculated(&self, game_id: u64, closing_prices: &[(&str, f64)]) -> Game {
        self.play_until_finalized(game_id, closing_prices).await;
        self.scheduler.run_handler(CALCULATE_WINNERS).await.unwrap();
        self.game(game_id)
    }
}
