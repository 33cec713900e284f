//! Game lifecycle scheduler.
//!
//! Independent periodic handlers drive games from cron firing to completion.
//! Each handler derives its work from persisted status, processes items
//! oldest first, isolates per-item failures, and is skipped (not queued) when
//! its previous run is still in progress.

use crate::config::Config;
use crate::error::SettlementError;
use crate::services::distributor::RewardDistributor;
use crate::services::ledger::Ledger;
use crate::services::locker::PortfolioLocker;
use crate::services::notifier::NotificationSink;
use crate::services::price_cache::PriceFeed;
use crate::services::reconciler::TransactionReconciler;
use crate::services::recommender::{FallbackRecommender, PortfolioRecommender, SmartPortfolio};
use crate::services::run_lock::RunLocks;
use crate::services::sqlite_store::SqliteStore;
use crate::services::winners::WinnerCalculator;
use crate::types::{ape_portfolio_id, now_ms, ApePortfolio, Game, GameCron, GameStatus};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

pub const FIRE_GAME_CRONS: &str = "fire_game_crons";
pub const START_GAMES: &str = "start_games";
pub const REFRESH_ACTIVE_VALUES: &str = "refresh_active_values";
pub const END_GAMES: &str = "end_games";
pub const FINALIZE_VALUES: &str = "finalize_values";
pub const CALCULATE_WINNERS: &str = "calculate_winners";
pub const DISTRIBUTE_REWARDS: &str = "distribute_rewards";
pub const RECONCILE_PORTFOLIOS: &str = "reconcile_portfolios";

/// All handlers in lifecycle order.
pub const HANDLERS: [&str; 8] = [
    FIRE_GAME_CRONS,
    RECONCILE_PORTFOLIOS,
    START_GAMES,
    REFRESH_ACTIVE_VALUES,
    END_GAMES,
    FINALIZE_VALUES,
    CALCULATE_WINNERS,
    DISTRIBUTE_REWARDS,
];

/// Items handled by one handler run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub processed: usize,
    pub failed: usize,
}

impl TickReport {
    fn record<T>(&mut self, name: &str, item: u64, result: Result<T, SettlementError>) {
        match result {
            Ok(_) => self.processed += 1,
            Err(e) => {
                warn!("{}: item {} failed: {}", name, item, e);
                self.failed += 1;
            }
        }
    }
}

/// Cumulative counters for one handler.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerStats {
    pub name: String,
    pub running: bool,
    pub runs: u64,
    pub skipped: u64,
    pub processed: u64,
    pub failed: u64,
    pub last_run_at: Option<i64>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

pub struct GameLifecycleScheduler {
    config: Config,
    store: Arc<SqliteStore>,
    ledger: Arc<dyn Ledger>,
    recommender: Arc<dyn PortfolioRecommender>,
    fallback: FallbackRecommender,
    locker: PortfolioLocker,
    calculator: WinnerCalculator,
    distributor: RewardDistributor,
    reconciler: TransactionReconciler,
    locks: RunLocks,
    stats: DashMap<&'static str, HandlerStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameLifecycleScheduler {
    pub fn new(
        config: Config,
        store: Arc<SqliteStore>,
        ledger: Arc<dyn Ledger>,
        price_feed: Arc<dyn PriceFeed>,
        notifier: Arc<dyn NotificationSink>,
        recommender: Arc<dyn PortfolioRecommender>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            fallback: FallbackRecommender::new(config.ape.asset_universe.clone()),
            locker: PortfolioLocker::new(store.clone(), price_feed.clone()),
            calculator: WinnerCalculator::new(
                store.clone(),
                price_feed,
                notifier.clone(),
                config.scheduler.price_stale_threshold_ms,
            ),
            distributor: RewardDistributor::new(
                store.clone(),
                ledger.clone(),
                config.distribution.clone(),
            ),
            reconciler: TransactionReconciler::new(
                store.clone(),
                ledger.clone(),
                notifier,
                config.reconcile.clone(),
            ),
            locks: RunLocks::new(),
            stats: DashMap::new(),
            shutdown_tx,
            config,
            store,
            ledger,
            recommender,
        }
    }

    fn batch_limit(&self) -> usize {
        self.config.scheduler.item_batch_limit
    }

    // ========== Handler dispatch ==========

    /// Run one handler unless its previous run is still in progress.
    ///
    /// Returns `None` when the run was skipped.
    pub async fn run_handler(&self, name: &'static str) -> Option<TickReport> {
        let Some(_permit) = self.locks.try_acquire(name) else {
            debug!("{} still running, skipping tick", name);
            self.stats
                .entry(name)
                .or_insert_with(|| HandlerStats {
                    name: name.to_string(),
                    ..Default::default()
                })
                .skipped += 1;
            return None;
        };

        let started = Instant::now();
        let result = self.dispatch(name).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let mut stats = self.stats.entry(name).or_insert_with(|| HandlerStats {
            name: name.to_string(),
            ..Default::default()
        });
        stats.runs += 1;
        stats.last_run_at = Some(now_ms());
        stats.last_duration_ms = Some(elapsed);

        match result {
            Ok(report) => {
                stats.processed += report.processed as u64;
                stats.failed += report.failed as u64;
                stats.last_error = None;
                Some(report)
            }
            Err(e) => {
                error!("{} run failed: {}", name, e);
                stats.failed += 1;
                stats.last_error = Some(e.to_string());
                Some(TickReport {
                    processed: 0,
                    failed: 1,
                })
            }
        }
    }

    async fn dispatch(&self, name: &str) -> Result<TickReport, SettlementError> {
        match name {
            FIRE_GAME_CRONS => self.fire_game_crons().await,
            START_GAMES => self.start_games().await,
            REFRESH_ACTIVE_VALUES => self.refresh_active_values().await,
            END_GAMES => self.end_games().await,
            FINALIZE_VALUES => self.finalize_values().await,
            CALCULATE_WINNERS => self.calculate_winners().await,
            DISTRIBUTE_REWARDS => self.distribute_rewards().await,
            RECONCILE_PORTFOLIOS => self.reconcile_portfolios().await,
            other => Err(SettlementError::Validation(format!("unknown handler {}", other))),
        }
    }

    /// Run every handler once, in lifecycle order.
    pub async fn tick_all(&self) -> Vec<(&'static str, Option<TickReport>)> {
        let mut reports = Vec::with_capacity(HANDLERS.len());
        for name in HANDLERS {
            reports.push((name, self.run_handler(name).await));
        }
        reports
    }

    /// Spawn one periodic task per handler.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let period = self.config.scheduler.tick_interval;
        info!(
            "Starting {} scheduler handlers every {}s",
            HANDLERS.len(),
            period.as_secs()
        );

        HANDLERS
            .iter()
            .map(|&name| {
                let scheduler = self.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let mut ticker = interval(period);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                scheduler.run_handler(name).await;
                            }
                            _ = shutdown_rx.recv() => {
                                info!("{} received shutdown signal", name);
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Signal every spawned handler to stop after its current run.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Counters for every handler, in lifecycle order.
    pub fn stats(&self) -> Vec<HandlerStats> {
        HANDLERS
            .iter()
            .map(|&name| {
                let mut stats = self
                    .stats
                    .get(name)
                    .map(|s| s.value().clone())
                    .unwrap_or_else(|| HandlerStats {
                        name: name.to_string(),
                        ..Default::default()
                    });
                stats.running = self.locks.is_running(name);
                stats
            })
            .collect()
    }

    // ========== Transitions ==========

    /// Guarded compare-and-swap transition from the game's current status.
    fn advance(&self, game: &Game, next: GameStatus, now: i64) -> Result<bool, SettlementError> {
        game.check_transition(next, now)?;
        Ok(self
            .store
            .transition_game(game.game_id, game.status, next, now)?)
    }

    // ========== Handlers ==========

    async fn fire_game_crons(&self) -> Result<TickReport, SettlementError> {
        let now = now_ms();
        let crons = self.store.due_crons(now, self.batch_limit())?;
        let mut report = TickReport::default();

        for cron in crons {
            let cron_id = cron.id;
            let result = self.fire_cron(cron, now).await;
            report.record(FIRE_GAME_CRONS, cron_id as u64, result);
        }
        Ok(report)
    }

    /// Create and register the game for one due firing, then advance the cron.
    ///
    /// A game an earlier attempt of the same firing already created is reused;
    /// if it got past `TRX_PENDING` only the cron is advanced.
    pub async fn fire_cron(&self, mut cron: GameCron, now: i64) -> Result<Game, SettlementError> {
        let mut game = match self.store.game_for_cron_firing(cron.id, cron.next_execution)? {
            Some(game) => {
                debug!("Cron {} resuming game {}", cron.id, game.game_id);
                game
            }
            None => self.store.insert_game(&cron.new_game(now), now)?,
        };

        if game.status != GameStatus::TrxPending {
            cron.record_firing(now);
            self.store.update_cron_schedule(&cron)?;
            return Ok(game);
        }

        let tx_hash = self
            .ledger
            .create_game(
                game.game_id,
                game.start_time,
                game.end_time,
                &game.entry_price,
                game.entry_cap,
            )
            .await?;
        self.store.set_creation_tx(game.game_id, &tx_hash, now)?;
        game.creation_tx_hash = Some(tx_hash);

        self.advance(&game, GameStatus::Upcoming, now)?;
        game.status = GameStatus::Upcoming;

        cron.record_firing(now);
        self.store.update_cron_schedule(&cron)?;
        info!("Cron {} fired game {}", cron.id, game.game_id);
        Ok(game)
    }

    async fn start_games(&self) -> Result<TickReport, SettlementError> {
        let now = now_ms();
        let games = self.store.upcoming_games_due(now, self.batch_limit())?;
        let mut report = TickReport::default();

        for game in games {
            let result = self.start_game(&game).await;
            report.record(START_GAMES, game.game_id, result);
        }
        Ok(report)
    }

    async fn start_game(&self, game: &Game) -> Result<(), SettlementError> {
        self.ensure_ape(game).await?;
        self.locker.lock_game_portfolios(game).await?;
        self.advance(game, GameStatus::Active, now_ms())?;
        Ok(())
    }

    async fn recommend(&self, game_type: &str) -> Option<SmartPortfolio> {
        let count = self.config.ape.asset_count;
        match self.recommender.generate_smart_portfolio(game_type, count).await {
            Ok(smart) => match smart.validate() {
                Ok(()) => return Some(smart),
                Err(e) => warn!("Discarding invalid recommendation: {}", e),
            },
            Err(e) => warn!("Recommendation failed, using fallback: {}", e),
        }

        match self.fallback.generate_smart_portfolio(game_type, count).await {
            Ok(smart) => Some(smart),
            Err(e) => {
                error!("Fallback recommendation failed: {}", e);
                None
            }
        }
    }

    /// Create the game's system-opponent portfolio once.
    async fn ensure_ape(&self, game: &Game) -> Result<(), SettlementError> {
        let ape_id = ape_portfolio_id(game.game_id);
        if self.store.get_portfolio(ape_id)?.is_some() {
            return Ok(());
        }

        let Some(smart) = self.recommend(&game.game_type).await else {
            warn!("Game {} starts without a system opponent", game.game_id);
            return Ok(());
        };

        let now = now_ms();
        let strategy = smart.strategy.clone();
        let ape = smart.into_ape_portfolio(game.game_id, self.config.ape.initial_value, now);
        if self.store.insert_portfolio(&ape)? {
            self.store.set_ape_portfolio(
                game.game_id,
                &ApePortfolio {
                    portfolio_id: ape.portfolio_id,
                    current_value: ape.current_value,
                    performance_percentage: ape.performance_percentage,
                },
                now,
            )?;
            info!(
                "Game {}: system opponent created with {} assets ({})",
                game.game_id,
                ape.assets.len(),
                strategy
            );
        }
        Ok(())
    }

    async fn refresh_active_values(&self) -> Result<TickReport, SettlementError> {
        let games = self.store.active_games(now_ms(), false, self.batch_limit())?;
        let mut report = TickReport::default();

        for game in games {
            let result = self.locker.revalue_game(&game).await;
            report.record(REFRESH_ACTIVE_VALUES, game.game_id, result);
        }
        Ok(report)
    }

    async fn end_games(&self) -> Result<TickReport, SettlementError> {
        let now = now_ms();
        let games = self.store.active_games(now, true, self.batch_limit())?;
        let mut report = TickReport::default();

        for game in games {
            let result = self.advance(&game, GameStatus::UpdateValues, now);
            report.record(END_GAMES, game.game_id, result);
        }
        Ok(report)
    }

    async fn finalize_values(&self) -> Result<TickReport, SettlementError> {
        let games = self
            .store
            .games_by_status(GameStatus::UpdateValues, self.batch_limit())?;
        let mut report = TickReport::default();

        for game in games {
            let result = self.finalize_game(&game).await;
            report.record(FINALIZE_VALUES, game.game_id, result);
        }
        Ok(report)
    }

    async fn finalize_game(&self, game: &Game) -> Result<(), SettlementError> {
        let revalued = self.locker.revalue_game(game).await?;
        if revalued.failed > 0 {
            return Err(SettlementError::TransientExternal(format!(
                "{} portfolios could not be revalued",
                revalued.failed
            )));
        }
        self.advance(game, GameStatus::CalculatingWinners, now_ms())?;
        Ok(())
    }

    async fn calculate_winners(&self) -> Result<TickReport, SettlementError> {
        let games = self
            .store
            .games_by_status(GameStatus::CalculatingWinners, self.batch_limit())?;
        let mut report = TickReport::default();

        for game in games.iter().filter(|g| !g.has_calculated_winners) {
            let result = self.calculate_game(game).await;
            report.record(CALCULATE_WINNERS, game.game_id, result);
        }
        Ok(report)
    }

    /// Settle one game, moving it to `FAILED` on validation or integrity errors.
    async fn calculate_game(&self, game: &Game) -> Result<(), SettlementError> {
        let err = match self.calculator.calculate(game).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        if err.fails_game() {
            error!("Game {} failed during winner calculation: {}", game.game_id, err);
            if let Err(store_err) = self.store.fail_game(game.game_id, &err.to_string(), now_ms()) {
                error!("Could not mark game {} failed: {}", game.game_id, store_err);
                return Err(store_err.into());
            }
        }
        Err(err)
    }

    async fn distribute_rewards(&self) -> Result<TickReport, SettlementError> {
        let mut report = TickReport::default();
        match self.distributor.distribute_oldest().await {
            Ok(Some(_)) => report.processed += 1,
            Ok(None) => {}
            Err(e) => {
                warn!("Reward distribution abandoned for this tick: {}", e);
                report.failed += 1;
            }
        }
        Ok(report)
    }

    async fn reconcile_portfolios(&self) -> Result<TickReport, SettlementError> {
        let reconciled = self.reconciler.reconcile_pending(self.batch_limit()).await?;
        Ok(TickReport {
            processed: reconciled.confirmed + reconciled.failed + reconciled.retried,
            failed: reconciled.errors,
        })
    }
}
