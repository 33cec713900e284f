//! End-to-end game lifecycle tests against the paper ledger.

mod common;

use ape_arena::services::scheduler::{CALCULATE_WINNERS, DISTRIBUTE_REWARDS, FIRE_GAME_CRONS};
use ape_arena::services::{
    FallbackRecommender, NotificationSink, PriceFeed, SqliteStore, WinnerCalculator,
};
use ape_arena::types::{
    ape_portfolio_id, now_ms, GameStatus, NotificationKind, PortfolioStatus, RewardTier,
    TransactionType, WinCondition,
};
use common::{test_config, Harness, ENTRY_PRICE};
use num_bigint::BigUint;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn over_allocated_tiers() -> WinCondition {
    WinCondition::tiered(vec![
        RewardTier {
            position: 1,
            reward_percentage: dec!(70),
        },
        RewardTier {
            position: 2,
            reward_percentage: dec!(40),
        },
    ])
}

// =============================================================================
// MARLOWE_BANES
// =============================================================================

#[tokio::test]
async fn test_marlowe_banes_full_lifecycle() {
    let h = Harness::new();
    let mut notifications = h.notifier.subscribe();

    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    assert!(game.creation_tx_hash.is_some());

    let now = now_ms();
    h.enter(game.game_id, 1, "alice", "sol", now);
    h.enter(game.game_id, 2, "bob", "ada", now + 1);

    // sol doubles, ada halves, the opponent's btc/eth stay flat
    let calculated = h
        .play_until_calculated(game.game_id, &[("sol", 20.0), ("ada", 5.0)])
        .await;
    assert_eq!(calculated.status, GameStatus::CalculatingWinners);
    assert!(calculated.has_calculated_winners);
    assert_eq!(calculated.participant_count, 2);
    assert_eq!(calculated.total_prize_pool, BigUint::from(2 * ENTRY_PRICE));

    let report = h.scheduler.run_handler(DISTRIBUTE_REWARDS).await.unwrap();
    assert_eq!(report.processed, 1);

    let game = h.game(game.game_id);
    assert_eq!(game.status, GameStatus::Completed);
    assert!(game.is_fully_distributed);
    assert_eq!(game.winners.len(), 1);

    let winner = &game.winners[0];
    assert_eq!(winner.portfolio_id, 1);
    assert_eq!(winner.rank, 1);
    assert_eq!(winner.reward, BigUint::from(2 * ENTRY_PRICE));
    assert!(winner.is_reward_distributed);

    let payouts = h.ledger.payouts(game.game_id);
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].portfolio_id, 1);
    assert_eq!(payouts[0].amount, BigUint::from(2 * ENTRY_PRICE));
    assert_eq!(winner.distribution_ref.as_deref(), Some(payouts[0].tx_hash.as_str()));

    let alice = h.portfolio(1);
    assert_eq!(alice.status, PortfolioStatus::Won);
    let outcome = alice.game_outcome.unwrap();
    assert_eq!(outcome.rank, 1);
    assert_eq!(
        outcome.reward_transaction_ref.as_deref(),
        Some(payouts[0].tx_hash.as_str())
    );

    let bob = h.portfolio(2);
    assert_eq!(bob.status, PortfolioStatus::Lost);
    assert_eq!(bob.game_outcome.unwrap().rank, 2);

    let ape = h.portfolio(ape_portfolio_id(game.game_id));
    assert_eq!(ape.status, PortfolioStatus::Lost);
    assert_eq!(ape.game_outcome.unwrap().rank, 2);

    let transactions = h.store.transactions_for_game(game.game_id).unwrap();
    assert_eq!(
        transactions
            .iter()
            .filter(|t| t.tx_type == TransactionType::EntryFee)
            .count(),
        2
    );
    let rewards: Vec<_> = transactions
        .iter()
        .filter(|t| t.tx_type == TransactionType::Reward)
        .collect();
    assert_eq!(rewards.len(), 1);
    assert_eq!(rewards[0].portfolio_id, 1);
    assert!(rewards[0].block_number.is_some());

    let alice_stats = h.store.get_user_stats("alice").unwrap().unwrap();
    assert_eq!(alice_stats.games_won, 1);
    assert_eq!(alice_stats.total_rewards, BigUint::from(2 * ENTRY_PRICE));
    let bob_stats = h.store.get_user_stats("bob").unwrap().unwrap();
    assert_eq!(bob_stats.games_played, 1);
    assert_eq!(bob_stats.games_won, 0);
    assert!(h.store.get_user_stats("system-ape").unwrap().is_none());

    let mut kinds = Vec::new();
    while let Ok(event) = notifications.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds.iter().filter(|k| **k == NotificationKind::PortfolioCreated).count(),
        2
    );
    assert_eq!(
        kinds.iter().filter(|k| **k == NotificationKind::PortfolioWon).count(),
        1
    );
    assert_eq!(
        kinds.iter().filter(|k| **k == NotificationKind::PortfolioLost).count(),
        1
    );
}

#[tokio::test]
async fn test_marlowe_banes_opponent_wins_without_payout() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;

    let now = now_ms();
    h.enter(game.game_id, 1, "alice", "sol", now);
    h.enter(game.game_id, 2, "bob", "ada", now + 1);

    h.play_until_calculated(game.game_id, &[("sol", 9.0), ("ada", 5.0)])
        .await;
    h.scheduler.run_handler(DISTRIBUTE_REWARDS).await.unwrap();

    let game = h.game(game.game_id);
    assert_eq!(game.status, GameStatus::Completed);
    assert_eq!(game.winners.len(), 1);

    let winner = &game.winners[0];
    assert!(winner.is_ape);
    assert_eq!(winner.rank, 1);
    assert_eq!(winner.reward, BigUint::from(0u32));
    assert!(winner.is_reward_distributed);
    assert!(winner.distribution_ref.as_deref().unwrap().starts_with("ape-"));

    assert_eq!(h.ledger.call_count("batch_assign_rewards"), 0);
    assert_eq!(h.portfolio(1).game_outcome.unwrap().rank, 2);
    assert_eq!(h.portfolio(2).game_outcome.unwrap().rank, 2);
}

#[tokio::test]
async fn test_marlowe_banes_tie_with_opponent_loses() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    h.enter(game.game_id, 1, "alice", "sol", now_ms());

    h.play_until_calculated(game.game_id, &[]).await;

    let alice = h.portfolio(1);
    assert_eq!(alice.status, PortfolioStatus::Lost);
    let game = h.game(game.game_id);
    assert_eq!(game.winners.len(), 1);
    assert!(game.winners[0].is_ape);
}

// =============================================================================
// EQUAL_DISTRIBUTE and TIERED
// =============================================================================

#[tokio::test]
async fn test_equal_distribute_pays_players_and_marks_opponent() {
    let h = Harness::new();
    let game = h
        .fire_game(WinCondition::equal_distribute(dec!(50), dec!(90)))
        .await;

    let now = now_ms();
    h.enter(game.game_id, 1, "alice", "sol", now);
    h.enter(game.game_id, 2, "bob", "ada", now + 1);

    // Field of three with the opponent: ceil(1.5) = 2 winners
    let calculated = h
        .play_until_calculated(game.game_id, &[("sol", 20.0), ("ada", 5.0)])
        .await;
    assert_eq!(calculated.winners.len(), 2);
    assert_eq!(calculated.winners[0].portfolio_id, 1);
    assert!(calculated.winners[1].is_ape);

    let per_winner = BigUint::from(2 * ENTRY_PRICE * 90 / 100 / 2);
    assert!(calculated.winners.iter().all(|w| w.reward == per_winner));

    h.scheduler.run_handler(DISTRIBUTE_REWARDS).await.unwrap();

    let game = h.game(game.game_id);
    assert_eq!(game.status, GameStatus::Completed);
    assert!(game.winners.iter().all(|w| w.is_reward_distributed));

    let payouts = h.ledger.payouts(game.game_id);
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].portfolio_id, 1);
    assert_eq!(payouts[0].amount, per_winner);

    assert_eq!(h.portfolio(2).game_outcome.unwrap().rank, 3);
}

#[tokio::test]
async fn test_tiered_over_one_hundred_percent_fails_game() {
    let h = Harness::new();
    let game = h.fire_game(over_allocated_tiers()).await;
    h.enter(game.game_id, 1, "alice", "sol", now_ms());

    let game = h.play_until_calculated(game.game_id, &[("sol", 20.0)]).await;

    assert_eq!(game.status, GameStatus::Failed);
    assert!(game.error.unwrap().contains("above 100"));
    assert!(game.winners.is_empty());
    assert!(!game.has_calculated_winners);
    assert_eq!(h.portfolio(1).status, PortfolioStatus::Locked);

    h.scheduler.run_handler(DISTRIBUTE_REWARDS).await.unwrap();
    assert_eq!(h.ledger.call_count("batch_assign_rewards"), 0);
}

#[tokio::test]
async fn test_tiered_pays_configured_positions() {
    let h = Harness::new();
    let game = h
        .fire_game(WinCondition::tiered(vec![
            RewardTier {
                position: 1,
                reward_percentage: dec!(60),
            },
            RewardTier {
                position: 3,
                reward_percentage: dec!(25),
            },
        ]))
        .await;

    let now = now_ms();
    h.enter(game.game_id, 1, "alice", "sol", now);
    h.enter(game.game_id, 2, "bob", "ada", now + 1);

    // alice +100%, opponent 0%, bob -50%
    h.play_until_calculated(game.game_id, &[("sol", 20.0), ("ada", 5.0)])
        .await;
    h.scheduler.run_handler(DISTRIBUTE_REWARDS).await.unwrap();

    let game = h.game(game.game_id);
    assert_eq!(game.status, GameStatus::Completed);

    let pool = 2 * ENTRY_PRICE;
    let payouts = h.ledger.payouts(game.game_id);
    let paid: Vec<(u64, BigUint)> = payouts
        .iter()
        .map(|p| (p.portfolio_id, p.amount.clone()))
        .collect();
    assert_eq!(
        paid,
        vec![
            (1, BigUint::from(pool * 60 / 100)),
            (2, BigUint::from(pool * 25 / 100)),
        ]
    );

    let ape = h.portfolio(ape_portfolio_id(game.game_id));
    assert_eq!(ape.status, PortfolioStatus::Lost);
    assert_eq!(ape.game_outcome.unwrap().rank, 3);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_zero_portfolio_value_fails_game() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    h.enter(game.game_id, 1, "alice", "sol", now_ms());
    h.play_until_finalized(game.game_id, &[("sol", 20.0)]).await;

    let mut alice = h.portfolio(1);
    alice.current_value = 0.0;
    assert!(h.store.update_portfolio_values(&alice, now_ms()).unwrap());

    let report = h.scheduler.run_handler(CALCULATE_WINNERS).await.unwrap();
    assert_eq!(report.failed, 1);

    let game = h.game(game.game_id);
    assert_eq!(game.status, GameStatus::Failed);
    assert!(game.error.unwrap().contains("invalid current value"));
    assert!(!game.has_calculated_winners);
    assert!(game.winners.is_empty());
    assert_eq!(h.portfolio(1).status, PortfolioStatus::Locked);
}

#[tokio::test]
async fn test_failed_game_does_not_block_batch() {
    let h = Harness::new();
    let broken = h.fire_game(over_allocated_tiers()).await;
    let healthy = h.fire_game(WinCondition::marlowe_banes()).await;

    let now = now_ms();
    h.enter(broken.game_id, 1, "alice", "sol", now);
    h.enter(healthy.game_id, 2, "bob", "sol", now + 1);
    h.play_until_finalized(broken.game_id, &[("sol", 20.0)]).await;
    assert_eq!(h.game(healthy.game_id).status, GameStatus::CalculatingWinners);

    let report = h.scheduler.run_handler(CALCULATE_WINNERS).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);

    assert_eq!(h.game(broken.game_id).status, GameStatus::Failed);
    let healthy = h.game(healthy.game_id);
    assert!(healthy.has_calculated_winners);
    assert_eq!(healthy.winners.len(), 1);
    assert_eq!(h.portfolio(2).status, PortfolioStatus::Won);
}

#[tokio::test]
async fn test_store_error_while_failing_game_does_not_block_batch() {
    let path = std::env::temp_dir().join(format!("ape-arena-{}.db", uuid::Uuid::new_v4()));
    let config = test_config();
    let recommender = Arc::new(FallbackRecommender::new(config.ape.asset_universe.clone()));
    let h = Harness::build(
        config,
        Arc::new(SqliteStore::new(&path).unwrap()),
        recommender,
    );

    let broken = h.fire_game(over_allocated_tiers()).await;
    let healthy = h.fire_game(WinCondition::marlowe_banes()).await;
    let now = now_ms();
    h.enter(broken.game_id, 1, "alice", "sol", now);
    h.enter(healthy.game_id, 2, "bob", "sol", now + 1);
    h.play_until_finalized(broken.game_id, &[("sol", 20.0)]).await;

    // Refuse to record the broken game's failure
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(&format!(
        "CREATE TRIGGER refuse_failure BEFORE UPDATE OF status ON games
         WHEN NEW.status = 'FAILED' AND OLD.game_id = {}
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        broken.game_id
    ))
    .unwrap();
    drop(conn);

    let report = h.scheduler.run_handler(CALCULATE_WINNERS).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);

    let broken = h.game(broken.game_id);
    assert_eq!(broken.status, GameStatus::CalculatingWinners);
    assert!(!broken.has_calculated_winners);
    assert!(h.game(healthy.game_id).has_calculated_winners);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_stale_prices_reported_but_game_settles() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    h.enter(game.game_id, 1, "alice", "sol", now_ms());
    let game = h.play_until_finalized(game.game_id, &[("sol", 20.0)]).await;

    let threshold = h.config.scheduler.price_stale_threshold_ms;
    h.prices.update_price_at("sol", 20.0, now_ms() - 2 * threshold);

    let calculator = WinnerCalculator::new(
        h.store.clone(),
        h.prices.clone() as Arc<dyn PriceFeed>,
        h.notifier.clone() as Arc<dyn NotificationSink>,
        threshold,
    );
    let report = calculator.calculate(&game).await.unwrap().unwrap();

    assert_eq!(report.stale_assets, vec!["sol".to_string()]);
    assert_eq!(report.winners, 1);
    assert!(h.game(game.game_id).has_calculated_winners);
    assert_eq!(h.portfolio(1).status, PortfolioStatus::Won);
}

// =============================================================================
// Crons
// =============================================================================

#[tokio::test]
async fn test_fired_cron_does_not_fire_again() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;

    let report = h.scheduler.run_handler(FIRE_GAME_CRONS).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(h.ledger.call_count("create_game"), 1);

    let cron = h.store.get_cron(game.game_cron_id.unwrap()).unwrap().unwrap();
    assert!(!cron.is_active);
    assert!(cron.last_executed.is_some());
}

#[tokio::test]
async fn test_cron_firing_resumes_after_ledger_failure() {
    let h = Harness::new();
    h.ledger.fail_next_calls(1);

    let now = now_ms();
    let cron = ape_arena::types::GameCron {
        id: 0,
        game_type: "crypto".to_string(),
        cron_type: ape_arena::types::CronType::Once,
        entry_price: BigUint::from(ENTRY_PRICE),
        start_offset_minutes: 0,
        game_duration_hours: 1,
        entry_cap: 10,
        win_condition: WinCondition::marlowe_banes(),
        recurring_schedule_hours: 0,
        next_execution: now - 1_000,
        last_executed: None,
        is_active: true,
        created_at: now,
    };
    let cron_id = h.store.insert_cron(&cron).unwrap();

    let first = h.scheduler.run_handler(FIRE_GAME_CRONS).await.unwrap();
    assert_eq!(first.failed, 1);
    let pending = h
        .store
        .game_for_cron_firing(cron_id, cron.next_execution)
        .unwrap()
        .unwrap();
    assert_eq!(pending.status, GameStatus::TrxPending);

    let second = h.scheduler.run_handler(FIRE_GAME_CRONS).await.unwrap();
    assert_eq!(second.processed, 1);

    let game = h.game(pending.game_id);
    assert_eq!(game.status, GameStatus::Upcoming);
    assert_eq!(
        h.store.games_by_status(GameStatus::Upcoming, 10).unwrap().len(),
        1
    );
    assert!(h.store.games_by_status(GameStatus::TrxPending, 10).unwrap().is_empty());
}
