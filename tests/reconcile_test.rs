//! Pending-entry reconciliation against the paper ledger.

mod common;

use ape_arena::config::ReconcileConfig;
use ape_arena::services::{
    Ledger, NotificationSink, ReconcileOutcome, TransactionReconciler,
};
use ape_arena::types::{
    now_ms, NotificationKind, Portfolio, PortfolioAsset, PortfolioStatus, ReceiptStatus,
    TransactionReceipt, TransactionType, WinCondition,
};
use common::{Harness, ENTRY_PRICE};
use num_bigint::BigUint;
use std::sync::Arc;
use std::time::Duration;

fn reconciler(h: &Harness, retry_interval: Duration) -> TransactionReconciler {
    TransactionReconciler::new(
        h.store.clone(),
        h.ledger.clone() as Arc<dyn Ledger>,
        h.notifier.clone() as Arc<dyn NotificationSink>,
        ReconcileConfig {
            max_retries: 3,
            retry_interval,
        },
    )
}

fn pending(game_id: u64, portfolio_id: u64, user: &str, hash: Option<&str>) -> Portfolio {
    let portfolio = Portfolio::new(
        portfolio_id,
        game_id,
        user,
        format!("0x{}", user),
        vec![PortfolioAsset::new("sol", "SOL", 1_000.0)],
        now_ms(),
    );
    match hash {
        Some(hash) => portfolio.with_transaction_hash(hash),
        None => portfolio,
    }
}

// =============================================================================
// Receipt path
// =============================================================================

#[tokio::test]
async fn test_matching_receipt_confirms_entry() {
    let h = Harness::new();
    let mut notifications = h.notifier.subscribe();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    let entered = h.enter(game.game_id, 1, "alice", "sol", now_ms());

    let outcome = reconciler(&h, Duration::ZERO)
        .reconcile(&entered)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Confirmed);

    let portfolio = h.portfolio(1);
    assert_eq!(portfolio.status, PortfolioStatus::Pending);

    let game = h.game(game.game_id);
    assert_eq!(game.participant_count, 1);
    assert_eq!(game.total_prize_pool, BigUint::from(ENTRY_PRICE));

    let records = h.store.transactions_for_portfolio(1).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tx_type, TransactionType::EntryFee);
    assert_eq!(records[0].amount, BigUint::from(ENTRY_PRICE));
    assert_eq!(
        Some(records[0].transaction_hash.as_str()),
        entered.transaction_hash.as_deref()
    );

    let event = notifications.try_recv().unwrap();
    assert_eq!(event.kind, NotificationKind::PortfolioCreated);
    assert_eq!(event.user_id, "alice");
}

#[tokio::test]
async fn test_confirmation_is_not_repeated() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    let entered = h.enter(game.game_id, 1, "alice", "sol", now_ms());
    let reconciler = reconciler(&h, Duration::ZERO);

    let first = reconciler.reconcile_pending(10).await.unwrap();
    assert_eq!(first.confirmed, 1);
    let second = reconciler.reconcile_pending(10).await.unwrap();
    assert_eq!(second.confirmed, 0);

    // A stale snapshot reconciled again records nothing new
    reconciler.reconcile(&entered).await.unwrap();
    assert_eq!(h.store.transactions_for_portfolio(1).unwrap().len(), 1);
}

#[tokio::test]
async fn test_owner_mismatch_fails_entry() {
    let h = Harness::new();
    let mut notifications = h.notifier.subscribe();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;

    let hash = h.ledger.enter_portfolio(1, game.game_id, "0xmallory").unwrap();
    let portfolio = pending(game.game_id, 1, "alice", Some(&hash));
    h.store.insert_portfolio(&portfolio).unwrap();

    let outcome = reconciler(&h, Duration::ZERO)
        .reconcile(&portfolio)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Failed);

    let stored = h.portfolio(1);
    assert_eq!(stored.status, PortfolioStatus::Failed);
    assert!(stored.error.is_some());
    assert!(h.store.transactions_for_portfolio(1).unwrap().is_empty());
    assert_eq!(
        notifications.try_recv().unwrap().kind,
        NotificationKind::TransactionFailed
    );
}

#[tokio::test]
async fn test_owner_comparison_ignores_case() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;

    let hash = h.ledger.enter_portfolio(1, game.game_id, "0xALICE").unwrap();
    let portfolio = pending(game.game_id, 1, "alice", Some(&hash));
    h.store.insert_portfolio(&portfolio).unwrap();

    let outcome = reconciler(&h, Duration::ZERO)
        .reconcile(&portfolio)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Confirmed);
}

#[tokio::test]
async fn test_receipt_without_creation_event_fails_entry() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;

    // The registration receipt carries no portfolio events
    let creation = game.creation_tx_hash.clone().unwrap();
    let portfolio = pending(game.game_id, 1, "alice", Some(&creation));
    h.store.insert_portfolio(&portfolio).unwrap();

    let outcome = reconciler(&h, Duration::ZERO)
        .reconcile(&portfolio)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Failed);
    assert_eq!(h.portfolio(1).status, PortfolioStatus::Failed);
}

#[tokio::test]
async fn test_reverted_entry_fails() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;

    h.ledger.insert_receipt(TransactionReceipt {
        transaction_hash: "0xreverted".to_string(),
        status: ReceiptStatus::Reverted,
        logs: Vec::new(),
        block_number: 9,
        gas_used: 21_000,
        effective_gas_price: 1,
    });
    let portfolio = pending(game.game_id, 1, "alice", Some("0xreverted"));
    h.store.insert_portfolio(&portfolio).unwrap();

    let outcome = reconciler(&h, Duration::ZERO)
        .reconcile(&portfolio)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Failed);
}

#[tokio::test]
async fn test_missing_receipt_retries_until_cap() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    let portfolio = pending(game.game_id, 1, "alice", Some("0xnot-mined"));
    h.store.insert_portfolio(&portfolio).unwrap();
    let reconciler = reconciler(&h, Duration::ZERO);

    let first = reconciler.reconcile_pending(10).await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(h.portfolio(1).retry_count, 1);
    assert!(h.portfolio(1).last_retry_at.is_some());

    let second = reconciler.reconcile_pending(10).await.unwrap();
    assert_eq!(second.retried, 1);

    let third = reconciler.reconcile_pending(10).await.unwrap();
    assert_eq!(third.failed, 1);

    let stored = h.portfolio(1);
    assert_eq!(stored.status, PortfolioStatus::Failed);
    assert_eq!(stored.retry_count, 3);
}

#[tokio::test]
async fn test_retry_spacing_defers_attempts() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    let portfolio = pending(game.game_id, 1, "alice", Some("0xnot-mined"));
    h.store.insert_portfolio(&portfolio).unwrap();
    let reconciler = reconciler(&h, Duration::from_secs(3600));

    assert_eq!(
        reconciler.reconcile(&portfolio).await.unwrap(),
        ReconcileOutcome::Retry
    );
    assert_eq!(
        reconciler.reconcile(&h.portfolio(1)).await.unwrap(),
        ReconcileOutcome::Deferred
    );
    assert_eq!(h.portfolio(1).retry_count, 1);
}

#[tokio::test]
async fn test_ledger_error_leaves_entry_pending() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    h.enter(game.game_id, 1, "alice", "sol", now_ms());

    h.ledger.fail_next_calls(1);
    let report = reconciler(&h, Duration::ZERO)
        .reconcile_pending(10)
        .await
        .unwrap();

    assert_eq!(report.errors, 1);
    let stored = h.portfolio(1);
    assert_eq!(stored.status, PortfolioStatus::PendingLockBalance);
    assert_eq!(stored.retry_count, 0);
}

// =============================================================================
// Owner path
// =============================================================================

#[tokio::test]
async fn test_manual_entry_confirmed_once_owner_appears() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    let portfolio = pending(game.game_id, 1, "alice", None);
    h.store.insert_portfolio(&portfolio).unwrap();
    let reconciler = reconciler(&h, Duration::ZERO);

    assert_eq!(
        reconciler.reconcile(&portfolio).await.unwrap(),
        ReconcileOutcome::Retry
    );

    h.ledger.set_owner(1, "0xAlice");
    assert_eq!(
        reconciler.reconcile(&h.portfolio(1)).await.unwrap(),
        ReconcileOutcome::Confirmed
    );

    assert_eq!(h.portfolio(1).status, PortfolioStatus::Pending);
    let records = h.store.transactions_for_portfolio(1).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].transaction_hash.starts_with("manual-"));
    assert_eq!(records[0].amount, BigUint::from(0u32));
}

#[tokio::test]
async fn test_manual_entry_owned_by_someone_else_fails() {
    let h = Harness::new();
    let game = h.fire_game(WinCondition::marlowe_banes()).await;
    let portfolio = pending(game.game_id, 1, "alice", None);
    h.store.insert_portfolio(&portfolio).unwrap();
    h.ledger.set_owner(1, "0xmallory");

    let outcome = reconciler(&h, Duration::ZERO)
        .reconcile(&portfolio)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Failed);
    assert_eq!(h.portfolio(1).status, PortfolioStatus::Failed);
}
