//! Reward distribution.
//!
//! Pays one game at a time, in bounded batches, through a single ledger
//! account. The system opponent is never paid; its winner entries are marked
//! locally with a deterministic synthetic reference.

use crate::config::DistributionConfig;
use crate::error::SettlementError;
use crate::services::ledger::{synthetic_reference, with_backoff, Ledger, LedgerError, RetryPolicy};
use crate::services::sqlite_store::SqliteStore;
use crate::types::{now_ms, Transaction, TransactionReceipt, TransactionType, Winner};
use num_bigint::BigUint;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Serialize)]
pub struct DistributionReport {
    pub game_id: u64,
    /// Ledger payout calls that landed
    pub batches: usize,
    pub paid: usize,
    /// System-opponent entries marked without a ledger call
    pub ape_marked: usize,
    pub completed: bool,
}

pub struct RewardDistributor {
    store: Arc<SqliteStore>,
    ledger: Arc<dyn Ledger>,
    config: DistributionConfig,
}

fn ape_reference(game_id: u64, winners: &[&Winner]) -> String {
    let ids: Vec<String> = winners.iter().map(|w| w.portfolio_id.to_string()).collect();
    synthetic_reference("ape", &format!("{}:{}", game_id, ids.join(",")))
}

impl RewardDistributor {
    pub fn new(
        store: Arc<SqliteStore>,
        ledger: Arc<dyn Ledger>,
        config: DistributionConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_attempts,
            base_delay: self.config.retry_base_delay,
            ..RetryPolicy::default()
        }
    }

    /// Distribute the oldest calculated but undistributed game, if any.
    pub async fn distribute_oldest(&self) -> Result<Option<DistributionReport>, SettlementError> {
        match self.store.oldest_undistributed_game()? {
            Some(game) => self.distribute_game(game.game_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Pay out a game until no undistributed winners remain.
    ///
    /// When a batch exhausts its retries the error is returned and the game is
    /// left as it was, so a later invocation picks it up again.
    pub async fn distribute_game(&self, game_id: u64) -> Result<DistributionReport, SettlementError> {
        let mut report = DistributionReport {
            game_id,
            ..Default::default()
        };
        let batch_size = self.config.batch_size.max(1);
        let total = self.store.winners_for_game(game_id)?.len();
        let max_rounds = total / batch_size + 2;

        for _ in 0..max_rounds {
            let pending: Vec<Winner> = self
                .store
                .winners_for_game(game_id)?
                .into_iter()
                .filter(|w| !w.is_reward_distributed)
                .collect();

            if pending.is_empty() {
                report.completed = self.store.complete_distribution(game_id, now_ms())?;
                info!(
                    "Game {} distribution finished: {} paid in {} batches, {} opponent entries",
                    game_id, report.paid, report.batches, report.ape_marked
                );
                return Ok(report);
            }

            if pending.iter().all(|w| w.is_ape) {
                let apes: Vec<&Winner> = pending.iter().collect();
                report.ape_marked += self.mark_apes(game_id, &apes)?;
                continue;
            }

            let batch = &pending[..pending.len().min(batch_size)];
            let (apes, players): (Vec<&Winner>, Vec<&Winner>) =
                batch.iter().partition(|w| w.is_ape);

            if !apes.is_empty() {
                report.ape_marked += self.mark_apes(game_id, &apes)?;
            }
            if !players.is_empty() {
                report.paid += self.pay_batch(game_id, &players).await?;
                report.batches += 1;
            }

            if pending.len() > batch.len() {
                sleep(self.config.batch_delay).await;
            }
        }

        Err(SettlementError::TransientExternal(format!(
            "game {} still has undistributed winners after {} rounds",
            game_id, max_rounds
        )))
    }

    fn mark_apes(&self, game_id: u64, apes: &[&Winner]) -> Result<usize, SettlementError> {
        let ids: Vec<u64> = apes.iter().map(|w| w.portfolio_id).collect();
        let reference = ape_reference(game_id, apes);
        Ok(self
            .store
            .mark_winners_distributed(game_id, &ids, &reference, &[], now_ms())?)
    }

    /// Submit one payout batch and wait for a non-reverted receipt.
    async fn submit_once(
        &self,
        game_id: u64,
        ids: &[u64],
        amounts: &[BigUint],
    ) -> Result<(String, Option<TransactionReceipt>), LedgerError> {
        let tx_hash = self.ledger.batch_assign_rewards(game_id, ids, amounts).await?;
        match self.ledger.get_transaction_receipt(&tx_hash).await {
            Ok(Some(receipt)) if !receipt.succeeded() => Err(LedgerError::Reverted(tx_hash)),
            Ok(receipt) => Ok((tx_hash, receipt)),
            Err(e) => {
                warn!("Payout {} submitted but receipt unavailable: {}", tx_hash, e);
                Ok((tx_hash, None))
            }
        }
    }

    async fn pay_batch(&self, game_id: u64, players: &[&Winner]) -> Result<usize, SettlementError> {
        let ids: Vec<u64> = players.iter().map(|w| w.portfolio_id).collect();
        let amounts: Vec<BigUint> = players.iter().map(|w| w.reward.clone()).collect();
        let label = format!("reward payout for game {}", game_id);

        let (tx_hash, receipt) = with_backoff(&self.retry_policy(), &label, || {
            self.submit_once(game_id, &ids, &amounts)
        })
        .await?;

        let now = now_ms();
        let records: Vec<Transaction> = players
            .iter()
            .map(|w| {
                let record = Transaction::new(
                    &tx_hash,
                    &w.user_id,
                    TransactionType::Reward,
                    w.reward.clone(),
                    game_id,
                    w.portfolio_id,
                    now,
                );
                match &receipt {
                    Some(receipt) => record.with_receipt(receipt),
                    None => record,
                }
            })
            .collect();

        let marked = self
            .store
            .mark_winners_distributed(game_id, &ids, &tx_hash, &records, now)?;
        info!("Game {}: paid {} winners in {}", game_id, marked, tx_hash);
        Ok(marked)
    }
}
