//! Reconciliation of entries awaiting ledger confirmation.
//!
//! A `PENDING_LOCK_BALANCE` portfolio is confirmed either from its entry
//! transaction receipt or, for manual entries without a hash, by polling the
//! ledger's owner of record.

use crate::config::ReconcileConfig;
use crate::error::SettlementError;
use crate::services::ledger::{synthetic_reference, Ledger};
use crate::services::notifier::NotificationSink;
use crate::services::sqlite_store::{ConfirmedEntry, SqliteStore};
use crate::types::{
    is_null_address, now_ms, same_address, LedgerEvent, NotificationEvent, NotificationKind,
    Portfolio, PortfolioStatus, Transaction, TransactionType,
};
use num_bigint::BigUint;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to one portfolio in a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileOutcome {
    Confirmed,
    /// Not decidable yet; retry later
    Retry,
    /// Too soon since the last attempt
    Deferred,
    Failed,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    pub confirmed: usize,
    pub retried: usize,
    pub deferred: usize,
    pub failed: usize,
    pub errors: usize,
}

pub struct TransactionReconciler {
    store: Arc<SqliteStore>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn NotificationSink>,
    config: ReconcileConfig,
}

impl TransactionReconciler {
    pub fn new(
        store: Arc<SqliteStore>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn NotificationSink>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            config,
        }
    }

    /// Reconcile up to `limit` awaiting portfolios, oldest first.
    pub async fn reconcile_pending(&self, limit: usize) -> Result<ReconcileReport, SettlementError> {
        let pending = self
            .store
            .portfolios_by_status(PortfolioStatus::PendingLockBalance, limit)?;
        let mut report = ReconcileReport::default();

        for portfolio in pending {
            match self.reconcile(&portfolio).await {
                Ok(ReconcileOutcome::Confirmed) => report.confirmed += 1,
                Ok(ReconcileOutcome::Retry) => report.retried += 1,
                Ok(ReconcileOutcome::Deferred) => report.deferred += 1,
                Ok(ReconcileOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    warn!("Reconciliation of portfolio {} failed: {}", portfolio.portfolio_id, e);
                    report.errors += 1;
                }
            }
        }

        if report.confirmed + report.failed + report.retried > 0 {
            info!(
                "Reconciled portfolios: {} confirmed, {} retrying, {} failed",
                report.confirmed, report.retried, report.failed
            );
        }
        Ok(report)
    }

    /// Reconcile a single portfolio.
    pub async fn reconcile(&self, portfolio: &Portfolio) -> Result<ReconcileOutcome, SettlementError> {
        let now = now_ms();
        let spacing = self.config.retry_interval.as_millis() as i64;
        if let Some(last) = portfolio.last_retry_at {
            if now - last < spacing {
                return Ok(ReconcileOutcome::Deferred);
            }
        }

        let result = match portfolio.transaction_hash.as_deref() {
            Some(hash) => self.reconcile_receipt(portfolio, hash, now).await,
            None => self.reconcile_owner(portfolio, now).await,
        };

        match result {
            Err(SettlementError::ReconciliationMismatch(reason)) => {
                self.fail(portfolio, &reason, now)?;
                Ok(ReconcileOutcome::Failed)
            }
            other => other,
        }
    }

    async fn reconcile_receipt(
        &self,
        portfolio: &Portfolio,
        hash: &str,
        now: i64,
    ) -> Result<ReconcileOutcome, SettlementError> {
        let receipt = match self.ledger.get_transaction_receipt(hash).await? {
            Some(receipt) => receipt,
            None => return self.retry(portfolio, "entry receipt not yet available", now),
        };

        if !receipt.succeeded() {
            return Err(SettlementError::ReconciliationMismatch(format!(
                "entry transaction {} reverted",
                hash
            )));
        }

        let events = receipt.events();
        let (event_portfolio, event_game, owner) = events
            .iter()
            .find_map(|event| match event {
                LedgerEvent::PortfolioCreated {
                    portfolio_id,
                    game_id,
                    owner,
                } => Some((*portfolio_id, *game_id, owner.clone())),
                _ => None,
            })
            .ok_or_else(|| {
                SettlementError::ReconciliationMismatch(format!(
                    "transaction {} has no PortfolioCreated event",
                    hash
                ))
            })?;

        if event_portfolio != portfolio.portfolio_id
            || event_game != portfolio.game_id
            || !same_address(&owner, &portfolio.wallet_address)
        {
            return Err(SettlementError::ReconciliationMismatch(format!(
                "PortfolioCreated(portfolio {}, game {}, owner {}) does not match portfolio {} \
                 of game {} owned by {}",
                event_portfolio,
                event_game,
                owner,
                portfolio.portfolio_id,
                portfolio.game_id,
                portfolio.wallet_address
            )));
        }

        let fee = events
            .iter()
            .find_map(|event| match event {
                LedgerEvent::PortfolioEntryFeePaid {
                    portfolio_id,
                    amount,
                    ..
                } if *portfolio_id == portfolio.portfolio_id => Some(amount.clone()),
                _ => None,
            });
        let fee = match fee {
            Some(fee) => fee,
            None => self.entry_price(portfolio.game_id)?,
        };

        let record = Transaction::new(
            hash,
            &portfolio.user_id,
            TransactionType::EntryFee,
            fee,
            portfolio.game_id,
            portfolio.portfolio_id,
            now,
        )
        .with_receipt(&receipt);
        self.confirm(portfolio, record, now).await
    }

    async fn reconcile_owner(
        &self,
        portfolio: &Portfolio,
        now: i64,
    ) -> Result<ReconcileOutcome, SettlementError> {
        let owner = self.ledger.get_portfolio_owner(portfolio.portfolio_id).await?;

        if is_null_address(&owner) {
            return self.retry(portfolio, "portfolio not yet registered on the ledger", now);
        }
        if !same_address(&owner, &portfolio.wallet_address) {
            return Err(SettlementError::ReconciliationMismatch(format!(
                "portfolio {} is owned by {}, expected {}",
                portfolio.portfolio_id, owner, portfolio.wallet_address
            )));
        }

        let reference = synthetic_reference(
            "manual",
            &format!(
                "{}:{}:{}",
                portfolio.game_id,
                portfolio.portfolio_id,
                owner.to_lowercase()
            ),
        );
        let record = Transaction::new(
            reference,
            &portfolio.user_id,
            TransactionType::EntryFee,
            BigUint::default(),
            portfolio.game_id,
            portfolio.portfolio_id,
            now,
        );
        self.confirm(portfolio, record, now).await
    }

    fn entry_price(&self, game_id: u64) -> Result<BigUint, SettlementError> {
        self.store
            .get_game(game_id)?
            .map(|g| g.entry_price)
            .ok_or_else(|| SettlementError::DataIntegrity(format!("game {} not found", game_id)))
    }

    async fn confirm(
        &self,
        portfolio: &Portfolio,
        record: Transaction,
        now: i64,
    ) -> Result<ReconcileOutcome, SettlementError> {
        let details = self.ledger.get_game_details(portfolio.game_id).await?;
        let entry = ConfirmedEntry {
            portfolio_id: portfolio.portfolio_id,
            game_id: portfolio.game_id,
            transaction: record,
            ledger_participants: details.entry_count,
            ledger_prize_pool: details.total_prize_pool,
        };

        if !self.store.confirm_entry(&entry, now)? {
            debug!("Portfolio {} was confirmed elsewhere", portfolio.portfolio_id);
            return Ok(ReconcileOutcome::Confirmed);
        }

        self.notifier.emit(NotificationEvent::new(
            NotificationKind::PortfolioCreated,
            &portfolio.user_id,
            portfolio.game_id,
            portfolio.portfolio_id,
            format!("Your entry into game {} is confirmed", portfolio.game_id),
        ));
        Ok(ReconcileOutcome::Confirmed)
    }

    fn retry(
        &self,
        portfolio: &Portfolio,
        reason: &str,
        now: i64,
    ) -> Result<ReconcileOutcome, SettlementError> {
        let retry_count = portfolio.retry_count + 1;
        if retry_count >= self.config.max_retries {
            let message = format!("{} after {} attempts", reason, retry_count);
            self.store
                .record_reconcile_retry(portfolio.portfolio_id, retry_count, now)?;
            self.fail(portfolio, &message, now)?;
            return Ok(ReconcileOutcome::Failed);
        }

        debug!(
            "Portfolio {}: {} (attempt {})",
            portfolio.portfolio_id, reason, retry_count
        );
        self.store
            .record_reconcile_retry(portfolio.portfolio_id, retry_count, now)?;
        Ok(ReconcileOutcome::Retry)
    }

    fn fail(&self, portfolio: &Portfolio, reason: &str, now: i64) -> Result<(), SettlementError> {
        let failed = self.store.fail_portfolio(
            portfolio.portfolio_id,
            PortfolioStatus::PendingLockBalance,
            reason,
            now,
        )?;
        if failed {
            warn!("Portfolio {} failed: {}", portfolio.portfolio_id, reason);
            self.notifier.emit(
                NotificationEvent::new(
                    NotificationKind::TransactionFailed,
                    &portfolio.user_id,
                    portfolio.game_id,
                    portfolio.portfolio_id,
                    format!("Your entry into game {} could not be confirmed", portfolio.game_id),
                )
                .with_message(reason),
            );
        }
        Ok(())
    }
}
