//! External ledger boundary.
//!
//! The ledger is the authority on game registration, portfolio ownership,
//! entry fees and reward assignment. Everything here is a network call that
//! may fail transiently; callers wrap writes in [`with_backoff`].

use crate::types::{LedgerGameDetails, TransactionReceipt};
use async_trait::async_trait;
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("Ledger RPC error: {0}")]
    Rpc(String),

    #[error("Ledger call timed out")]
    Timeout,

    #[error("Ledger transaction reverted: {0}")]
    Reverted(String),

    #[error("Ledger rejected call: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Register a game. Returns the registration transaction hash.
    async fn create_game(
        &self,
        game_id: u64,
        start_time: i64,
        end_time: i64,
        entry_price: &BigUint,
        entry_cap: u32,
    ) -> Result<String, LedgerError>;

    async fn get_game_details(&self, game_id: u64) -> Result<LedgerGameDetails, LedgerError>;

    /// Owner address of a portfolio; the null address if unknown.
    async fn get_portfolio_owner(&self, portfolio_id: u64) -> Result<String, LedgerError>;

    /// Assign rewards for a batch of portfolios. Returns the transaction hash.
    async fn batch_assign_rewards(
        &self,
        game_id: u64,
        portfolio_ids: &[u64],
        amounts: &[BigUint],
    ) -> Result<String, LedgerError>;

    /// Receipt for a transaction, `None` while it is not yet available.
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, LedgerError>;
}

/// Deterministic reference for an effect recorded without a ledger transaction.
pub fn synthetic_reference(prefix: &str, seed: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", prefix, seed).as_bytes());
    format!("{}-{}", prefix, hex::encode(digest))
}

/// Exponential backoff for ledger calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for a single attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// Returns the last error when every attempt fails.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = LedgerError::Rpc(format!("{}: no attempts made", label));

    for attempt in 0..attempts {
        match timeout(policy.call_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                warn!("{} failed (attempt {}): {}", label, attempt + 1, e);
                last_error = e;
            }
            Err(_) => {
                warn!("{} timed out (attempt {})", label, attempt + 1);
                last_error = LedgerError::Timeout;
            }
        }

        if attempt + 1 < attempts {
            let delay = policy.delay_for(attempt);
            info!("Retrying {} in {}ms", label, delay.as_millis());
            sleep(delay).await;
        }
    }

    Err(last_error)
}
