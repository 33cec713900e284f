//! In-process ledger used in paper mode and tests.
//!
//! Keeps registrations, ownership and receipts in memory and can be told to
//! fail or revert upcoming calls.

use crate::services::ledger::{Ledger, LedgerError};
use crate::types::{
    LedgerEvent, LedgerGameDetails, ReceiptStatus, TransactionReceipt, NULL_ADDRESS,
};
use async_trait::async_trait;
use dashmap::DashMap;
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

const PAPER_GAS_USED: u64 = 21_000;
const PAPER_GAS_PRICE: u64 = 1_000_000_000;

#[derive(Debug, Clone)]
struct PaperGame {
    creation_hash: String,
    entry_price: BigUint,
    entry_cap: u32,
    total_prize_pool: BigUint,
    entry_count: u64,
}

/// A reward assignment the ledger accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperPayout {
    pub portfolio_id: u64,
    pub amount: BigUint,
    pub tx_hash: String,
}

pub struct PaperLedger {
    games: DashMap<u64, PaperGame>,
    owners: DashMap<u64, String>,
    receipts: DashMap<String, TransactionReceipt>,
    payouts: DashMap<u64, Vec<PaperPayout>>,
    calls: DashMap<&'static str, u64>,
    nonce: AtomicU64,
    block: AtomicU64,
    fail_next: AtomicU32,
    revert_next: AtomicU32,
}

impl Default for PaperLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrement `counter` if positive; true when a unit was taken.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl PaperLedger {
    pub fn new() -> Self {
        Self {
            games: DashMap::new(),
            owners: DashMap::new(),
            receipts: DashMap::new(),
            payouts: DashMap::new(),
            calls: DashMap::new(),
            nonce: AtomicU64::new(0),
            block: AtomicU64::new(1),
            fail_next: AtomicU32::new(0),
            revert_next: AtomicU32::new(0),
        }
    }

    /// Make the next `n` ledger calls fail with an RPC error.
    pub fn fail_next_calls(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reward batches land with a reverted receipt.
    pub fn revert_next_payouts(&self, n: u32) {
        self.revert_next.store(n, Ordering::SeqCst);
    }

    /// Number of times a ledger method was invoked.
    pub fn call_count(&self, method: &str) -> u64 {
        self.calls.get(method).map(|c| *c).unwrap_or(0)
    }

    /// Rewards assigned for a game, in assignment order.
    pub fn payouts(&self, game_id: u64) -> Vec<PaperPayout> {
        self.payouts
            .get(&game_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn set_owner(&self, portfolio_id: u64, owner: impl Into<String>) {
        self.owners.insert(portfolio_id, owner.into());
    }

    pub fn insert_receipt(&self, receipt: TransactionReceipt) {
        self.receipts
            .insert(receipt.transaction_hash.clone(), receipt);
    }

    /// Remove a receipt so lookups report it as not yet available.
    pub fn forget_receipt(&self, tx_hash: &str) {
        self.receipts.remove(tx_hash);
    }

    /// Pay the entry fee for a portfolio: records ownership, raises the game's
    /// pool and count, and stores a receipt with the creation events.
    pub fn enter_portfolio(
        &self,
        portfolio_id: u64,
        game_id: u64,
        owner: &str,
    ) -> Result<String, LedgerError> {
        let amount = {
            let mut game = self
                .games
                .get_mut(&game_id)
                .ok_or_else(|| LedgerError::Rejected(format!("unknown game {}", game_id)))?;
            if game.entry_count >= game.entry_cap as u64 {
                return Err(LedgerError::Rejected(format!("game {} is full", game_id)));
            }
            let price = game.entry_price.clone();
            game.entry_count += 1;
            game.total_prize_pool += &price;
            price
        };

        self.owners.insert(portfolio_id, owner.to_string());
        let hash = self.next_hash("enter");
        let logs = vec![
            LedgerEvent::PortfolioCreated {
                portfolio_id,
                game_id,
                owner: owner.to_string(),
            }
            .to_log(),
            LedgerEvent::PortfolioEntryFeePaid {
                portfolio_id,
                game_id,
                amount,
            }
            .to_log(),
        ];
        self.push_receipt(&hash, ReceiptStatus::Success, logs);
        Ok(hash)
    }

    fn next_hash(&self, label: &str) -> String {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let digest = Sha256::digest(format!("paper:{}:{}", label, nonce).as_bytes());
        format!("0x{}", hex::encode(digest))
    }

    fn push_receipt(&self, hash: &str, status: ReceiptStatus, logs: Vec<crate::types::LedgerLog>) {
        let block_number = self.block.fetch_add(1, Ordering::SeqCst);
        self.insert_receipt(TransactionReceipt {
            transaction_hash: hash.to_string(),
            status,
            logs,
            block_number,
            gas_used: PAPER_GAS_USED,
            effective_gas_price: PAPER_GAS_PRICE,
        });
    }

    /// Count the call and apply any injected failure.
    fn enter_call(&self, method: &'static str) -> Result<(), LedgerError> {
        *self.calls.entry(method).or_insert(0) += 1;
        if take_one(&self.fail_next) {
            debug!("Paper ledger failing {}", method);
            return Err(LedgerError::Rpc(format!("injected failure in {}", method)));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for PaperLedger {
    async fn create_game(
        &self,
        game_id: u64,
        _start_time: i64,
        _end_time: i64,
        entry_price: &BigUint,
        entry_cap: u32,
    ) -> Result<String, LedgerError> {
        self.enter_call("create_game")?;

        if let Some(existing) = self.games.get(&game_id) {
            return Ok(existing.creation_hash.clone());
        }

        let hash = self.next_hash("create_game");
        self.games.insert(
            game_id,
            PaperGame {
                creation_hash: hash.clone(),
                entry_price: entry_price.clone(),
                entry_cap,
                total_prize_pool: BigUint::default(),
                entry_count: 0,
            },
        );
        self.push_receipt(&hash, ReceiptStatus::Success, Vec::new());
        Ok(hash)
    }

    async fn get_game_details(&self, game_id: u64) -> Result<LedgerGameDetails, LedgerError> {
        self.enter_call("get_game_details")?;
        self.games
            .get(&game_id)
            .map(|g| LedgerGameDetails {
                total_prize_pool: g.total_prize_pool.clone(),
                entry_count: g.entry_count,
            })
            .ok_or_else(|| LedgerError::Rejected(format!("unknown game {}", game_id)))
    }

    async fn get_portfolio_owner(&self, portfolio_id: u64) -> Result<String, LedgerError> {
        self.enter_call("get_portfolio_owner")?;
        Ok(self
            .owners
            .get(&portfolio_id)
            .map(|o| o.clone())
            .unwrap_or_else(|| NULL_ADDRESS.to_string()))
    }

    async fn batch_assign_rewards(
        &self,
        game_id: u64,
        portfolio_ids: &[u64],
        amounts: &[BigUint],
    ) -> Result<String, LedgerError> {
        self.enter_call("batch_assign_rewards")?;

        if portfolio_ids.len() != amounts.len() {
            return Err(LedgerError::Rejected(format!(
                "{} portfolios but {} amounts",
                portfolio_ids.len(),
                amounts.len()
            )));
        }
        if !self.games.contains_key(&game_id) {
            return Err(LedgerError::Rejected(format!("unknown game {}", game_id)));
        }

        let hash = self.next_hash("batch_assign_rewards");
        if take_one(&self.revert_next) {
            self.push_receipt(&hash, ReceiptStatus::Reverted, Vec::new());
            return Ok(hash);
        }

        let mut assigned = self.payouts.entry(game_id).or_default();
        for (portfolio_id, amount) in portfolio_ids.iter().zip(amounts) {
            assigned.push(PaperPayout {
                portfolio_id: *portfolio_id,
                amount: amount.clone(),
                tx_hash: hash.clone(),
            });
        }
        drop(assigned);

        let log = LedgerEvent::RewardsAssigned {
            game_id,
            count: portfolio_ids.len() as u64,
        }
        .to_log();
        self.push_receipt(&hash, ReceiptStatus::Success, vec![log]);
        Ok(hash)
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, LedgerError> {
        self.enter_call("get_transaction_receipt")?;
        Ok(self.receipts.get(tx_hash).map(|r| r.clone()))
    }
}
