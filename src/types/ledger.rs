//! Ledger Types
//!
//! Observable shapes of the external ledger: game details, receipts, and the
//! decoded events carried in receipt logs.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Owner reported for a portfolio id the ledger has never seen.
pub const NULL_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Whether an address is the null address (any case, with or without the 0x prefix).
pub fn is_null_address(address: &str) -> bool {
    let hex = address.trim().trim_start_matches("0x");
    hex.is_empty() || hex.chars().all(|c| c == '0')
}

/// Case-insensitive address comparison.
pub fn same_address(a: &str, b: &str) -> bool {
    let a = a.trim().trim_start_matches("0x");
    let b = b.trim().trim_start_matches("0x");
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

/// On-ledger aggregates for a game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerGameDetails {
    #[serde(with = "crate::types::amount")]
    pub total_prize_pool: BigUint,
    pub entry_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    /// The call executed but failed; it had no effect
    Reverted,
}

/// A raw receipt log: event name plus JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerLog {
    pub event: String,
    pub args: serde_json::Value,
}

/// Receipt logs decoded into known events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "args")]
pub enum LedgerEvent {
    #[serde(rename_all = "camelCase")]
    PortfolioCreated {
        portfolio_id: u64,
        game_id: u64,
        owner: String,
    },
    #[serde(rename_all = "camelCase")]
    PortfolioEntryFeePaid {
        portfolio_id: u64,
        game_id: u64,
        #[serde(with = "crate::types::amount")]
        amount: BigUint,
    },
    #[serde(rename_all = "camelCase")]
    RewardsAssigned { game_id: u64, count: u64 },
}

impl LedgerEvent {
    /// Decode a log; unknown or malformed logs yield `None`.
    pub fn decode(log: &LedgerLog) -> Option<Self> {
        serde_json::from_value(serde_json::json!({
            "event": log.event,
            "args": log.args,
        }))
        .ok()
    }

    /// Encode an event back into a raw log.
    pub fn to_log(&self) -> LedgerLog {
        let value = serde_json::to_value(self).unwrap_or_default();
        LedgerLog {
            event: value["event"].as_str().unwrap_or_default().to_string(),
            args: value["args"].clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub status: ReceiptStatus,
    pub logs: Vec<LedgerLog>,
    pub block_number: u64,
    pub gas_used: u64,
    pub effective_gas_price: u64,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == ReceiptStatus::Success
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.logs.iter().filter_map(LedgerEvent::decode).collect()
    }
}
