use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// User paid to enter a game
    EntryFee,
    /// Reward paid out to a winner
    Reward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::EntryFee => write!(f, "ENTRY_FEE"),
            TransactionType::Reward => write!(f, "REWARD"),
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY_FEE" => Ok(TransactionType::EntryFee),
            "REWARD" => Ok(TransactionType::Reward),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "PENDING"),
            TransactionStatus::Completed => write!(f, "COMPLETED"),
            TransactionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// Immutable settlement record, one per confirmed ledger effect per portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub transaction_hash: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    #[serde(with = "crate::types::amount")]
    pub amount: BigUint,
    pub game_id: u64,
    pub portfolio_id: u64,
    pub status: TransactionStatus,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub effective_gas_price: Option<u64>,
    pub created_at: i64,
}

impl Transaction {
    pub fn new(
        transaction_hash: impl Into<String>,
        user_id: impl Into<String>,
        tx_type: TransactionType,
        amount: BigUint,
        game_id: u64,
        portfolio_id: u64,
        created_at: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_hash: transaction_hash.into(),
            user_id: user_id.into(),
            tx_type,
            amount,
            game_id,
            portfolio_id,
            status: TransactionStatus::Completed,
            block_number: None,
            gas_used: None,
            effective_gas_price: None,
            created_at,
        }
    }

    /// Attach block metadata from a receipt.
    pub fn with_receipt(mut self, receipt: &crate::types::TransactionReceipt) -> Self {
        self.block_number = Some(receipt.block_number);
        self.gas_used = Some(receipt.gas_used);
        self.effective_gas_price = Some(receipt.effective_gas_price);
        self
    }
}
