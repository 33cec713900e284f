//! Notification types for the notification sink.

use serde::{Deserialize, Serialize};

/// Notification event categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    PortfolioWon,
    PortfolioLost,
    PortfolioCreated,
    TransactionFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::PortfolioWon => "PORTFOLIO_WON",
            NotificationKind::PortfolioLost => "PORTFOLIO_LOST",
            NotificationKind::PortfolioCreated => "PORTFOLIO_CREATED",
            NotificationKind::TransactionFailed => "TRANSACTION_FAILED",
        }
    }
}

/// A fire-and-forget notification about a portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    /// Unique notification ID
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Recipient
    pub user_id: String,
    pub game_id: u64,
    pub portfolio_id: u64,
    /// Short title
    pub title: String,
    /// Optional longer message
    pub message: Option<String>,
    /// Timestamp in milliseconds
    pub timestamp: i64,
}

impl NotificationEvent {
    pub fn new(
        kind: NotificationKind,
        user_id: impl Into<String>,
        game_id: u64,
        portfolio_id: u64,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            user_id: user_id.into(),
            game_id,
            portfolio_id,
            title: title.into(),
            message: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
