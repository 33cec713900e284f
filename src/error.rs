use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::ledger::LedgerError;
use crate::services::price_cache::PriceFeedError;
use crate::services::sqlite_store::StoreError;
use crate::types::TransitionError;

/// Settlement failure taxonomy.
///
/// Validation and integrity failures end the affected game in `FAILED`.
/// Transient failures leave persisted state untouched so a later tick retries.
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Validation failure: {0}")]
    Validation(String),

    #[error("Data integrity failure: {0}")]
    DataIntegrity(String),

    #[error("Transient external failure: {0}")]
    TransientExternal(String),

    #[error("Reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SettlementError {
    /// Whether this error moves the affected game to `FAILED`.
    pub fn fails_game(&self) -> bool {
        matches!(
            self,
            SettlementError::Validation(_) | SettlementError::DataIntegrity(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SettlementError::TransientExternal(_) | SettlementError::Store(_)
        )
    }
}

impl From<LedgerError> for SettlementError {
    fn from(e: LedgerError) -> Self {
        SettlementError::TransientExternal(e.to_string())
    }
}

impl From<PriceFeedError> for SettlementError {
    fn from(e: PriceFeedError) -> Self {
        SettlementError::TransientExternal(e.to_string())
    }
}

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::SerdeJson(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            AppError::Anyhow(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
