use crate::services::lifecycle::LifecycleError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Invalid ETH address: {0}")]
    InvalidAddress(String),

    #[error("Invalid ETH amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid transaction hash: {0}")]
    InvalidTxHash(String),

    #[error("Invalid required confirmations: {0}")]
    InvalidConfirmations(u64),

    #[error("Order reference is required")]
    MissingOrderRef,

    #[error("Recipient wallet is not configured, payment intents are disabled")]
    RecipientNotConfigured,

    #[error("Payment {0} not found")]
    NotFound(Uuid),

    #[error("Transaction {tx_hash} is already attached to payment {owner}")]
    DuplicateTxHash { tx_hash: String, owner: Uuid },

    #[error("Payment {0} was modified concurrently, retry with fresh state")]
    ConcurrentUpdate(Uuid),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Chain client error: {0}")]
    Chain(#[from] ChainError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    pub fn error_code(&self) -> &'static str {
        match self {
            PaymentError::InvalidAddress(_) => "INVALID_ADDRESS",
            PaymentError::InvalidAmount(_) => "INVALID_AMOUNT",
            PaymentError::InvalidTxHash(_) => "INVALID_TX_HASH",
            PaymentError::InvalidConfirmations(_) => "INVALID_CONFIRMATIONS",
            PaymentError::MissingOrderRef => "MISSING_ORDER_REF",
            PaymentError::RecipientNotConfigured => "RECIPIENT_NOT_CONFIGURED",
            PaymentError::NotFound(_) => "NOT_FOUND",
            PaymentError::DuplicateTxHash { .. } => "DUPLICATE_TX_HASH",
            PaymentError::ConcurrentUpdate(_) => "CONCURRENT_UPDATE",
            PaymentError::Lifecycle(LifecycleError::InvalidTransition { .. }) => {
                "INVALID_TRANSITION"
            }
            PaymentError::Lifecycle(LifecycleError::AlreadyAttached { .. }) => "ALREADY_ATTACHED",
            PaymentError::Lifecycle(LifecycleError::StaleObservation { .. }) => {
                "STALE_OBSERVATION"
            }
            PaymentError::Chain(_) => "UPSTREAM_ERROR",
            PaymentError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Validation failures are rejected synchronously and never persisted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PaymentError::InvalidAddress(_)
                | PaymentError::InvalidAmount(_)
                | PaymentError::InvalidTxHash(_)
                | PaymentError::InvalidConfirmations(_)
                | PaymentError::MissingOrderRef
                | PaymentError::RecipientNotConfigured
        )
    }
}

/// Failures talking to the external chain client.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("chain query timed out after {0:?}")]
    Timeout(Duration),

    #[error("chain client rate limited: {0}")]
    RateLimited(String),

    #[error("provider error: {0}")]
    Provider(#[from] ethers::providers::ProviderError),

    #[error("chain client unavailable: {0}")]
    Unavailable(String),
}

impl ChainError {
    /// Transient errors are retried with backoff and never fail a payment.
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::Timeout(_) | ChainError::RateLimited(_) | ChainError::Unavailable(_) => {
                true
            }
            ChainError::Provider(e) => !matches!(
                e,
                ethers::providers::ProviderError::SerdeJson(_)
                    | ethers::providers::ProviderError::HexError(_)
            ),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub request_id: String,
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();

        let status = match &self {
            e if e.is_validation() => match e {
                PaymentError::RecipientNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            },
            PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
            PaymentError::DuplicateTxHash { .. }
            | PaymentError::ConcurrentUpdate(_)
            | PaymentError::Lifecycle(_) => StatusCode::CONFLICT,
            PaymentError::Chain(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error_code = self.error_code();

        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            error_code: error_code.to_string(),
            timestamp: Utc::now(),
            request_id,
        };

        if status.is_server_error() {
            tracing::error!(error = ?self, error_code = error_code, "Request failed");
        } else {
            tracing::warn!(error = %self, error_code = error_code, "Request rejected");
        }

        (status, Json(body)).into_response()
    }
}
