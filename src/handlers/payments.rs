use crate::{
    error::{ErrorResponse, PaymentError},
    models::{ApiResponse, PaymentRecord, PaymentStatusSnapshot},
    services::{Analytics, ChainClient, PaymentIntentRequest, ReconciliationService},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<ReconciliationService>,
    pub chain: Arc<dyn ChainClient>,
    pub analytics: Arc<Analytics>,
}

#[derive(Debug, Deserialize)]
pub struct AttachTransactionRequest {
    pub tx_hash: String,
    pub from_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecipientAddress {
    pub address: Address,
    pub network: String,
    pub chain_id: Option<u64>,
}

pub async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<PaymentIntentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentRecord>>), PaymentError> {
    let record = state.payments.create_payment_intent(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(record))))
}

pub async fn get_payment_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentStatusSnapshot>>, PaymentError> {
    let snapshot = state.payments.get_status(id).await?;
    Ok(Json(ApiResponse::ok(snapshot)))
}

pub async fn attach_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<AttachTransactionRequest>,
) -> Result<Json<ApiResponse<PaymentRecord>>, PaymentError> {
    let record = state
        .payments
        .attach_transaction(id, &request.tx_hash, request.from_address.as_deref())
        .await?;
    Ok(Json(ApiResponse::ok(record)))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentRecord>>, PaymentError> {
    let record = state.payments.cancel(id).await?;
    Ok(Json(ApiResponse::ok(record)))
}

pub async fn order_payments(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
) -> Result<Json<ApiResponse<Vec<PaymentStatusSnapshot>>>, PaymentError> {
    let payments = state.payments.payments_for_order(&order_ref).await?;
    Ok(Json(ApiResponse::ok(payments)))
}

/// Exposes the configured recipient so it never has to ship in client code.
pub async fn recipient_address(State(state): State<AppState>) -> Response {
    match state.payments.recipient() {
        Some(address) => {
            let network = state.payments.network();
            Json(ApiResponse::ok(RecipientAddress {
                address,
                network: network.display_name().to_string(),
                chain_id: network.chain_id(),
            }))
            .into_response()
        }
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                success: false,
                error: "RECIPIENT_WALLET is missing or not a valid ETH address (0x followed by 40 hex characters)".to_string(),
                error_code: "RECIPIENT_NOT_CONFIGURED".to_string(),
                timestamp: Utc::now(),
                request_id: Uuid::new_v4().to_string(),
            }),
        )
            .into_response(),
    }
}
