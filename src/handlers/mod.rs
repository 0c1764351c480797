pub mod dashboard;
pub mod health;
pub mod payments;
pub mod stats;

pub use dashboard::*;
pub use health::*;
pub use payments::*;
pub use stats::*;

use axum::{
    routing::{get, post},
    Router,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/ws/payments", get(websocket_handler))
        .route("/api/crypto/address", get(recipient_address))
        .route("/api/payments", post(create_payment))
        .route("/api/payments/:id", get(get_payment_status))
        .route("/api/payments/:id/transaction", post(attach_transaction))
        .route("/api/payments/:id/cancel", post(cancel_payment))
        .route("/api/orders/:order_ref/payments", get(order_payments))
        .with_state(state)
}
