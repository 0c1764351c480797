mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use common::*;
use eth_pay_tracker::handlers::{router, AppState};
use eth_pay_tracker::services::TxObservation;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    router(AppState {
        payments: h.payments.clone(),
        chain: h.chain.clone(),
        analytics: h.analytics.clone(),
    })
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_payment_flow_over_http() {
    let h = harness(ScriptedChain::at_height(100));

    let (status, body) = send(
        app(&h),
        post(
            "/api/payments",
            json!({ "order_ref": "order-42", "amount_eth": "1.5", "required_confirmations": 3 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "created");
    assert_eq!(body["data"]["amount_eth"], "1.5");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        app(&h),
        post(
            &format!("/api/payments/{}/transaction", id),
            json!({ "tx_hash": TX_A }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "pending");

    h.chain
        .set_transaction(TX_A, TxObservation::included(98, block_hash(1)));
    h.watcher.tick().await;

    let (status, body) = send(app(&h), get(&format!("/api/payments/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "confirmed");
    assert_eq!(body["data"]["confirmations"], 3);
    assert_eq!(body["data"]["block_number"], 98);

    let (status, body) = send(app(&h), get("/api/orders/order-42/payments")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_validation_errors() {
    let h = harness(ScriptedChain::at_height(100));

    let (status, body) = send(
        app(&h),
        post(
            "/api/payments",
            json!({ "order_ref": "order-1", "to_address": "0x123", "amount_eth": "1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_ADDRESS");

    let (status, body) = send(
        app(&h),
        post(
            "/api/payments",
            json!({ "order_ref": "order-1", "amount_eth": "-2" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_AMOUNT");

    let (_, body) = send(
        app(&h),
        post("/api/payments", json!({ "order_ref": "order-1", "amount_eth": "1" })),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        app(&h),
        post(
            &format!("/api/payments/{}/transaction", id),
            json!({ "tx_hash": "0xabc" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_TX_HASH");
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn test_conflicts_and_missing_payments() {
    let h = harness(ScriptedChain::at_height(100));
    let mut ids = Vec::new();
    for order in ["order-1", "order-2"] {
        let (_, body) = send(
            app(&h),
            post("/api/payments", json!({ "order_ref": order, "amount_eth": "1" })),
        )
        .await;
        ids.push(body["data"]["id"].as_str().unwrap().to_string());
    }

    let (status, _) = send(
        app(&h),
        post(&format!("/api/payments/{}/transaction", ids[0]), json!({ "tx_hash": TX_A })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        app(&h),
        post(&format!("/api/payments/{}/transaction", ids[1]), json!({ "tx_hash": TX_A })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "DUPLICATE_TX_HASH");

    let (status, body) = send(app(&h), post(&format!("/api/payments/{}/cancel", ids[0]), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "INVALID_TRANSITION");

    let (status, body) = send(app(&h), post(&format!("/api/payments/{}/cancel", ids[1]), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    let (status, body) = send(
        app(&h),
        get("/api/payments/00000000-0000-0000-0000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_missing_recipient_refuses_intents() {
    let h = harness_with(ScriptedChain::at_height(100), Some("not-an-address"), watcher_config());

    let (status, body) = send(
        app(&h),
        post("/api/payments", json!({ "order_ref": "order-1", "amount_eth": "1" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], "RECIPIENT_NOT_CONFIGURED");
    assert!(h.store.is_empty().await);

    let (status, body) = send(app(&h), get("/api/crypto/address")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error_code"], "RECIPIENT_NOT_CONFIGURED");
}

#[tokio::test]
async fn test_recipient_address() {
    let h = harness(ScriptedChain::at_height(100));

    let (status, body) = send(app(&h), get("/api/crypto/address")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"]["address"].as_str().unwrap().to_lowercase(),
        RECIPIENT.to_lowercase()
    );
    assert_eq!(body["data"]["chain_id"], 1);
}

#[tokio::test]
async fn test_health_and_stats() {
    let chain = ScriptedChain::at_height(1234);
    let h = harness(Arc::clone(&chain));

    let (status, body) = send(app(&h), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["chain_height"], 1234);
    assert_eq!(body["accepting_intents"], true);

    chain.go_down();
    let (_, body) = send(app(&h), get("/health")).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["ethereum_rpc"], false);

    send(
        app(&h),
        post("/api/payments", json!({ "order_ref": "order-1", "amount_eth": "0.3" })),
    )
    .await;
    let (status, body) = send(app(&h), get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["intents_created"], 1);
}
