use super::AppState;
use crate::models::HealthStatus;
use axum::{extract::State, Json};
use chrono::Utc;
use std::time::Duration;

const CHAIN_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    let chain_height = match tokio::time::timeout(CHAIN_PROBE_TIMEOUT, state.chain.current_height()).await {
        Ok(Ok(height)) => Some(height),
        Ok(Err(e)) => {
            tracing::warn!("Health check could not reach chain: {}", e);
            None
        }
        Err(_) => {
            tracing::warn!("Health check chain query timed out");
            None
        }
    };
    let ethereum_ok = chain_height.is_some();
    let accepting_intents = state.payments.accepts_intents();

    let status = if ethereum_ok && accepting_intents {
        "healthy"
    } else if ethereum_ok || accepting_intents {
        "degraded"
    } else {
        "unhealthy"
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ethereum_rpc: ethereum_ok,
        chain_height,
        accepting_intents,
        uptime_seconds: state.analytics.uptime_seconds(),
        timestamp: Utc::now(),
    })
}
