use anyhow::Result;
use eth_pay_tracker::{
    config::Config,
    handlers::{router, AppState},
    services::*,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CAS_MAX_ATTEMPTS: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    tracing::info!("Starting eth-pay-tracker v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {:?}", config.environment);

    // Initialize services
    let ethereum = EthereumChainClient::new(
        &config.eth_rpc_url,
        config.eth_rpc_fallback.as_deref(),
        config.eth_ws_url.as_deref(),
    )
    .await?;
    match ethereum.network().await {
        Ok(network) if network != config.network => tracing::warn!(
            "RPC endpoint serves {} but NETWORK is {}",
            network.display_name(),
            config.network.display_name()
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!("Could not read chain id: {}", e),
    }
    let chain: Arc<dyn ChainClient> = Arc::new(ethereum);
    let store: PaymentStoreRef = Arc::new(InMemoryPaymentStore::new());
    let notifier = StatusNotifier::new();
    let analytics = Arc::new(Analytics::new());
    let applier = Arc::new(TransitionApplier::new(
        store,
        notifier.clone(),
        analytics.clone(),
        CAS_MAX_ATTEMPTS,
    ));
    let payments = Arc::new(ReconciliationService::new(
        applier.clone(),
        config.payment_policy(),
    ));

    if let Some(url) = &config.status_webhook_url {
        let webhook = WebhookNotifier::new(url.clone())?;
        tokio::spawn(webhook.run(notifier.subscribe()));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = Arc::new(ConfirmationWatcher::new(
        chain.clone(),
        applier,
        config.watcher_config(),
    ));
    let watcher_handle = watcher.spawn(shutdown_rx);

    // Build router
    let app = router(AppState {
        payments,
        chain,
        analytics,
    })
    .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)))
    .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Payment updates: ws://{}/ws/payments", addr);
    tracing::info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let the watcher finish its current pass
    let _ = shutdown_tx.send(true);
    if let Err(e) = watcher_handle.await {
        tracing::error!("Watcher task ended abnormally: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl+c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down gracefully...");
}
