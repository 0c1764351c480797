use crate::models::Network;
use crate::services::{PaymentPolicy, WatcherConfig};
use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Development,
    Testnet,
    Production,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub host: String,
    pub port: u16,

    // Chain access
    pub eth_rpc_url: String,
    pub eth_rpc_fallback: Option<String>,
    pub eth_ws_url: Option<String>,
    pub network: Network,

    // Payment policy
    pub recipient_wallet: Option<String>,
    pub required_confirmations: u64,

    // Watcher
    pub poll_interval_secs: u64,
    pub chain_query_timeout_secs: u64,
    pub intent_expiry_secs: i64,
    pub pending_timeout_secs: i64,
    pub dropped_grace_secs: i64,
    pub reorg_watch_depth: u64,
    pub chain_max_retries: u32,
    pub chain_backoff_ms: u64,
    pub watch_batch_size: usize,

    pub status_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let environment = Self::parse_environment()?;

        let config = Self {
            environment,
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_var("PORT", "8080")?,

            eth_rpc_url: std::env::var("ETH_RPC_URL").context("ETH_RPC_URL required")?,
            eth_rpc_fallback: Self::optional_var("ETH_RPC_FALLBACK"),
            eth_ws_url: Self::optional_var("ETH_WS_URL"),
            network: Network::from_str(
                &std::env::var("NETWORK").unwrap_or_else(|_| "mainnet".to_string()),
            )
            .map_err(|e| anyhow::anyhow!("Invalid NETWORK: {}", e))?,

            // Validated by PaymentPolicy; a bad value disables intents instead of aborting
            recipient_wallet: Self::optional_var("RECIPIENT_WALLET"),
            required_confirmations: Self::parse_var("REQUIRED_CONFIRMATIONS", "3")?,

            poll_interval_secs: Self::parse_var("POLL_INTERVAL_SECS", "12")?,
            chain_query_timeout_secs: Self::parse_var("CHAIN_QUERY_TIMEOUT_SECS", "10")?,
            intent_expiry_secs: Self::parse_var("INTENT_EXPIRY_SECS", "3600")?,
            pending_timeout_secs: Self::parse_var("PENDING_TIMEOUT_SECS", "7200")?,
            dropped_grace_secs: Self::parse_var("DROPPED_GRACE_SECS", "900")?,
            reorg_watch_depth: Self::parse_var("REORG_WATCH_DEPTH", "64")?,
            chain_max_retries: Self::parse_var("CHAIN_MAX_RETRIES", "5")?,
            chain_backoff_ms: Self::parse_var("CHAIN_BACKOFF_MS", "500")?,
            watch_batch_size: Self::parse_var("WATCH_BATCH_SIZE", "16")?,

            status_webhook_url: Self::optional_var("STATUS_WEBHOOK_URL"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn payment_policy(&self) -> PaymentPolicy {
        PaymentPolicy::from_configured(
            self.recipient_wallet.as_deref(),
            self.network,
            self.required_confirmations,
        )
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            query_timeout: Duration::from_secs(self.chain_query_timeout_secs),
            intent_expiry: chrono::Duration::seconds(self.intent_expiry_secs),
            pending_timeout: chrono::Duration::seconds(self.pending_timeout_secs),
            dropped_grace: chrono::Duration::seconds(self.dropped_grace_secs),
            reorg_watch_depth: self.reorg_watch_depth,
            max_retries: self.chain_max_retries,
            backoff_base: Duration::from_millis(self.chain_backoff_ms),
            batch_size: self.watch_batch_size,
        }
    }

    fn parse_environment() -> Result<Environment> {
        let env = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        match env.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testnet" | "test" => Ok(Environment::Testnet),
            "production" | "prod" => Ok(Environment::Production),
            _ => bail!("Unknown environment: {}", env),
        }
    }

    fn parse_var<T>(var: &str, default: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        std::env::var(var)
            .unwrap_or_else(|_| default.to_string())
            .parse()
            .with_context(|| format!("Invalid {}", var))
    }

    fn optional_var(var: &str) -> Option<String> {
        std::env::var(var).ok().filter(|value| !value.trim().is_empty())
    }

    fn validate(&self) -> Result<()> {
        if !self.eth_rpc_url.starts_with("http") {
            bail!("ETH_RPC_URL must be HTTP(S) URL");
        }
        if let Some(url) = &self.eth_ws_url {
            if !url.starts_with("ws") {
                bail!("ETH_WS_URL must be WS(S) URL");
            }
        }
        if let Some(url) = &self.status_webhook_url {
            if !url.starts_with("http") {
                bail!("STATUS_WEBHOOK_URL must be HTTP(S) URL");
            }
        }
        if self.required_confirmations == 0 {
            bail!("REQUIRED_CONFIRMATIONS must be at least 1");
        }
        if self.poll_interval_secs == 0 {
            bail!("POLL_INTERVAL_SECS must be at least 1");
        }

        tracing::info!(
            "Configuration validated for {:?} environment on {}",
            self.environment,
            self.network.display_name()
        );

        Ok(())
    }
}
