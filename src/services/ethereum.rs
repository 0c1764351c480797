use crate::error::ChainError;
use crate::models::{format_gwei, format_wei, GasDetails, Network};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::{
    prelude::*,
    providers::{Http, Provider, Ws},
    types::{Block, Transaction, TransactionReceipt},
};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Not in any block or mempool the client can see.
    Unknown,
    /// Broadcast but not yet mined.
    Mempool,
    /// In a canonical block with a successful receipt.
    Included,
    /// In a block that is no longer canonical, or replaced.
    Orphaned,
    /// Mined but execution failed.
    Failed,
}

/// What the chain client currently knows about a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxObservation {
    pub status: TxStatus,
    pub block_number: Option<u64>,
    pub block_hash: Option<H256>,
    pub timestamp: Option<DateTime<Utc>>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: Option<U256>,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
}

impl TxObservation {
    pub fn with_status(status: TxStatus) -> Self {
        Self {
            status,
            block_number: None,
            block_hash: None,
            timestamp: None,
            from: None,
            to: None,
            value: None,
            gas_used: None,
            effective_gas_price: None,
        }
    }

    pub fn unknown() -> Self {
        Self::with_status(TxStatus::Unknown)
    }

    pub fn included(block_number: u64, block_hash: H256) -> Self {
        Self {
            block_number: Some(block_number),
            block_hash: Some(block_hash),
            ..Self::with_status(TxStatus::Included)
        }
    }

    fn from_transaction(status: TxStatus, tx: &Transaction) -> Self {
        Self {
            from: Some(tx.from),
            to: tx.to,
            value: Some(tx.value),
            ..Self::with_status(status)
        }
    }

    /// Confirmations at chain height `height`; a block ahead of a lagging
    /// height still counts as one.
    pub fn confirmations_at(&self, height: u64) -> Option<u64> {
        self.block_number
            .map(|block| (height + 1).saturating_sub(block).max(1))
    }

    pub fn gas_details(&self) -> Option<GasDetails> {
        let gas_used = self.gas_used?;
        let price = self.effective_gas_price;
        Some(GasDetails {
            gas_used: Some(gas_used.to_string()),
            gas_price_gwei: price.map(format_gwei),
            gas_fee_eth: price.map(|p| format_wei(gas_used.saturating_mul(p))),
        })
    }
}

/// External blockchain collaborator.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_height(&self) -> Result<u64, ChainError>;

    async fn get_transaction(&self, tx_hash: H256) -> Result<TxObservation, ChainError>;

    /// Push notifications of new block heights, when the client supports them.
    async fn subscribe_new_blocks(&self) -> Result<Option<mpsc::Receiver<u64>>, ChainError> {
        Ok(None)
    }
}

/// [`ChainClient`] over JSON-RPC, with an optional fallback endpoint and an
/// optional websocket endpoint for block subscriptions.
pub struct EthereumChainClient {
    primary: Arc<Provider<Http>>,
    fallback: Option<Arc<Provider<Http>>>,
    ws_url: Option<String>,
}

impl EthereumChainClient {
    pub async fn new(
        rpc_url: &str,
        fallback_url: Option<&str>,
        ws_url: Option<&str>,
    ) -> anyhow::Result<Self> {
        let primary = Arc::new(Provider::<Http>::try_from(rpc_url)?);

        let fallback = if let Some(url) = fallback_url {
            Some(Arc::new(Provider::<Http>::try_from(url)?))
        } else {
            None
        };

        // Test connection
        match primary.get_block_number().await {
            Ok(block_number) => {
                tracing::info!("Ethereum RPC connected, current block: {}", block_number)
            }
            Err(e) => tracing::warn!("Ethereum RPC not reachable yet: {}", e),
        }

        Ok(Self {
            primary,
            fallback,
            ws_url: ws_url.map(str::to_string),
        })
    }

    async fn fetch_transaction(&self, tx_hash: H256) -> Result<Option<Transaction>, ChainError> {
        match self.primary.get_transaction(tx_hash).await {
            Ok(tx) => Ok(tx),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!("Primary RPC failed ({}), trying fallback", e);
                    fallback.get_transaction(tx_hash).await.map_err(classify)
                }
                None => Err(classify(e)),
            },
        }
    }

    async fn fetch_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ChainError> {
        match self.primary.get_transaction_receipt(tx_hash).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!("Primary RPC failed ({}), trying fallback", e);
                    fallback
                        .get_transaction_receipt(tx_hash)
                        .await
                        .map_err(classify)
                }
                None => Err(classify(e)),
            },
        }
    }

    /// Network the primary endpoint is serving, by chain id.
    pub async fn network(&self) -> Result<Network, ChainError> {
        let chain_id = self.primary.get_chainid().await.map_err(classify)?;
        Ok(Network::from_chain_id(chain_id.low_u64()))
    }

    async fn fetch_block(&self, block_number: u64) -> Result<Option<Block<H256>>, ChainError> {
        match self.primary.get_block(block_number).await {
            Ok(block) => Ok(block),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!("Primary RPC failed ({}), trying fallback", e);
                    fallback.get_block(block_number).await.map_err(classify)
                }
                None => Err(classify(e)),
            },
        }
    }
}

#[async_trait]
impl ChainClient for EthereumChainClient {
    async fn current_height(&self) -> Result<u64, ChainError> {
        match self.primary.get_block_number().await {
            Ok(num) => Ok(num.as_u64()),
            Err(e) => match &self.fallback {
                Some(fallback) => fallback
                    .get_block_number()
                    .await
                    .map(|n| n.as_u64())
                    .map_err(classify),
                None => Err(classify(e)),
            },
        }
    }

    async fn get_transaction(&self, tx_hash: H256) -> Result<TxObservation, ChainError> {
        let Some(tx) = self.fetch_transaction(tx_hash).await? else {
            return Ok(TxObservation::unknown());
        };

        let (Some(block_hash), Some(block_number)) = (tx.block_hash, tx.block_number) else {
            return Ok(TxObservation::from_transaction(TxStatus::Mempool, &tx));
        };
        let block_number = block_number.as_u64();

        // The node may still serve the transaction from a block that lost a reorg
        let canonical = self
            .fetch_block(block_number)
            .await?
            .filter(|block| block.hash == Some(block_hash));
        let Some(canonical) = canonical else {
            tracing::debug!(tx = ?tx_hash, block_number, "Transaction block is not canonical");
            return Ok(TxObservation {
                block_number: Some(block_number),
                block_hash: Some(block_hash),
                ..TxObservation::from_transaction(TxStatus::Orphaned, &tx)
            });
        };

        let receipt = self.fetch_receipt(tx_hash).await?;
        let status = match receipt.as_ref().and_then(|r| r.status) {
            Some(status) if status.is_zero() => TxStatus::Failed,
            _ => TxStatus::Included,
        };

        Ok(TxObservation {
            block_number: Some(block_number),
            block_hash: Some(block_hash),
            timestamp: DateTime::<Utc>::from_timestamp(canonical.timestamp.low_u64() as i64, 0),
            gas_used: receipt.as_ref().and_then(|r| r.gas_used),
            effective_gas_price: receipt
                .as_ref()
                .and_then(|r| r.effective_gas_price)
                .or(tx.gas_price),
            ..TxObservation::from_transaction(status, &tx)
        })
    }

    async fn subscribe_new_blocks(&self) -> Result<Option<mpsc::Receiver<u64>>, ChainError> {
        let Some(url) = &self.ws_url else {
            return Ok(None);
        };

        let ws = Ws::connect(url.as_str())
            .await
            .map_err(|e| ChainError::Unavailable(format!("websocket connect failed: {}", e)))?;
        let provider = Arc::new(Provider::new(ws));
        let (sender, receiver) = mpsc::channel(64);

        tracing::info!("Block subscription connected to WebSocket");

        tokio::spawn(async move {
            let mut stream = match provider.subscribe_blocks().await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to subscribe to new blocks: {}", e);
                    return;
                }
            };

            while let Some(block) = stream.next().await {
                let Some(number) = block.number else {
                    continue;
                };
                if sender.send(number.as_u64()).await.is_err() {
                    break;
                }
            }
            tracing::warn!("Block subscription ended");
        });

        Ok(Some(receiver))
    }
}

fn classify(error: ProviderError) -> ChainError {
    let message = error.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("429") || lowered.contains("rate limit") || lowered.contains("too many requests") {
        ChainError::RateLimited(message)
    } else {
        ChainError::Provider(error)
    }
}
