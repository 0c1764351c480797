#![allow(dead_code)]

use async_trait::async_trait;
use eth_pay_tracker::error::ChainError;
use eth_pay_tracker::models::Network;
use eth_pay_tracker::services::{
    Analytics, ChainClient, ConfirmationWatcher, InMemoryPaymentStore, PaymentPolicy,
    ReconciliationService, StatusNotifier, TransitionApplier, TxObservation, WatcherConfig,
};
use ethers::types::H256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RECIPIENT: &str = "0x52908400098527886E0F7030069857D2E4169EE7";
pub const TX_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const TX_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

/// Chain client whose answers are set by the test.
#[derive(Default)]
pub struct ScriptedChain {
    height: Mutex<Option<u64>>,
    transactions: Mutex<HashMap<H256, TxObservation>>,
    /// Number of upcoming calls that fail with a transient error.
    transient_failures: AtomicU32,
    pub height_calls: AtomicUsize,
    pub transaction_calls: AtomicUsize,
}

impl ScriptedChain {
    pub fn at_height(height: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.set_height(height);
        Arc::new(chain)
    }

    /// A chain that is unreachable until a height is set.
    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_height(&self, height: u64) {
        *self.height.lock().unwrap() = Some(height);
    }

    pub fn go_down(&self) {
        *self.height.lock().unwrap() = None;
    }

    pub fn set_transaction(&self, tx_hash: &str, observation: TxObservation) {
        self.transactions
            .lock()
            .unwrap()
            .insert(hash(tx_hash), observation);
    }

    pub fn forget_transaction(&self, tx_hash: &str) {
        self.transactions.lock().unwrap().remove(&hash(tx_hash));
    }

    pub fn fail_next(&self, calls: u32) {
        self.transient_failures.store(calls, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Option<ChainError> {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .ok()
            .map(|_| ChainError::RateLimited("429 Too Many Requests".to_string()))
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn current_height(&self) -> Result<u64, ChainError> {
        self.height_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let height = *self.height.lock().unwrap();
        height.ok_or_else(|| ChainError::Unavailable("connection refused".to_string()))
    }

    async fn get_transaction(&self, tx_hash: H256) -> Result<TxObservation, ChainError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let observation = self.transactions.lock().unwrap().get(&tx_hash).cloned();
        Ok(observation.unwrap_or_else(TxObservation::unknown))
    }
}

pub struct Harness {
    pub chain: Arc<ScriptedChain>,
    pub store: Arc<InMemoryPaymentStore>,
    pub analytics: Arc<Analytics>,
    pub payments: Arc<ReconciliationService>,
    pub watcher: Arc<ConfirmationWatcher>,
}

pub fn watcher_config() -> WatcherConfig {
    WatcherConfig {
        poll_interval: Duration::from_millis(20),
        query_timeout: Duration::from_millis(200),
        max_retries: 2,
        backoff_base: Duration::from_millis(1),
        ..WatcherConfig::default()
    }
}

pub fn harness(chain: Arc<ScriptedChain>) -> Harness {
    harness_with(chain, Some(RECIPIENT), watcher_config())
}

pub fn harness_with(
    chain: Arc<ScriptedChain>,
    recipient: Option<&str>,
    config: WatcherConfig,
) -> Harness {
    let store = Arc::new(InMemoryPaymentStore::new());
    let analytics = Arc::new(Analytics::new());
    let applier = Arc::new(TransitionApplier::new(
        store.clone(),
        StatusNotifier::new(),
        analytics.clone(),
        5,
    ));
    let payments = Arc::new(ReconciliationService::new(
        applier.clone(),
        PaymentPolicy::from_configured(recipient, Network::Mainnet, 3),
    ));
    let watcher = Arc::new(ConfirmationWatcher::new(chain.clone(), applier, config));

    Harness {
        chain,
        store,
        analytics,
        payments,
        watcher,
    }
}

pub fn hash(tx_hash: &str) -> H256 {
    tx_hash.parse().unwrap()
}

pub fn block_hash(byte: u8) -> H256 {
    H256::repeat_byte(byte)
}
