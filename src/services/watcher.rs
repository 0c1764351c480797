//! Background reconciliation of payment records against the chain.
//!
//! Each tick reads the canonical height, re-queries every transaction that
//! can still change (pending, reverted, and confirmed inside the reorg watch
//! window), and feeds the resulting observation into the lifecycle through
//! the [`TransitionApplier`]. Confirmations are always derived from
//! `height - block + 1`, never accumulated, so a reorg that lowers the count
//! is simply re-evaluated.

use crate::error::{ChainError, PaymentError};
use crate::models::{format_address, format_wei, PaymentRecord, PaymentStatus};
use crate::services::ethereum::{ChainClient, TxObservation, TxStatus};
use crate::services::lifecycle::{BlockRef, LifecycleError, LifecycleEvent};
use crate::services::transitions::{Applied, TransitionApplier};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Pull interval, also the fallback when no block subscription is available.
    pub poll_interval: Duration,
    /// Bound on each individual chain query.
    pub query_timeout: Duration,
    /// `created` intents without a hash older than this become `failed`.
    pub intent_expiry: chrono::Duration,
    /// `pending` records without confirmation progress for this long become `failed`.
    pub pending_timeout: chrono::Duration,
    /// How long a transaction may be absent from every mempool and block.
    pub dropped_grace: chrono::Duration,
    /// Confirmed records this many blocks below the tip are still re-checked.
    pub reorg_watch_depth: u64,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub batch_size: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(12),
            query_timeout: Duration::from_secs(10),
            intent_expiry: chrono::Duration::hours(1),
            pending_timeout: chrono::Duration::hours(2),
            dropped_grace: chrono::Duration::minutes(15),
            reorg_watch_depth: 64,
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            batch_size: 16,
        }
    }
}

/// Outcome counters for one watcher pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub height: Option<u64>,
    pub checked: usize,
    pub committed: usize,
    pub discarded: usize,
    pub expired: usize,
    pub timed_out: usize,
    pub errors: usize,
}

pub struct ConfirmationWatcher {
    chain: Arc<dyn ChainClient>,
    applier: Arc<TransitionApplier>,
    config: WatcherConfig,
}

impl ConfirmationWatcher {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        applier: Arc<TransitionApplier>,
        config: WatcherConfig,
    ) -> Self {
        tracing::info!(
            poll_interval = ?config.poll_interval,
            reorg_watch_depth = config.reorg_watch_depth,
            "ConfirmationWatcher initialized"
        );
        Self {
            chain,
            applier,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Runs until `shutdown` flips to true or its sender is dropped. A pass in
    /// progress always completes before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut blocks = match self.chain.subscribe_new_blocks().await {
            Ok(Some(rx)) => {
                tracing::info!("Watching new blocks via subscription");
                Some(rx)
            }
            Ok(None) => {
                tracing::info!("Block subscription unavailable, polling every {:?}", self.config.poll_interval);
                None
            }
            Err(e) => {
                tracing::warn!("Block subscription failed ({}), falling back to polling", e);
                None
            }
        };

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
                block = next_block(&mut blocks) => match block {
                    Some(number) => {
                        tracing::debug!(block = number, "New block");
                        interval.reset();
                    }
                    None => {
                        tracing::warn!("Block subscription closed, falling back to polling");
                        blocks = None;
                        continue;
                    }
                },
            }

            let report = self.tick().await;
            if report.committed > 0 || report.errors > 0 || report.expired > 0 {
                tracing::info!(
                    height = ?report.height,
                    checked = report.checked,
                    committed = report.committed,
                    expired = report.expired,
                    timed_out = report.timed_out,
                    errors = report.errors,
                    "Watcher pass complete"
                );
            }
        }

        tracing::info!("ConfirmationWatcher stopped");
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One reconciliation pass evaluated at wall-clock time `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        // Intent expiry needs no chain data, so it runs even when the client is down
        self.expire_intents(now, &mut report).await;

        let height = match self.with_retry(|| self.chain.current_height()).await {
            Ok(height) => height,
            Err(e) => {
                tracing::warn!("Could not read chain height, skipping pass: {}", e);
                report.errors += 1;
                return report;
            }
        };
        report.height = Some(height);

        let candidates = match self.candidates(height).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!("Could not load payments to check: {}", e);
                report.errors += 1;
                return report;
            }
        };

        for batch in candidates.chunks(self.config.batch_size.max(1)) {
            let observations = join_all(batch.iter().map(|record| self.observe(record))).await;

            for (record, observation) in batch.iter().zip(observations) {
                report.checked += 1;
                match observation {
                    Ok(observation) => {
                        if let Some(event) = self.event_for(record, &observation, height, now) {
                            self.apply(record, event, &mut report).await;
                        }
                    }
                    Err(e) => {
                        // Retried on the next pass; never a reason to fail the payment
                        tracing::warn!(
                            payment_id = %record.id,
                            tx = ?record.tx_hash,
                            "Chain query failed after retries: {}",
                            e
                        );
                        report.errors += 1;
                    }
                }
            }
        }

        self.time_out_pending(now, &mut report).await;
        report
    }

    async fn candidates(&self, height: u64) -> Result<Vec<PaymentRecord>, PaymentError> {
        let store = self.applier.store();
        let mut candidates = store.find_pending_below_height(height).await?;
        let window_start = height.saturating_sub(self.config.reorg_watch_depth);
        candidates.extend(store.find_confirmed_since(window_start).await?);
        Ok(candidates)
    }

    async fn observe(&self, record: &PaymentRecord) -> Result<TxObservation, ChainError> {
        let Some(tx_hash) = record.tx_hash else {
            return Ok(TxObservation::unknown());
        };
        self.with_retry(|| self.chain.get_transaction(tx_hash)).await
    }

    /// Maps a chain observation to the lifecycle event it implies.
    fn event_for(
        &self,
        record: &PaymentRecord,
        observation: &TxObservation,
        height: u64,
        now: DateTime<Utc>,
    ) -> Option<LifecycleEvent> {
        match observation.status {
            TxStatus::Included | TxStatus::Failed => {
                let rejected = if observation.status == TxStatus::Failed {
                    Some("transaction execution failed on chain".to_string())
                } else {
                    verify_transfer(record, observation)
                };
                let (Some(number), Some(hash)) = (observation.block_number, observation.block_hash)
                else {
                    return match (record.status, rejected) {
                        (PaymentStatus::Pending, Some(reason)) => Some(LifecycleEvent::Fail { reason }),
                        _ => {
                            tracing::warn!(
                                payment_id = %record.id,
                                status = %record.status,
                                "Receipt reported without a block"
                            );
                            None
                        }
                    };
                };
                Some(LifecycleEvent::Included {
                    block: BlockRef {
                        number,
                        hash,
                        timestamp: observation.timestamp,
                    },
                    confirmations: observation.confirmations_at(height).unwrap_or(1),
                    from_address: observation.from,
                    gas: observation.gas_details(),
                    rejected,
                })
            }
            TxStatus::Mempool => Some(LifecycleEvent::InMempool),
            TxStatus::Orphaned => Some(LifecycleEvent::Orphaned),
            TxStatus::Unknown => {
                let dropped = record.status == PaymentStatus::Pending
                    && record.block_hash.is_none()
                    && record
                        .missing_since
                        .map_or(false, |since| now - since >= self.config.dropped_grace);
                if dropped {
                    Some(LifecycleEvent::Fail {
                        reason: format!(
                            "transaction dropped: not seen in any mempool or block for {} minutes",
                            self.config.dropped_grace.num_minutes()
                        ),
                    })
                } else {
                    Some(LifecycleEvent::NotFound)
                }
            }
        }
    }

    async fn apply(&self, record: &PaymentRecord, event: LifecycleEvent, report: &mut TickReport) {
        match self.applier.apply(record.id, event).await {
            Ok(Applied::Committed(_)) => report.committed += 1,
            Ok(Applied::Unchanged(_)) => {}
            Ok(Applied::Discarded(_)) => report.discarded += 1,
            Err(PaymentError::Lifecycle(e @ LifecycleError::InvalidTransition { .. })) => {
                // The record moved on (e.g. cancelled) since it was selected
                tracing::debug!(payment_id = %record.id, "Observation no longer applicable: {}", e);
            }
            Err(e) => {
                tracing::warn!(payment_id = %record.id, "Failed to apply chain observation: {}", e);
                report.errors += 1;
            }
        }
    }

    async fn expire_intents(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let cutoff = now - self.config.intent_expiry;
        let expired = match self.applier.store().find_expired_intents(cutoff).await {
            Ok(expired) => expired,
            Err(e) => {
                tracing::error!("Could not load expired intents: {}", e);
                report.errors += 1;
                return;
            }
        };

        for record in expired {
            match self.applier.apply(record.id, LifecycleEvent::Expire).await {
                Ok(Applied::Committed(_)) => {
                    tracing::info!(payment_id = %record.id, order_ref = %record.order_ref, "Payment intent expired");
                    report.expired += 1;
                }
                Ok(_) => {}
                Err(PaymentError::Lifecycle(_)) => {
                    // A hash was attached or the intent was cancelled in the meantime
                }
                Err(e) => {
                    tracing::warn!(payment_id = %record.id, "Failed to expire intent: {}", e);
                    report.errors += 1;
                }
            }
        }
    }

    /// Fails pending payments whose transaction never made it into a block
    /// within the pending timeout. Runs only after a successful height read.
    async fn time_out_pending(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let cutoff = now - self.config.pending_timeout;
        let stale = match self.applier.store().find_stale_pending(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::error!("Could not load stale pending payments: {}", e);
                report.errors += 1;
                return;
            }
        };

        for record in stale.into_iter().filter(|r| r.block_hash.is_none()) {
            let reason = format!(
                "no confirmation progress for {} minutes",
                self.config.pending_timeout.num_minutes()
            );
            match self
                .applier
                .apply(record.id, LifecycleEvent::Fail { reason })
                .await
            {
                Ok(Applied::Committed(_)) => report.timed_out += 1,
                Ok(_) | Err(PaymentError::Lifecycle(_)) => {}
                Err(e) => {
                    tracing::warn!(payment_id = %record.id, "Failed to time out payment: {}", e);
                    report.errors += 1;
                }
            }
        }
    }

    /// Runs a chain query under the per-query timeout, retrying transient
    /// failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, mut query: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(self.config.query_timeout, query()).await {
                Ok(result) => result,
                Err(_) => Err(ChainError::Timeout(self.config.query_timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff_base * 2u32.saturating_pow(attempt.min(16));
                    tracing::debug!(attempt, ?delay, "Transient chain error, backing off: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn next_block(blocks: &mut Option<mpsc::Receiver<u64>>) -> Option<u64> {
    match blocks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Checks recipient and value of an included transfer, returning the reason
/// it cannot settle the payment.
fn verify_transfer(record: &PaymentRecord, observation: &TxObservation) -> Option<String> {
    if let Some(to) = observation.to {
        if to != record.to_address {
            return Some(format!(
                "payment sent to {} instead of {}",
                format_address(&to),
                format_address(&record.to_address)
            ));
        }
    }
    if let Some(value) = observation.value {
        let expected = record.amount_eth.to_wei();
        if value < expected {
            return Some(format!(
                "insufficient payment: {} ETH received, {} ETH expected",
                format_wei(value),
                record.amount_eth
            ));
        }
    }
    None
}
