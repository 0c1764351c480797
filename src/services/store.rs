use crate::error::PaymentError;
use crate::models::{PaymentRecord, PaymentStatus};
use crate::services::lifecycle::{LifecycleError, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Computes the next record from the one currently stored.
///
/// Runs while the store holds the record, so it must be quick and must not
/// perform I/O.
pub type RecordMutation =
    Box<dyn FnOnce(&PaymentRecord) -> Result<Transition, LifecycleError> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The mutation was applied; carries the stored record.
    Committed(PaymentRecord),
    /// The record already reflected the mutation.
    Unchanged(PaymentRecord),
    /// The status no longer matched; a concurrent writer won.
    Conflict { actual: PaymentStatus },
}

impl CasOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CasOutcome::Committed(_))
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Persists a new record. Fails validation or on a duplicate hash.
    async fn create(&self, record: PaymentRecord) -> Result<Uuid, PaymentError>;

    async fn get(&self, id: Uuid) -> Result<Option<PaymentRecord>, PaymentError>;

    async fn find_by_tx_hash(&self, tx_hash: H256) -> Result<Option<PaymentRecord>, PaymentError>;

    async fn find_by_order(&self, order_ref: &str) -> Result<Vec<PaymentRecord>, PaymentError>;

    /// Records with a hash awaiting settlement (`pending` or `reverted`)
    /// whose known block, if any, is at or below `height`.
    async fn find_pending_below_height(
        &self,
        height: u64,
    ) -> Result<Vec<PaymentRecord>, PaymentError>;

    /// Confirmed records mined at or above `min_block`, still exposed to reorgs.
    async fn find_confirmed_since(&self, min_block: u64)
        -> Result<Vec<PaymentRecord>, PaymentError>;

    /// `created` records without a hash created before `cutoff`.
    async fn find_expired_intents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentRecord>, PaymentError>;

    /// `pending` records without confirmation progress since `cutoff`.
    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentRecord>, PaymentError>;

    /// Atomically applies `mutation` if the record is still in `expected` status.
    ///
    /// Enforces at-most-once hash attachment and hash uniqueness across records.
    async fn compare_and_update_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        mutation: RecordMutation,
    ) -> Result<CasOutcome, PaymentError>;
}

pub type PaymentStoreRef = Arc<dyn PaymentStore>;

#[derive(Default)]
struct Tables {
    records: HashMap<Uuid, PaymentRecord>,
    by_tx_hash: HashMap<H256, Uuid>,
}

impl Tables {
    fn select(&self, predicate: impl Fn(&PaymentRecord) -> bool) -> Vec<PaymentRecord> {
        let mut found: Vec<PaymentRecord> = self
            .records
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        found
    }

    fn claim_hash(&self, id: Uuid, tx_hash: H256) -> Result<(), PaymentError> {
        match self.by_tx_hash.get(&tx_hash) {
            Some(owner) if *owner != id => Err(PaymentError::DuplicateTxHash {
                tx_hash: format!("{:?}", tx_hash),
                owner: *owner,
            }),
            _ => Ok(()),
        }
    }
}

/// A thread-safe in-memory payment table with a secondary index on `tx_hash`.
///
/// A single write lock covers both maps, which makes every
/// compare-and-swap atomic with respect to the hash index.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn create(&self, record: PaymentRecord) -> Result<Uuid, PaymentError> {
        record.validate()?;

        let mut tables = self.tables.write().await;
        if tables.records.contains_key(&record.id) {
            return Err(PaymentError::Internal(format!(
                "payment {} already exists",
                record.id
            )));
        }
        if let Some(tx_hash) = record.tx_hash {
            tables.claim_hash(record.id, tx_hash)?;
            tables.by_tx_hash.insert(tx_hash, record.id);
        }
        let id = record.id;
        tables.records.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentRecord>, PaymentError> {
        let tables = self.tables.read().await;
        Ok(tables.records.get(&id).cloned())
    }

    async fn find_by_tx_hash(&self, tx_hash: H256) -> Result<Option<PaymentRecord>, PaymentError> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_tx_hash
            .get(&tx_hash)
            .and_then(|id| tables.records.get(id))
            .cloned())
    }

    async fn find_by_order(&self, order_ref: &str) -> Result<Vec<PaymentRecord>, PaymentError> {
        let tables = self.tables.read().await;
        Ok(tables.select(|r| r.order_ref == order_ref))
    }

    async fn find_pending_below_height(
        &self,
        height: u64,
    ) -> Result<Vec<PaymentRecord>, PaymentError> {
        let tables = self.tables.read().await;
        Ok(tables.select(|r| {
            matches!(r.status, PaymentStatus::Pending | PaymentStatus::Reverted)
                && r.tx_hash.is_some()
                && r.block_number.map_or(true, |b| b <= height)
        }))
    }

    async fn find_confirmed_since(
        &self,
        min_block: u64,
    ) -> Result<Vec<PaymentRecord>, PaymentError> {
        let tables = self.tables.read().await;
        Ok(tables.select(|r| {
            r.status == PaymentStatus::Confirmed && r.block_number.map_or(false, |b| b >= min_block)
        }))
    }

    async fn find_expired_intents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentRecord>, PaymentError> {
        let tables = self.tables.read().await;
        Ok(tables.select(|r| {
            r.status == PaymentStatus::Created && r.tx_hash.is_none() && r.created_at < cutoff
        }))
    }

    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentRecord>, PaymentError> {
        let tables = self.tables.read().await;
        Ok(tables.select(|r| {
            r.status == PaymentStatus::Pending
                && r.last_progress_at.unwrap_or(r.updated_at) < cutoff
        }))
    }

    async fn compare_and_update_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        mutation: RecordMutation,
    ) -> Result<CasOutcome, PaymentError> {
        let mut tables = self.tables.write().await;
        let current = tables
            .records
            .get(&id)
            .cloned()
            .ok_or(PaymentError::NotFound(id))?;

        if current.status != expected {
            return Ok(CasOutcome::Conflict {
                actual: current.status,
            });
        }

        let mut next = match mutation(&current)? {
            Transition::Unchanged => return Ok(CasOutcome::Unchanged(current)),
            Transition::Changed(next) => next,
        };

        if next.id != current.id
            || next.order_ref != current.order_ref
            || next.to_address != current.to_address
            || next.network != current.network
            || next.required_confirmations != current.required_confirmations
        {
            return Err(PaymentError::Internal(format!(
                "mutation of payment {} touched immutable fields",
                id
            )));
        }

        match (current.tx_hash, next.tx_hash) {
            (Some(existing), new) if new != Some(existing) => {
                return Err(LifecycleError::AlreadyAttached { tx_hash: existing }.into());
            }
            (None, Some(new)) => {
                tables.claim_hash(id, new)?;
                tables.by_tx_hash.insert(new, id);
            }
            _ => {}
        }
        if current.from_address.is_some() && next.from_address != current.from_address {
            next.from_address = current.from_address;
        }

        next.revision = current.revision + 1;
        tables.records.insert(id, next.clone());
        Ok(CasOutcome::Committed(next))
    }
}
