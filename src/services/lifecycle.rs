//! Payment state machine.
//!
//! [`transition`] is a pure function from the current record and an event to
//! the next record. It never touches storage; persistence goes through
//! [`PaymentStore::compare_and_update_status`](crate::services::store::PaymentStore::compare_and_update_status).
//!
//! ```text
//! created --attach--> pending --included(>= required)--> confirmed
//!    |                 |  ^                                  |
//!  cancel/expire       |  +--------- reappears ---------+    |
//!    v                 v                                |    v
//! cancelled/failed   reverted <---- orphaned / reorg ---+--- reverted
//! ```

use crate::models::{GasDetails, PaymentRecord, PaymentStatus};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use thiserror::Error;

/// Block containing the tracked transaction on the lineage the client reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub number: u64,
    pub hash: H256,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// A transaction hash was attached by the service.
    Attach {
        tx_hash: H256,
        from_address: Option<Address>,
    },
    /// Operator cancelled the intent.
    Cancel,
    /// Transaction is in a canonical block with the given confirmation count.
    Included {
        block: BlockRef,
        confirmations: u64,
        from_address: Option<Address>,
        gas: Option<GasDetails>,
        /// Why the mined transfer cannot settle this payment. Ends the record
        /// as `failed`.
        rejected: Option<String>,
    },
    /// Transaction is known but waiting in a mempool.
    InMempool,
    /// Transaction sits in a block that is no longer canonical, or was replaced.
    Orphaned,
    /// Client has no record of the transaction at all.
    NotFound,
    /// Explicit on-chain evidence the payment cannot complete.
    Fail { reason: String },
    /// Intent without a transaction outlived the expiry window.
    Expire,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Attach { .. } => "attach",
            LifecycleEvent::Cancel => "cancel",
            LifecycleEvent::Included { .. } => "included",
            LifecycleEvent::InMempool => "in_mempool",
            LifecycleEvent::Orphaned => "orphaned",
            LifecycleEvent::NotFound => "not_found",
            LifecycleEvent::Fail { .. } => "fail",
            LifecycleEvent::Expire => "expire",
        }
    }

    /// Chain observations can be re-applied safely; commands cannot.
    pub fn is_observation(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::Included { .. }
                | LifecycleEvent::InMempool
                | LifecycleEvent::Orphaned
                | LifecycleEvent::NotFound
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("invalid transition: {event} is not allowed from {from}")]
    InvalidTransition { from: PaymentStatus, event: String },

    #[error("transaction {tx_hash:?} is already attached")]
    AlreadyAttached { tx_hash: H256 },

    #[error("stale observation: {observed} confirmations reported, {recorded} already recorded for the same block")]
    StaleObservation { observed: u64, recorded: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Changed(PaymentRecord),
    /// The record already reflects the event.
    Unchanged,
}

impl Transition {
    pub fn is_changed(&self) -> bool {
        matches!(self, Transition::Changed(_))
    }
}

const ORPHANED_REASON: &str = "transaction no longer in the canonical chain";
const EXPIRED_REASON: &str = "payment intent expired without a transaction";

/// Computes the next state of `record` for `event`.
pub fn transition(
    record: &PaymentRecord,
    event: &LifecycleEvent,
    now: DateTime<Utc>,
) -> Result<Transition, LifecycleError> {
    use PaymentStatus::*;

    let mut next = record.clone();
    let invalid = || LifecycleError::InvalidTransition {
        from: record.status,
        event: event.name().to_string(),
    };

    match (record.status, event) {
        (
            _,
            LifecycleEvent::Attach {
                tx_hash,
                from_address,
            },
        ) => {
            if let Some(existing) = record.tx_hash {
                return Err(LifecycleError::AlreadyAttached { tx_hash: existing });
            }
            if record.status != Created {
                return Err(invalid());
            }
            next.tx_hash = Some(*tx_hash);
            next.from_address = record.from_address.or(*from_address);
            next.status = Pending;
            next.confirmations = 0;
            next.last_progress_at = Some(now);
            next.missing_since = None;
        }

        (Created, LifecycleEvent::Cancel) if record.tx_hash.is_none() => {
            next.status = Cancelled;
        }
        (Cancelled, LifecycleEvent::Cancel) => {}

        (
            Pending | Reverted,
            LifecycleEvent::Included {
                block,
                confirmations,
                from_address,
                gas,
                rejected,
            },
        ) => {
            let same_lineage = record.status == Pending && record.block_hash == Some(block.hash);
            if same_lineage && *confirmations < record.confirmations {
                return Err(LifecycleError::StaleObservation {
                    observed: *confirmations,
                    recorded: record.confirmations,
                });
            }
            if !same_lineage {
                next.block_number = Some(block.number);
                next.block_hash = Some(block.hash);
                next.block_timestamp = block.timestamp;
            } else if next.block_timestamp.is_none() {
                next.block_timestamp = block.timestamp;
            }
            if !same_lineage || *confirmations > record.confirmations {
                next.last_progress_at = Some(now);
            }
            next.confirmations = *confirmations;
            next.missing_since = None;
            if next.from_address.is_none() {
                next.from_address = *from_address;
            }
            if let Some(gas) = gas {
                if next.gas == GasDetails::default() {
                    next.gas = gas.clone();
                }
            }
            next.status = if record.status == Reverted {
                // Re-entry goes through pending; threshold and rejection are checked on the next step
                next.last_error = None;
                Pending
            } else if let Some(reason) = rejected {
                next.last_error = Some(reason.clone());
                Failed
            } else if *confirmations >= record.required_confirmations {
                Confirmed
            } else {
                Pending
            };
        }
        (
            Failed,
            LifecycleEvent::Included {
                rejected: Some(_), ..
            },
        ) => {}

        (Confirmed, LifecycleEvent::Included {
            block,
            confirmations,
            ..
        }) => {
            if record.block_hash != Some(block.hash) {
                revert(&mut next, "confirmed block was replaced by a chain reorganization");
            } else if *confirmations < record.confirmations {
                return Err(LifecycleError::StaleObservation {
                    observed: *confirmations,
                    recorded: record.confirmations,
                });
            } else {
                next.confirmations = *confirmations;
            }
        }

        (Pending, LifecycleEvent::InMempool) => {
            if record.block_hash.is_some() {
                revert(&mut next, ORPHANED_REASON);
            } else {
                next.missing_since = None;
            }
        }
        (Confirmed, LifecycleEvent::InMempool) => revert(&mut next, ORPHANED_REASON),
        (Reverted, LifecycleEvent::InMempool) => {}

        (Pending | Confirmed, LifecycleEvent::Orphaned) => revert(&mut next, ORPHANED_REASON),
        (Reverted, LifecycleEvent::Orphaned) => {}

        (Pending, LifecycleEvent::NotFound) => {
            if record.block_hash.is_some() {
                revert(&mut next, ORPHANED_REASON);
            } else if record.missing_since.is_none() {
                next.missing_since = Some(now);
            }
        }
        (Confirmed, LifecycleEvent::NotFound) => revert(&mut next, ORPHANED_REASON),
        (Reverted, LifecycleEvent::NotFound) => {}

        (Pending, LifecycleEvent::Fail { reason }) => {
            next.status = Failed;
            next.last_error = Some(reason.clone());
        }
        (Failed, LifecycleEvent::Fail { .. }) => {}

        (Created, LifecycleEvent::Expire) if record.tx_hash.is_none() => {
            next.status = Failed;
            next.last_error = Some(EXPIRED_REASON.to_string());
        }
        (Failed, LifecycleEvent::Expire) => {}

        _ => return Err(invalid()),
    }

    if next == *record {
        return Ok(Transition::Unchanged);
    }
    next.updated_at = now;
    Ok(Transition::Changed(next))
}

fn revert(record: &mut PaymentRecord, reason: &str) {
    record.status = PaymentStatus::Reverted;
    record.confirmations = 0;
    record.clear_block();
    record.last_error = Some(reason.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EthAmount, Network};
    use chrono::Duration;

    fn record() -> PaymentRecord {
        PaymentRecord::new(
            "order-42",
            "0x52908400098527886E0F7030069857D2E4169EE7".parse().unwrap(),
            EthAmount::parse("1.5").unwrap(),
            3,
            Network::Mainnet,
        )
    }

    fn apply(record: &PaymentRecord, event: LifecycleEvent) -> PaymentRecord {
        match transition(record, &event, Utc::now()).unwrap() {
            Transition::Changed(next) => next,
            Transition::Unchanged => record.clone(),
        }
    }

    fn attach(record: &PaymentRecord) -> PaymentRecord {
        apply(
            record,
            LifecycleEvent::Attach {
                tx_hash: H256::repeat_byte(0xaa),
                from_address: None,
            },
        )
    }

    fn included(hash_byte: u8, number: u64, confirmations: u64) -> LifecycleEvent {
        LifecycleEvent::Included {
            block: BlockRef {
                number,
                hash: H256::repeat_byte(hash_byte),
                timestamp: Some(Utc::now()),
            },
            confirmations,
            from_address: None,
            gas: None,
            rejected: None,
        }
    }

    fn rejected(hash_byte: u8, number: u64, confirmations: u64) -> LifecycleEvent {
        match included(hash_byte, number, confirmations) {
            LifecycleEvent::Included {
                block,
                confirmations,
                from_address,
                gas,
                ..
            } => LifecycleEvent::Included {
                block,
                confirmations,
                from_address,
                gas,
                rejected: Some("payment sent to 0x1111...1111".to_string()),
            },
            other => other,
        }
    }

    #[test]
    fn test_attach_moves_to_pending() {
        let pending = attach(&record());
        assert_eq!(pending.status, PaymentStatus::Pending);
        assert_eq!(pending.tx_hash, Some(H256::repeat_byte(0xaa)));
        assert!(pending.last_progress_at.is_some());
    }

    #[test]
    fn test_attach_twice_fails() {
        let pending = attach(&record());
        let err = transition(
            &pending,
            &LifecycleEvent::Attach {
                tx_hash: H256::repeat_byte(0xbb),
                from_address: None,
            },
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            LifecycleError::AlreadyAttached {
                tx_hash: H256::repeat_byte(0xaa)
            }
        );
    }

    #[test]
    fn test_cancel_only_before_hash() {
        let cancelled = apply(&record(), LifecycleEvent::Cancel);
        assert_eq!(cancelled.status, PaymentStatus::Cancelled);
        assert_eq!(
            transition(&cancelled, &LifecycleEvent::Cancel, Utc::now()).unwrap(),
            Transition::Unchanged
        );

        let pending = attach(&record());
        assert!(matches!(
            transition(&pending, &LifecycleEvent::Cancel, Utc::now()),
            Err(LifecycleError::InvalidTransition {
                from: PaymentStatus::Pending,
                ..
            })
        ));
    }

    #[test]
    fn test_confirmations_below_threshold_stay_pending() {
        let pending = apply(&attach(&record()), included(1, 98, 2));
        assert_eq!(pending.status, PaymentStatus::Pending);
        assert_eq!(pending.confirmations, 2);
        assert_eq!(pending.block_number, Some(98));
    }

    #[test]
    fn test_threshold_confirms() {
        let confirmed = apply(&attach(&record()), included(1, 98, 3));
        assert_eq!(confirmed.status, PaymentStatus::Confirmed);
        assert_eq!(confirmed.block_number, Some(98));
        assert!(confirmed.block_timestamp.is_some());
    }

    #[test]
    fn test_stale_count_on_same_block_is_rejected() {
        let pending = apply(&attach(&record()), included(1, 98, 2));
        assert_eq!(
            transition(&pending, &included(1, 98, 1), Utc::now()).unwrap_err(),
            LifecycleError::StaleObservation {
                observed: 1,
                recorded: 2
            }
        );
    }

    #[test]
    fn test_lower_count_on_new_block_is_accepted() {
        let pending = apply(&attach(&record()), included(1, 98, 2));
        let moved = apply(&pending, included(2, 99, 1));
        assert_eq!(moved.status, PaymentStatus::Pending);
        assert_eq!(moved.confirmations, 1);
        assert_eq!(moved.block_number, Some(99));
        assert_eq!(moved.block_hash, Some(H256::repeat_byte(2)));
    }

    #[test]
    fn test_same_observation_is_idempotent() {
        let confirmed = apply(&attach(&record()), included(1, 98, 3));
        let event = included(1, 98, 3);
        assert_eq!(
            transition(&confirmed, &event, Utc::now()).unwrap(),
            Transition::Unchanged
        );

        let pending = apply(&attach(&record()), included(1, 98, 2));
        assert_eq!(
            transition(&pending, &included(1, 98, 2), Utc::now()).unwrap(),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_orphaned_confirmed_reverts_and_clears_block() {
        let confirmed = apply(&attach(&record()), included(1, 98, 3));
        let reverted = apply(&confirmed, LifecycleEvent::Orphaned);
        assert_eq!(reverted.status, PaymentStatus::Reverted);
        assert_eq!(reverted.confirmations, 0);
        assert_eq!(reverted.block_number, None);
        assert_eq!(reverted.block_hash, None);
        assert_eq!(reverted.block_timestamp, None);
        assert!(reverted.last_error.is_some());
    }

    #[test]
    fn test_confirmed_block_replaced_reverts() {
        let confirmed = apply(&attach(&record()), included(1, 98, 3));
        let reverted = apply(&confirmed, included(2, 99, 5));
        assert_eq!(reverted.status, PaymentStatus::Reverted);
    }

    #[test]
    fn test_reverted_reappears_as_pending_then_confirms() {
        let confirmed = apply(&attach(&record()), included(1, 98, 3));
        let reverted = apply(&confirmed, LifecycleEvent::Orphaned);

        let pending = apply(&reverted, included(2, 99, 4));
        assert_eq!(pending.status, PaymentStatus::Pending);
        assert_eq!(pending.block_number, Some(99));

        let confirmed = apply(&pending, included(2, 99, 4));
        assert_eq!(confirmed.status, PaymentStatus::Confirmed);
        assert_eq!(confirmed.last_error, None);
    }

    #[test]
    fn test_reentry_clears_reorg_error() {
        let reverted = apply(&attach(&record()), LifecycleEvent::Orphaned);
        assert_eq!(reverted.last_error.as_deref(), Some(ORPHANED_REASON));

        let pending = apply(&reverted, included(1, 98, 1));
        assert_eq!(pending.status, PaymentStatus::Pending);
        assert_eq!(pending.last_error, None);
    }

    #[test]
    fn test_rejected_transfer_fails_pending() {
        let failed = apply(&attach(&record()), rejected(1, 98, 5));
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(
            failed.last_error.as_deref(),
            Some("payment sent to 0x1111...1111")
        );
        assert_eq!(
            transition(&failed, &rejected(1, 98, 5), Utc::now()).unwrap(),
            Transition::Unchanged
        );
        assert!(transition(&failed, &included(1, 98, 5), Utc::now()).is_err());
    }

    #[test]
    fn test_rejected_transfer_fails_after_reentry() {
        let reverted = apply(&attach(&record()), LifecycleEvent::Orphaned);

        let pending = apply(&reverted, rejected(1, 98, 3));
        assert_eq!(pending.status, PaymentStatus::Pending);

        let failed = apply(&pending, rejected(1, 98, 3));
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert!(failed.last_error.unwrap().starts_with("payment sent to"));
    }

    #[test]
    fn test_not_found_starts_grace_period_once() {
        let pending = attach(&record());
        let first = Utc::now();
        let missing = match transition(&pending, &LifecycleEvent::NotFound, first).unwrap() {
            Transition::Changed(next) => next,
            Transition::Unchanged => panic!("expected missing_since to be recorded"),
        };
        assert_eq!(missing.missing_since, Some(first));
        assert_eq!(
            transition(
                &missing,
                &LifecycleEvent::NotFound,
                first + Duration::seconds(30)
            )
            .unwrap(),
            Transition::Unchanged
        );

        let seen = apply(&missing, LifecycleEvent::InMempool);
        assert_eq!(seen.missing_since, None);
    }

    #[test]
    fn test_not_found_after_inclusion_reverts() {
        let pending = apply(&attach(&record()), included(1, 98, 1));
        let reverted = apply(&pending, LifecycleEvent::NotFound);
        assert_eq!(reverted.status, PaymentStatus::Reverted);
    }

    #[test]
    fn test_fail_and_expire() {
        let failed = apply(
            &attach(&record()),
            LifecycleEvent::Fail {
                reason: "dropped".into(),
            },
        );
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("dropped"));

        let expired = apply(&record(), LifecycleEvent::Expire);
        assert_eq!(expired.status, PaymentStatus::Failed);

        assert!(transition(&attach(&record()), &LifecycleEvent::Expire, Utc::now()).is_err());
    }

    #[test]
    fn test_terminal_states_reject_observations() {
        let cancelled = apply(&record(), LifecycleEvent::Cancel);
        assert!(transition(&cancelled, &included(1, 98, 3), Utc::now()).is_err());
        assert!(transition(&cancelled, &LifecycleEvent::Orphaned, Utc::now()).is_err());

        let failed = apply(&record(), LifecycleEvent::Expire);
        assert!(transition(&failed, &LifecycleEvent::Cancel, Utc::now()).is_err());
    }
}
