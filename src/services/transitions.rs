use crate::error::PaymentError;
use crate::models::{PaymentRecord, StatusChange};
use crate::services::analytics::Analytics;
use crate::services::lifecycle::{transition, LifecycleError, LifecycleEvent};
use crate::services::notifier::StatusNotifier;
use crate::services::store::{CasOutcome, PaymentStoreRef};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Upper bound of chained commits for a single observation, e.g.
/// `confirmed -> reverted -> pending -> confirmed` after a block moved.
const MAX_CHAINED_STEPS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// At least one transition committed; carries the final record.
    Committed(PaymentRecord),
    /// The record already reflected the event.
    Unchanged(PaymentRecord),
    /// The event was based on stale chain state and was dropped.
    Discarded(LifecycleError),
}

impl Applied {
    pub fn record(&self) -> Option<&PaymentRecord> {
        match self {
            Applied::Committed(record) | Applied::Unchanged(record) => Some(record),
            Applied::Discarded(_) => None,
        }
    }
}

/// Applies lifecycle events through the store's compare-and-swap and
/// publishes every committed status change.
pub struct TransitionApplier {
    store: PaymentStoreRef,
    notifier: StatusNotifier,
    analytics: Arc<Analytics>,
    max_attempts: usize,
}

impl TransitionApplier {
    pub fn new(
        store: PaymentStoreRef,
        notifier: StatusNotifier,
        analytics: Arc<Analytics>,
        max_attempts: usize,
    ) -> Self {
        Self {
            store,
            notifier,
            analytics,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &PaymentStoreRef {
        &self.store
    }

    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    pub fn analytics(&self) -> &Arc<Analytics> {
        &self.analytics
    }

    pub async fn apply(&self, id: Uuid, event: LifecycleEvent) -> Result<Applied, PaymentError> {
        let mut conflicts = 0;
        let mut steps = 0;
        let mut last_committed: Option<PaymentRecord> = None;

        loop {
            let current = self
                .store
                .get(id)
                .await?
                .ok_or(PaymentError::NotFound(id))?;
            let expected = current.status;

            let observed = event.clone();
            let now = Utc::now();
            let outcome = self
                .store
                .compare_and_update_status(
                    id,
                    expected,
                    Box::new(move |record| transition(record, &observed, now)),
                )
                .await;

            match outcome {
                Ok(CasOutcome::Committed(record)) => {
                    if record.status != expected {
                        self.publish(StatusChange::new(expected, record.clone()));
                    } else {
                        tracing::debug!(
                            payment_id = %id,
                            status = %record.status,
                            confirmations = record.confirmations,
                            "Payment updated"
                        );
                    }
                    last_committed = Some(record);
                    steps += 1;
                    if !event.is_observation() || steps >= MAX_CHAINED_STEPS {
                        break;
                    }
                }
                Ok(CasOutcome::Unchanged(record)) => {
                    return Ok(match last_committed {
                        Some(committed) => Applied::Committed(committed),
                        None => Applied::Unchanged(record),
                    });
                }
                Ok(CasOutcome::Conflict { actual }) => {
                    conflicts += 1;
                    tracing::debug!(
                        payment_id = %id,
                        expected = %expected,
                        actual = %actual,
                        attempt = conflicts,
                        "Concurrent update, re-evaluating"
                    );
                    if conflicts >= self.max_attempts {
                        return Err(PaymentError::ConcurrentUpdate(id));
                    }
                }
                Err(PaymentError::Lifecycle(stale @ LifecycleError::StaleObservation { .. })) => {
                    tracing::debug!(payment_id = %id, "Discarding stale observation: {}", stale);
                    return Ok(match last_committed {
                        Some(committed) => Applied::Committed(committed),
                        None => Applied::Discarded(stale),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        match last_committed {
            Some(committed) => Ok(Applied::Committed(committed)),
            None => Err(PaymentError::Internal(format!(
                "no transition recorded for payment {}",
                id
            ))),
        }
    }

    fn publish(&self, change: StatusChange) {
        tracing::info!(
            payment_id = %change.payment_id,
            order_ref = %change.order_ref,
            from = %change.from,
            to = %change.to,
            confirmations = change.record.confirmations,
            "Payment status changed"
        );
        self.analytics.record_transition(&change);
        self.notifier.notify(change);
    }
}
