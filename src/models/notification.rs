use super::payment::{PaymentRecord, PaymentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fired once for every committed lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub payment_id: Uuid,
    pub order_ref: String,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    /// A payment previously considered settled was retracted by a reorg.
    pub reversal: bool,
    pub record: PaymentRecord,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn new(from: PaymentStatus, record: PaymentRecord) -> Self {
        Self {
            payment_id: record.id,
            order_ref: record.order_ref.clone(),
            from,
            to: record.status,
            reversal: from == PaymentStatus::Confirmed && record.status == PaymentStatus::Reverted,
            at: record.updated_at,
            record,
        }
    }
}
