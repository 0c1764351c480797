use crate::models::{PaymentStatus, StatusChange, Stats};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-lifetime counters of intents and committed transitions.
pub struct Analytics {
    intents_created: AtomicU64,
    pending: AtomicU64,
    confirmed: AtomicU64,
    reverted: AtomicU64,
    reversals: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    start_time: Instant,
}

impl Default for Analytics {
    fn default() -> Self {
        Self::new()
    }
}

impl Analytics {
    pub fn new() -> Self {
        Self {
            intents_created: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            confirmed: AtomicU64::new(0),
            reverted: AtomicU64::new(0),
            reversals: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_intent(&self) {
        self.intents_created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_transition(&self, change: &StatusChange) {
        let counter = match change.to {
            PaymentStatus::Created => return,
            PaymentStatus::Pending => &self.pending,
            PaymentStatus::Confirmed => &self.confirmed,
            PaymentStatus::Reverted => &self.reverted,
            PaymentStatus::Failed => &self.failed,
            PaymentStatus::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if change.reversal {
            self.reversals.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn get_stats(&self) -> Stats {
        Stats {
            intents_created: self.intents_created.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
            confirmed: self.confirmed.load(Ordering::SeqCst),
            reverted: self.reverted.load(Ordering::SeqCst),
            reversals: self.reversals.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            uptime_seconds: self.uptime_seconds(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
