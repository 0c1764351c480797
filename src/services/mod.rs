pub mod analytics;
pub mod ethereum;
pub mod lifecycle;
pub mod notifier;
pub mod reconciliation;
pub mod store;
pub mod transitions;
pub mod watcher;

pub use analytics::Analytics;
pub use ethereum::{ChainClient, EthereumChainClient, TxObservation, TxStatus};
pub use notifier::{StatusNotifier, WebhookNotifier};
pub use reconciliation::{PaymentIntentRequest, PaymentPolicy, ReconciliationService};
pub use store::{InMemoryPaymentStore, PaymentStore, PaymentStoreRef};
pub use transitions::{Applied, TransitionApplier};
pub use watcher::{ConfirmationWatcher, TickReport, WatcherConfig};
