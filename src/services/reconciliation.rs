use crate::error::PaymentError;
use crate::models::{
    AddressValidator, EthAmount, Network, PaymentRecord, PaymentStatusSnapshot, StatusChange,
    WalletProvider,
};
use crate::services::lifecycle::LifecycleEvent;
use crate::services::transitions::{Applied, TransitionApplier};
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Business policy handed to the service at construction.
#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    /// Validated recipient; `None` disables new payment intents.
    pub recipient: Option<Address>,
    pub network: Network,
    pub default_required_confirmations: u64,
}

impl PaymentPolicy {
    /// Builds a policy from the raw configured recipient, which is validated
    /// here so a malformed value disables intents instead of being used.
    pub fn from_configured(
        recipient: Option<&str>,
        network: Network,
        default_required_confirmations: u64,
    ) -> Self {
        let recipient = match recipient {
            Some(raw) => match AddressValidator::parse(raw) {
                Ok(address) => Some(address),
                Err(_) => {
                    tracing::error!("Configured recipient wallet is not a valid ETH address, payment intents disabled");
                    None
                }
            },
            None => {
                tracing::warn!("No recipient wallet configured, payment intents disabled");
                None
            }
        };
        Self {
            recipient,
            network,
            default_required_confirmations,
        }
    }
}

/// Input of [`ReconciliationService::create_payment_intent`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentIntentRequest {
    pub order_ref: String,
    /// Defaults to the configured recipient.
    pub to_address: Option<String>,
    pub amount_eth: String,
    /// Defaults to the policy value.
    pub required_confirmations: Option<u64>,
    pub payer_ref: Option<String>,
    pub amount_usd: Option<Decimal>,
    pub usd_rate: Option<Decimal>,
    pub provider: Option<WalletProvider>,
    pub metadata: Option<serde_json::Value>,
}

impl PaymentIntentRequest {
    pub fn new(
        order_ref: impl Into<String>,
        to_address: Option<&str>,
        amount_eth: impl Into<String>,
        required_confirmations: Option<u64>,
    ) -> Self {
        Self {
            order_ref: order_ref.into(),
            to_address: to_address.map(str::to_string),
            amount_eth: amount_eth.into(),
            required_confirmations,
            ..Default::default()
        }
    }
}

/// Public contract used by order processing and admin views.
pub struct ReconciliationService {
    applier: Arc<TransitionApplier>,
    policy: PaymentPolicy,
}

impl ReconciliationService {
    pub fn new(applier: Arc<TransitionApplier>, policy: PaymentPolicy) -> Self {
        Self { applier, policy }
    }

    pub fn recipient(&self) -> Option<Address> {
        self.policy.recipient
    }

    pub fn network(&self) -> Network {
        self.policy.network
    }

    pub fn accepts_intents(&self) -> bool {
        self.policy.recipient.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.applier.notifier().subscribe()
    }

    pub async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> Result<PaymentRecord, PaymentError> {
        let Some(recipient) = self.policy.recipient else {
            return Err(PaymentError::RecipientNotConfigured);
        };

        if request.order_ref.trim().is_empty() {
            return Err(PaymentError::MissingOrderRef);
        }
        let to_address = match request.to_address.as_deref() {
            Some(raw) => AddressValidator::parse(raw)?,
            None => recipient,
        };
        let amount = EthAmount::parse(&request.amount_eth)?;
        let required_confirmations = request
            .required_confirmations
            .unwrap_or(self.policy.default_required_confirmations);
        if required_confirmations == 0 {
            return Err(PaymentError::InvalidConfirmations(required_confirmations));
        }

        let mut record = PaymentRecord::new(
            request.order_ref.trim(),
            to_address,
            amount,
            required_confirmations,
            self.policy.network,
        );
        record.payer_ref = request.payer_ref;
        record.amount_usd_snapshot = request.amount_usd;
        record.usd_rate_at_creation = request.usd_rate;
        record.provider = request.provider.unwrap_or_default();
        record.metadata = request.metadata;

        self.applier.store().create(record.clone()).await?;
        self.applier.analytics().record_intent();

        tracing::info!(
            payment_id = %record.id,
            order_ref = %record.order_ref,
            amount_eth = %record.amount_eth,
            required_confirmations,
            "Payment intent created"
        );

        Ok(record)
    }

    /// Attaches the buyer's transaction, moving the payment to `pending`.
    pub async fn attach_transaction(
        &self,
        id: Uuid,
        tx_hash: &str,
        from_address: Option<&str>,
    ) -> Result<PaymentRecord, PaymentError> {
        let tx_hash = parse_tx_hash(tx_hash)?;
        let from_address = from_address.map(AddressValidator::parse).transpose()?;

        if let Some(owner) = self.applier.store().find_by_tx_hash(tx_hash).await? {
            if owner.id != id {
                return Err(PaymentError::DuplicateTxHash {
                    tx_hash: format!("{:?}", tx_hash),
                    owner: owner.id,
                });
            }
        }

        let applied = self
            .applier
            .apply(
                id,
                LifecycleEvent::Attach {
                    tx_hash,
                    from_address,
                },
            )
            .await?;
        self.expect_record(id, applied)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<PaymentStatusSnapshot, PaymentError> {
        let record = self.get_payment(id).await?;
        Ok(PaymentStatusSnapshot::from(&record))
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<PaymentRecord, PaymentError> {
        self.applier
            .store()
            .get(id)
            .await?
            .ok_or(PaymentError::NotFound(id))
    }

    pub async fn payments_for_order(
        &self,
        order_ref: &str,
    ) -> Result<Vec<PaymentStatusSnapshot>, PaymentError> {
        let records = self.applier.store().find_by_order(order_ref).await?;
        Ok(records.iter().map(PaymentStatusSnapshot::from).collect())
    }

    /// Cancels an intent that has no transaction attached yet.
    pub async fn cancel(&self, id: Uuid) -> Result<PaymentRecord, PaymentError> {
        let applied = self.applier.apply(id, LifecycleEvent::Cancel).await?;
        self.expect_record(id, applied)
    }

    fn expect_record(&self, id: Uuid, applied: Applied) -> Result<PaymentRecord, PaymentError> {
        match applied {
            Applied::Committed(record) | Applied::Unchanged(record) => Ok(record),
            Applied::Discarded(e) => Err(PaymentError::Internal(format!(
                "command on payment {} was discarded: {}",
                id, e
            ))),
        }
    }
}

fn parse_tx_hash(input: &str) -> Result<H256, PaymentError> {
    let invalid = || PaymentError::InvalidTxHash(input.to_string());
    let body = input.strip_prefix("0x").ok_or_else(invalid)?;
    if body.len() != 64 {
        return Err(invalid());
    }
    H256::from_str(body).map_err(|_| invalid())
}
