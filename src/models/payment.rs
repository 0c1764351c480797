use super::amount::EthAmount;
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Created,
    Pending,
    Confirmed,
    Reverted,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    /// `reverted` is deliberately absent: a reverted payment may come back.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Confirmed | PaymentStatus::Failed | PaymentStatus::Cancelled
        )
    }

    /// Statuses for which `confirmations` carries meaning.
    pub fn tracks_confirmations(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Reverted => "reverted",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Eth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Sepolia,
    Goerli,
    Ropsten,
    Rinkeby,
    Kovan,
    Other,
}

impl Network {
    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Network::Mainnet => Some(1),
            Network::Ropsten => Some(3),
            Network::Rinkeby => Some(4),
            Network::Goerli => Some(5),
            Network::Kovan => Some(42),
            Network::Sepolia => Some(11_155_111),
            Network::Other => None,
        }
    }

    pub fn from_chain_id(chain_id: u64) -> Self {
        match chain_id {
            1 => Network::Mainnet,
            3 => Network::Ropsten,
            4 => Network::Rinkeby,
            5 => Network::Goerli,
            42 => Network::Kovan,
            11_155_111 => Network::Sepolia,
            _ => Network::Other,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Network::Mainnet => "Ethereum Mainnet",
            Network::Sepolia => "Sepolia Testnet",
            Network::Goerli => "Goerli Testnet",
            Network::Ropsten => "Ropsten Testnet",
            Network::Rinkeby => "Rinkeby Testnet",
            Network::Kovan => "Kovan Testnet",
            Network::Other => "Other network",
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "sepolia" => Ok(Network::Sepolia),
            "goerli" => Ok(Network::Goerli),
            "ropsten" => Ok(Network::Ropsten),
            "rinkeby" => Ok(Network::Rinkeby),
            "kovan" => Ok(Network::Kovan),
            "other" => Ok(Network::Other),
            _ => Err(format!("unknown network: {}", s)),
        }
    }
}

/// Wallet the payer used to broadcast the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WalletProvider {
    #[default]
    Metamask,
    Walletconnect,
    Other,
}

/// Gas figures taken from the receipt, as exact decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GasDetails {
    pub gas_used: Option<String>,
    pub gas_price_gwei: Option<String>,
    pub gas_fee_eth: Option<String>,
}

/// One intended or in-flight transfer to the merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_ref: String,
    pub payer_ref: Option<String>,

    pub amount_eth: EthAmount,
    /// Informational only, never used for settlement.
    pub amount_usd_snapshot: Option<Decimal>,
    pub usd_rate_at_creation: Option<Decimal>,

    pub currency: Currency,
    pub network: Network,
    pub provider: WalletProvider,

    pub to_address: Address,
    pub from_address: Option<Address>,
    pub tx_hash: Option<H256>,

    pub status: PaymentStatus,
    pub confirmations: u64,
    pub required_confirmations: u64,

    pub block_number: Option<u64>,
    pub block_hash: Option<H256>,
    pub block_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gas: GasDetails,

    pub last_error: Option<String>,
    pub metadata: Option<serde_json::Value>,

    pub last_progress_at: Option<DateTime<Utc>>,
    pub missing_since: Option<DateTime<Utc>>,
    pub revision: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn new(
        order_ref: impl Into<String>,
        to_address: Address,
        amount_eth: EthAmount,
        required_confirmations: u64,
        network: Network,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_ref: order_ref.into(),
            payer_ref: None,
            amount_eth,
            amount_usd_snapshot: None,
            usd_rate_at_creation: None,
            currency: Currency::Eth,
            network,
            provider: WalletProvider::default(),
            to_address,
            from_address: None,
            tx_hash: None,
            status: PaymentStatus::Created,
            confirmations: 0,
            required_confirmations,
            block_number: None,
            block_hash: None,
            block_timestamp: None,
            gas: GasDetails::default(),
            last_error: None,
            metadata: None,
            last_progress_at: None,
            missing_since: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks the invariants a record must satisfy before it is persisted.
    pub fn validate(&self) -> Result<(), PaymentError> {
        if self.order_ref.trim().is_empty() {
            return Err(PaymentError::MissingOrderRef);
        }
        if self.required_confirmations == 0 {
            return Err(PaymentError::InvalidConfirmations(0));
        }
        Ok(())
    }

    pub fn is_settled(&self) -> bool {
        self.status == PaymentStatus::Confirmed
    }

    pub fn clear_block(&mut self) {
        self.block_number = None;
        self.block_hash = None;
        self.block_timestamp = None;
    }
}

/// Read-only view returned to order-processing code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatusSnapshot {
    pub id: Uuid,
    pub order_ref: String,
    pub status: PaymentStatus,
    pub settled: bool,
    pub amount_eth: EthAmount,
    pub to_address: Address,
    pub tx_hash: Option<H256>,
    pub confirmations: u64,
    pub required_confirmations: u64,
    pub block_number: Option<u64>,
    pub block_timestamp: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&PaymentRecord> for PaymentStatusSnapshot {
    fn from(record: &PaymentRecord) -> Self {
        Self {
            id: record.id,
            order_ref: record.order_ref.clone(),
            status: record.status,
            settled: record.is_settled(),
            amount_eth: record.amount_eth,
            to_address: record.to_address,
            tx_hash: record.tx_hash,
            confirmations: if record.status.tracks_confirmations() {
                record.confirmations
            } else {
                0
            },
            required_confirmations: record.required_confirmations,
            block_number: record.block_number,
            block_timestamp: record.block_timestamp,
            last_error: record.last_error.clone(),
            updated_at: record.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> Address {
        "0x52908400098527886E0F7030069857D2E4169EE7".parse().unwrap()
    }

    #[test]
    fn test_new_record_starts_created() {
        let record = PaymentRecord::new(
            "order-1",
            recipient(),
            EthAmount::parse("1.5").unwrap(),
            3,
            Network::Mainnet,
        );
        assert_eq!(record.status, PaymentStatus::Created);
        assert_eq!(record.currency, Currency::Eth);
        assert_eq!(record.confirmations, 0);
        assert!(record.tx_hash.is_none());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_order_ref() {
        let record = PaymentRecord::new(
            "  ",
            recipient(),
            EthAmount::parse("1").unwrap(),
            3,
            Network::Mainnet,
        );
        assert!(matches!(record.validate(), Err(PaymentError::MissingOrderRef)));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&PaymentStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert!(!PaymentStatus::Reverted.is_terminal());
        assert!(PaymentStatus::Confirmed.is_terminal());
    }

    #[test]
    fn test_network_chain_ids() {
        assert_eq!(Network::from_chain_id(11_155_111), Network::Sepolia);
        assert_eq!(Network::from_chain_id(137), Network::Other);
        assert_eq!(Network::Mainnet.chain_id(), Some(1));
        assert_eq!("Goerli".parse::<Network>().unwrap(), Network::Goerli);
    }
}
