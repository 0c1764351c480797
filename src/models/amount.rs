use crate::error::PaymentError;
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Decimal places of the native asset (wei per ether = 10^18).
pub const ETH_DECIMALS: u32 = 18;

/// An exact, strictly positive ETH amount. Serialized as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EthAmount(Decimal);

impl EthAmount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value <= Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(format!(
                "{} must be greater than zero",
                value
            )));
        }
        if value.scale() > ETH_DECIMALS {
            return Err(PaymentError::InvalidAmount(format!(
                "{} has more than {} decimal places",
                value, ETH_DECIMALS
            )));
        }
        Ok(Self(value))
    }

    pub fn parse(input: &str) -> Result<Self, PaymentError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(PaymentError::InvalidAmount("amount is empty".to_string()));
        }
        let value = Decimal::from_str_exact(trimmed)
            .map_err(|e| PaymentError::InvalidAmount(format!("{}: {}", input, e)))?;
        Self::new(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Exact conversion to wei.
    pub fn to_wei(&self) -> U256 {
        // `new` guarantees a positive mantissa and scale <= 18
        let mantissa = U256::from(self.0.mantissa().unsigned_abs());
        mantissa * U256::exp10((ETH_DECIMALS - self.0.scale()) as usize)
    }
}

impl fmt::Display for EthAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EthAmount {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EthAmount {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EthAmount> for String {
    fn from(amount: EthAmount) -> Self {
        amount.to_string()
    }
}

/// Renders a wei quantity as an ETH decimal string without trailing zeros.
pub fn format_wei(wei: U256) -> String {
    let divisor = U256::exp10(ETH_DECIMALS as usize);
    let whole = wei / divisor;
    let fraction = wei % divisor;
    if fraction.is_zero() {
        return whole.to_string();
    }
    let fraction = format!("{:0>18}", fraction.to_string());
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}

/// Renders a wei quantity in gwei with up to 9 decimals.
pub fn format_gwei(wei: U256) -> String {
    let divisor = U256::exp10(9);
    let whole = wei / divisor;
    let fraction = wei % divisor;
    if fraction.is_zero() {
        return whole.to_string();
    }
    let fraction = format!("{:0>9}", fraction.to_string());
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}
