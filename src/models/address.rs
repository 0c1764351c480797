use crate::error::PaymentError;
use ethers::types::Address;
use std::str::FromStr;

const ADDRESS_HEX_LEN: usize = 40;

/// Validates the textual form of a 20-byte account address.
pub struct AddressValidator;

impl AddressValidator {
    /// Returns true only for `0x` followed by exactly 40 hex digits, in any case.
    ///
    /// Never panics; empty, missing or malformed input is simply rejected.
    pub fn validate(address: &str) -> bool {
        match address.strip_prefix("0x") {
            Some(body) => body.len() == ADDRESS_HEX_LEN && hex::decode(body).is_ok(),
            None => false,
        }
    }

    /// Same as [`AddressValidator::validate`] for values that may be absent.
    pub fn validate_opt(address: Option<&str>) -> bool {
        address.map(Self::validate).unwrap_or(false)
    }

    /// Validates and converts into a typed address.
    pub fn parse(address: &str) -> Result<Address, PaymentError> {
        if !Self::validate(address) {
            return Err(PaymentError::InvalidAddress(address.to_string()));
        }
        Address::from_str(address).map_err(|_| PaymentError::InvalidAddress(address.to_string()))
    }
}

/// Shortens an address for log lines, e.g. `0x1234...abcd`.
pub fn format_address(address: &Address) -> String {
    let full = format!("{:?}", address);
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}
