//! Wallet address used as the key of a nonce record.

use alloy_primitives::Address;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Address of an admin wallet, normalized for use as a store key.
///
/// EVM addresses (`0x` followed by 40 hex digits) are lower-cased, so a
/// checksummed and a lower-case spelling of the same account share one record.
/// Anything else is kept verbatim, which leaves room for non-EVM account formats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletAddress(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Wallet address must not be empty")]
    Empty,
}

impl WalletAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_evm_hex(s: &str) -> bool {
        s.len() == 42
            && (s.starts_with("0x") || s.starts_with("0X"))
            && s[2..].chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl FromStr for WalletAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        if Self::is_evm_hex(s) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Ok(Self(s.to_string()))
        }
    }
}

impl From<Address> for WalletAddress {
    fn from(address: Address) -> Self {
        // Display is EIP-55 checksummed.
        Self(address.to_string().to_ascii_lowercase())
    }
}

impl TryFrom<&WalletAddress> for Address {
    type Error = alloy_primitives::hex::FromHexError;

    fn try_from(value: &WalletAddress) -> Result<Self, Self::Error> {
        Address::from_str(value.as_str())
    }
}

impl Display for WalletAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for WalletAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for WalletAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn evm_addresses_are_lowercased() {
        let checksummed: WalletAddress = "0x52908400098527886E0F7030069857D2E4169EE7"
            .parse()
            .unwrap();
        let lower: WalletAddress = "0x52908400098527886e0f7030069857d2e4169ee7"
            .parse()
            .unwrap();
        assert_eq!(checksummed, lower);
        assert_eq!(
            lower.as_str(),
            "0x52908400098527886e0f7030069857d2e4169ee7"
        );
    }

    #[test]
    fn non_evm_addresses_are_kept_verbatim() {
        let solana: WalletAddress = "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp".parse().unwrap();
        assert_eq!(solana.as_str(), "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp");
    }

    #[test]
    fn empty_address_is_rejected() {
        assert_eq!("  ".parse::<WalletAddress>(), Err(AddressError::Empty));
    }

    #[test]
    fn from_alloy_address_matches_parsed_form() {
        let raw = address!("0x52908400098527886E0F7030069857D2E4169EE7");
        let parsed: WalletAddress = "0x52908400098527886E0F7030069857D2E4169EE7"
            .parse()
            .unwrap();
        assert_eq!(WalletAddress::from(raw), parsed);
        assert_eq!(Address::try_from(&parsed).unwrap(), raw);
    }
}
