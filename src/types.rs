//! Wire-level primitive types shared across the enclave.
//!
//! Everything that crosses the command boundary is a newtype with explicit
//! serde behavior: addresses render as lowercase hex, amounts survive JSON
//! without precision loss, and raw bytes are `0x`-prefixed hex strings.

use alloy_primitives::{Address, hex};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// A 20-byte Ethereum address.
///
/// Rendered as a lowercase `0x`-prefixed hex string at the API boundary and
/// parsed case-insensitively (checksum casing is accepted but not required).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvmAddress(pub Address);

impl EvmAddress {
    /// The raw 20 bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl From<Address> for EvmAddress {
    fn from(address: Address) -> Self {
        EvmAddress(address)
    }
}

impl From<EvmAddress> for Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_slice()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct AddressParseError(String);

impl FromStr for EvmAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_str(s)
            .map(EvmAddress)
            .map_err(|_| AddressParseError(s.to_string()))
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        EvmAddress::from_str(&s).map_err(DeError::custom)
    }
}

/// Token standard of a registered asset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    #[serde(rename = "ETH")]
    Eth,
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "ERC721")]
    Erc721,
    #[serde(rename = "ERC1155")]
    Erc1155,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenType::Eth => "ETH",
            TokenType::Erc20 => "ERC20",
            TokenType::Erc721 => "ERC721",
            TokenType::Erc1155 => "ERC1155",
        };
        write!(f, "{}", s)
    }
}

/// An asset amount in atomic units.
///
/// Serialized as a JSON unsigned integer; deserialization additionally
/// accepts a decimal string for callers that quote large values to stay
/// inside double precision.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenAmount(pub u128);

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        TokenAmount(value)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u128(self.0)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AmountVisitor;

        impl serde::de::Visitor<'_> for AmountVisitor {
            type Value = TokenAmount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an unsigned integer or decimal string")
            }

            fn visit_u64<E: DeError>(self, value: u64) -> Result<Self::Value, E> {
                Ok(TokenAmount(value as u128))
            }

            fn visit_u128<E: DeError>(self, value: u128) -> Result<Self::Value, E> {
                Ok(TokenAmount(value))
            }

            fn visit_str<E: DeError>(self, value: &str) -> Result<Self::Value, E> {
                value
                    .parse::<u128>()
                    .map(TokenAmount)
                    .map_err(|_| E::custom("amount must be a non-negative integer"))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

/// Seconds since the Unix epoch, stamping provenance records and outbox
/// entries.
///
/// Provenance ordering is carried by `seq`, not by this value; `Ord` exists
/// so records can still be compared by wall clock in queries and tests.
/// Serialized as a plain unsigned integer. A ledger commit has already
/// passed its preconditions by the time it is stamped, so an unreadable or
/// pre-epoch clock degrades to zero rather than failing the mutation.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    /// The current wall clock, or the epoch if it cannot be read.
    pub fn now_or_epoch() -> Self {
        let seconds = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        UnixTimestamp(seconds)
    }
}

impl fmt::Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw bytes rendered as a lowercase `0x`-prefixed hex string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

impl HexBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        HexBytes(bytes)
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x"))
            .map(HexBytes)
            .map_err(|_| DeError::custom("invalid hex string"))
    }
}
