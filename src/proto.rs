//! The command/response wire protocol spoken over the transport boundary.
//!
//! Each request frame is one JSON object whose outer key names the command;
//! each response frame is a `{"success": …}` envelope. The command set is
//! exhaustive: frames with an unrecognized tag fail decoding and are
//! answered with an error envelope rather than silently dropped.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::ledger::views::AssetView;
use crate::ledger::{OutboxEntry, ProvenanceRecord};
use crate::types::{EvmAddress, HexBytes, TokenAmount, TokenType};

/// Every command the enclave accepts, tagged by the outer JSON key.
///
/// Wallet-scoped commands carry a `wallet_address`; the `Keygen`, `Sign`,
/// and `List` commands address the key manager directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Keygen {},
    Sign {
        address: EvmAddress,
        message: String,
    },
    List {},
    CreateWallet {
        name: String,
        owner: String,
    },
    ListWallets {},
    WalletState {
        wallet_address: EvmAddress,
    },
    AddAsset {
        wallet_address: EvmAddress,
        asset_id: String,
        token_type: TokenType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contract_address: Option<EvmAddress>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_id: Option<String>,
        symbol: String,
        name: String,
        decimals: u8,
    },
    ListAssets {
        wallet_address: EvmAddress,
    },
    AddSubaccount {
        wallet_address: EvmAddress,
        subaccount_id: String,
        label: String,
        address: EvmAddress,
    },
    InboxDeposit {
        wallet_address: EvmAddress,
        asset_id: String,
        amount: TokenAmount,
        deposit_id: String,
        transaction_hash: String,
        block_number: String,
        from_address: EvmAddress,
        to_address: EvmAddress,
    },
    Claim {
        wallet_address: EvmAddress,
        deposit_id: String,
        subaccount_id: String,
    },
    Transfer {
        wallet_address: EvmAddress,
        asset_id: String,
        amount: TokenAmount,
        from_subaccount: String,
        to_subaccount: String,
    },
    Withdraw {
        wallet_address: EvmAddress,
        asset_id: String,
        amount: TokenAmount,
        subaccount_id: String,
        destination: EvmAddress,
        chain_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gas_price: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gas_limit: Option<u64>,
    },
    ListOutbox {
        wallet_address: EvmAddress,
    },
    RemoveOutbox {
        wallet_address: EvmAddress,
        outbox_id: u64,
    },
    Balance {
        wallet_address: EvmAddress,
        subaccount_id: String,
        asset_id: String,
    },
    SubaccountBalances {
        wallet_address: EvmAddress,
        subaccount_id: String,
    },
    SignGsm {
        wallet_address: EvmAddress,
        domain: String,
        message: String,
    },
    Provenance {
        wallet_address: EvmAddress,
    },
    ProvenanceByAsset {
        wallet_address: EvmAddress,
        asset_id: String,
    },
    ProvenanceBySubaccount {
        wallet_address: EvmAddress,
        subaccount_id: String,
    },
}

/// The response envelope: `{"success": true, "data": …}` or
/// `{"success": false, "error": …}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(serde_json::Value),
    Failure(String),
}

impl Response {
    pub fn success(data: serde_json::Value) -> Self {
        Response::Success(data)
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Response::Failure(error.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }
}

#[derive(Serialize, Deserialize)]
struct ResponseWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Response::Success(data) => ResponseWire {
                success: true,
                data: Some(data.clone()),
                error: None,
            },
            Response::Failure(error) => ResponseWire {
                success: false,
                data: None,
                error: Some(error.clone()),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = ResponseWire::deserialize(deserializer)?;
        match wire.success {
            true => Ok(Response::Success(wire.data.unwrap_or(serde_json::Value::Null))),
            false => {
                let error = wire
                    .error
                    .ok_or_else(|| serde::de::Error::missing_field("error"))?;
                Ok(Response::Failure(error))
            }
        }
    }
}

// Success payloads, one struct per command where a bare value would be
// ambiguous on the wire.

#[derive(Debug, Serialize, Deserialize)]
pub struct AddressPayload {
    pub address: EvmAddress,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub signature: HexBytes,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddressListPayload {
    pub addresses: Vec<EvmAddress>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletCreatedPayload {
    pub wallet_address: EvmAddress,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletListPayload {
    pub wallets: Vec<EvmAddress>,
}

#[derive(Debug, Serialize)]
pub struct AssetsPayload {
    pub assets: BTreeMap<String, AssetView>,
}

#[derive(Debug, Serialize)]
pub struct OutboxPayload {
    pub outbox: Vec<OutboxEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalancePayload {
    pub balance: TokenAmount,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubaccountBalancesPayload {
    pub balances: BTreeMap<String, TokenAmount>,
}

#[derive(Debug, Serialize)]
pub struct ProvenancePayload {
    pub provenance: Vec<ProvenanceRecord>,
}

#[derive(Debug, Serialize)]
pub struct WithdrawPayload {
    pub withdrawal: OutboxEntry,
}

/// Marker payload for commands whose success carries no data.
#[derive(Debug, Serialize, Deserialize)]
pub struct AckPayload {
    pub ok: bool,
}

impl AckPayload {
    pub fn ok() -> Self {
        AckPayload { ok: true }
    }
}
