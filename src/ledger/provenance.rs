//! The append-only operation log that backs every balance.
//!
//! Provenance records are written under the same lock that mutates
//! balances, so replaying the log against an empty balance map always
//! reproduces the live state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{EvmAddress, HexBytes, TokenAmount, UnixTimestamp};

/// One state-mutating operation, stamped with a per-wallet sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub seq: u64,
    pub timestamp: UnixTimestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<String>,
    pub operation: Operation,
}

/// The balance-mutating operations a wallet supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Claim {
        deposit_id: String,
        subaccount_id: String,
        asset_id: String,
        amount: TokenAmount,
    },
    Transfer {
        from_subaccount: String,
        to_subaccount: String,
        asset_id: String,
        amount: TokenAmount,
    },
    Withdraw {
        subaccount_id: String,
        asset_id: String,
        amount: TokenAmount,
        destination: EvmAddress,
        nonce: u64,
        gas_price: u64,
        gas_limit: u64,
        chain_id: u64,
        signed_raw_transaction: HexBytes,
    },
}

impl Operation {
    pub fn asset_id(&self) -> &str {
        match self {
            Operation::Claim { asset_id, .. }
            | Operation::Transfer { asset_id, .. }
            | Operation::Withdraw { asset_id, .. } => asset_id,
        }
    }

    /// Whether the operation references the sub-account as source,
    /// destination, claim target, or withdraw source.
    pub fn references_subaccount(&self, subaccount_id: &str) -> bool {
        match self {
            Operation::Claim {
                subaccount_id: target,
                ..
            } => target == subaccount_id,
            Operation::Transfer {
                from_subaccount,
                to_subaccount,
                ..
            } => from_subaccount == subaccount_id || to_subaccount == subaccount_id,
            Operation::Withdraw {
                subaccount_id: source,
                ..
            } => source == subaccount_id,
        }
    }
}

/// Selects which provenance records a query returns.
#[derive(Debug, Clone)]
pub enum ProvenanceFilter {
    All,
    ByAsset(String),
    BySubaccount(String),
}

impl ProvenanceRecord {
    pub fn matches(&self, filter: &ProvenanceFilter) -> bool {
        match filter {
            ProvenanceFilter::All => true,
            ProvenanceFilter::ByAsset(asset_id) => self.operation.asset_id() == asset_id,
            ProvenanceFilter::BySubaccount(subaccount_id) => {
                self.operation.references_subaccount(subaccount_id)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("balance underflow replaying seq {0}")]
    Underflow(u64),
    #[error("balance overflow replaying seq {0}")]
    Overflow(u64),
}

/// Replays records in order against an empty balance map.
///
/// A log written by a live wallet replays without error and yields exactly
/// the wallet's balance map (zero entries pruned).
pub fn replay_balances(
    records: &[ProvenanceRecord],
) -> Result<BTreeMap<(String, String), u128>, ReplayError> {
    let mut balances: BTreeMap<(String, String), u128> = BTreeMap::new();

    fn credit(
        balances: &mut BTreeMap<(String, String), u128>,
        subaccount_id: &str,
        asset_id: &str,
        amount: u128,
        seq: u64,
    ) -> Result<(), ReplayError> {
        let key = (subaccount_id.to_string(), asset_id.to_string());
        let current = balances.get(&key).copied().unwrap_or(0);
        let next = current
            .checked_add(amount)
            .ok_or(ReplayError::Overflow(seq))?;
        balances.insert(key, next);
        Ok(())
    }

    fn debit(
        balances: &mut BTreeMap<(String, String), u128>,
        subaccount_id: &str,
        asset_id: &str,
        amount: u128,
        seq: u64,
    ) -> Result<(), ReplayError> {
        let key = (subaccount_id.to_string(), asset_id.to_string());
        let current = balances.get(&key).copied().unwrap_or(0);
        let next = current
            .checked_sub(amount)
            .ok_or(ReplayError::Underflow(seq))?;
        if next == 0 {
            balances.remove(&key);
        } else {
            balances.insert(key, next);
        }
        Ok(())
    }

    for record in records {
        match &record.operation {
            Operation::Claim {
                subaccount_id,
                asset_id,
                amount,
                ..
            } => credit(&mut balances, subaccount_id, asset_id, amount.0, record.seq)?,
            Operation::Transfer {
                from_subaccount,
                to_subaccount,
                asset_id,
                amount,
            } => {
                debit(
                    &mut balances,
                    from_subaccount,
                    asset_id,
                    amount.0,
                    record.seq,
                )?;
                credit(&mut balances, to_subaccount, asset_id, amount.0, record.seq)?;
            }
            Operation::Withdraw {
                subaccount_id,
                asset_id,
                amount,
                ..
            } => debit(&mut balances, subaccount_id, asset_id, amount.0, record.seq)?,
        }
    }

    Ok(balances)
}
