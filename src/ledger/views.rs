//! Read-only views over a [`WalletLedger`].

use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::{EvmAddress, TokenAmount, UnixTimestamp};

use super::{Asset, InboxEntry, OutboxEntry, ProvenanceFilter, ProvenanceRecord, Subaccount, WalletLedger};

/// An asset together with its aggregate and per-subaccount balances.
#[derive(Debug, Clone, Serialize)]
pub struct AssetView {
    #[serde(flatten)]
    pub asset: Asset,
    pub total_balance: TokenAmount,
    pub balances: BTreeMap<String, TokenAmount>,
}

/// A full serializable snapshot of one wallet.
#[derive(Debug, Serialize)]
pub struct WalletStateView {
    pub address: EvmAddress,
    pub name: String,
    pub owner: String,
    pub created_at: UnixTimestamp,
    pub nonce: u64,
    pub assets: BTreeMap<String, Asset>,
    pub subaccounts: BTreeMap<String, Subaccount>,
    pub inbox: BTreeMap<String, InboxEntry>,
    pub outbox: Vec<OutboxEntry>,
    pub balances: BTreeMap<String, BTreeMap<String, TokenAmount>>,
    pub provenance: Vec<ProvenanceRecord>,
}

impl WalletLedger {
    /// The balance of one `(subaccount, asset)` pair; zero when absent.
    pub fn balance(&self, subaccount_id: &str, asset_id: &str) -> u128 {
        self.balances
            .get(&(subaccount_id.to_string(), asset_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// All non-zero balances of one sub-account, keyed by asset id.
    pub fn balances_for_subaccount(&self, subaccount_id: &str) -> BTreeMap<String, TokenAmount> {
        self.balances
            .iter()
            .filter(|((subaccount, _), _)| subaccount == subaccount_id)
            .map(|((_, asset_id), amount)| (asset_id.clone(), TokenAmount(*amount)))
            .collect()
    }

    /// Every registered asset with its total and per-subaccount balances.
    pub fn assets_view(&self) -> BTreeMap<String, AssetView> {
        self.assets
            .iter()
            .map(|(asset_id, asset)| {
                let mut balances = BTreeMap::new();
                let mut total: u128 = 0;
                for ((subaccount_id, balance_asset), amount) in &self.balances {
                    if balance_asset == asset_id {
                        balances.insert(subaccount_id.clone(), TokenAmount(*amount));
                        total = total.saturating_add(*amount);
                    }
                }
                (
                    asset_id.clone(),
                    AssetView {
                        asset: asset.clone(),
                        total_balance: TokenAmount(total),
                        balances,
                    },
                )
            })
            .collect()
    }

    /// Outbox entries in append order.
    pub fn outbox_entries(&self) -> &[OutboxEntry] {
        &self.outbox
    }

    /// Provenance records matching `filter`, ordered by `seq` ascending.
    pub fn provenance_records(&self, filter: &ProvenanceFilter) -> Vec<ProvenanceRecord> {
        self.provenance
            .iter()
            .filter(|record| record.matches(filter))
            .cloned()
            .collect()
    }

    /// Raw provenance log, for replay checks.
    pub fn provenance_log(&self) -> &[ProvenanceRecord] {
        &self.provenance
    }

    /// The live balance map, keyed `(subaccount_id, asset_id)`.
    pub fn balance_map(&self) -> &BTreeMap<(String, String), u128> {
        &self.balances
    }

    pub fn transaction_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    /// A full snapshot for the `WalletState` command.
    pub fn state_view(&self) -> WalletStateView {
        let mut balances: BTreeMap<String, BTreeMap<String, TokenAmount>> = BTreeMap::new();
        for ((subaccount_id, asset_id), amount) in &self.balances {
            balances
                .entry(subaccount_id.clone())
                .or_default()
                .insert(asset_id.clone(), TokenAmount(*amount));
        }
        WalletStateView {
            address: self.address,
            name: self.name.clone(),
            owner: self.owner.clone(),
            created_at: self.created_at,
            nonce: self.nonce,
            assets: self.assets.clone(),
            subaccounts: self.subaccounts.clone(),
            inbox: self.inbox.clone(),
            outbox: self.outbox.clone(),
            balances,
            provenance: self.provenance.clone(),
        }
    }
}
