//! Per-wallet ledger state and its operation semantics.
//!
//! A [`WalletLedger`] owns everything behind one on-chain address: the asset
//! registry, sub-accounts, the deposit inbox, the signed-withdrawal outbox,
//! the balance map, and the provenance log. Every mutator stages its changes
//! locally and commits only once all preconditions hold (and, for
//! withdrawals, only after the key manager has returned a signature), so an
//! error leaves the wallet exactly as it was on entry.

pub mod provenance;
pub mod views;

use alloy_primitives::{Bytes, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::keystore::{KeyManager, KeystoreError};
use crate::tx::{self, LegacyTransaction};
use crate::types::{EvmAddress, HexBytes, TokenAmount, TokenType, UnixTimestamp};

pub use provenance::{Operation, ProvenanceFilter, ProvenanceRecord};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown asset: {0}")]
    UnknownAsset(String),
    #[error("unknown subaccount: {0}")]
    UnknownSubaccount(String),
    #[error("unknown deposit: {0}")]
    UnknownDeposit(String),
    #[error("unknown outbox entry: {0}")]
    UnknownOutbox(u64),
    #[error("duplicate deposit: {0}")]
    DuplicateDeposit(String),
    #[error("deposit already claimed: {0}")]
    AlreadyClaimed(String),
    #[error("invalid asset: {0}")]
    InvalidAsset(String),
    #[error("invalid amount")]
    InvalidAmount,
    #[error("insufficient balance of {asset_id} in subaccount {subaccount_id}")]
    InsufficientBalance {
        subaccount_id: String,
        asset_id: String,
    },
    #[error(transparent)]
    Kms(#[from] KeystoreError),
}

/// A registered asset. `asset_id` is the externally chosen key;
/// `(token_type, contract_address, token_id)` is its semantic identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<EvmAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

impl Asset {
    fn validate(&self) -> Result<(), LedgerError> {
        let invalid = |reason: &str| {
            Err(LedgerError::InvalidAsset(format!(
                "{}: {reason}",
                self.asset_id
            )))
        };
        match self.token_type {
            TokenType::Eth => {
                if self.contract_address.is_some() {
                    return invalid("ETH must not carry a contract address");
                }
                if self.token_id.is_some() {
                    return invalid("ETH must not carry a token id");
                }
            }
            TokenType::Erc20 => {
                if self.contract_address.is_none() {
                    return invalid("ERC20 requires a contract address");
                }
                if self.token_id.is_some() {
                    return invalid("ERC20 must not carry a token id");
                }
            }
            TokenType::Erc721 | TokenType::Erc1155 => {
                if self.contract_address.is_none() {
                    return invalid("NFT assets require a contract address");
                }
                let Some(token_id) = &self.token_id else {
                    return invalid("NFT assets require a token id");
                };
                if tx::parse_token_id(token_id).is_none() {
                    return invalid("token id is not a valid integer");
                }
            }
        }
        Ok(())
    }
}

/// A ledger-only partition of the wallet. The display `address` may be
/// shared; `subaccount_id` is the sole identity used in operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subaccount {
    pub subaccount_id: String,
    pub label: String,
    pub address: EvmAddress,
}

/// A deposit observed for the wallet's address, awaiting a claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub deposit_id: String,
    pub asset_id: String,
    pub amount: TokenAmount,
    pub from_address: EvmAddress,
    pub to_address: EvmAddress,
    pub transaction_hash: String,
    pub block_number: String,
    pub claimed: bool,
}

/// A signed-but-not-broadcast withdrawal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub outbox_id: u64,
    pub asset_id: String,
    pub amount: TokenAmount,
    pub subaccount_id: String,
    pub destination: EvmAddress,
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub signed_raw_transaction: HexBytes,
    pub created_at: UnixTimestamp,
}

/// All mutable state behind one on-chain wallet address.
pub struct WalletLedger {
    address: EvmAddress,
    name: String,
    owner: String,
    created_at: UnixTimestamp,
    /// Next EIP-155 transaction nonce, assigned at withdrawal signing.
    nonce: u64,
    assets: BTreeMap<String, Asset>,
    subaccounts: BTreeMap<String, Subaccount>,
    inbox: BTreeMap<String, InboxEntry>,
    outbox: Vec<OutboxEntry>,
    next_outbox_id: u64,
    balances: BTreeMap<(String, String), u128>,
    provenance: Vec<ProvenanceRecord>,
}

impl WalletLedger {
    pub fn new(address: EvmAddress, name: String, owner: String) -> Self {
        Self {
            address,
            name,
            owner,
            created_at: UnixTimestamp::now_or_epoch(),
            nonce: 0,
            assets: BTreeMap::new(),
            subaccounts: BTreeMap::new(),
            inbox: BTreeMap::new(),
            outbox: Vec::new(),
            next_outbox_id: 0,
            balances: BTreeMap::new(),
            provenance: Vec::new(),
        }
    }

    pub fn address(&self) -> EvmAddress {
        self.address
    }

    /// Registers an asset. Idempotent on `asset_id`: re-adding an existing
    /// id succeeds without mutation. Writes no provenance.
    pub fn add_asset(&mut self, asset: Asset) -> Result<(), LedgerError> {
        asset.validate()?;
        if self.assets.contains_key(&asset.asset_id) {
            return Ok(());
        }
        self.assets.insert(asset.asset_id.clone(), asset);
        Ok(())
    }

    /// Registers a sub-account. Idempotent on `subaccount_id`. Writes no
    /// provenance.
    pub fn add_subaccount(&mut self, subaccount: Subaccount) -> Result<(), LedgerError> {
        if self.subaccounts.contains_key(&subaccount.subaccount_id) {
            return Ok(());
        }
        self.subaccounts
            .insert(subaccount.subaccount_id.clone(), subaccount);
        Ok(())
    }

    /// Appends a deposit to the inbox, unclaimed. No balance change and no
    /// provenance; provenance is written on claim.
    pub fn record_deposit(&mut self, entry: InboxEntry) -> Result<(), LedgerError> {
        if self.inbox.contains_key(&entry.deposit_id) {
            return Err(LedgerError::DuplicateDeposit(entry.deposit_id));
        }
        let deposit_id = entry.deposit_id.clone();
        self.inbox.insert(
            deposit_id,
            InboxEntry {
                claimed: false,
                ..entry
            },
        );
        Ok(())
    }

    /// Claims a deposit into a sub-account: marks it claimed, credits the
    /// balance, and appends a `Claim` provenance record.
    pub fn claim(&mut self, deposit_id: &str, subaccount_id: &str) -> Result<(), LedgerError> {
        let entry = self
            .inbox
            .get(deposit_id)
            .ok_or_else(|| LedgerError::UnknownDeposit(deposit_id.to_string()))?;
        if entry.claimed {
            return Err(LedgerError::AlreadyClaimed(deposit_id.to_string()));
        }
        if !self.subaccounts.contains_key(subaccount_id) {
            return Err(LedgerError::UnknownSubaccount(subaccount_id.to_string()));
        }
        if !self.assets.contains_key(&entry.asset_id) {
            return Err(LedgerError::UnknownAsset(entry.asset_id.clone()));
        }
        let asset_id = entry.asset_id.clone();
        let amount = entry.amount;
        let block_number = entry.block_number.clone();
        let credited = self
            .balance(subaccount_id, &asset_id)
            .checked_add(amount.0)
            .ok_or(LedgerError::InvalidAmount)?;

        // All preconditions hold; commit.
        if let Some(entry) = self.inbox.get_mut(deposit_id) {
            entry.claimed = true;
        }
        self.balances
            .insert((subaccount_id.to_string(), asset_id.clone()), credited);
        self.push_provenance(
            Some(block_number),
            Operation::Claim {
                deposit_id: deposit_id.to_string(),
                subaccount_id: subaccount_id.to_string(),
                asset_id,
                amount,
            },
        );
        Ok(())
    }

    /// Moves `amount` of an asset between two sub-accounts. Purely off-chain:
    /// the on-chain address and the key manager are never involved.
    pub fn transfer(
        &mut self,
        from_subaccount: &str,
        to_subaccount: &str,
        asset_id: &str,
        amount: u128,
    ) -> Result<(), LedgerError> {
        if amount == 0 || from_subaccount == to_subaccount {
            return Err(LedgerError::InvalidAmount);
        }
        if !self.subaccounts.contains_key(from_subaccount) {
            return Err(LedgerError::UnknownSubaccount(from_subaccount.to_string()));
        }
        if !self.subaccounts.contains_key(to_subaccount) {
            return Err(LedgerError::UnknownSubaccount(to_subaccount.to_string()));
        }
        if !self.assets.contains_key(asset_id) {
            return Err(LedgerError::UnknownAsset(asset_id.to_string()));
        }
        let from_next = self
            .balance(from_subaccount, asset_id)
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::InsufficientBalance {
                subaccount_id: from_subaccount.to_string(),
                asset_id: asset_id.to_string(),
            })?;
        let to_next = self
            .balance(to_subaccount, asset_id)
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount)?;

        self.set_balance(from_subaccount, asset_id, from_next);
        self.set_balance(to_subaccount, asset_id, to_next);
        self.push_provenance(
            None,
            Operation::Transfer {
                from_subaccount: from_subaccount.to_string(),
                to_subaccount: to_subaccount.to_string(),
                asset_id: asset_id.to_string(),
                amount: TokenAmount(amount),
            },
        );
        Ok(())
    }

    /// Signs a withdrawal to an external address and stages it in the outbox.
    ///
    /// Assigns the wallet's next transaction nonce, builds the EIP-155
    /// legacy transaction for the asset, and asks the key manager for a
    /// signature. On any failure nothing is committed; in particular the
    /// nonce does not advance on a signing failure.
    #[allow(clippy::too_many_arguments)]
    pub fn withdraw(
        &mut self,
        keystore: &KeyManager,
        subaccount_id: &str,
        asset_id: &str,
        amount: u128,
        destination: EvmAddress,
        chain_id: u64,
        gas_price: Option<u64>,
        gas_limit: Option<u64>,
    ) -> Result<OutboxEntry, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if !self.subaccounts.contains_key(subaccount_id) {
            return Err(LedgerError::UnknownSubaccount(subaccount_id.to_string()));
        }
        let asset = self
            .assets
            .get(asset_id)
            .ok_or_else(|| LedgerError::UnknownAsset(asset_id.to_string()))?;
        let remaining = self
            .balance(subaccount_id, asset_id)
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::InsufficientBalance {
                subaccount_id: subaccount_id.to_string(),
                asset_id: asset_id.to_string(),
            })?;

        let gas_price = gas_price.unwrap_or(tx::DEFAULT_GAS_PRICE);
        let gas_limit = gas_limit.unwrap_or_else(|| tx::default_gas_limit(asset.token_type));
        let (to, value, data) = transfer_call(asset, self.address, destination, amount)?;
        let transaction = LegacyTransaction {
            nonce: self.nonce,
            gas_price,
            gas_limit,
            to,
            value,
            data,
        };
        let digest = tx::signing_digest(&tx::encode_unsigned(&transaction, chain_id));
        let signature = keystore.sign_digest(self.address, digest)?;
        let v = tx::eip155_v(chain_id, signature.recovery_id);
        let raw = tx::encode_signed(&transaction, v, signature.r, signature.s);

        // Signature in hand; commit.
        let nonce = self.nonce;
        self.nonce += 1;
        let outbox_id = self.next_outbox_id;
        self.next_outbox_id += 1;
        let entry = OutboxEntry {
            outbox_id,
            asset_id: asset_id.to_string(),
            amount: TokenAmount(amount),
            subaccount_id: subaccount_id.to_string(),
            destination,
            chain_id,
            nonce,
            gas_price,
            gas_limit,
            signed_raw_transaction: HexBytes(raw.clone()),
            created_at: UnixTimestamp::now_or_epoch(),
        };
        self.outbox.push(entry.clone());
        self.set_balance(subaccount_id, asset_id, remaining);
        self.push_provenance(
            None,
            Operation::Withdraw {
                subaccount_id: subaccount_id.to_string(),
                asset_id: asset_id.to_string(),
                amount: TokenAmount(amount),
                destination,
                nonce,
                gas_price,
                gas_limit,
                chain_id,
                signed_raw_transaction: HexBytes(raw),
            },
        );
        Ok(entry)
    }

    /// Removes an outbox entry after the host confirms broadcast. No balance
    /// change and no provenance.
    pub fn remove_outbox(&mut self, outbox_id: u64) -> Result<OutboxEntry, LedgerError> {
        let position = self
            .outbox
            .iter()
            .position(|entry| entry.outbox_id == outbox_id)
            .ok_or(LedgerError::UnknownOutbox(outbox_id))?;
        Ok(self.outbox.remove(position))
    }

    /// Signs a generic EIP-191 message with the wallet's own key. The core
    /// keeps no record; policy and history live in the host.
    pub fn sign_gsm(
        &self,
        keystore: &KeyManager,
        message: &[u8],
    ) -> Result<[u8; 65], LedgerError> {
        Ok(keystore.sign_personal_message(self.address, message)?)
    }

    fn set_balance(&mut self, subaccount_id: &str, asset_id: &str, value: u128) {
        let key = (subaccount_id.to_string(), asset_id.to_string());
        if value == 0 {
            self.balances.remove(&key);
        } else {
            self.balances.insert(key, value);
        }
    }

    fn push_provenance(&mut self, block_number: Option<String>, operation: Operation) {
        let seq = self.provenance.len() as u64;
        self.provenance.push(ProvenanceRecord {
            seq,
            timestamp: UnixTimestamp::now_or_epoch(),
            block_number,
            operation,
        });
    }
}

/// Maps an asset withdrawal onto the transaction's `(to, value, data)`.
fn transfer_call(
    asset: &Asset,
    wallet: EvmAddress,
    destination: EvmAddress,
    amount: u128,
) -> Result<(alloy_primitives::Address, U256, Bytes), LedgerError> {
    let contract = || {
        asset
            .contract_address
            .map(|a| a.0)
            .ok_or_else(|| LedgerError::InvalidAsset(asset.asset_id.clone()))
    };
    let token_id = || {
        asset
            .token_id
            .as_deref()
            .and_then(tx::parse_token_id)
            .ok_or_else(|| LedgerError::InvalidAsset(asset.asset_id.clone()))
    };
    match asset.token_type {
        TokenType::Eth => Ok((destination.0, U256::from(amount), Bytes::new())),
        TokenType::Erc20 => Ok((
            contract()?,
            U256::ZERO,
            tx::erc20_transfer_calldata(destination.0, U256::from(amount)),
        )),
        TokenType::Erc721 => Ok((
            contract()?,
            U256::ZERO,
            tx::erc721_safe_transfer_calldata(wallet.0, destination.0, token_id()?),
        )),
        TokenType::Erc1155 => Ok((
            contract()?,
            U256::ZERO,
            tx::erc1155_safe_transfer_calldata(
                wallet.0,
                destination.0,
                token_id()?,
                U256::from(amount),
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::provenance::replay_balances;
    use super::*;
    use crate::keystore::{KeyManager, RecoverableSignature};
    use alloy_primitives::Address;
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::str::FromStr;

    const WEI: u128 = 1_000_000_000_000_000_000;

    fn wallet_with_key() -> (KeyManager, WalletLedger) {
        let keystore = KeyManager::new("ledger-test-secret");
        let address = keystore.generate_account().unwrap();
        let ledger = WalletLedger::new(address, "primary".to_string(), "alice".to_string());
        (keystore, ledger)
    }

    fn eth_asset() -> Asset {
        Asset {
            asset_id: "eth_mainnet".to_string(),
            token_type: TokenType::Eth,
            contract_address: None,
            token_id: None,
            symbol: "ETH".to_string(),
            name: "Ether".to_string(),
            decimals: 18,
        }
    }

    fn erc20_asset(asset_id: &str) -> Asset {
        Asset {
            asset_id: asset_id.to_string(),
            token_type: TokenType::Erc20,
            contract_address: Some(
                EvmAddress::from_str("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").unwrap(),
            ),
            token_id: None,
            symbol: "USDC".to_string(),
            name: "USD Coin".to_string(),
            decimals: 6,
        }
    }

    fn erc721_asset(asset_id: &str, token_id: &str) -> Asset {
        Asset {
            asset_id: asset_id.to_string(),
            token_type: TokenType::Erc721,
            contract_address: Some(
                EvmAddress::from_str("0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d").unwrap(),
            ),
            token_id: Some(token_id.to_string()),
            symbol: "BAYC".to_string(),
            name: "Bored Ape".to_string(),
            decimals: 0,
        }
    }

    fn subaccount(subaccount_id: &str) -> Subaccount {
        Subaccount {
            subaccount_id: subaccount_id.to_string(),
            label: subaccount_id.to_string(),
            address: EvmAddress::from_str("0x1111111111111111111111111111111111111111").unwrap(),
        }
    }

    fn deposit(deposit_id: &str, asset_id: &str, amount: u128) -> InboxEntry {
        InboxEntry {
            deposit_id: deposit_id.to_string(),
            asset_id: asset_id.to_string(),
            amount: TokenAmount(amount),
            from_address: EvmAddress::from_str("0x2222222222222222222222222222222222222222").unwrap(),
            to_address: EvmAddress::from_str("0x3333333333333333333333333333333333333333").unwrap(),
            transaction_hash: format!("0xhash-{deposit_id}"),
            block_number: "100".to_string(),
            claimed: false,
        }
    }

    fn destination() -> EvmAddress {
        EvmAddress::from_str("0x000000000000000000000000000000000000dead").unwrap()
    }

    fn recover_signer(digest: alloy_primitives::B256, signature: &RecoverableSignature) -> EvmAddress {
        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&signature.r.to_be_bytes::<32>());
        rs[32..].copy_from_slice(&signature.s.to_be_bytes::<32>());
        let sig = Signature::from_slice(&rs).unwrap();
        let recid = RecoveryId::from_byte(signature.recovery_id).unwrap();
        let key = VerifyingKey::recover_from_prehash(digest.as_slice(), &sig, recid).unwrap();
        EvmAddress(Address::from_public_key(&key))
    }

    // S1: create, deposit, claim, query.
    #[test]
    fn test_create_deposit_claim_query() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.claim("d1", "main").unwrap();

        assert_eq!(wallet.balance("main", "eth_mainnet"), WEI);
        let log = wallet.provenance_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].seq, 0);
        assert_eq!(log[0].block_number.as_deref(), Some("100"));
        assert!(matches!(
            &log[0].operation,
            Operation::Claim { deposit_id, amount, .. }
                if deposit_id == "d1" && amount.0 == WEI
        ));
    }

    // S2: internal transfer.
    #[test]
    fn test_internal_transfer() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.claim("d1", "main").unwrap();
        wallet.add_subaccount(subaccount("trade")).unwrap();
        wallet
            .transfer("main", "trade", "eth_mainnet", 4 * WEI / 10)
            .unwrap();

        assert_eq!(wallet.balance("main", "eth_mainnet"), 6 * WEI / 10);
        assert_eq!(wallet.balance("trade", "eth_mainnet"), 4 * WEI / 10);
        assert_eq!(wallet.provenance_log().len(), 2);
    }

    // S3: withdraw with signature check.
    #[test]
    fn test_withdraw_signs_for_wallet_address() {
        let (keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.claim("d1", "main").unwrap();
        wallet.add_subaccount(subaccount("trade")).unwrap();
        wallet
            .transfer("main", "trade", "eth_mainnet", 4 * WEI / 10)
            .unwrap();

        let chain_id = 11_155_111;
        let entry = wallet
            .withdraw(
                &keystore,
                "main",
                "eth_mainnet",
                WEI / 10,
                destination(),
                chain_id,
                Some(20_000_000_000),
                Some(21_000),
            )
            .unwrap();

        assert_eq!(wallet.balance("main", "eth_mainnet"), 5 * WEI / 10);
        assert_eq!(wallet.outbox_entries().len(), 1);
        assert_eq!(entry.nonce, 0);
        assert_eq!(wallet.transaction_nonce(), 1);

        // RFC 6979 signing is deterministic: re-deriving the signature must
        // reproduce the stored raw transaction bit for bit.
        let transaction = crate::tx::LegacyTransaction {
            nonce: entry.nonce,
            gas_price: entry.gas_price,
            gas_limit: entry.gas_limit,
            to: entry.destination.0,
            value: alloy_primitives::U256::from(entry.amount.0),
            data: alloy_primitives::Bytes::new(),
        };
        let digest = crate::tx::signing_digest(&crate::tx::encode_unsigned(&transaction, chain_id));
        let signature = keystore.sign_digest(wallet.address(), digest).unwrap();
        let v = crate::tx::eip155_v(chain_id, signature.recovery_id);
        assert!(v == 22_310_257 || v == 22_310_258);
        let raw = crate::tx::encode_signed(&transaction, v, signature.r, signature.s);
        assert_eq!(raw, entry.signed_raw_transaction.0);
        assert_eq!(recover_signer(digest, &signature), wallet.address());
    }

    // S4: double-claim rejection.
    #[test]
    fn test_double_claim_rejected() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.claim("d1", "main").unwrap();

        let err = wallet.claim("d1", "main").unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyClaimed(id) if id == "d1"));
        assert_eq!(wallet.balance("main", "eth_mainnet"), WEI);
        assert_eq!(wallet.provenance_log().len(), 1);
    }

    // S5: insufficient balance on transfer.
    #[test]
    fn test_insufficient_transfer_leaves_state_untouched() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.add_subaccount(subaccount("trade")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.claim("d1", "main").unwrap();

        let err = wallet
            .transfer("main", "trade", "eth_mainnet", 2 * WEI)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(wallet.balance("main", "eth_mainnet"), WEI);
        assert_eq!(wallet.balance("trade", "eth_mainnet"), 0);
        assert_eq!(wallet.provenance_log().len(), 1);
    }

    // S6: duplicate deposit id.
    #[test]
    fn test_duplicate_deposit_rejected() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();

        let err = wallet
            .record_deposit(deposit("d1", "eth_mainnet", 2 * WEI))
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateDeposit(id) if id == "d1"));
        assert_eq!(wallet.inbox_len(), 1);
    }

    #[test]
    fn test_add_asset_is_idempotent() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        let mut renamed = eth_asset();
        renamed.name = "Ether again".to_string();
        wallet.add_asset(renamed).unwrap();

        let assets = wallet.assets_view();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets["eth_mainnet"].asset.name, "Ether");
    }

    #[test]
    fn test_add_subaccount_is_idempotent() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_subaccount(subaccount("main")).unwrap();
        let mut relabeled = subaccount("main");
        relabeled.label = "Main (renamed)".to_string();
        wallet.add_subaccount(relabeled).unwrap();

        assert_eq!(wallet.state_view().subaccounts.len(), 1);
        assert_eq!(wallet.state_view().subaccounts["main"].label, "main");
    }

    #[test]
    fn test_asset_constraints() {
        let (_keystore, mut wallet) = wallet_with_key();

        let mut eth_with_contract = eth_asset();
        eth_with_contract.contract_address = Some(destination());
        assert!(matches!(
            wallet.add_asset(eth_with_contract),
            Err(LedgerError::InvalidAsset(_))
        ));

        let mut erc20_without_contract = erc20_asset("usdc");
        erc20_without_contract.contract_address = None;
        assert!(matches!(
            wallet.add_asset(erc20_without_contract),
            Err(LedgerError::InvalidAsset(_))
        ));

        let mut nft_without_token = erc721_asset("ape", "1");
        nft_without_token.token_id = None;
        assert!(matches!(
            wallet.add_asset(nft_without_token),
            Err(LedgerError::InvalidAsset(_))
        ));
    }

    #[test]
    fn test_claim_requires_registered_entities() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.record_deposit(deposit("d2", "unregistered", WEI)).unwrap();

        assert!(matches!(
            wallet.claim("missing", "main"),
            Err(LedgerError::UnknownDeposit(_))
        ));
        assert!(matches!(
            wallet.claim("d1", "ghost"),
            Err(LedgerError::UnknownSubaccount(_))
        ));
        assert!(matches!(
            wallet.claim("d2", "main"),
            Err(LedgerError::UnknownAsset(_))
        ));
        assert!(wallet.provenance_log().is_empty());
    }

    #[test]
    fn test_transfer_rejects_zero_and_self() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.add_subaccount(subaccount("trade")).unwrap();

        assert!(matches!(
            wallet.transfer("main", "trade", "eth_mainnet", 0),
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            wallet.transfer("main", "main", "eth_mainnet", 1),
            Err(LedgerError::InvalidAmount)
        ));
    }

    #[test]
    fn test_withdraw_failure_rolls_back_nonce() {
        let keystore = KeyManager::new("ledger-test-secret");
        let stranger = EvmAddress::from_str("0x4444444444444444444444444444444444444444").unwrap();
        // A wallet whose key this enclave does not hold: signing must fail.
        let mut wallet = WalletLedger::new(stranger, "w".to_string(), "o".to_string());
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.claim("d1", "main").unwrap();

        let err = wallet
            .withdraw(
                &keystore,
                "main",
                "eth_mainnet",
                WEI / 2,
                destination(),
                1,
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Kms(_)));
        assert_eq!(wallet.transaction_nonce(), 0);
        assert_eq!(wallet.balance("main", "eth_mainnet"), WEI);
        assert!(wallet.outbox_entries().is_empty());
        assert_eq!(wallet.provenance_log().len(), 1);
    }

    #[test]
    fn test_withdraw_nonces_are_gapless() {
        let (keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.claim("d1", "main").unwrap();

        for expected_nonce in 0..3 {
            let entry = wallet
                .withdraw(
                    &keystore,
                    "main",
                    "eth_mainnet",
                    WEI / 10,
                    destination(),
                    1,
                    None,
                    None,
                )
                .unwrap();
            assert_eq!(entry.nonce, expected_nonce);
            assert_eq!(entry.outbox_id, expected_nonce);
        }
        // A failed withdraw between successes must not leave a gap.
        assert!(wallet
            .withdraw(&keystore, "main", "eth_mainnet", 5 * WEI, destination(), 1, None, None)
            .is_err());
        let entry = wallet
            .withdraw(&keystore, "main", "eth_mainnet", WEI / 10, destination(), 1, None, None)
            .unwrap();
        assert_eq!(entry.nonce, 3);
    }

    #[test]
    fn test_withdraw_gas_defaults_per_token_type() {
        let (keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_asset(erc20_asset("usdc")).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.record_deposit(deposit("d2", "usdc", 1_000_000)).unwrap();
        wallet.claim("d1", "main").unwrap();
        wallet.claim("d2", "main").unwrap();

        let eth = wallet
            .withdraw(&keystore, "main", "eth_mainnet", WEI / 10, destination(), 1, None, None)
            .unwrap();
        assert_eq!(eth.gas_limit, 21_000);
        assert_eq!(eth.gas_price, 20_000_000_000);

        let erc20 = wallet
            .withdraw(&keystore, "main", "usdc", 500_000, destination(), 1, None, None)
            .unwrap();
        assert_eq!(erc20.gas_limit, 65_000);
    }

    #[test]
    fn test_erc721_withdraw_calldata_targets_contract() {
        let (keystore, mut wallet) = wallet_with_key();
        let asset = erc721_asset("ape", "42");
        let contract = asset.contract_address.unwrap();
        wallet.add_asset(asset).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "ape", 1)).unwrap();
        wallet.claim("d1", "main").unwrap();

        let entry = wallet
            .withdraw(&keystore, "main", "ape", 1, destination(), 1, None, None)
            .unwrap();

        // Reconstruct the unsigned body: `to` must be the contract and the
        // calldata must carry wallet -> destination for token 42.
        let data = crate::tx::erc721_safe_transfer_calldata(
            wallet.address().0,
            destination().0,
            alloy_primitives::U256::from(42u64),
        );
        let transaction = crate::tx::LegacyTransaction {
            nonce: 0,
            gas_price: entry.gas_price,
            gas_limit: entry.gas_limit,
            to: contract.0,
            value: alloy_primitives::U256::ZERO,
            data,
        };
        let digest = crate::tx::signing_digest(&crate::tx::encode_unsigned(&transaction, 1));
        let signature = keystore.sign_digest(wallet.address(), digest).unwrap();
        let raw = crate::tx::encode_signed(
            &transaction,
            crate::tx::eip155_v(1, signature.recovery_id),
            signature.r,
            signature.s,
        );
        assert_eq!(raw, entry.signed_raw_transaction.0);
    }

    #[test]
    fn test_remove_outbox() {
        let (keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.claim("d1", "main").unwrap();
        let entry = wallet
            .withdraw(&keystore, "main", "eth_mainnet", WEI / 10, destination(), 1, None, None)
            .unwrap();

        let provenance_before = wallet.provenance_log().len();
        let removed = wallet.remove_outbox(entry.outbox_id).unwrap();
        assert_eq!(removed.outbox_id, entry.outbox_id);
        assert!(wallet.outbox_entries().is_empty());
        assert_eq!(wallet.provenance_log().len(), provenance_before);
        assert!(matches!(
            wallet.remove_outbox(entry.outbox_id),
            Err(LedgerError::UnknownOutbox(_))
        ));
    }

    #[test]
    fn test_queries_and_views() {
        let (_keystore, mut wallet) = wallet_with_key();
        wallet.add_asset(eth_asset()).unwrap();
        wallet.add_asset(erc20_asset("usdc")).unwrap();
        wallet.add_subaccount(subaccount("main")).unwrap();
        wallet.add_subaccount(subaccount("trade")).unwrap();
        wallet.record_deposit(deposit("d1", "eth_mainnet", WEI)).unwrap();
        wallet.record_deposit(deposit("d2", "usdc", 5_000_000)).unwrap();
        wallet.claim("d1", "main").unwrap();
        wallet.claim("d2", "main").unwrap();
        wallet.transfer("main", "trade", "eth_mainnet", WEI / 4).unwrap();

        let balances = wallet.balances_for_subaccount("main");
        assert_eq!(balances["eth_mainnet"].0, 3 * WEI / 4);
        assert_eq!(balances["usdc"].0, 5_000_000);
        assert!(wallet.balances_for_subaccount("ghost").is_empty());

        let assets = wallet.assets_view();
        assert_eq!(assets["eth_mainnet"].total_balance.0, WEI);
        assert_eq!(assets["eth_mainnet"].balances["main"].0, 3 * WEI / 4);
        assert_eq!(assets["eth_mainnet"].balances["trade"].0, WEI / 4);
        assert_eq!(assets["usdc"].total_balance.0, 5_000_000);

        let by_asset = wallet.provenance_records(&ProvenanceFilter::ByAsset("usdc".to_string()));
        assert_eq!(by_asset.len(), 1);
        let by_subaccount =
            wallet.provenance_records(&ProvenanceFilter::BySubaccount("trade".to_string()));
        assert_eq!(by_subaccount.len(), 1);
        let all = wallet.provenance_records(&ProvenanceFilter::All);
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));

        let state = wallet.state_view();
        assert_eq!(state.balances["main"]["usdc"].0, 5_000_000);
        assert_eq!(state.provenance.len(), 3);
    }

    #[test]
    fn test_sign_gsm_returns_personal_signature() {
        let (keystore, wallet) = wallet_with_key();
        let signature = wallet.sign_gsm(&keystore, b"host challenge").unwrap();
        assert_eq!(
            signature,
            keystore
                .sign_personal_message(wallet.address(), b"host challenge")
                .unwrap()
        );
    }

    // Randomized operation sequences: conservation, replay faithfulness, claim
    // uniqueness, and gapless nonces must hold at every step.
    #[test]
    fn test_randomized_sequences_preserve_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        let subaccounts = ["a", "b", "c"];

        for _round in 0..8 {
            let (keystore, mut wallet) = wallet_with_key();
            wallet.add_asset(eth_asset()).unwrap();
            for subaccount_id in subaccounts {
                wallet.add_subaccount(subaccount(subaccount_id)).unwrap();
            }
            for i in 0..6 {
                wallet
                    .record_deposit(deposit(&format!("d{i}"), "eth_mainnet", WEI))
                    .unwrap();
            }

            let mut claimed: u128 = 0;
            let mut withdrawn: u128 = 0;
            let mut successful_withdraws: u64 = 0;

            for _step in 0..60 {
                let nonce_before = wallet.transaction_nonce();
                let provenance_before = wallet.provenance_log().len();
                let balances_before = wallet.balance_map().clone();

                let op = rng.random_range(0..4u32);
                let outcome: Result<(), LedgerError> = match op {
                    0 => {
                        let deposit_id = format!("d{}", rng.random_range(0..6u32));
                        let target = subaccounts[rng.random_range(0..subaccounts.len())];
                        let result = wallet.claim(&deposit_id, target);
                        if result.is_ok() {
                            claimed += WEI;
                        }
                        result
                    }
                    1 => {
                        let from = subaccounts[rng.random_range(0..subaccounts.len())];
                        let to = subaccounts[rng.random_range(0..subaccounts.len())];
                        let amount = rng.random_range(0..WEI / 2);
                        wallet.transfer(from, to, "eth_mainnet", amount)
                    }
                    2 => {
                        let from = subaccounts[rng.random_range(0..subaccounts.len())];
                        let amount = rng.random_range(1..WEI);
                        let result = wallet
                            .withdraw(
                                &keystore,
                                from,
                                "eth_mainnet",
                                amount,
                                destination(),
                                1,
                                None,
                                None,
                            )
                            .map(|_| ());
                        if result.is_ok() {
                            withdrawn += amount;
                            successful_withdraws += 1;
                        }
                        result
                    }
                    _ => wallet.record_deposit(deposit(
                        &format!("d{}", rng.random_range(0..8u32)),
                        "eth_mainnet",
                        WEI,
                    )),
                };

                if outcome.is_err() {
                    // Failed operations must leave the wallet untouched.
                    assert_eq!(wallet.transaction_nonce(), nonce_before);
                    assert_eq!(wallet.provenance_log().len(), provenance_before);
                    assert_eq!(wallet.balance_map(), &balances_before);
                }

                let total: u128 = wallet.balance_map().values().sum();
                assert_eq!(total, claimed - withdrawn);
                assert_eq!(wallet.transaction_nonce(), successful_withdraws);
                assert_eq!(wallet.outbox_entries().len() as u64, successful_withdraws);

                let replayed = replay_balances(wallet.provenance_log()).unwrap();
                assert_eq!(&replayed, wallet.balance_map());
            }

            // At most one Claim record per deposit id across the whole log.
            let mut seen = std::collections::BTreeSet::new();
            for record in wallet.provenance_log() {
                if let Operation::Claim { deposit_id, .. } = &record.operation {
                    assert!(seen.insert(deposit_id.clone()));
                }
            }
        }
    }
}
