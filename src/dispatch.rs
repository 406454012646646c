//! Routes decoded commands to the key manager and wallet registry.
//!
//! The dispatcher holds no state of its own: wallet-scoped commands run
//! inside [`WalletRegistry::with_wallet`], key-manager commands go straight
//! to the [`KeyManager`], and every internal error is mapped into the
//! `{"success": false, "error": …}` envelope. Nothing is logged and
//! swallowed below this layer.

use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

use crate::keystore::{KeyManager, KeystoreError};
use crate::ledger::{Asset, InboxEntry, LedgerError, ProvenanceFilter, Subaccount};
use crate::proto::{
    AckPayload, AddressListPayload, AddressPayload, AssetsPayload, BalancePayload, Command,
    OutboxPayload, ProvenancePayload, Response, SignaturePayload, SubaccountBalancesPayload,
    WalletCreatedPayload, WalletListPayload, WithdrawPayload,
};
use crate::registry::{RegistryError, WalletRegistry};
use crate::types::{HexBytes, TokenAmount};

#[derive(Debug, thiserror::Error)]
pub enum EnclaveError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stateless command router over the enclave's two shared components.
pub struct Dispatcher {
    keystore: Arc<KeyManager>,
    registry: Arc<WalletRegistry>,
}

impl Dispatcher {
    pub fn new(keystore: Arc<KeyManager>, registry: Arc<WalletRegistry>) -> Self {
        Self { keystore, registry }
    }

    /// Decodes one request frame and executes it. Frames that do not parse
    /// as a known command are answered with an `invalid command` envelope.
    pub async fn dispatch_frame(&self, frame: &str) -> Response {
        match serde_json::from_str::<Command>(frame) {
            Ok(command) => self.dispatch(command).await,
            Err(error) => {
                Response::failure(EnclaveError::InvalidCommand(error.to_string()).to_string())
            }
        }
    }

    #[instrument(skip_all)]
    pub async fn dispatch(&self, command: Command) -> Response {
        match self.execute(command).await {
            Ok(data) => Response::success(data),
            Err(error) => {
                tracing::debug!(%error, "command failed");
                Response::failure(error.to_string())
            }
        }
    }

    async fn execute(&self, command: Command) -> Result<serde_json::Value, EnclaveError> {
        match command {
            Command::Keygen {} => {
                let address = self.keystore.generate_account()?;
                encode(&AddressPayload { address })
            }
            Command::Sign { address, message } => {
                let signature = self
                    .keystore
                    .sign_personal_message(address, message.as_bytes())?;
                encode(&SignaturePayload {
                    signature: HexBytes(signature.to_vec()),
                })
            }
            Command::List {} => encode(&AddressListPayload {
                addresses: self.keystore.list_addresses(),
            }),
            Command::CreateWallet { name, owner } => {
                let wallet_address = self.registry.create(name, owner)?;
                encode(&WalletCreatedPayload { wallet_address })
            }
            Command::ListWallets {} => encode(&WalletListPayload {
                wallets: self.registry.list(),
            }),
            Command::WalletState { wallet_address } => {
                let state = self
                    .registry
                    .with_wallet(wallet_address, |wallet| wallet.state_view())
                    .await?;
                encode(&state)
            }
            Command::AddAsset {
                wallet_address,
                asset_id,
                token_type,
                contract_address,
                token_id,
                symbol,
                name,
                decimals,
            } => {
                let asset = Asset {
                    asset_id,
                    token_type,
                    contract_address,
                    token_id,
                    symbol,
                    name,
                    decimals,
                };
                self.registry
                    .with_wallet(wallet_address, move |wallet| wallet.add_asset(asset))
                    .await??;
                encode(&AckPayload::ok())
            }
            Command::ListAssets { wallet_address } => {
                let assets = self
                    .registry
                    .with_wallet(wallet_address, |wallet| wallet.assets_view())
                    .await?;
                encode(&AssetsPayload { assets })
            }
            Command::AddSubaccount {
                wallet_address,
                subaccount_id,
                label,
                address,
            } => {
                let subaccount = Subaccount {
                    subaccount_id,
                    label,
                    address,
                };
                self.registry
                    .with_wallet(wallet_address, move |wallet| {
                        wallet.add_subaccount(subaccount)
                    })
                    .await??;
                encode(&AckPayload::ok())
            }
            Command::InboxDeposit {
                wallet_address,
                asset_id,
                amount,
                deposit_id,
                transaction_hash,
                block_number,
                from_address,
                to_address,
            } => {
                let entry = InboxEntry {
                    deposit_id,
                    asset_id,
                    amount,
                    from_address,
                    to_address,
                    transaction_hash,
                    block_number,
                    claimed: false,
                };
                self.registry
                    .with_wallet(wallet_address, move |wallet| wallet.record_deposit(entry))
                    .await??;
                encode(&AckPayload::ok())
            }
            Command::Claim {
                wallet_address,
                deposit_id,
                subaccount_id,
            } => {
                self.registry
                    .with_wallet(wallet_address, move |wallet| {
                        wallet.claim(&deposit_id, &subaccount_id)
                    })
                    .await??;
                encode(&AckPayload::ok())
            }
            Command::Transfer {
                wallet_address,
                asset_id,
                amount,
                from_subaccount,
                to_subaccount,
            } => {
                self.registry
                    .with_wallet(wallet_address, move |wallet| {
                        wallet.transfer(&from_subaccount, &to_subaccount, &asset_id, amount.0)
                    })
                    .await??;
                encode(&AckPayload::ok())
            }
            Command::Withdraw {
                wallet_address,
                asset_id,
                amount,
                subaccount_id,
                destination,
                chain_id,
                gas_price,
                gas_limit,
            } => {
                let keystore = self.keystore.clone();
                let withdrawal = self
                    .registry
                    .with_wallet(wallet_address, move |wallet| {
                        wallet.withdraw(
                            &keystore,
                            &subaccount_id,
                            &asset_id,
                            amount.0,
                            destination,
                            chain_id,
                            gas_price,
                            gas_limit,
                        )
                    })
                    .await??;
                encode(&WithdrawPayload { withdrawal })
            }
            Command::ListOutbox { wallet_address } => {
                let outbox = self
                    .registry
                    .with_wallet(wallet_address, |wallet| wallet.outbox_entries().to_vec())
                    .await?;
                encode(&OutboxPayload { outbox })
            }
            Command::RemoveOutbox {
                wallet_address,
                outbox_id,
            } => {
                self.registry
                    .with_wallet(wallet_address, move |wallet| wallet.remove_outbox(outbox_id))
                    .await??;
                encode(&AckPayload::ok())
            }
            Command::Balance {
                wallet_address,
                subaccount_id,
                asset_id,
            } => {
                let balance = self
                    .registry
                    .with_wallet(wallet_address, move |wallet| {
                        wallet.balance(&subaccount_id, &asset_id)
                    })
                    .await?;
                encode(&BalancePayload {
                    balance: TokenAmount(balance),
                })
            }
            Command::SubaccountBalances {
                wallet_address,
                subaccount_id,
            } => {
                let balances = self
                    .registry
                    .with_wallet(wallet_address, move |wallet| {
                        wallet.balances_for_subaccount(&subaccount_id)
                    })
                    .await?;
                encode(&SubaccountBalancesPayload { balances })
            }
            Command::SignGsm {
                wallet_address,
                domain,
                message,
            } => {
                let keystore = self.keystore.clone();
                let signature = self
                    .registry
                    .with_wallet(wallet_address, move |wallet| {
                        wallet.sign_gsm(&keystore, message.as_bytes())
                    })
                    .await??;
                tracing::info!(%wallet_address, %domain, "gsm signature issued");
                encode(&SignaturePayload {
                    signature: HexBytes(signature.to_vec()),
                })
            }
            Command::Provenance { wallet_address } => {
                self.provenance(wallet_address, ProvenanceFilter::All).await
            }
            Command::ProvenanceByAsset {
                wallet_address,
                asset_id,
            } => {
                self.provenance(wallet_address, ProvenanceFilter::ByAsset(asset_id))
                    .await
            }
            Command::ProvenanceBySubaccount {
                wallet_address,
                subaccount_id,
            } => {
                self.provenance(
                    wallet_address,
                    ProvenanceFilter::BySubaccount(subaccount_id),
                )
                .await
            }
        }
    }

    async fn provenance(
        &self,
        wallet_address: crate::types::EvmAddress,
        filter: ProvenanceFilter,
    ) -> Result<serde_json::Value, EnclaveError> {
        let provenance = self
            .registry
            .with_wallet(wallet_address, move |wallet| {
                wallet.provenance_records(&filter)
            })
            .await?;
        encode(&ProvenancePayload { provenance })
    }
}

fn encode<T: Serialize>(payload: &T) -> Result<serde_json::Value, EnclaveError> {
    serde_json::to_value(payload).map_err(|error| EnclaveError::Internal(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dispatcher() -> Dispatcher {
        let keystore = Arc::new(KeyManager::new("dispatch-test-secret"));
        let registry = Arc::new(WalletRegistry::new(
            keystore.clone(),
            Duration::from_secs(5),
        ));
        Dispatcher::new(keystore, registry)
    }

    async fn send(dispatcher: &Dispatcher, frame: serde_json::Value) -> serde_json::Value {
        let response = dispatcher.dispatch_frame(&frame.to_string()).await;
        serde_json::to_value(&response).unwrap()
    }

    async fn expect_success(dispatcher: &Dispatcher, frame: serde_json::Value) -> serde_json::Value {
        let response = send(dispatcher, frame).await;
        assert_eq!(response["success"], true, "unexpected failure: {response}");
        response["data"].clone()
    }

    #[tokio::test]
    async fn test_full_wallet_flow_over_commands() {
        let dispatcher = dispatcher();

        let created = expect_success(
            &dispatcher,
            serde_json::json!({"CreateWallet": {"name": "savings", "owner": "alice"}}),
        )
        .await;
        let wallet = created["wallet_address"].as_str().unwrap().to_string();

        expect_success(
            &dispatcher,
            serde_json::json!({"AddAsset": {
                "wallet_address": wallet,
                "asset_id": "eth_mainnet",
                "token_type": "ETH",
                "symbol": "ETH",
                "name": "Ether",
                "decimals": 18
            }}),
        )
        .await;
        expect_success(
            &dispatcher,
            serde_json::json!({"AddSubaccount": {
                "wallet_address": wallet,
                "subaccount_id": "main",
                "label": "Main",
                "address": wallet
            }}),
        )
        .await;
        expect_success(
            &dispatcher,
            serde_json::json!({"InboxDeposit": {
                "wallet_address": wallet,
                "asset_id": "eth_mainnet",
                "amount": 1_000_000_000_000_000_000u64,
                "deposit_id": "d1",
                "transaction_hash": "0xabc",
                "block_number": "100",
                "from_address": "0x2222222222222222222222222222222222222222",
                "to_address": wallet
            }}),
        )
        .await;
        expect_success(
            &dispatcher,
            serde_json::json!({"Claim": {
                "wallet_address": wallet,
                "deposit_id": "d1",
                "subaccount_id": "main"
            }}),
        )
        .await;

        let balance = expect_success(
            &dispatcher,
            serde_json::json!({"Balance": {
                "wallet_address": wallet,
                "subaccount_id": "main",
                "asset_id": "eth_mainnet"
            }}),
        )
        .await;
        assert_eq!(balance["balance"], 1_000_000_000_000_000_000u64);

        let withdrawal = expect_success(
            &dispatcher,
            serde_json::json!({"Withdraw": {
                "wallet_address": wallet,
                "asset_id": "eth_mainnet",
                "amount": 100_000_000_000_000_000u64,
                "subaccount_id": "main",
                "destination": "0x000000000000000000000000000000000000dead",
                "chain_id": 11155111,
                "gas_price": 20_000_000_000u64,
                "gas_limit": 21000
            }}),
        )
        .await;
        assert_eq!(withdrawal["withdrawal"]["nonce"], 0);
        let raw = withdrawal["withdrawal"]["signed_raw_transaction"]
            .as_str()
            .unwrap();
        assert!(raw.starts_with("0x"));

        let state = expect_success(
            &dispatcher,
            serde_json::json!({"WalletState": {"wallet_address": wallet}}),
        )
        .await;
        assert_eq!(state["nonce"], 1);
        assert_eq!(state["provenance"].as_array().unwrap().len(), 2);

        let provenance = expect_success(
            &dispatcher,
            serde_json::json!({"Provenance": {"wallet_address": wallet}}),
        )
        .await;
        assert_eq!(provenance["provenance"].as_array().unwrap().len(), 2);

        let outbox = expect_success(
            &dispatcher,
            serde_json::json!({"ListOutbox": {"wallet_address": wallet}}),
        )
        .await;
        assert_eq!(outbox["outbox"].as_array().unwrap().len(), 1);

        expect_success(
            &dispatcher,
            serde_json::json!({"RemoveOutbox": {"wallet_address": wallet, "outbox_id": 0}}),
        )
        .await;
        let outbox = expect_success(
            &dispatcher,
            serde_json::json!({"ListOutbox": {"wallet_address": wallet}}),
        )
        .await;
        assert!(outbox["outbox"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keygen_sign_list() {
        let dispatcher = dispatcher();
        let keygen = expect_success(&dispatcher, serde_json::json!({"Keygen": {}})).await;
        let address = keygen["address"].as_str().unwrap().to_string();

        let listed = expect_success(&dispatcher, serde_json::json!({"List": {}})).await;
        assert_eq!(listed["addresses"][0], address);

        let signed = expect_success(
            &dispatcher,
            serde_json::json!({"Sign": {"address": address, "message": "hello"}}),
        )
        .await;
        let signature = signed["signature"].as_str().unwrap();
        // 65 bytes -> 0x + 130 hex chars
        assert_eq!(signature.len(), 132);
    }

    #[tokio::test]
    async fn test_sign_gsm_matches_personal_sign() {
        let dispatcher = dispatcher();
        let created = expect_success(
            &dispatcher,
            serde_json::json!({"CreateWallet": {"name": "w", "owner": "o"}}),
        )
        .await;
        let wallet = created["wallet_address"].as_str().unwrap().to_string();

        let via_gsm = expect_success(
            &dispatcher,
            serde_json::json!({"SignGsm": {
                "wallet_address": wallet,
                "domain": "app.example",
                "message": "challenge"
            }}),
        )
        .await;
        let via_sign = expect_success(
            &dispatcher,
            serde_json::json!({"Sign": {"address": wallet, "message": "challenge"}}),
        )
        .await;
        assert_eq!(via_gsm["signature"], via_sign["signature"]);
    }

    #[tokio::test]
    async fn test_unknown_tag_yields_invalid_command() {
        let dispatcher = dispatcher();
        let response = send(&dispatcher, serde_json::json!({"SelfDestruct": {}})).await;
        assert_eq!(response["success"], false);
        assert!(
            response["error"]
                .as_str()
                .unwrap()
                .starts_with("invalid command")
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_yields_invalid_command() {
        let dispatcher = dispatcher();
        let response = dispatcher.dispatch_frame("{not json").await;
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_errors_surface_in_envelope() {
        let dispatcher = dispatcher();
        let response = send(
            &dispatcher,
            serde_json::json!({"WalletState": {
                "wallet_address": "0x000000000000000000000000000000000000dead"
            }}),
        )
        .await;
        assert_eq!(response["success"], false);
        assert_eq!(
            response["error"],
            "unknown wallet: 0x000000000000000000000000000000000000dead"
        );
    }
}
