//! Core implementation of the PASS wallet enclave.
//!
//! The enclave is the secure backend a host process talks to over a local
//! boundary: it custodies Ethereum-compatible private keys, tracks
//! multi-asset balances across logical sub-accounts of a single on-chain
//! wallet, and produces signed messages and signed raw transactions on
//! request. Balances are backed by an ordered, append-only provenance log
//! written under the same lock that mutates them.
//!
//! # Modules
//!
//! - [`keystore`] — key generation, AES-256-GCM encryption at rest, EIP-191
//!   and raw-digest ECDSA signing.
//! - [`tx`] — pure EIP-155 legacy-transaction RLP encoding and the
//!   ERC-20/721/1155 transfer calldata builders.
//! - [`ledger`] — the per-wallet aggregate and the claim / transfer /
//!   withdraw state machine, with provenance and query views.
//! - [`registry`] — address → wallet index with per-wallet fair locks,
//!   bounded lock waits, and fail-stop poisoning.
//! - [`proto`] — the tagged command set and the response envelope.
//! - [`dispatch`] — the stateless router from commands to components.
//! - [`server`] — the framed JSON transport over a local stream socket.
//! - [`config`] — env-resolved service configuration.
//!
//! State is in-memory; the host is responsible for deposit monitoring and
//! for broadcasting the signed transactions the outbox hands back.

pub mod config;
pub mod dispatch;
pub mod keystore;
pub mod ledger;
pub mod proto;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod tx;
pub mod types;
