//! Legacy (type 0) Ethereum transaction encoding.
//!
//! Pure functions only: RLP encoding of the nine-item legacy transaction
//! list, the EIP-155 replay-protected signing digest, and the transfer
//! calldata for each supported token standard. Nothing here performs I/O or
//! touches key material.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_rlp::{Encodable, Header};

use crate::types::TokenType;

/// `keccak256("transfer(address,uint256)")[..4]`
pub const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
/// `keccak256("safeTransferFrom(address,address,uint256)")[..4]`
pub const ERC721_SAFE_TRANSFER_FROM_SELECTOR: [u8; 4] = [0x42, 0x84, 0x2e, 0x0e];
/// `keccak256("safeTransferFrom(address,address,uint256,uint256,bytes)")[..4]`
pub const ERC1155_SAFE_TRANSFER_FROM_SELECTOR: [u8; 4] = [0xf2, 0x42, 0x43, 0x2a];

/// Default gas price when the caller omits one: 20 gwei.
pub const DEFAULT_GAS_PRICE: u64 = 20_000_000_000;

/// Default gas limit for the token standard when the caller omits one.
///
/// Advisory values carried over from the reference system; callers should
/// pass explicit limits for anything but a plain ETH transfer.
pub fn default_gas_limit(token_type: TokenType) -> u64 {
    match token_type {
        TokenType::Eth => 21_000,
        TokenType::Erc20 => 65_000,
        TokenType::Erc721 | TokenType::Erc1155 => 100_000,
    }
}

/// An unsigned legacy transaction body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl LegacyTransaction {
    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.encode(out);
    }
}

fn finish_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// RLP of `[nonce, gas_price, gas_limit, to, value, data, chain_id, 0, 0]`,
/// the EIP-155 preimage of the signing digest.
pub fn encode_unsigned(tx: &LegacyTransaction, chain_id: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    tx.encode_fields(&mut payload);
    chain_id.encode(&mut payload);
    0u8.encode(&mut payload);
    0u8.encode(&mut payload);
    finish_list(payload)
}

/// RLP of `[nonce, gas_price, gas_limit, to, value, data, v, r, s]`, the
/// broadcastable raw transaction.
pub fn encode_signed(tx: &LegacyTransaction, v: u64, r: U256, s: U256) -> Vec<u8> {
    let mut payload = Vec::new();
    tx.encode_fields(&mut payload);
    v.encode(&mut payload);
    r.encode(&mut payload);
    s.encode(&mut payload);
    finish_list(payload)
}

/// Keccak-256 of the encoded unsigned transaction.
pub fn signing_digest(encoded_unsigned: &[u8]) -> B256 {
    keccak256(encoded_unsigned)
}

/// EIP-155 replay-protected `v`.
pub fn eip155_v(chain_id: u64, recovery_id: u8) -> u64 {
    chain_id * 2 + 35 + recovery_id as u64
}

fn pad32_address(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    word
}

/// `transfer(address,uint256)` calldata.
pub fn erc20_transfer_calldata(to: Address, amount: U256) -> Bytes {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&ERC20_TRANSFER_SELECTOR);
    data.extend_from_slice(&pad32_address(to));
    data.extend_from_slice(&amount.to_be_bytes::<32>());
    Bytes::from(data)
}

/// `safeTransferFrom(address,address,uint256)` calldata.
pub fn erc721_safe_transfer_calldata(from: Address, to: Address, token_id: U256) -> Bytes {
    let mut data = Vec::with_capacity(4 + 96);
    data.extend_from_slice(&ERC721_SAFE_TRANSFER_FROM_SELECTOR);
    data.extend_from_slice(&pad32_address(from));
    data.extend_from_slice(&pad32_address(to));
    data.extend_from_slice(&token_id.to_be_bytes::<32>());
    Bytes::from(data)
}

/// `safeTransferFrom(address,address,uint256,uint256,bytes)` calldata with
/// empty `data`.
///
/// The tail (`offset = 0x80`, zero length word) reproduces the reference
/// system's layout byte-for-byte; downstream verifiers match on it.
pub fn erc1155_safe_transfer_calldata(
    from: Address,
    to: Address,
    token_id: U256,
    amount: U256,
) -> Bytes {
    let mut data = Vec::with_capacity(4 + 192);
    data.extend_from_slice(&ERC1155_SAFE_TRANSFER_FROM_SELECTOR);
    data.extend_from_slice(&pad32_address(from));
    data.extend_from_slice(&pad32_address(to));
    data.extend_from_slice(&token_id.to_be_bytes::<32>());
    data.extend_from_slice(&amount.to_be_bytes::<32>());
    data.extend_from_slice(&U256::from(0x80u64).to_be_bytes::<32>());
    data.extend_from_slice(&[0u8; 32]);
    Bytes::from(data)
}

/// Parses a token id as decimal, or hex when `0x`-prefixed.
pub fn parse_token_id(token_id: &str) -> Option<U256> {
    if let Some(hex_digits) = token_id.strip_prefix("0x") {
        U256::from_str_radix(hex_digits, 16).ok()
    } else {
        U256::from_str_radix(token_id, 10).ok()
    }
}
