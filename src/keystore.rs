//! Key custody for the enclave.
//!
//! The [`KeyManager`] is the only component that touches secp256k1 secret
//! material. Secrets are generated on demand, encrypted at rest with
//! AES-256-GCM under a process-wide key-encryption key, and decrypted only
//! transiently inside sign operations. Plaintext key bytes are zeroized
//! before any sign call returns and never appear in logs or responses.

use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use alloy_primitives::{Address, B256, U256, keccak256};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::rand_core::OsRng;
use std::sync::{Mutex, PoisonError};
use zeroize::Zeroize;

use crate::types::EvmAddress;

/// AES-GCM nonce length in bytes (96 bits).
const AEAD_NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    /// The address has no key in this enclave.
    #[error("unknown address: {0}")]
    UnknownAddress(EvmAddress),
    /// RNG, encryption, decryption, or signing failure.
    #[error("kms failure: {0}")]
    Kms(String),
}

/// A secret key encrypted under the process KEK.
///
/// Immutable once installed; the nonce is unique per stored key.
#[derive(Clone)]
struct EncryptedKey {
    ciphertext: Vec<u8>,
    nonce: [u8; AEAD_NONCE_LEN],
}

/// A canonical low-s ECDSA signature with its recovery id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: U256,
    pub s: U256,
    /// Parity of the recovered point, 0 or 1.
    pub recovery_id: u8,
}

impl RecoverableSignature {
    /// The 65-byte `r ‖ s ‖ v` wire form with `v = v_base + recovery_id`.
    pub fn to_rsv(&self, v_base: u8) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r.to_be_bytes::<32>());
        out[32..64].copy_from_slice(&self.s.to_be_bytes::<32>());
        out[64] = v_base + self.recovery_id;
        out
    }
}

/// Custodian of encrypted secp256k1 keys.
///
/// Sign operations on distinct addresses run in parallel; key generation
/// briefly excludes writers on the touched shard.
pub struct KeyManager {
    cipher: Aes256Gcm,
    keys: DashMap<EvmAddress, EncryptedKey>,
    order: Mutex<Vec<EvmAddress>>,
}

impl KeyManager {
    /// Builds a key manager whose KEK is derived from the startup secret.
    pub fn new(enclave_secret: &str) -> Self {
        let kek = keccak256(enclave_secret.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_slice()));
        Self {
            cipher,
            keys: DashMap::new(),
            order: Mutex::new(Vec::new()),
        }
    }

    /// Generates a fresh keypair, encrypts the secret at rest, and returns
    /// the derived Ethereum address.
    pub fn generate_account(&self) -> Result<EvmAddress, KeystoreError> {
        loop {
            let signing_key = SigningKey::random(&mut OsRng);
            let address = EvmAddress(Address::from_public_key(signing_key.verifying_key()));
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let mut secret = signing_key.to_bytes();
            let ciphertext = self.cipher.encrypt(&nonce, secret.as_slice());
            secret.as_mut_slice().zeroize();
            let ciphertext =
                ciphertext.map_err(|_| KeystoreError::Kms("key encryption failed".to_string()))?;
            match self.keys.entry(address) {
                // A colliding address means a colliding key; draw again.
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(EncryptedKey {
                        ciphertext,
                        nonce: nonce.into(),
                    });
                }
            }
            self.order
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(address);
            return Ok(address);
        }
    }

    /// Stored addresses in insertion order.
    pub fn list_addresses(&self) -> Vec<EvmAddress> {
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the address has a key in this enclave.
    pub fn contains(&self, address: EvmAddress) -> bool {
        self.keys.contains_key(&address)
    }

    /// Signs a 32-byte digest with the key behind `address`.
    ///
    /// The signature is canonical (low-s) with a deterministic RFC 6979
    /// nonce; `recovery_id` is 0 or 1.
    pub fn sign_digest(
        &self,
        address: EvmAddress,
        digest: B256,
    ) -> Result<RecoverableSignature, KeystoreError> {
        let signing_key = self.decrypt_key(address)?;
        let (signature, recovery_id) = signing_key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|e| KeystoreError::Kms(format!("signing failed: {e}")))?;
        let bytes = signature.to_bytes();
        Ok(RecoverableSignature {
            r: U256::from_be_slice(&bytes[..32]),
            s: U256::from_be_slice(&bytes[32..]),
            recovery_id: recovery_id.to_byte(),
        })
    }

    /// EIP-191 `personal_sign`: signs
    /// `keccak256("\x19Ethereum Signed Message:\n" ‖ len ‖ message)` and
    /// returns the 65-byte `r ‖ s ‖ v` signature with `v = 27 + recovery_id`.
    pub fn sign_personal_message(
        &self,
        address: EvmAddress,
        message: &[u8],
    ) -> Result<[u8; 65], KeystoreError> {
        let digest = personal_message_digest(message);
        let signature = self.sign_digest(address, digest)?;
        Ok(signature.to_rsv(27))
    }

    fn decrypt_key(&self, address: EvmAddress) -> Result<SigningKey, KeystoreError> {
        let entry = self
            .keys
            .get(&address)
            .map(|entry| entry.value().clone())
            .ok_or(KeystoreError::UnknownAddress(address))?;
        let mut plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&entry.nonce), entry.ciphertext.as_ref())
            .map_err(|_| KeystoreError::Kms("key decryption failed".to_string()))?;
        let signing_key = SigningKey::from_slice(&plaintext);
        plaintext.zeroize();
        signing_key.map_err(|_| KeystoreError::Kms("invalid key material".to_string()))
    }
}

/// The EIP-191 "personal_sign" digest of `message`.
pub fn personal_message_digest(message: &[u8]) -> B256 {
    let mut buf = Vec::with_capacity(message.len() + 34);
    buf.extend_from_slice(b"\x19Ethereum Signed Message:\n");
    buf.extend_from_slice(message.len().to_string().as_bytes());
    buf.extend_from_slice(message);
    keccak256(&buf)
}
