//! Seed handling and deterministic address derivation.
//!
//! Every address of the account comes from the seed and a non-negative
//! index. Derivation follows the BIP32 path `m/44'/60'/0'/0/{index}`; the
//! derived secret becomes an ed25519 signing key and the address is the hex
//! encoded public key.

use bip39::{Language, Mnemonic};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tiny_hderive::bip32::ExtendedPrivKey;

use crate::crypto::{decrypt_secret, encrypt_secret, CryptoError};

/// Highest index usable with non-hardened BIP32 derivation.
pub const MAX_INDEX: u64 = (1 << 31) - 1;

const SEED_LEN: usize = 64;
const FINGERPRINT_DOMAIN: &[u8] = b"cda-account/v1";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyspaceError {
    #[error("Invalid mnemonic phrase")]
    InvalidMnemonic,
    #[error("Invalid seed encoding: {0}")]
    InvalidSeed(String),
    #[error("Key derivation failed for index {0}")]
    DerivationFailed(u64),
    #[error("Keyspace exhausted: index {0} exceeds {max}", max = MAX_INDEX)]
    KeyspaceExhausted(u64),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Fingerprint of a seed. Identifies the account without revealing the seed.
pub type AccountId = String;

/// The account secret. Not `Debug`, not `Serialize`.
#[derive(Clone)]
pub struct Seed {
    bytes: [u8; SEED_LEN],
}

impl Seed {
    /// Generate a fresh 24-word mnemonic and the seed behind it.
    pub fn generate() -> Result<(Self, String), KeyspaceError> {
        let mut entropy = [0u8; 32];
        OsRng.fill_bytes(&mut entropy);

        let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
            .map_err(|_| KeyspaceError::InvalidMnemonic)?;
        let phrase = mnemonic.to_string();
        Ok((Self { bytes: mnemonic.to_seed("") }, phrase))
    }

    pub fn from_phrase(phrase: &str) -> Result<Self, KeyspaceError> {
        let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase.trim())
            .map_err(|_| KeyspaceError::InvalidMnemonic)?;
        Ok(Self {
            bytes: mnemonic.to_seed(""),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyspaceError> {
        let bytes: [u8; SEED_LEN] = bytes.try_into().map_err(|_| {
            KeyspaceError::InvalidSeed(format!("expected {} bytes, got {}", SEED_LEN, bytes.len()))
        })?;
        Ok(Self { bytes })
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyspaceError> {
        let bytes = hex::decode(s.trim()).map_err(|e| KeyspaceError::InvalidSeed(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Accepts either a mnemonic phrase or a hex encoded seed.
    pub fn parse(s: &str) -> Result<Self, KeyspaceError> {
        let s = s.trim();
        if s.contains(' ') {
            Self::from_phrase(s)
        } else {
            Self::from_hex(s)
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn account_id(&self) -> AccountId {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(self.bytes);
        hex::encode(&hasher.finalize()[..16])
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A hex encoded ed25519 public key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = KeyspaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match hex::decode(&s) {
            Ok(bytes) if bytes.len() == 32 => Ok(Address(s)),
            _ => Err(KeyspaceError::InvalidAddress(s)),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = KeyspaceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Deterministic address derivation for one seed.
#[derive(Clone)]
pub struct Keyspace {
    seed: Seed,
}

impl Keyspace {
    pub fn new(seed: Seed) -> Self {
        Self { seed }
    }

    pub fn account_id(&self) -> AccountId {
        self.seed.account_id()
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    pub fn address(&self, index: u64) -> Result<Address, KeyspaceError> {
        if index > MAX_INDEX {
            return Err(KeyspaceError::KeyspaceExhausted(index));
        }
        let path = format!("m/44'/60'/0'/0/{}", index);
        let ext_key = ExtendedPrivKey::derive(self.seed.as_bytes(), path.as_str())
            .map_err(|_| KeyspaceError::DerivationFailed(index))?;

        let signing_key = SigningKey::from_bytes(&ext_key.secret());
        Ok(Address(hex::encode(signing_key.verifying_key().to_bytes())))
    }
}

/// How the seed is represented inside an exported snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SeedReference {
    /// No secret material; the importer must already hold the seed.
    Fingerprint,
    /// The raw seed, hex encoded. Protecting the file is the caller's job.
    Plain { seed: String },
    /// AES-256-GCM encrypted seed.
    Encrypted { salt: String, ciphertext: String },
}

/// Export choice for the seed reference.
#[derive(Clone, Debug, Default)]
pub enum SeedExport {
    #[default]
    Fingerprint,
    Plain,
    Encrypted { passphrase: String },
}

impl SeedReference {
    pub fn build(seed: &Seed, export: &SeedExport) -> Result<Self, CryptoError> {
        Ok(match export {
            SeedExport::Fingerprint => SeedReference::Fingerprint,
            SeedExport::Plain => SeedReference::Plain { seed: seed.to_hex() },
            SeedExport::Encrypted { passphrase } => {
                let (salt, blob) = encrypt_secret(seed.as_bytes(), passphrase)?;
                SeedReference::Encrypted {
                    salt: hex::encode(salt),
                    ciphertext: hex::encode(blob),
                }
            }
        })
    }

    /// Recovers the seed if the reference carries it.
    pub fn recover(&self, passphrase: Option<&str>) -> Result<Option<Seed>, crate::error::AccountError> {
        match self {
            SeedReference::Fingerprint => Ok(None),
            SeedReference::Plain { seed } => Ok(Some(Seed::from_hex(seed)?)),
            SeedReference::Encrypted { salt, ciphertext } => {
                let passphrase = passphrase.ok_or(CryptoError::Decryption)?;
                let salt = hex::decode(salt)
                    .map_err(|e| KeyspaceError::InvalidSeed(e.to_string()))?;
                let blob = hex::decode(ciphertext)
                    .map_err(|e| KeyspaceError::InvalidSeed(e.to_string()))?;
                let bytes = decrypt_secret(&blob, &salt, passphrase)?;
                Ok(Some(Seed::from_bytes(&bytes)?))
            }
        }
    }
}
