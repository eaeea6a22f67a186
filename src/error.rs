use thiserror::Error;

use crate::crypto::CryptoError;
use crate::keyspace::KeyspaceError;
use crate::ledger::LedgerError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Invalid deposit conditions: {0}")]
    InvalidConditions(String),
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),
    #[error("Oracle rejected send for deposit address #{index}: {reason}")]
    OracleRejected { index: u64, reason: String },
    #[error("Transfer submission failed: {0}")]
    Submission(#[source] LedgerError),
    #[error("Store is corrupt: {0}")]
    StoreCorrupt(String),
    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("Snapshot format version {found} is newer than supported version {supported}")]
    IncompatibleVersion { found: u32, supported: u32 },
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("Invalid account configuration: {0}")]
    InvalidConfig(String),
    #[error("Unknown deposit address #{0}")]
    UnknownCda(u64),
    #[error("Deposit address #{0} is already spent")]
    AlreadySpent(u64),
    #[error("Deposit address #{0} already has a send in flight")]
    SendInFlight(u64),
    #[error("Account is not running")]
    NotRunning,
    #[error("Snapshot belongs to account {found}, expected {expected}")]
    SeedMismatch { expected: String, found: String },
    #[error(transparent)]
    Keyspace(#[from] KeyspaceError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Ledger query failed: {0}")]
    Ledger(#[from] LedgerError),
}

pub type Result<T, E = AccountError> = std::result::Result<T, E>;
